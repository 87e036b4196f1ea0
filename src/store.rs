//! Desired-State Store (C6): an in-memory, on-disk-backed declarative spec
//! of `Service`s, served over HTTP + SSE.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::error::StoreError;
use crate::model::{DesiredState, Service};

/// On-disk document shapes accepted when loading a desired-state file: the
/// canonical `{services: [...]}`, a bare `{service: ...}` wrapper, or a
/// single `Service` at the document root.
#[derive(Debug, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
enum DesiredStateDocument {
    Multi {
        services: Vec<Service>,
    },
    Single {
        service: Service,
    },
    Bare(Service),
}

impl DesiredStateDocument {
    fn into_state(self) -> DesiredState {
        match self {
            DesiredStateDocument::Multi { services } => DesiredState { services },
            DesiredStateDocument::Single { service } => DesiredState {
                services: vec![service],
            },
            DesiredStateDocument::Bare(service) => DesiredState {
                services: vec![service],
            },
        }
    }
}

/// Canonical on-disk/wire shape for a full `DesiredState` document.
#[derive(Debug, Serialize, Deserialize)]
struct CanonicalDocument<'a> {
    services: &'a [Service],
}

/// Reason an `/v1/events` SSE record (or in-process `Subscribe` tick) was
/// emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeReason {
    /// Emitted once, immediately after a subscriber connects.
    Initial,
    /// Emitted after a mutation.
    Update,
}

/// One notification delivered to `/v1/events` subscribers and in-process
/// `Subscribe()` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    /// Why this notification was sent.
    pub reason: ChangeReason,
    /// When it was sent.
    pub time: chrono::DateTime<chrono::Utc>,
    /// The full desired state at the time of the change.
    pub state: DesiredState,
}

/// Validates the invariants checked at load, update, and reconcile time: ids
/// are unique, every service has at least one region, and every region
/// satisfies `0 <= min <= desired <= max`.
pub fn validate(state: &DesiredState) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::new();
    for service in &state.services {
        if !seen.insert(&service.id) {
            return Err(StoreError::Validation(format!(
                "duplicate service id '{}'",
                service.id
            )));
        }
        if service.scale.regions.is_empty() {
            return Err(StoreError::Validation(format!(
                "service '{}' declares no regions",
                service.id
            )));
        }
        for region in &service.scale.regions {
            if !(region.min <= region.desired && region.desired <= region.max) {
                return Err(StoreError::Validation(format!(
                    "service '{}' region '{}' violates min <= desired <= max ({} <= {} <= {})",
                    service.id, region.name, region.min, region.desired, region.max
                )));
            }
        }
    }
    Ok(())
}

/// Validates a single incoming service update/create payload in isolation
/// (the region/id invariants above, scoped to one service).
fn validate_one(service: &Service) -> Result<(), StoreError> {
    if service.id.is_empty() {
        return Err(StoreError::Validation("service id must not be empty".into()));
    }
    if service.scale.regions.is_empty() {
        return Err(StoreError::Validation(format!(
            "service '{}' declares no regions",
            service.id
        )));
    }
    for region in &service.scale.regions {
        if !(region.min <= region.desired && region.desired <= region.max) {
            return Err(StoreError::Validation(format!(
                "service '{}' region '{}' violates min <= desired <= max ({} <= {} <= {})",
                service.id, region.name, region.min, region.desired, region.max
            )));
        }
    }
    Ok(())
}

fn parse_document(path: &Path, raw: &str) -> Result<DesiredState, StoreError> {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let doc: DesiredStateDocument = if is_json {
        serde_json::from_str(raw).map_err(|e| StoreError::Serde(e.to_string()))?
    } else {
        serde_yaml::from_str(raw).map_err(|e| StoreError::Serde(e.to_string()))?
    };
    Ok(doc.into_state())
}

fn render_document(path: &Path, state: &DesiredState) -> Result<String, StoreError> {
    let doc = CanonicalDocument {
        services: &state.services,
    };
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::to_string_pretty(&doc).map_err(|e| StoreError::Serde(e.to_string()))
    } else {
        serde_yaml::to_string(&doc).map_err(|e| StoreError::Serde(e.to_string()))
    }
}

/// Whether a `Store::update` created or replaced an existing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The id did not previously exist; the service was appended.
    Created,
    /// The id existed; the service was replaced in place.
    Replaced,
}

struct Inner {
    state: DesiredState,
    source: Option<PathBuf>,
}

/// The Desired-State Store (C6): exclusive owner of the on-disk desired
/// state. A single reader-writer lock protects the in-memory copy;
/// notifications are delivered on a `watch` channel so slow subscribers
/// coalesce updates instead of blocking the writer.
pub struct Store {
    inner: RwLock<Inner>,
    changes: watch::Sender<StateChange>,
}

impl Store {
    /// Builds a store with an empty desired state and no backing file.
    pub fn empty() -> Arc<Self> {
        let state = DesiredState::default();
        let (changes, _) = watch::channel(StateChange {
            reason: ChangeReason::Initial,
            time: chrono::Utc::now(),
            state: state.clone(),
        });
        Arc::new(Self {
            inner: RwLock::new(Inner {
                state,
                source: None,
            }),
            changes,
        })
    }

    /// Loads a desired-state document from `path` (YAML or JSON, inferred
    /// from the extension), validating it before it becomes readable.
    pub async fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let path = path.as_ref().to_path_buf();
        let raw = tokio::fs::read_to_string(&path).await?;
        let state = parse_document(&path, &raw)?;
        validate(&state)?;
        let (changes, _) = watch::channel(StateChange {
            reason: ChangeReason::Initial,
            time: chrono::Utc::now(),
            state: state.clone(),
        });
        Ok(Arc::new(Self {
            inner: RwLock::new(Inner {
                state,
                source: Some(path),
            }),
            changes,
        }))
    }

    /// Returns a defensive copy of the current desired state.
    pub async fn state(&self) -> DesiredState {
        self.inner.read().await.state.clone()
    }

    /// Subscribes to state-change notifications. The returned receiver
    /// always observes the most recent `StateChange`, coalescing updates
    /// sent while the subscriber was not polling.
    pub fn subscribe(&self) -> watch::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Validates and applies a single-service update: replaces the service
    /// if `service.id` exists, otherwise appends it. Returns whether it was
    /// created or replaced.
    pub async fn update(&self, service: Service) -> Result<UpdateOutcome, StoreError> {
        validate_one(&service)?;
        let mut guard = self.inner.write().await;
        let outcome = if let Some(slot) = guard
            .state
            .services
            .iter_mut()
            .find(|existing| existing.id == service.id)
        {
            *slot = service;
            UpdateOutcome::Replaced
        } else {
            guard.state.services.push(service);
            UpdateOutcome::Created
        };
        validate(&guard.state)?;
        let snapshot = guard.state.clone();
        drop(guard);

        let _ = self.changes.send(StateChange {
            reason: ChangeReason::Update,
            time: chrono::Utc::now(),
            state: snapshot,
        });
        Ok(outcome)
    }

    /// Persists the current state back to its source file, if any.
    pub async fn close(&self) -> Result<(), StoreError> {
        let guard = self.inner.read().await;
        if let Some(path) = &guard.source {
            let rendered = render_document(path, &guard.state)?;
            tokio::fs::write(path, rendered).await?;
            info!(path = %path.display(), "persisted desired state");
        }
        Ok(())
    }
}
