//! Live View Store (C8): aggregates Supervisor, Event, and Desired-State
//! observations into a single broadcastable UI snapshot.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::constants::{
    LIVE_VIEW_LOG_TAIL_LINES, MAX_EVENT_LOG_ENTRIES, RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_CAP,
    SUPERVISOR_SYNC_INTERVAL,
};
use crate::eventlog::EventPublisher;
use crate::events::Event;
use crate::model::{DesiredState, ProcessState, ProcessStatus};
use crate::runtime;
use crate::store::StateChange;
use crate::supervisor::Supervisor;

/// One entry retained in the Live View's capped event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// When the Live View Store observed this event (not when it occurred).
    pub received_at: DateTime<Utc>,
    /// Icon derived from the event's severity, for a UI to render directly.
    pub icon: &'static str,
    /// The underlying lifecycle event.
    pub event: Event,
}

/// Build/version identification surfaced in every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    /// The crate's own version string.
    pub version: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One at-a-glance card summarizing a declared service's live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCard {
    /// Process name.
    pub name: String,
    /// Current lifecycle status.
    pub status: ProcessStatus,
    /// Current replica count.
    pub replicas: u32,
    /// Restart counter, carried straight from the `ProcessState`.
    pub restarts: u64,
}

/// One labeled metric surfaced alongside the service cards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCard {
    /// Metric label, e.g. `"Active Services"`.
    pub label: String,
    /// Rendered value, e.g. `"3/5"`.
    pub value: String,
}

/// Per-service supplementary detail: a recent log tail and free-form notes
/// contributed by the controller stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDetail {
    /// Tail of recent combined stdout/stderr lines.
    pub log_tail: Vec<String>,
    /// Notes decoded from the most recent Desired-State Store update.
    pub notes: Vec<String>,
}

/// One navigation entry for a UI shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavEntry {
    /// Display label.
    pub label: String,
    /// Route path.
    pub path: String,
}

fn default_navigation() -> Vec<NavEntry> {
    vec![
        NavEntry {
            label: "Processes".into(),
            path: "/processes".into(),
        },
        NavEntry {
            label: "Events".into(),
            path: "/events".into(),
        },
        NavEntry {
            label: "Desired State".into(),
            path: "/desired-state".into(),
        },
    ]
}

fn default_tips() -> Vec<String> {
    vec![
        "Use `orchestra status` to check every process's health at a glance.".into(),
        "`orchestra logs <name>` tails a process's combined stdout/stderr.".into(),
        "Edit the desired state document and reconciliation picks it up automatically.".into(),
    ]
}

fn environment_label() -> String {
    match runtime::mode() {
        runtime::RuntimeMode::User => "user".to_string(),
        runtime::RuntimeMode::System => "system".to_string(),
    }
}

/// A single point-in-time aggregate of everything a UI needs to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Runtime mode label (`"user"` or `"system"`).
    pub environment: String,
    /// The orchestrator's own state directory.
    pub data_dir: String,
    /// When this snapshot was produced. Monotonically non-decreasing across
    /// successive snapshots delivered to any one subscriber.
    pub generated_at: DateTime<Utc>,
    /// Crate build/version identification.
    pub build_info: BuildInfo,
    /// One card per declared service.
    pub services: Vec<ServiceCard>,
    /// Aggregate metrics derived from `services`.
    pub metrics: Vec<MetricCard>,
    /// Capped tail of recently observed lifecycle events, oldest first.
    pub events: VecDeque<EventLogEntry>,
    /// Static operator-facing hints.
    pub tips: Vec<String>,
    /// Static navigation entries for a UI shell.
    pub navigation: Vec<NavEntry>,
    /// Per-service log tail and controller-contributed notes, keyed by name.
    pub service_details: HashMap<String, ServiceDetail>,
    /// Current `ProcessState` for every supervised process.
    pub processes: Vec<ProcessState>,
    /// Most recently observed desired state, `None` until the controller
    /// stream delivers its first update.
    pub desired_state: Option<DesiredState>,
    /// Whether the controller (Desired-State Store) SSE stream is currently
    /// connected.
    pub controller_connected: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            environment: environment_label(),
            data_dir: runtime::state_dir().display().to_string(),
            generated_at: Utc::now(),
            build_info: BuildInfo::default(),
            services: Vec::new(),
            metrics: Vec::new(),
            events: VecDeque::new(),
            tips: default_tips(),
            navigation: default_navigation(),
            service_details: HashMap::new(),
            processes: Vec::new(),
            desired_state: None,
            controller_connected: false,
        }
    }
}

/// Merges `states` into the snapshot's service cards and metrics: one card
/// per name in `declared` (any name missing from `states` is rendered as
/// `stopped` with zero replicas), plus `Active Services` = `<running>/<total>`
/// and `Process Restarts` = the sum of every card's restart counter.
pub fn apply_service_status(snapshot: &mut Snapshot, declared: &[String], states: &[ProcessState]) {
    let by_name: HashMap<&str, &ProcessState> =
        states.iter().map(|state| (state.name.as_str(), state)).collect();

    let mut cards = Vec::with_capacity(declared.len());
    let mut running = 0usize;
    let mut total_restarts = 0u64;
    for name in declared {
        let card = match by_name.get(name.as_str()) {
            Some(state) => {
                if state.is_running {
                    running += 1;
                }
                ServiceCard {
                    name: name.clone(),
                    status: state.status,
                    replicas: state.replicas,
                    restarts: state.restarts,
                }
            }
            None => ServiceCard {
                name: name.clone(),
                status: ProcessStatus::Stopped,
                replicas: 0,
                restarts: 0,
            },
        };
        total_restarts += card.restarts;
        cards.push(card);
    }

    snapshot.metrics = vec![
        MetricCard {
            label: "Active Services".into(),
            value: format!("{running}/{}", declared.len()),
        },
        MetricCard {
            label: "Process Restarts".into(),
            value: total_restarts.to_string(),
        },
    ];
    snapshot.services = cards;
    snapshot.processes = states.to_vec();
}

/// Merges `log_tail` into `name`'s `ServiceDetail`, leaving any
/// controller-contributed notes untouched.
pub fn apply_process_logs(snapshot: &mut Snapshot, name: &str, log_tail: Vec<String>) {
    snapshot
        .service_details
        .entry(name.to_string())
        .or_default()
        .log_tail = log_tail;
}

/// The Live View Store (C8): a single `Snapshot`, mutated under a lock and
/// broadcast to subscribers on every change. Slow subscribers coalesce
/// updates rather than blocking the writer, matching the Desired-State
/// Store's own `watch`-based notification scheme.
pub struct LiveView {
    inner: RwLock<Snapshot>,
    changes: watch::Sender<Arc<Snapshot>>,
}

impl LiveView {
    /// Builds a Live View Store with an empty snapshot.
    pub fn new() -> Arc<Self> {
        let snapshot = Arc::new(Snapshot::default());
        let (changes, _) = watch::channel(snapshot.clone());
        Arc::new(Self {
            inner: RwLock::new((*snapshot).clone()),
            changes,
        })
    }

    /// Returns the current snapshot.
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        Arc::new(self.inner.read().await.clone())
    }

    /// Subscribes to snapshot updates. The receiver always observes the
    /// most recent snapshot, coalescing updates sent while not polling.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.changes.subscribe()
    }

    /// Applies `mutator` to the current snapshot under the write lock, then
    /// publishes the result to subscribers. `generated_at` is bumped to
    /// `now` (never backwards) so subscribers always observe a
    /// non-decreasing sequence of timestamps.
    pub async fn update(&self, mutator: impl FnOnce(&mut Snapshot)) {
        let mut guard = self.inner.write().await;
        mutator(&mut guard);
        let now = Utc::now();
        if now > guard.generated_at {
            guard.generated_at = now;
        }
        let snapshot = Arc::new(guard.clone());
        drop(guard);
        let _ = self.changes.send(snapshot);
    }

    /// Appends `event` to the capped event log, evicting the oldest entry
    /// once `MAX_EVENT_LOG_ENTRIES` is reached.
    pub async fn append_event(&self, event: Event) {
        let icon = event.severity.icon();
        self.update(|snapshot| {
            if snapshot.events.len() >= MAX_EVENT_LOG_ENTRIES {
                snapshot.events.pop_front();
            }
            snapshot.events.push_back(EventLogEntry {
                received_at: Utc::now(),
                icon,
                event,
            });
        })
        .await;
    }

    /// Spawns a task that polls `supervisor.list()` every
    /// `SUPERVISOR_SYNC_INTERVAL` and republishes the result as the
    /// snapshot's process list, until `shutdown` is cancelled.
    pub fn start_supervisor_sync(
        self: &Arc<Self>,
        supervisor: Arc<Supervisor>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let live_view = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUPERVISOR_SYNC_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let states = supervisor.list().await;
                        let declared: Vec<String> = states.iter().map(|s| s.name.clone()).collect();
                        let mut log_tails = Vec::with_capacity(declared.len());
                        for name in &declared {
                            let tail = supervisor.logs(name, 0, LIVE_VIEW_LOG_TAIL_LINES).await;
                            log_tails.push((name.clone(), tail));
                        }
                        live_view
                            .update(|snapshot| {
                                apply_service_status(snapshot, &declared, &states);
                                for (name, tail) in log_tails {
                                    apply_process_logs(snapshot, &name, tail);
                                }
                            })
                            .await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Spawns a task that subscribes to `publisher` under `pattern` and
    /// appends every matching event to the snapshot's event log, until the
    /// publisher closes or `shutdown` is cancelled.
    pub fn start_event_stream(
        self: &Arc<Self>,
        publisher: Arc<EventPublisher>,
        pattern: impl Into<String>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let live_view = Arc::clone(self);
        let pattern = pattern.into();
        tokio::spawn(async move {
            let mut consumer = publisher.subscribe(pattern);
            loop {
                tokio::select! {
                    event = consumer.recv() => {
                        match event {
                            Some(event) => live_view.append_event(event).await,
                            None => break,
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Spawns a task that maintains an SSE connection to the
    /// Desired-State Store's `/v1/events` endpoint at `controller_addr`,
    /// reconnecting with exponential backoff (bounded by
    /// `RECONNECT_BACKOFF_BASE`/`RECONNECT_BACKOFF_CAP`) whenever the
    /// connection drops, until `shutdown` is cancelled.
    pub fn start_controller_stream(
        self: &Arc<Self>,
        controller_addr: String,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let live_view = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BACKOFF_BASE;
            loop {
                match stream_controller_events(&controller_addr, &live_view, &shutdown).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => warn!(error = %err, "controller stream error"),
                }
                live_view.update(|s| s.controller_connected = false).await;
                warn!(delay_secs = backoff.as_secs_f64(), "reconnecting to controller");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => break,
                }
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
            }
        })
    }
}

/// Connects once and streams SSE frames until the connection drops or
/// `shutdown` fires. Returns `Ok(true)` if shutdown was requested, `Ok(false)`
/// if the stream simply ended (reconnect should be attempted).
async fn stream_controller_events(
    controller_addr: &str,
    live_view: &Arc<LiveView>,
    shutdown: &CancellationToken,
) -> Result<bool, reqwest::Error> {
    let url = format!("{controller_addr}/v1/events");
    let response = reqwest::get(&url).await?.error_for_status()?;
    live_view.update(|s| s.controller_connected = true).await;

    let mut stream = response.bytes_stream();
    let mut buf = String::new();
    loop {
        tokio::select! {
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(idx) = buf.find("\n\n") {
                            let frame: String = buf.drain(..idx + 2).collect();
                            if let Some(data) = frame.trim_end().strip_prefix("data: ") {
                                if let Ok(change) = serde_json::from_str::<StateChange>(data) {
                                    let note = format!("{:?} at {}", change.reason, change.time.to_rfc3339());
                                    let service_ids: Vec<String> =
                                        change.state.services.iter().map(|s| s.id.clone()).collect();
                                    live_view
                                        .update(|s| {
                                            for id in &service_ids {
                                                s.service_details
                                                    .entry(id.clone())
                                                    .or_default()
                                                    .notes
                                                    .push(note.clone());
                                            }
                                            s.desired_state = Some(change.state);
                                        })
                                        .await;
                                }
                            }
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(false),
                }
            }
            _ = shutdown.cancelled() => return Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::model::{Backoff, ProcessSpec, ProcessState, RestartPolicy};
    use std::collections::HashMap;

    fn spec() -> ProcessSpec {
        ProcessSpec {
            name: "db".into(),
            command: "/bin/db".into(),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
            restart_policy: RestartPolicy::Always,
            backoff: Backoff::default(),
            depends_on: vec![],
            readiness_probe: None,
            startup_probe: None,
            shutdown_probe: None,
            ports: vec![],
        }
    }

    fn event() -> Event {
        Event::new(
            EventType::Started,
            "db",
            "",
            ProcessState::pending(&spec()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn update_publishes_to_subscribers() {
        let live_view = LiveView::new();
        let mut rx = live_view.subscribe();
        live_view
            .update(|s| s.controller_connected = true)
            .await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().controller_connected);
    }

    #[tokio::test]
    async fn event_log_caps_at_max_entries() {
        let live_view = LiveView::new();
        for _ in 0..(MAX_EVENT_LOG_ENTRIES + 5) {
            live_view.append_event(event()).await;
        }
        let snapshot = live_view.snapshot().await;
        assert_eq!(snapshot.events.len(), MAX_EVENT_LOG_ENTRIES);
    }

    #[tokio::test]
    async fn snapshot_reflects_latest_processes() {
        let live_view = LiveView::new();
        live_view
            .update(|s| s.processes = vec![ProcessState::pending(&spec())])
            .await;
        let snapshot = live_view.snapshot().await;
        assert_eq!(snapshot.processes.len(), 1);
        assert_eq!(snapshot.processes[0].name, "db");
    }

    #[tokio::test]
    async fn generated_at_never_moves_backwards() {
        let live_view = LiveView::new();
        let first = live_view.snapshot().await.generated_at;
        live_view.update(|s| s.controller_connected = true).await;
        let second = live_view.snapshot().await.generated_at;
        assert!(second >= first);
        live_view.update(|s| s.controller_connected = false).await;
        let third = live_view.snapshot().await.generated_at;
        assert!(third >= second);
    }

    #[test]
    fn apply_service_status_marks_missing_declared_service_stopped() {
        let mut snapshot = Snapshot::default();
        let mut running = ProcessState::pending(&spec());
        running.status = crate::model::ProcessStatus::Running;
        running.is_running = true;
        running.replicas = 1;
        running.restarts = 2;

        let declared = vec!["db".to_string(), "api".to_string()];
        apply_service_status(&mut snapshot, &declared, &[running]);

        assert_eq!(snapshot.services.len(), 2);
        let api = snapshot.services.iter().find(|c| c.name == "api").unwrap();
        assert_eq!(api.status, crate::model::ProcessStatus::Stopped);
        assert_eq!(api.replicas, 0);

        let active = snapshot.metrics.iter().find(|m| m.label == "Active Services").unwrap();
        assert_eq!(active.value, "1/2");
        let restarts = snapshot.metrics.iter().find(|m| m.label == "Process Restarts").unwrap();
        assert_eq!(restarts.value, "2");
    }

    #[test]
    fn apply_process_logs_merges_without_disturbing_notes() {
        let mut snapshot = Snapshot::default();
        snapshot
            .service_details
            .entry("db".to_string())
            .or_default()
            .notes
            .push("seeded note".to_string());

        apply_process_logs(&mut snapshot, "db", vec!["line one".to_string()]);

        let detail = snapshot.service_details.get("db").unwrap();
        assert_eq!(detail.log_tail, vec!["line one".to_string()]);
        assert_eq!(detail.notes, vec!["seeded note".to_string()]);
    }
}
