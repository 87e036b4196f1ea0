//! Reconciler (C7): periodically (or on desired-state change) drives each
//! declared `Service` toward its providers' view of external
//! infrastructure.
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::providers::{MachinesProvider, RoutingProvider};
use crate::store::Store;

/// Why a reconcile pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    /// The reconciler loop just started.
    Startup,
    /// A periodic tick elapsed.
    Periodic,
    /// The Desired-State Store notified of a mutation.
    Update,
}

impl ReconcileReason {
    fn as_str(self) -> &'static str {
        match self {
            ReconcileReason::Startup => "startup",
            ReconcileReason::Periodic => "periodic",
            ReconcileReason::Update => "update",
        }
    }
}

/// Drives a `Store`'s desired state toward convergence via a
/// `MachinesProvider` and `RoutingProvider`. Single-threaded per instance:
/// no two provider calls for the same service run concurrently, and a pass
/// never retries within itself (the next tick is the retry).
pub struct Reconciler {
    store: Arc<Store>,
    machines: Arc<dyn MachinesProvider>,
    routing: Arc<dyn RoutingProvider>,
    interval: Duration,
}

impl Reconciler {
    /// Builds a reconciler over `store`, using `machines`/`routing` as the
    /// external-infrastructure collaborators.
    pub fn new(
        store: Arc<Store>,
        machines: Arc<dyn MachinesProvider>,
        routing: Arc<dyn RoutingProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            machines,
            routing,
            interval,
        }
    }

    /// Runs one reconcile pass over every declared service, logging
    /// (and never propagating) per-service provider failures.
    pub async fn reconcile_once(&self, reason: ReconcileReason) {
        let state = self.store.state().await;
        for service in &state.services {
            match self.machines.ensure_machines(service).await {
                Ok(runtime) => match self.routing.ensure_routing(service, &runtime).await {
                    Ok(()) => {
                        info!(service = %service.id, reason = reason.as_str(), "reconciled");
                    }
                    Err(err) => {
                        error!(service = %service.id, reason = reason.as_str(), error = %err, "routing provider failed");
                    }
                },
                Err(err) => {
                    error!(service = %service.id, reason = reason.as_str(), error = %err, "machines provider failed");
                }
            }
        }
    }

    /// Runs the reconcile loop: once at startup, on every tick of
    /// `interval`, and on every store change notification, until
    /// `shutdown` is cancelled. Cancellation takes effect after the
    /// in-flight pass completes.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut changes = self.store.subscribe();
        changes.mark_changed();
        self.reconcile_once(ReconcileReason::Startup).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_once(ReconcileReason::Periodic).await;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile_once(ReconcileReason::Update).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
