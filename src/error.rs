//! Typed error taxonomy for the orchestrator, one enum per crate boundary.
//!
//! Each enum maps deterministically onto the HTTP status codes and event
//! severities described by the error handling design: validation errors are
//! never retried, `NotFound`/`Conflict` are surfaced to the caller as-is, and
//! `Unavailable` is distinguished so HTTP clients can tell "down" from
//! "refused".
use thiserror::Error;

/// Errors raised by the Child Registry (C1).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Attempted to register a process name that already exists.
    #[error("process '{0}' is already registered")]
    DuplicateProcess(String),

    /// A `depends_on` entry references a process that was never registered.
    #[error("service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The process declaring the dependency.
        service: String,
        /// The dependency name that does not exist.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },
}

/// Errors raised by the Supervisor (C2).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No process is registered under this name.
    #[error("no such process: {0}")]
    NotFound(String),

    /// `Start` was called on a process that is already running.
    #[error("process '{0}' is already running")]
    AlreadyRunning(String),

    /// A `depends_on` condition has not yet been satisfied.
    #[error("process '{process}' is waiting on dependency '{dependency}'")]
    DependencyUnsatisfied {
        /// The process whose start was gated.
        process: String,
        /// The dependency condition that is not yet satisfied.
        dependency: String,
    },

    /// A registry-level error surfaced during reload.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An I/O error while spawning, signaling, or persisting state.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the Desired-State Store (C6).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The submitted document failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// No service exists under this id.
    #[error("no such service: {0}")]
    NotFound(String),

    /// An I/O error reading or writing the desired-state file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A (de)serialization error for the desired-state document.
    #[error("serde error: {0}")]
    Serde(String),
}

/// Errors raised while a Reconciler (C7) pass drives a single service.
///
/// These are always logged and recorded as events; they never abort a pass
/// or propagate out of the reconcile loop.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The `MachinesProvider` failed to ensure machines for a service.
    #[error("machines provider failed for '{service}': {source}")]
    Machines {
        /// The service that failed to reconcile.
        service: String,
        /// The underlying provider error.
        source: anyhow::Error,
    },

    /// The `RoutingProvider` failed to ensure routing for a service.
    #[error("routing provider failed for '{service}': {source}")]
    Routing {
        /// The service that failed to reconcile.
        service: String,
        /// The underlying provider error.
        source: anyhow::Error,
    },
}

/// The `ComposeUnavailable` sentinel: the normalized shape returned to HTTP
/// clients when a downstream component could not be reached at all, as
/// distinct from a request that was reached and refused.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ComposeUnavailable {
    /// Always `"compose_unavailable"`, so clients can match on it without
    /// parsing prose.
    pub error: &'static str,
    /// Human-readable detail for logs/debugging.
    pub detail: String,
}

impl ComposeUnavailable {
    /// Builds the sentinel body for a given downstream failure detail.
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            error: "compose_unavailable",
            detail: detail.into(),
        }
    }
}
