//! A deterministic local/edge service orchestrator: process supervision,
//! lifecycle event fan-out over a durable log, and a desired-state
//! reconciliation loop for external infrastructure (DNS, fleet machines).

/// Core data model shared across every component: `ProcessSpec`,
/// `ProcessState`, `Service`, `DesiredState`.
pub mod model;

/// Child Registry (C1): the declarative table of `ProcessSpec`s.
pub mod registry;

/// Supervisor (C2): owns OS child processes, their state machine, and the
/// restart-policy engine.
pub mod supervisor;

/// Snapshot Differ (C3): the pure function turning two supervisor snapshots
/// into typed lifecycle events.
pub mod differ;

/// Lifecycle events, subjects, and severities (shared by C3/C4/C5).
pub mod events;

/// Durable, subject-hierarchical event log (C4 publisher, C5 consumer).
pub mod eventlog;

/// Desired-State Store (C6): the declarative service spec served over
/// HTTP + SSE.
pub mod store;

/// Pluggable `MachinesProvider`/`RoutingProvider` interfaces and their
/// null/local/DNS implementations.
pub mod providers;

/// Reconciler (C7): drives external infrastructure toward desired state.
pub mod reconciler;

/// Live View Store (C8): aggregates supervisor, event, and desired-state
/// observations into a broadcastable UI snapshot.
pub mod live_view;

/// HTTP surfaces: the Supervisor control API and the Desired-State Store
/// API, both built on `axum`.
pub mod http;

/// Layered YAML configuration loading.
pub mod config;

/// Constants and defaults shared across components.
pub mod constants;

/// Typed error taxonomy, one enum per crate boundary.
pub mod error;

/// Runtime paths and modes (state dir, log dir, config dirs).
pub mod runtime;

/// Process-tree bookkeeping: the on-disk `{name -> pid}` / `{identity hash
/// -> last known status}` table persisted across supervisor binary restarts.
pub mod pidfile;

/// `clap`-derived CLI, a thin client of the control APIs plus the `serve`
/// entrypoint that boots the whole object graph.
pub mod cli;

/// Shared helpers for unit and integration tests.
#[doc(hidden)]
pub mod test_utils;
