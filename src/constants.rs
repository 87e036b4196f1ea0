//! Constants and default values shared across components.
use std::time::Duration;

/// Default port for the Supervisor's HTTP control API, overridable via
/// the `PC_PORT_NUM` environment variable.
pub const DEFAULT_SUPERVISOR_PORT: u16 = 28081;

/// Environment variable overriding the Supervisor control API port.
pub const SUPERVISOR_PORT_ENV: &str = "PC_PORT_NUM";

/// Default port for the Desired-State Store HTTP API.
pub const DEFAULT_STORE_PORT: u16 = 4400;

/// Environment variable carrying the default Desired-State Store address
/// for clients (the reconciler, CLI, Live View Store).
pub const CONTROLLER_ADDR_ENV: &str = "CONTROLLER_ADDR";

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "SYSG_CONFIG";

/// Default config file name, searched for in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "systemg.yaml";

/// Root token prepended to every event subject (`<root>.<namespace?>.<process>.<type>`).
pub const EVENT_SUBJECT_ROOT: &str = "pc";

/// Default retention window for the durable event log.
pub const DEFAULT_EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between reconciler passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Per-request timeout for outbound control-plane HTTP calls.
pub const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for the Supervisor control API availability probe used to derive
/// `ComposeUnavailable`.
pub const AVAILABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for `Supervisor::shutdown` before remaining children are
/// force-killed.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline for graceful HTTP server shutdown.
pub const HTTP_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Interval the Supervisor polls child processes and probe state.
pub const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Base backoff for Live View Store / SSE client reconnects.
pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(3);

/// Cap on reconnect backoff.
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Maximum number of `EventLog` entries retained in a Live View snapshot.
pub const MAX_EVENT_LOG_ENTRIES: usize = 100;

/// Default interval `StartSupervisorSync` polls the Supervisor.
pub const SUPERVISOR_SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// Number of log lines returned when a tail `limit` of zero is requested.
pub const UNLIMITED_LOG_TAIL: usize = usize::MAX;

/// Number of trailing log lines `StartSupervisorSync` pulls per process on
/// each tick, for display in a `ServiceDetail`.
pub const LIVE_VIEW_LOG_TAIL_LINES: usize = 20;
