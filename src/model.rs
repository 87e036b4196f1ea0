//! Core data model shared by the Child Registry, Supervisor, and Snapshot
//! Differ: `ProcessSpec` (immutable, declarative) and `ProcessState`
//! (mutable, observed).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How the Supervisor should react when a process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart; a terminal exit is final.
    Never,
    /// Restart only when the exit code was non-zero.
    OnFailure,
    /// Always restart, regardless of exit code.
    Always,
}

/// Exponential backoff parameters for scheduling restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub initial: Duration,
    /// Upper bound on the delay between retries.
    #[serde(with = "duration_secs")]
    pub max: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// `delay(attempt) = min(max, initial * multiplier^attempt)`.
    ///
    /// At `attempt = 0` this returns `initial` immediately — no multiplier
    /// step is applied before the first retry.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Gate condition on a `depends_on` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependsOnCondition {
    /// Gate until the dependency has reached at least `running`.
    ProcessStarted,
    /// Gate until the dependency has reached `ready`.
    ProcessHealthy,
}

/// One entry of a `ProcessSpec`'s `depends_on` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOn {
    /// Name of the dependency.
    pub name: String,
    /// Condition that must hold before the dependent may start.
    pub condition: DependsOnCondition,
}

/// Protocol of a named port exposed by a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

/// A named port exposed by a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedPort {
    /// Logical name, e.g. `"http"`.
    pub name: String,
    /// Port number.
    pub port: u16,
    /// Transport protocol.
    pub protocol: PortProtocol,
}

/// One probe mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProbeKind {
    /// HTTP GET against a URL; any 2xx status is a success.
    Http {
        /// URL to GET.
        url: String,
    },
    /// Raw TCP connect.
    Tcp {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u16,
    },
    /// Run a command; exit code 0 is a success.
    Exec {
        /// Command line, passed to a shell.
        command: String,
    },
}

/// A probe definition: a mechanism plus timing/threshold parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    /// The check to perform.
    #[serde(flatten)]
    pub kind: ProbeKind,
    /// Delay before the first check.
    #[serde(with = "duration_secs", default = "Duration::default")]
    pub initial_delay: Duration,
    /// Interval between checks.
    #[serde(with = "duration_secs")]
    pub period: Duration,
    /// Per-check timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Consecutive successes required to flip not-ready → ready.
    #[serde(default = "default_threshold")]
    pub success_threshold: u32,
    /// Consecutive failures required to flip ready → not-ready.
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,
}

fn default_threshold() -> u32 {
    1
}

/// Immutable declaration of a managed process. Registered once in the Child
/// Registry and never mutated; a config reload replaces the whole registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Unique name.
    pub name: String,
    /// Executable or shell command line.
    pub command: String,
    /// Ordered argument list (appended after `command` when both are used
    /// with `sh -c`, this is typically empty and `command` carries the full
    /// line — kept separate to mirror how the reference config represents
    /// multi-word invocations explicitly).
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Restart policy.
    #[serde(default = "default_restart_policy")]
    pub restart_policy: RestartPolicy,
    /// Backoff parameters for scheduled restarts.
    #[serde(default)]
    pub backoff: Backoff,
    /// Ordered dependency list.
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
    /// Readiness probe (gates `running → ready`).
    #[serde(default)]
    pub readiness_probe: Option<Probe>,
    /// Startup probe (gates `starting → running`).
    #[serde(default)]
    pub startup_probe: Option<Probe>,
    /// Shutdown probe (drained before signaling termination on `Stop`).
    #[serde(default)]
    pub shutdown_probe: Option<Probe>,
    /// Named, protocol-tagged ports this process exposes.
    #[serde(default)]
    pub ports: Vec<NamedPort>,
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::OnFailure
}

impl ProcessSpec {
    /// Stable identity hash over the spec's content, used to recognize a
    /// renamed-but-otherwise-identical service across a config reload.
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

/// Lifecycle status of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Registered, never started.
    Pending,
    /// `Start` issued, waiting for the OS process to exist.
    Starting,
    /// Alive, startup probe (if any) has passed.
    Running,
    /// Alive and readiness probe (if any) is currently passing.
    Ready,
    /// Stop/restart in progress.
    Restarting,
    /// `Stop` issued, draining.
    Stopping,
    /// Exited with code 0, or stopped deliberately.
    Stopped,
    /// Exited with a non-zero code while no stop was in progress.
    Crashed,
}

/// Health as reported by the readiness probe, independent of `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Health {
    /// No readiness information yet.
    Unknown,
    /// Readiness probe passing.
    Ready,
    /// Readiness probe failing.
    NotReady,
}

/// Mutable, point-in-time snapshot of one supervised process. The Supervisor
/// is the sole owner; every reader gets a defensive copy (it derives
/// `Clone`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    /// Process name.
    pub name: String,
    /// Logical namespace (empty string when unset).
    #[serde(default)]
    pub namespace: String,
    /// Current lifecycle status.
    pub status: ProcessStatus,
    /// Whether the OS process is currently alive.
    pub is_running: bool,
    /// Whether this process has a readiness probe configured.
    pub has_health_probe: bool,
    /// Current health, if a readiness probe is configured.
    pub health: Option<Health>,
    /// Monotonically increasing restart counter.
    pub restarts: u64,
    /// Exit code of the most recent non-running termination, if any.
    pub exit_code: Option<i32>,
    /// Current replica count.
    pub replicas: u32,
    /// Timestamp of the most recent state mutation.
    pub updated_at: DateTime<Utc>,
}

impl ProcessState {
    /// Builds the initial (`pending`) state for a freshly registered spec.
    pub fn pending(spec: &ProcessSpec) -> Self {
        Self {
            name: spec.name.clone(),
            namespace: String::new(),
            status: ProcessStatus::Pending,
            is_running: false,
            has_health_probe: spec.readiness_probe.is_some(),
            health: spec.readiness_probe.as_ref().map(|_| Health::Unknown),
            restarts: 0,
            exit_code: None,
            replicas: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Scaling strategy for a `Service`: whether replica counts are
/// enforced locally or delegated to an external fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleStrategy {
    /// The `MachinesProvider` manages replicas on this host.
    Local,
    /// Replica management is delegated to external fleet infrastructure;
    /// the reconciler
    /// always calls `EnsureMachines`, and `LocalMachinesProvider` treats
    /// this the same as `Local`.
    Infra,
}

/// Autoscale mode for a `Service`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoscaleMode {
    /// Replica counts are set only by explicit updates.
    Manual,
    /// Replica counts react to reported metrics (interpreted by the
    /// `MachinesProvider`; this crate does not evaluate metrics itself).
    Metrics,
    /// Autoscaling is off.
    Disabled,
}

/// One region's replica bounds within a `ScaleSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Region {
    /// Region identifier, e.g. `"iad"`.
    pub name: String,
    /// Minimum replica count.
    pub min: u32,
    /// Desired replica count.
    pub desired: u32,
    /// Maximum replica count.
    pub max: u32,
}

/// Scaling declaration for a `Service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScaleSpec {
    /// Where replica enforcement happens.
    pub strategy: ScaleStrategy,
    /// Autoscale mode.
    #[serde(default = "default_autoscale")]
    pub autoscale: AutoscaleMode,
    /// Minimum time between consecutive scaling actions.
    #[serde(default, with = "duration_secs_opt")]
    pub cooldown: Option<Duration>,
    /// Time-to-live for a scale-up burst before reverting to `desired`.
    #[serde(default, with = "duration_secs_opt")]
    pub burst_ttl: Option<Duration>,
    /// Per-region replica bounds; at least one is required.
    pub regions: Vec<Region>,
}

fn default_autoscale() -> AutoscaleMode {
    AutoscaleMode::Manual
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.map(|s| Duration::from_secs_f64(s.max(0.0))))
    }
}

/// Object storage bucket declaration within a `StorageSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketSpec {
    /// Bucket name.
    pub name: String,
    /// Provider-specific region or location hint.
    #[serde(default)]
    pub region: Option<String>,
}

/// Storage declaration for a `Service`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSpec {
    /// Storage provider identifier (empty string when storage is unused).
    #[serde(default)]
    pub provider: String,
    /// Reference to externally managed credentials (never the credentials
    /// themselves).
    #[serde(default)]
    pub credentials_ref: Option<String>,
    /// Named buckets, keyed by logical name.
    #[serde(default)]
    pub buckets: HashMap<String, BucketSpec>,
    /// Provider-specific free-form options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// One DNS record declaration within a `RoutingSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsRecord {
    /// Record name; empty is rejected at reconcile time with a warning.
    #[serde(default)]
    pub name: String,
    /// Record type (`"A"`, `"CNAME"`, ...); empty is rejected.
    #[serde(default, rename = "type")]
    pub record_type: String,
    /// Time-to-live in seconds; negative values are clamped to 0.
    #[serde(default)]
    pub ttl: i64,
    /// Record content; empty is rejected.
    #[serde(default)]
    pub content: String,
    /// Free-form operator comment, not sent to the provider.
    #[serde(default)]
    pub comment: Option<String>,
}

/// A routing-level health check declaration (provider-interpreted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSpec {
    /// Health check name.
    pub name: String,
    /// Path or target the provider should probe.
    #[serde(default)]
    pub target: Option<String>,
}

/// Load-balancing strategy declaration (provider-interpreted).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadBalancing {
    /// Strategy name, e.g. `"round_robin"`.
    #[serde(default)]
    pub strategy: String,
    /// Provider-specific free-form options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Routing declaration for a `Service`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingSpec {
    /// Routing provider identifier (empty string when routing is unused).
    #[serde(default)]
    pub provider: String,
    /// DNS zone the records below belong to.
    #[serde(default)]
    pub zone: Option<String>,
    /// Declared DNS records.
    #[serde(default)]
    pub dns_records: Vec<DnsRecord>,
    /// Declared health checks.
    #[serde(default)]
    pub health_checks: Vec<HealthCheckSpec>,
    /// Load-balancing declaration.
    #[serde(default)]
    pub load_balancing: LoadBalancing,
}

/// A declared desired-state Service: scaling, storage, and routing for
/// one logical application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    /// Unique id.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Scaling declaration.
    pub scale: ScaleSpec,
    /// Storage declaration.
    #[serde(default)]
    pub storage: StorageSpec,
    /// Routing declaration.
    #[serde(default)]
    pub routing: RoutingSpec,
}

/// Observed replica counts per region, populated by the `MachinesProvider`
/// on each reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRuntimeState {
    /// Region name to observed replica count.
    pub regions: HashMap<String, u32>,
}

/// The full declarative desired state: an ordered list of `Service`s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Declared services, in load order.
    pub services: Vec<Service>,
}
