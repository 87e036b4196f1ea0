//! Supervisor (C2): owns OS child processes, enforces restart policy,
//! tracks state, and exposes the operations backing the HTTP control API.
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::SUPERVISOR_POLL_INTERVAL;
use crate::differ;
use crate::error::SupervisorError;
use crate::eventlog::EventPublisher;
use crate::model::{
    Backoff, DependsOnCondition, Health, ProcessSpec, ProcessState, ProcessStatus, Probe,
    ProbeKind, RestartPolicy,
};
use crate::pidfile::PidTable;
use crate::registry::ChildRegistry;
use crate::runtime;

const MAX_LOG_LINES: usize = 2000;

/// Outcome of `Supervisor::start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The process was started (or a new replica spawned).
    Ok,
    /// No such process is registered.
    NotFound,
    /// The process already has at least one running replica.
    AlreadyRunning,
    /// A `depends_on` condition is not yet satisfied.
    DependencyUnsatisfied {
        /// The dependency that is not yet satisfied.
        dependency: String,
    },
}

/// Outcome of `Supervisor::stop`/`restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleOutcome {
    /// The operation completed.
    Ok,
    /// No such process is registered.
    NotFound,
}

struct ReplicaSlot {
    index: u32,
    child: Child,
    log_rx: mpsc::UnboundedReceiver<String>,
}

struct ProcessRuntime {
    spec: ProcessSpec,
    replicas: Vec<ReplicaSlot>,
    next_index: u32,
    attempt: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
    stop_requested: bool,
    logs: VecDeque<String>,
    /// Deadline for the current start cycle's `startup_probe` to succeed at
    /// least once, if one is configured. Recomputed each time the first
    /// replica of a start cycle is spawned.
    startup_deadline: Option<Instant>,
}

impl ProcessRuntime {
    fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            replicas: Vec::new(),
            next_index: 0,
            attempt: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            stop_requested: false,
            logs: VecDeque::new(),
            startup_deadline: None,
        }
    }

    fn push_log(&mut self, line: String) {
        if self.logs.len() >= MAX_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    fn drain_log_channels(&mut self) {
        for slot in &mut self.replicas {
            while let Ok(line) = slot.log_rx.try_recv() {
                if self.logs.len() >= MAX_LOG_LINES {
                    self.logs.pop_front();
                }
                self.logs.push_back(line);
            }
        }
    }
}

/// The Supervisor (C2): exclusive owner of every managed OS child process.
/// All external access goes through this type's methods; readers receive
/// defensive `ProcessState` copies.
pub struct Supervisor {
    registry: RwLock<ChildRegistry>,
    states: RwLock<HashMap<String, ProcessState>>,
    runtimes: Mutex<HashMap<String, ProcessRuntime>>,
    publisher: Option<Arc<EventPublisher>>,
    /// Snapshot last handed to the differ, persisted across poll cycles (and
    /// across the sub-steps of a single cycle) so every state transition —
    /// including ones that happen and resolve within one `poll_once` call,
    /// like a crash-then-restart — gets its own diff against what was last
    /// published, rather than being invisible because it nets out to the
    /// same value by the time the cycle finishes.
    last_published: Mutex<HashMap<String, ProcessState>>,
    pid_table: Mutex<PidTable>,
}

impl Supervisor {
    /// Builds a supervisor over `registry`; every registered spec starts in
    /// `pending`. `publisher`, if given, receives the lifecycle events
    /// derived from each poll.
    ///
    /// Loads the on-disk PID table left by a previous run of the supervisor
    /// binary (if any) and logs, per registered process whose identity hash
    /// still matches, whether its last-known pid is still alive. This is
    /// introspection only: a process found alive here is orphaned (its
    /// stdout/stderr pipes and OS child handle died with the previous
    /// supervisor process) and is not automatically re-adopted as a managed
    /// replica.
    pub fn new(registry: ChildRegistry, publisher: Option<Arc<EventPublisher>>) -> Arc<Self> {
        let mut states = HashMap::new();
        let mut runtimes = HashMap::new();
        let pid_table = PidTable::load();
        for spec in registry.list() {
            if let Some(entry) = pid_table.get(&spec.name) {
                if entry.identity_hash == spec.content_hash() {
                    if entry.pid_is_alive() {
                        warn!(
                            process = %spec.name,
                            pid = entry.pid,
                            "found a process still alive from a previous supervisor run; not re-adopting it"
                        );
                    } else {
                        debug!(process = %spec.name, pid = entry.pid, "discarding stale pid from a previous supervisor run");
                    }
                }
            }
            states.insert(spec.name.clone(), ProcessState::pending(&spec));
            runtimes.insert(spec.name.clone(), ProcessRuntime::new(spec));
        }
        let last_published = states.clone();
        Arc::new(Self {
            registry: RwLock::new(registry),
            states: RwLock::new(states),
            runtimes: Mutex::new(runtimes),
            publisher,
            last_published: Mutex::new(last_published),
            pid_table: Mutex::new(pid_table),
        })
    }

    async fn persist_pid_entry(&self, name: &str, pid: u32, identity_hash: String, status: ProcessStatus) {
        let mut table = self.pid_table.lock().await;
        table.record(name, pid, identity_hash, status);
        if let Err(err) = table.save() {
            warn!(process = name, error = %err, "failed to persist pid table");
        }
    }

    async fn persist_pid_status(&self, name: &str, status: ProcessStatus) {
        let mut table = self.pid_table.lock().await;
        if let Some(entry) = table.get(name).cloned() {
            table.record(name, entry.pid, entry.identity_hash, status);
            if let Err(err) = table.save() {
                warn!(process = name, error = %err, "failed to persist pid table");
            }
        }
    }

    async fn forget_pid_entry(&self, name: &str) {
        let mut table = self.pid_table.lock().await;
        table.remove(name);
        if let Err(err) = table.save() {
            warn!(process = name, error = %err, "failed to persist pid table");
        }
    }

    /// Starts `name`: spawns its first replica, subject to dependency
    /// gating. Starting an already-running process returns
    /// `AlreadyRunning`; starting additional replicas is `Scale`'s job.
    pub async fn start(&self, name: &str) -> Result<StartOutcome, SupervisorError> {
        if !self.registry.read().await.contains(name) {
            return Ok(StartOutcome::NotFound);
        }

        {
            let states = self.states.read().await;
            if let Some(state) = states.get(name) {
                if state.is_running {
                    return Ok(StartOutcome::AlreadyRunning);
                }
            }
            if let Some(unmet) = self.first_unsatisfied_dependency(name, &states).await {
                return Ok(StartOutcome::DependencyUnsatisfied { dependency: unmet });
            }
        }

        self.set_status(name, ProcessStatus::Starting).await;
        self.spawn_replica(name).await?;
        self.set_running(name, true, None).await;
        Ok(StartOutcome::Ok)
    }

    async fn first_unsatisfied_dependency(
        &self,
        name: &str,
        states: &HashMap<String, ProcessState>,
    ) -> Option<String> {
        let registry = self.registry.read().await;
        let spec = registry.get(name)?;
        for dep in &spec.depends_on {
            let dep_state = states.get(&dep.name)?;
            let satisfied = match dep.condition {
                DependsOnCondition::ProcessStarted => {
                    matches!(
                        dep_state.status,
                        ProcessStatus::Running | ProcessStatus::Ready
                    )
                }
                DependsOnCondition::ProcessHealthy => dep_state.status == ProcessStatus::Ready,
            };
            if !satisfied {
                return Some(dep.name.clone());
            }
        }
        None
    }

    async fn spawn_replica(&self, name: &str) -> Result<u32, SupervisorError> {
        let spec = self
            .registry
            .read()
            .await
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        let mut command = build_command(&spec);
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SupervisorError::Io)?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(name.to_string(), "stdout", stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(name.to_string(), "stderr", stderr, tx);
        }

        let pid = child.id();
        let mut runtimes = self.runtimes.lock().await;
        let runtime = runtimes
            .entry(name.to_string())
            .or_insert_with(|| ProcessRuntime::new(spec.clone()));
        let index = runtime.next_index;
        runtime.next_index += 1;
        runtime.stop_requested = false;
        let is_first_replica = runtime.replicas.is_empty();
        if is_first_replica {
            runtime.startup_deadline = runtime.spec.startup_probe.as_ref().map(|probe| {
                Instant::now() + probe.initial_delay + probe.period * probe.failure_threshold.max(1)
            });
        }
        runtime.replicas.push(ReplicaSlot {
            index,
            child,
            log_rx: rx,
        });
        drop(runtimes);

        if is_first_replica {
            if let Some(pid) = pid {
                self.persist_pid_entry(name, pid, spec.content_hash(), ProcessStatus::Starting)
                    .await;
            }
        }

        Ok(index)
    }

    /// Stops `name`: drains via its shutdown probe (if configured), signals
    /// graceful termination, then forceful termination. Stops dependents
    /// first, in reverse dependency order.
    pub async fn stop(&self, name: &str) -> Result<SimpleOutcome, SupervisorError> {
        if !self.registry.read().await.contains(name) {
            return Ok(SimpleOutcome::NotFound);
        }
        self.stop_dependents_first(name).await?;
        self.stop_one(name).await?;
        Ok(SimpleOutcome::Ok)
    }

    async fn stop_dependents_first(&self, name: &str) -> Result<(), SupervisorError> {
        let dependents: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .list()
                .into_iter()
                .filter(|spec| spec.depends_on.iter().any(|d| d.name == name))
                .map(|spec| spec.name)
                .collect()
        };
        for dependent in dependents {
            Box::pin(self.stop(&dependent)).await?;
        }
        Ok(())
    }

    async fn stop_one(&self, name: &str) -> Result<(), SupervisorError> {
        self.set_status(name, ProcessStatus::Stopping).await;

        let shutdown_probe = self
            .registry
            .read()
            .await
            .get(name)
            .and_then(|spec| spec.shutdown_probe.clone());
        if let Some(probe) = shutdown_probe {
            let _ = run_probe(&probe).await;
        }

        let mut runtimes = self.runtimes.lock().await;
        if let Some(runtime) = runtimes.get_mut(name) {
            runtime.stop_requested = true;
            for slot in &mut runtime.replicas {
                terminate_gracefully(slot).await;
            }
            runtime.replicas.clear();
        }
        drop(runtimes);

        self.set_status(name, ProcessStatus::Stopped).await;
        self.set_running(name, false, Some(0)).await;
        self.forget_pid_entry(name).await;
        Ok(())
    }

    /// Stops many processes in one call. Each name's final status is
    /// reported independently; a failure for one name does not prevent the
    /// others from being attempted.
    pub async fn stop_many(&self, names: &[String]) -> HashMap<String, String> {
        let mut results = HashMap::new();
        for name in names {
            let outcome = match self.stop(name).await {
                Ok(SimpleOutcome::Ok) => "stopped".to_string(),
                Ok(SimpleOutcome::NotFound) => "not_found".to_string(),
                Err(err) => format!("error: {err}"),
            };
            results.insert(name.clone(), outcome);
        }
        results
    }

    /// Restarts `name`: equivalent to `stop` then `start`, dependency order
    /// honored by both halves.
    pub async fn restart(&self, name: &str) -> Result<SimpleOutcome, SupervisorError> {
        if !self.registry.read().await.contains(name) {
            return Ok(SimpleOutcome::NotFound);
        }
        self.set_status(name, ProcessStatus::Restarting).await;
        self.stop_one(name).await?;
        let restarts = self.bump_restart_count(name).await;
        debug!(process = name, restarts, "restarting");
        self.start(name).await?;
        Ok(SimpleOutcome::Ok)
    }

    async fn bump_restart_count(&self, name: &str) -> u64 {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.restarts += 1;
            state.updated_at = Utc::now();
            return state.restarts;
        }
        0
    }

    /// Scales `name` to `count` replicas: spawns `max(0, count - current)`
    /// new replicas, or stops the highest-index `max(0, current - count)`.
    pub async fn scale(&self, name: &str, count: u32) -> Result<SimpleOutcome, SupervisorError> {
        if !self.registry.read().await.contains(name) {
            return Ok(SimpleOutcome::NotFound);
        }

        let current = {
            let runtimes = self.runtimes.lock().await;
            runtimes.get(name).map(|r| r.replicas.len() as u32).unwrap_or(0)
        };

        if count > current {
            for _ in 0..(count - current) {
                self.spawn_replica(name).await?;
            }
            self.set_status(name, ProcessStatus::Running).await;
            self.set_running(name, true, None).await;
        } else if count < current {
            let to_stop = current - count;
            let mut runtimes = self.runtimes.lock().await;
            if let Some(runtime) = runtimes.get_mut(name) {
                runtime.replicas.sort_by_key(|s| s.index);
                for _ in 0..to_stop {
                    if let Some(mut slot) = runtime.replicas.pop() {
                        terminate_gracefully(&mut slot).await;
                    }
                }
            }
            drop(runtimes);
            if count == 0 {
                self.set_status(name, ProcessStatus::Stopped).await;
                self.set_running(name, false, Some(0)).await;
            }
        }

        self.set_replicas(name, count).await;
        Ok(SimpleOutcome::Ok)
    }

    /// Returns a defensive copy of `name`'s current state.
    pub async fn info(&self, name: &str) -> Option<ProcessState> {
        self.states.read().await.get(name).cloned()
    }

    /// Returns defensive copies of every process's current state.
    pub async fn list(&self) -> Vec<ProcessState> {
        let registry = self.registry.read().await;
        let states = self.states.read().await;
        registry
            .list()
            .into_iter()
            .filter_map(|spec| states.get(&spec.name).cloned())
            .collect()
    }

    /// Returns a tail slice of `name`'s combined stdout/stderr log.
    /// `end_offset < 0` is clamped to 0; `limit == 0` returns every
    /// retained line.
    pub async fn logs(&self, name: &str, end_offset: i64, limit: usize) -> Vec<String> {
        let mut runtimes = self.runtimes.lock().await;
        let Some(runtime) = runtimes.get_mut(name) else {
            return Vec::new();
        };
        runtime.drain_log_channels();
        let end_offset = end_offset.max(0) as usize;
        let lines: Vec<String> = runtime.logs.iter().cloned().collect();
        let end = lines.len().saturating_sub(end_offset);
        let start = if limit == 0 { 0 } else { end.saturating_sub(limit) };
        lines[start.min(end)..end].to_vec()
    }

    /// Clears `name`'s retained in-memory log tail.
    pub async fn truncate_logs(&self, name: &str) {
        if let Some(runtime) = self.runtimes.lock().await.get_mut(name) {
            runtime.logs.clear();
        }
    }

    /// Re-reads the registry, adding/updating/removing processes to match
    /// `new_registry`. Running processes whose spec is unchanged (by
    /// content hash) are left alone.
    pub async fn reload(&self, new_registry: ChildRegistry) -> Result<(), SupervisorError> {
        new_registry.start_order()?;

        let mut registry = self.registry.write().await;
        let mut states = self.states.write().await;
        let mut runtimes = self.runtimes.lock().await;

        let new_specs: HashMap<String, ProcessSpec> = new_registry
            .list()
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();

        states.retain(|name, _| new_specs.contains_key(name));
        runtimes.retain(|name, _| new_specs.contains_key(name));

        for (name, spec) in &new_specs {
            states
                .entry(name.clone())
                .or_insert_with(|| ProcessState::pending(spec));
            runtimes
                .entry(name.clone())
                .or_insert_with(|| ProcessRuntime::new(spec.clone()));
        }

        *registry = new_registry;
        Ok(())
    }

    /// Stops every process in reverse dependency order, forcefully killing
    /// anything still alive once `deadline` elapses.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SupervisorError> {
        let order = self.registry.read().await.stop_order()?;
        let shutdown = async {
            for name in &order {
                let _ = self.stop_one(name).await;
            }
        };
        if tokio::time::timeout(deadline, shutdown).await.is_err() {
            warn!("shutdown deadline exceeded; force-killing remaining children");
            let mut runtimes = self.runtimes.lock().await;
            for runtime in runtimes.values_mut() {
                for slot in &mut runtime.replicas {
                    let _ = slot.child.start_kill();
                }
                runtime.replicas.clear();
            }
        }
        Ok(())
    }

    async fn set_status(&self, name: &str, status: ProcessStatus) {
        {
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(name) {
                state.status = status;
                state.updated_at = Utc::now();
            }
        }
        self.persist_pid_status(name, status).await;
    }

    async fn set_running(&self, name: &str, running: bool, exit_code: Option<i32>) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.is_running = running;
            if exit_code.is_some() {
                state.exit_code = exit_code;
            }
            state.updated_at = Utc::now();
        }
    }

    async fn set_replicas(&self, name: &str, replicas: u32) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.replicas = replicas;
            state.updated_at = Utc::now();
        }
    }

    /// Runs one poll cycle: drains buffered log lines, reaps exited
    /// children, reschedules restarts per policy, runs readiness probes,
    /// and diffs the resulting snapshot against the previous one,
    /// publishing any derived events.
    pub async fn poll_once(&self) {
        self.drain_logs().await;
        self.reap_exited().await;
        self.run_probes().await;
        self.record_and_publish().await;
    }

    /// Diffs the current state snapshot against the one last handed to the
    /// differ, publishes any resulting events, and advances the stored
    /// snapshot to match. Called once per `poll_once` cycle and, in
    /// addition, at points within a cycle where a transition needs to be
    /// visible before further processing continues (a crash ahead of its
    /// restart, a restart's completion) so that neither collapses into the
    /// next diff unnoticed.
    async fn record_and_publish(&self) {
        let mut last_published = self.last_published.lock().await;
        let current = self.states.read().await.clone();
        let events = differ::diff(&last_published, &current, Utc::now());
        if let Some(publisher) = &self.publisher {
            for event in events {
                publisher.publish(event);
            }
        }
        *last_published = current;
    }

    async fn drain_logs(&self) {
        let mut runtimes = self.runtimes.lock().await;
        for runtime in runtimes.values_mut() {
            runtime.drain_log_channels();
        }
    }

    async fn reap_exited(&self) {
        let names: Vec<String> = self.runtimes.lock().await.keys().cloned().collect();
        for name in names {
            let (exit_code, all_gone, stop_requested, policy, backoff, attempt) = {
                let mut runtimes = self.runtimes.lock().await;
                let Some(runtime) = runtimes.get_mut(&name) else {
                    continue;
                };
                let mut exit_code = None;
                runtime.replicas.retain_mut(|slot| match slot.child.try_wait() {
                    Ok(Some(status)) => {
                        exit_code = Some(status.code().unwrap_or(-1));
                        false
                    }
                    _ => true,
                });
                (
                    exit_code,
                    runtime.replicas.is_empty(),
                    runtime.stop_requested,
                    runtime.spec.restart_policy,
                    runtime.spec.backoff,
                    runtime.attempt,
                )
            };

            let Some(code) = exit_code else { continue };
            if !all_gone || stop_requested {
                continue;
            }

            let status = if code == 0 {
                ProcessStatus::Stopped
            } else {
                ProcessStatus::Crashed
            };
            self.set_status(&name, status).await;
            self.set_running(&name, false, Some(code)).await;
            // Publish the crash/stop transition on its own before the
            // restart cycle (which can complete entirely within this same
            // poll) runs, so it is never coalesced away.
            self.record_and_publish().await;
            self.maybe_restart(&name, policy, backoff, attempt, code).await;
        }
    }

    /// Schedules a restart of `name` per `policy`/`backoff`, if warranted by
    /// `exit_code`. Bumps the per-process restart attempt counter and
    /// restart count, sleeps out the computed backoff delay, re-invokes
    /// `start`, then publishes the resulting transition.
    async fn maybe_restart(&self, name: &str, policy: RestartPolicy, backoff: Backoff, attempt: u32, exit_code: i32) {
        let should_restart = match policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => exit_code != 0,
            RestartPolicy::Never => false,
        };

        if should_restart {
            let delay = backoff.delay(attempt);
            debug!(process = name, attempt, delay_secs = delay.as_secs_f64(), "scheduling restart");
            {
                let mut runtimes = self.runtimes.lock().await;
                if let Some(runtime) = runtimes.get_mut(name) {
                    runtime.attempt += 1;
                }
            }
            tokio::time::sleep(delay).await;
            self.bump_restart_count(name).await;
            let _ = self.start(name).await;
            self.record_and_publish().await;
        }
    }

    async fn run_probes(&self) {
        let names: Vec<String> = self.registry.read().await.list().into_iter().map(|s| s.name).collect();
        for name in names {
            let (readiness, startup, status, is_running) = {
                let registry = self.registry.read().await;
                let Some(spec) = registry.get(&name) else {
                    continue;
                };
                let states = self.states.read().await;
                let state = states.get(&name);
                let running = state.map(|s| s.is_running).unwrap_or(false);
                let status = state.map(|s| s.status).unwrap_or(ProcessStatus::Pending);
                (spec.readiness_probe.clone(), spec.startup_probe.clone(), status, running)
            };

            if !is_running {
                continue;
            }

            // `starting -> running` requires the startup probe (if any) to
            // succeed at least once within its deadline; an exceeded
            // deadline is treated as a crash. Readiness is evaluated only
            // once the process has left `starting`.
            if status == ProcessStatus::Starting {
                match startup {
                    None => self.mark_running_ready(&name).await,
                    Some(probe) => {
                        if run_probe(&probe).await {
                            self.mark_running_ready(&name).await;
                        } else if self.startup_deadline_exceeded(&name).await {
                            warn!(process = name, "startup probe deadline exceeded, treating as crash");
                            self.fail_startup_probe(&name).await;
                        }
                    }
                }
                continue;
            }

            match readiness {
                None => self.mark_running_ready(&name).await,
                Some(probe) => {
                    let success = run_probe(&probe).await;
                    self.record_probe_result(&name, &probe, success).await;
                }
            }
        }
    }

    async fn startup_deadline_exceeded(&self, name: &str) -> bool {
        let runtimes = self.runtimes.lock().await;
        runtimes
            .get(name)
            .and_then(|runtime| runtime.startup_deadline)
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Terminates every replica of a process whose `startup_probe` never
    /// succeeded within its deadline, marks it crashed, and schedules a
    /// restart per its policy — mirroring an ordinary post-exit crash.
    async fn fail_startup_probe(&self, name: &str) {
        let (policy, backoff, attempt) = {
            let mut runtimes = self.runtimes.lock().await;
            let Some(runtime) = runtimes.get_mut(name) else {
                return;
            };
            for slot in &mut runtime.replicas {
                terminate_gracefully(slot).await;
            }
            runtime.replicas.clear();
            runtime.startup_deadline = None;
            (runtime.spec.restart_policy, runtime.spec.backoff, runtime.attempt)
        };

        self.set_status(name, ProcessStatus::Crashed).await;
        self.set_running(name, false, Some(-1)).await;
        self.record_and_publish().await;
        self.maybe_restart(name, policy, backoff, attempt, -1).await;
    }

    async fn mark_running_ready(&self, name: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            if state.status == ProcessStatus::Starting || state.status == ProcessStatus::Running {
                state.status = ProcessStatus::Running;
            }
            state.updated_at = Utc::now();
        }
    }

    async fn record_probe_result(&self, name: &str, probe: &Probe, success: bool) {
        let (successes, failures) = {
            let mut runtimes = self.runtimes.lock().await;
            let Some(runtime) = runtimes.get_mut(name) else {
                return;
            };
            if success {
                runtime.consecutive_successes += 1;
                runtime.consecutive_failures = 0;
            } else {
                runtime.consecutive_failures += 1;
                runtime.consecutive_successes = 0;
            }
            (runtime.consecutive_successes, runtime.consecutive_failures)
        };

        let became_ready = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(name) else {
                return;
            };
            let currently_ready = state.health == Some(Health::Ready);
            if !currently_ready && successes >= probe.success_threshold {
                state.health = Some(Health::Ready);
                state.status = ProcessStatus::Ready;
                state.updated_at = Utc::now();
                info!(process = name, "became ready");
                true
            } else if currently_ready && failures >= probe.failure_threshold {
                state.health = Some(Health::NotReady);
                state.status = ProcessStatus::Running;
                state.updated_at = Utc::now();
                warn!(process = name, "became not-ready");
                false
            } else {
                if state.health.is_none() {
                    state.health = Some(Health::Unknown);
                }
                false
            }
        };

        // Each successful transition into `ready` resets the backoff
        // attempt counter and consecutive-failure streak: the process has
        // proven itself healthy, so a future crash should back off from
        // scratch rather than inherit the prior run's attempt count.
        if became_ready {
            let mut runtimes = self.runtimes.lock().await;
            if let Some(runtime) = runtimes.get_mut(name) {
                runtime.attempt = 0;
                runtime.consecutive_failures = 0;
            }
        }
    }

    /// Spawns the background poll task, running `poll_once` every
    /// `SUPERVISOR_POLL_INTERVAL` until `shutdown` is cancelled.
    pub fn spawn_poll_loop(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                Instant::now() + SUPERVISOR_POLL_INTERVAL,
                SUPERVISOR_POLL_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => supervisor.poll_once().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

fn build_command(spec: &ProcessSpec) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c");
    if spec.args.is_empty() {
        command.arg(&spec.command);
    } else {
        command.arg(format!("{} {}", spec.command, spec.args.join(" ")));
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    command.kill_on_drop(true);
    command
}

/// Spawns a task reading `stream` line by line, forwarding each line to
/// `tx` and best-effort appending it to `{name}_{kind}.log` under the
/// runtime log directory.
fn spawn_log_reader<R>(name: String, kind: &'static str, stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let log_path = runtime::log_dir().join(format!("{name}_{kind}.log"));
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    persist_log_line(&log_path, &line).await;
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });
}

async fn persist_log_line(path: &std::path::Path, line: &str) {
    use tokio::io::AsyncWriteExt;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    if let Ok(mut file) = file {
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.write_all(b"\n").await;
    }
}

async fn terminate_gracefully(slot: &mut ReplicaSlot) {
    #[cfg(unix)]
    if let Some(pid) = slot.child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    let graceful = tokio::time::timeout(Duration::from_secs(3), slot.child.wait()).await;
    if graceful.is_err() {
        let _ = slot.child.start_kill();
        let _ = slot.child.wait().await;
    }
}

async fn run_probe(probe: &Probe) -> bool {
    match &probe.kind {
        ProbeKind::Http { url } => match reqwest::Client::new()
            .get(url)
            .timeout(probe.timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        },
        ProbeKind::Tcp { host, port } => {
            tokio::time::timeout(probe.timeout, tokio::net::TcpStream::connect((host.as_str(), *port)))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
        }
        ProbeKind::Exec { command } => {
            let result = tokio::time::timeout(
                probe.timeout,
                Command::new("sh").arg("-c").arg(command).status(),
            )
            .await;
            matches!(result, Ok(Ok(status)) if status.success())
        }
    }
}
