//! Lifecycle events: the typed records the Snapshot Differ (C3) emits
//! and the Event Publisher (C4) carries over the durable log.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::EVENT_SUBJECT_ROOT;
use crate::model::{Health, ProcessState, ProcessStatus};

/// The kind of lifecycle transition an `Event` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A process became running (it was absent, or `is_running` flipped on).
    Started,
    /// A process exited with code 0, or was deliberately stopped.
    Stopped,
    /// A process exited with a non-zero code while no stop was in progress.
    Crashed,
    /// The restart counter advanced.
    Restarted,
    /// The readiness probe started passing.
    Healthy,
    /// The readiness probe started failing.
    Unhealthy,
    /// `status` changed without matching any of the above, more specific
    /// rules.
    StatusChanged,
    /// A single log line, for consumers that subscribe to log tailing over
    /// the same subject scheme.
    Log,
}

impl EventType {
    /// Severity derived purely from the event type.
    pub fn severity(self) -> Severity {
        match self {
            EventType::Crashed => Severity::Error,
            EventType::Unhealthy => Severity::Warning,
            EventType::Stopped => Severity::Info,
            EventType::Started | EventType::Healthy | EventType::Restarted => Severity::Info,
            EventType::StatusChanged | EventType::Log => Severity::Debug,
        }
    }

    /// The token used in the dotted subject.
    pub fn subject_token(self) -> &'static str {
        match self {
            EventType::Started => "started",
            EventType::Stopped => "stopped",
            EventType::Crashed => "crashed",
            EventType::Restarted => "restarted",
            EventType::Healthy => "healthy",
            EventType::Unhealthy => "unhealthy",
            EventType::StatusChanged => "status_changed",
            EventType::Log => "log",
        }
    }
}

/// Severity of an event, used by the Live View Store to pick an icon and by
/// structured logging to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Polling/reconciliation detail, not user-facing.
    Debug,
    /// Normal lifecycle transition.
    Info,
    /// Recovered error, still healthy overall.
    Warning,
    /// Recovered error, currently unhealthy.
    Error,
}

impl Severity {
    /// A short glyph for terminal/UI display, used by the Live View Store.
    pub fn icon(self) -> &'static str {
        match self {
            Severity::Debug => "·",
            Severity::Info => "✓",
            Severity::Warning => "⚠",
            Severity::Error => "✗",
        }
    }
}

/// One typed lifecycle event, self-describing on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The kind of transition.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Name of the process the event concerns.
    pub process: String,
    /// Logical namespace, empty string when unset.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// When the event was derived.
    pub timestamp: DateTime<Utc>,
    /// The `ProcessState` snapshot at emission time.
    pub state: ProcessState,
    /// Exit code, present on `crashed`/`stopped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// New restart count, present on `restarted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarts: Option<u64>,
    /// New health, present on `healthy`/`unhealthy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Health>,
    /// Previous status, present on `status_changed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<ProcessStatus>,
    /// New status, present on `status_changed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<ProcessStatus>,
    /// The log line, present on `log`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_line: Option<String>,
    /// Derived dotted subject, `<root>.<namespace?>.<process>.<type>`.
    pub subject: String,
    /// Derived severity.
    pub severity: Severity,
}

impl Event {
    /// Builds an event, deriving `subject` and `severity` from the other
    /// fields. `namespace` may be empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_type: EventType,
        process: impl Into<String>,
        namespace: impl Into<String>,
        state: ProcessState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let process = process.into();
        let namespace = namespace.into();
        let subject = build_subject(&namespace, &process, event_type);
        Self {
            event_type,
            process,
            namespace,
            timestamp,
            state,
            exit_code: None,
            restarts: None,
            health: None,
            old_status: None,
            new_status: None,
            log_line: None,
            subject,
            severity: event_type.severity(),
        }
    }
}

/// Sanitizes a single subject token: slashes become dots, spaces become
/// underscores, and anything outside `[A-Za-z0-9._-]` is dropped.
pub fn sanitize_token(token: &str) -> String {
    token
        .replace('/', ".")
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// Builds the dotted subject for an event: `<root>.<namespace?>.<process>.<type>`.
pub fn build_subject(namespace: &str, process: &str, event_type: EventType) -> String {
    let mut parts = vec![EVENT_SUBJECT_ROOT.to_string()];
    if !namespace.is_empty() {
        parts.push(sanitize_token(namespace));
    }
    parts.push(sanitize_token(process));
    parts.push(event_type.subject_token().to_string());
    parts.join(".")
}

/// Subject-pattern helpers: construct wildcard patterns for common
/// subscription shapes. `*` matches exactly one token, `>` matches the tail.
pub mod patterns {
    use super::{build_subject, EventType, EVENT_SUBJECT_ROOT};

    /// Pattern matching every event published by this orchestrator.
    pub fn all() -> String {
        format!("{EVENT_SUBJECT_ROOT}.>")
    }

    /// Pattern matching every event for a single process, with or without a
    /// namespace token. Uses `>` rather than `*` around the process token
    /// since the namespace slot is absent entirely (not merely wildcarded)
    /// when a process has no namespace (see `build_subject`).
    pub fn for_process(process: &str) -> String {
        format!("{EVENT_SUBJECT_ROOT}.>.{}.>", super::sanitize_token(process))
    }

    /// Pattern matching every process for a single event type.
    pub fn for_event_type(event_type: EventType) -> String {
        format!("{EVENT_SUBJECT_ROOT}.>.{}", event_type.subject_token())
    }

    /// Exact subject for a single process + event type pair (no namespace).
    pub fn for_process_and_type(process: &str, event_type: EventType) -> String {
        build_subject("", process, event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessSpec;
    use std::collections::HashMap;

    fn sample_spec() -> ProcessSpec {
        use crate::model::{Backoff, RestartPolicy};
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

    #[test]
    fn subject_sanitizes_slashes_and_spaces() {
        let event = Event::new(
            EventType::Started,
            "web app/1",
            "prod team",
            ProcessState::pending(&sample_spec()),
            Utc::now(),
        );
        assert_eq!(event.subject, "pc.prod_team.web.app.1.started");
        assert!(event.subject.chars().all(|c| c.is_ascii_alphanumeric()
            || matches!(c, '.' | '_' | '-')));
    }

    #[test]
    fn subject_omits_namespace_when_empty() {
        let event = Event::new(
            EventType::Crashed,
            "db",
            "",
            ProcessState::pending(&sample_spec()),
            Utc::now(),
        );
        assert_eq!(event.subject, "pc.db.crashed");
    }

    #[test]
    fn for_process_matches_with_and_without_namespace() {
        use crate::eventlog::EventPublisher;
        use std::time::Duration;

        let publisher = EventPublisher::open_in_memory(Duration::from_secs(3600)).unwrap();
        let mut consumer = publisher.subscribe(patterns::for_process("db"));

        publisher.publish(Event::new(
            EventType::Started,
            "db",
            "",
            ProcessState::pending(&sample_spec()),
            Utc::now(),
        ));
        publisher.publish(Event::new(
            EventType::Crashed,
            "db",
            "prod",
            ProcessState::pending(&sample_spec()),
            Utc::now(),
        ));
        publisher.publish(Event::new(
            EventType::Started,
            "web",
            "",
            ProcessState::pending(&sample_spec()),
            Utc::now(),
        ));

        let futures = async {
            let first = consumer.recv().await.unwrap();
            let second = consumer.recv().await.unwrap();
            (first, second)
        };
        let (first, second) = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(futures);
        assert_eq!(first.process, "db");
        assert_eq!(second.process, "db");
        assert_eq!(second.namespace, "prod");
    }

    #[test]
    fn severity_matches_table() {
        assert_eq!(EventType::Crashed.severity(), Severity::Error);
        assert_eq!(EventType::Unhealthy.severity(), Severity::Warning);
        assert_eq!(EventType::Stopped.severity(), Severity::Info);
        assert_eq!(EventType::Started.severity(), Severity::Info);
        assert_eq!(EventType::StatusChanged.severity(), Severity::Debug);
    }
}
