//! Durable, subject-hierarchical event log (C4 publisher, C5 consumer).
//!
//! Backed by `sled`, an embedded ordered key-value store, in place of a
//! native NATS-JetStream log: each event is appended under a monotonically
//! increasing key, with a background sweep evicting entries older than the
//! retention window. Wildcard subscriptions (`*` one token, `>` tail) are
//! matched by tokenizing the subject and scanning the store.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::constants::DEFAULT_EVENT_RETENTION;
use crate::events::Event;

const TREE_NAME: &str = "events";
const FAN_OUT_CAPACITY: usize = 1024;

/// Errors raised while publishing to or reading from the durable log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The embedded store rejected the operation.
    #[error("event log storage error: {0}")]
    Storage(#[from] sled::Error),
    /// The event could not be serialized onto the wire format.
    #[error("event serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Publishes events onto a durable, hierarchically-subjected log and
/// fans them out to live subscribers (C4).
///
/// Publish failures are logged and the event is dropped: this is an
/// at-most-once log with durable best-effort delivery, matching the
/// semantics of the underlying embedded store.
pub struct EventPublisher {
    db: sled::Db,
    sequence: AtomicU64,
    retention: Duration,
    fan_out: broadcast::Sender<Event>,
}

impl EventPublisher {
    /// Opens (or creates) a durable log rooted at `path`, retaining events
    /// for at least `retention`.
    pub fn open(path: impl AsRef<std::path::Path>, retention: Duration) -> Result<Self, LogError> {
        let db = sled::open(path)?;
        let (fan_out, _) = broadcast::channel(FAN_OUT_CAPACITY);
        let sequence = db
            .open_tree(TREE_NAME)?
            .iter()
            .keys()
            .next_back()
            .transpose()?
            .map(|key| sequence_from_key(&key))
            .unwrap_or(0);
        Ok(Self {
            db,
            sequence: AtomicU64::new(sequence),
            retention,
            fan_out,
        })
    }

    /// Opens a log backed by an ephemeral, in-memory store (for tests).
    pub fn open_in_memory(retention: Duration) -> Result<Self, LogError> {
        let db = sled::Config::new().temporary(true).open()?;
        let (fan_out, _) = broadcast::channel(FAN_OUT_CAPACITY);
        Ok(Self {
            db,
            sequence: AtomicU64::new(0),
            retention,
            fan_out,
        })
    }

    /// Appends `event` to the log and notifies live subscribers. Never
    /// returns an error to the caller's event-emission path: failures are
    /// logged and the event is simply dropped, per the at-most-once
    /// contract.
    pub fn publish(&self, event: Event) {
        if let Err(err) = self.try_publish(&event) {
            error!(process = %event.process, subject = %event.subject, error = %err, "failed to publish event");
        }
        // Fan-out is best-effort too: no receivers is not an error.
        let _ = self.fan_out.send(event);
    }

    fn try_publish(&self, event: &Event) -> Result<(), LogError> {
        let tree = self.db.open_tree(TREE_NAME)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let key = make_key(&event.subject, seq);
        let value = serde_json::to_vec(event)?;
        tree.insert(key, value)?;
        Ok(())
    }

    /// Evicts entries older than the configured retention window. Intended
    /// to be called periodically by a background sweep task.
    pub fn sweep_expired(&self) -> Result<usize, LogError> {
        let tree = self.db.open_tree(TREE_NAME)?;
        let cutoff = Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        let mut removed = 0;
        for entry in tree.iter() {
            let (key, value) = entry?;
            let event: Event = match serde_json::from_slice(&value) {
                Ok(event) => event,
                Err(_) => continue,
            };
            if event.timestamp < cutoff {
                tree.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Returns every stored event matching `pattern`, in publish order.
    /// Used by late-joining consumers to replay history.
    pub fn replay(&self, pattern: &str) -> Result<Vec<Event>, LogError> {
        let tree = self.db.open_tree(TREE_NAME)?;
        let tokens: Vec<&str> = pattern.split('.').collect();
        let mut events = Vec::new();
        for entry in tree.iter() {
            let (_key, value) = entry?;
            let event: Event = serde_json::from_slice(&value)?;
            if subject_matches(&tokens, &event.subject) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Subscribes to the live fan-out, filtered by `pattern`. Returns a
    /// `Consumer` that can be polled with `recv`.
    pub fn subscribe(&self, pattern: impl Into<String>) -> Consumer {
        Consumer {
            pattern: pattern.into(),
            receiver: self.fan_out.subscribe(),
        }
    }

    /// Spawns a background task that sweeps expired entries every
    /// `interval`, until `shutdown` resolves.
    pub fn spawn_retention_sweep(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: tokio_util::sync::CancellationToken,
    ) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match publisher.sweep_expired() {
                            Ok(count) if count > 0 => debug!(count, "swept expired events"),
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "event log retention sweep failed"),
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

/// Default retention-backed constructor, backed by an in-memory store so
/// callers that don't care about durability don't need to pick a path.
impl Default for EventPublisher {
    fn default() -> Self {
        Self::open_in_memory(DEFAULT_EVENT_RETENTION).expect("in-memory sled store")
    }
}

/// A subscription to a subject pattern (C5). Handler errors are the
/// caller's responsibility to log; they must never cancel the subscription.
pub struct Consumer {
    pattern: String,
    receiver: broadcast::Receiver<Event>,
}

impl Consumer {
    /// Awaits the next event matching this consumer's pattern, skipping
    /// non-matching events and tolerating lagged receivers by resuming
    /// after the gap.
    pub async fn recv(&mut self) -> Option<Event> {
        let tokens: Vec<&str> = self.pattern.split('.').collect();
        loop {
            match self.receiver.recv().await {
                Ok(event) if subject_matches(&tokens, &event.subject) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event consumer lagged; resuming after gap");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drives `handler` for every matching event until the publisher is
    /// dropped. Handler errors are logged and do not cancel the
    /// subscription.
    pub async fn run<F, Fut>(mut self, mut handler: F)
    where
        F: FnMut(Event) -> Fut,
        Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>,
    {
        while let Some(event) = self.recv().await {
            if let Err(err) = handler(event).await {
                error!(error = %err, "event consumer handler failed");
            }
        }
    }

    /// Releases this subscription. Dropping the `Consumer` has the same
    /// effect; this exists to mirror the explicit `Close()` contract.
    pub fn close(self) {
        drop(self);
    }
}

fn make_key(subject: &str, seq: u64) -> Vec<u8> {
    let mut key = subject.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn sequence_from_key(key: &[u8]) -> u64 {
    if key.len() < 8 {
        return 0;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[key.len() - 8..]);
    u64::from_be_bytes(buf)
}

/// Matches a dotted `subject` against a tokenized pattern: `*` matches
/// exactly one token, `>` matches zero or more tokens (including, unlike
/// plain NATS subjects, when followed by more literal tokens — this lets
/// `patterns::for_event_type` filter on the trailing type token regardless
/// of how many namespace tokens precede it).
fn subject_matches(pattern_tokens: &[&str], subject: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    matches_rec(pattern_tokens, &subject_tokens)
}

fn matches_rec(pattern: &[&str], subject: &[&str]) -> bool {
    match pattern.first() {
        None => subject.is_empty(),
        Some(&">") => (0..=subject.len()).any(|k| matches_rec(&pattern[1..], &subject[k..])),
        Some(&"*") => !subject.is_empty() && matches_rec(&pattern[1..], &subject[1..]),
        Some(token) => {
            !subject.is_empty() && subject[0] == *token && matches_rec(&pattern[1..], &subject[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::model::{Backoff, ProcessSpec, ProcessState, RestartPolicy};
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

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

    fn event(event_type: EventType) -> Event {
        Event::new(event_type, "db", "", ProcessState::pending(&spec()), Utc::now())
    }

    #[test]
    fn wildcard_star_matches_single_token() {
        assert!(subject_matches(&["pc", "*", "started"], "pc.db.started"));
        assert!(!subject_matches(&["pc", "*", "started"], "pc.db.sub.started"));
    }

    #[test]
    fn wildcard_tail_matches_remainder() {
        assert!(subject_matches(&["pc", ">"], "pc.db.started"));
        assert!(subject_matches(&["pc", ">"], "pc.db.crashed.extra"));
    }

    #[test]
    fn tail_wildcard_can_be_followed_by_a_literal_suffix() {
        use crate::events::patterns;
        let pattern = patterns::for_event_type(EventType::Started);
        let tokens: Vec<&str> = pattern.split('.').collect();
        assert!(subject_matches(&tokens, "pc.db.started"));
        assert!(subject_matches(&tokens, "pc.prod.db.started"));
        assert!(!subject_matches(&tokens, "pc.db.crashed"));
    }

    #[test]
    fn publish_is_replayed_by_pattern() {
        let publisher = EventPublisher::open_in_memory(StdDuration::from_secs(3600)).unwrap();
        publisher.publish(event(EventType::Started));
        publisher.publish(event(EventType::Crashed));

        let replayed = publisher.replay("pc.db.*").unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].event_type, EventType::Started);
        assert_eq!(replayed[1].event_type, EventType::Crashed);
    }

    #[tokio::test]
    async fn subscriber_receives_only_matching_subject() {
        let publisher = EventPublisher::open_in_memory(StdDuration::from_secs(3600)).unwrap();
        let mut consumer = publisher.subscribe("pc.db.started");
        publisher.publish(event(EventType::Crashed));
        publisher.publish(event(EventType::Started));

        let received = consumer.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::Started);
    }

    #[test]
    fn sweep_removes_entries_past_retention() {
        let publisher = EventPublisher::open_in_memory(StdDuration::from_millis(0)).unwrap();
        publisher.publish(event(EventType::Started));
        std::thread::sleep(StdDuration::from_millis(5));
        let removed = publisher.sweep_expired().unwrap();
        assert_eq!(removed, 1);
        assert!(publisher.replay("pc.>").unwrap().is_empty());
    }
}
