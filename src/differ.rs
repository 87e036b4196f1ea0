//! Snapshot Differ (C3): a pure function over two successive supervisor
//! snapshots, emitting typed lifecycle events.
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::events::{Event, EventType};
use crate::model::{Health, ProcessState};

/// Diffs `previous` against `current`, both keyed by process name, and
/// returns the events in the prescribed per-process order.
/// Stateless: identical inputs always produce identical output.
pub fn diff(
    previous: &HashMap<String, ProcessState>,
    current: &HashMap<String, ProcessState>,
    now: DateTime<Utc>,
) -> Vec<Event> {
    let mut events = Vec::new();

    for (name, state) in current {
        match previous.get(name) {
            None => events.push(Event::new(
                EventType::Started,
                name.clone(),
                state.namespace.clone(),
                state.clone(),
                now,
            )),
            Some(prev) => diff_one(name, prev, state, now, &mut events),
        }
    }

    for (name, prev) in previous {
        if !current.contains_key(name) {
            events.push(Event::new(
                EventType::Stopped,
                name.clone(),
                prev.namespace.clone(),
                prev.clone(),
                now,
            ));
        }
    }

    events
}

fn diff_one(
    name: &str,
    prev: &ProcessState,
    cur: &ProcessState,
    now: DateTime<Utc>,
    events: &mut Vec<Event>,
) {
    if !prev.is_running && cur.is_running {
        events.push(Event::new(
            EventType::Started,
            name,
            cur.namespace.clone(),
            cur.clone(),
            now,
        ));
    } else if prev.is_running && !cur.is_running {
        let event_type = match cur.exit_code {
            Some(code) if code != 0 => EventType::Crashed,
            _ => EventType::Stopped,
        };
        let mut event = Event::new(event_type, name, cur.namespace.clone(), cur.clone(), now);
        event.exit_code = cur.exit_code;
        events.push(event);
    }

    if cur.restarts > prev.restarts {
        let mut event = Event::new(
            EventType::Restarted,
            name,
            cur.namespace.clone(),
            cur.clone(),
            now,
        );
        event.restarts = Some(cur.restarts);
        events.push(event);
    }

    if cur.has_health_probe && prev.health != cur.health {
        if let Some(health) = cur.health {
            let event_type = if health == Health::Ready {
                EventType::Healthy
            } else {
                EventType::Unhealthy
            };
            let mut event =
                Event::new(event_type, name, cur.namespace.clone(), cur.clone(), now);
            event.health = Some(health);
            events.push(event);
        }
    }

    if prev.status != cur.status {
        let mut event = Event::new(
            EventType::StatusChanged,
            name,
            cur.namespace.clone(),
            cur.clone(),
            now,
        );
        event.old_status = Some(prev.status);
        event.new_status = Some(cur.status);
        events.push(event);
    }
}
