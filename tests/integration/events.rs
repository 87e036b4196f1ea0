//! End-to-end test of the event pipeline: Supervisor polling drives the
//! Snapshot Differ, whose derived events are published onto a durable,
//! subject-hierarchical log and fanned out to live subscribers.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use orchestra::events::{patterns, EventType};
use orchestra::eventlog::EventPublisher;
use orchestra::model::{Backoff, Probe, ProbeKind, ProcessSpec, ProcessStatus, RestartPolicy};
use orchestra::registry::ChildRegistry;
use orchestra::supervisor::Supervisor;

fn spec(name: &str, command: &str, restart_policy: RestartPolicy) -> ProcessSpec {
    ProcessSpec {
        name: name.to_string(),
        command: command.to_string(),
        args: vec![],
        env: HashMap::new(),
        working_dir: None,
        restart_policy,
        backoff: Backoff::default(),
        depends_on: vec![],
        readiness_probe: None,
        startup_probe: None,
        shutdown_probe: None,
        ports: vec![],
    }
}

#[tokio::test]
async fn crash_without_restart_policy_is_published_as_crashed() {
    let mut registry = ChildRegistry::new();
    registry
        .register(spec("flaky", "exit 7", RestartPolicy::Never))
        .unwrap();

    let publisher = Arc::new(EventPublisher::open_in_memory(Duration::from_secs(3600)).unwrap());
    let supervisor = Supervisor::new(registry, Some(publisher.clone()));
    let mut consumer = publisher.subscribe(patterns::all());

    supervisor.start("flaky").await.unwrap();
    // Let the shell actually exit before the poll cycle reaps it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.poll_once().await;

    let event = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .expect("no event published within timeout")
        .expect("publisher closed before an event arrived");
    assert_eq!(event.event_type, EventType::Crashed);
    assert_eq!(event.exit_code, Some(7));
    assert_eq!(event.process, "flaky");

    let info = supervisor.info("flaky").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Crashed);
    assert!(!info.is_running);
}

#[tokio::test]
async fn automatic_restart_publishes_crashed_then_started_then_restarted() {
    let mut registry = ChildRegistry::new();
    let mut flaky = spec("flaky", "exit 1", RestartPolicy::Always);
    flaky.backoff = Backoff {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(5),
        multiplier: 1.0,
    };
    registry.register(flaky).unwrap();

    let publisher = Arc::new(EventPublisher::open_in_memory(Duration::from_secs(3600)).unwrap());
    let supervisor = Supervisor::new(registry, Some(publisher.clone()));
    let mut consumer = publisher.subscribe(patterns::all());

    supervisor.start("flaky").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.poll_once().await;

    let crashed = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .expect("no event published within timeout")
        .expect("publisher closed before an event arrived");
    assert_eq!(crashed.event_type, EventType::Crashed);

    let started = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(started.event_type, EventType::Started);

    let restarted = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restarted.event_type, EventType::Restarted);
    assert_eq!(restarted.restarts, Some(1));

    let info = supervisor.info("flaky").await.unwrap();
    assert_eq!(info.restarts, 1);
}

#[tokio::test]
async fn readiness_probe_passing_is_published_as_healthy() {
    let mut registry = ChildRegistry::new();
    let mut web = spec("web", "sleep 30", RestartPolicy::Never);
    web.readiness_probe = Some(Probe {
        kind: ProbeKind::Exec {
            command: "true".to_string(),
        },
        initial_delay: Duration::ZERO,
        period: Duration::from_millis(10),
        timeout: Duration::from_secs(1),
        success_threshold: 1,
        failure_threshold: 1,
    });
    registry.register(web).unwrap();

    let publisher = Arc::new(EventPublisher::open_in_memory(Duration::from_secs(3600)).unwrap());
    let supervisor = Supervisor::new(registry, Some(publisher.clone()));
    let mut consumer = publisher.subscribe(patterns::all());

    supervisor.start("web").await.unwrap();
    supervisor.poll_once().await; // starting -> running
    supervisor.poll_once().await; // running -> ready, health becomes Ready

    let mut saw_healthy = false;
    for _ in 0..4 {
        let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), consumer.recv()).await else {
            break;
        };
        if event.event_type == EventType::Healthy {
            saw_healthy = true;
            break;
        }
    }
    assert!(saw_healthy, "expected a healthy event after the readiness probe passed");

    let info = supervisor.info("web").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Ready);
}

#[tokio::test]
async fn replay_returns_every_published_event_for_a_process_in_order() {
    let mut registry = ChildRegistry::new();
    registry
        .register(spec("oneshot", "exit 0", RestartPolicy::Never))
        .unwrap();

    let publisher = Arc::new(EventPublisher::open_in_memory(Duration::from_secs(3600)).unwrap());
    let supervisor = Supervisor::new(registry, Some(publisher.clone()));

    supervisor.start("oneshot").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.poll_once().await;

    let replayed = publisher.replay(&patterns::all()).unwrap();
    assert!(!replayed.is_empty());
    assert!(replayed.iter().any(|e| e.event_type == EventType::Stopped));
    assert_eq!(replayed[0].process, "oneshot");
}
