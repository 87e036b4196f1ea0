//! End-to-end tests of the Supervisor's HTTP control API (§6): a real
//! `axum` server bound to an ephemeral port, driven over the network with
//! `reqwest`, against a registry of real (but trivial) `sh -c` children.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use orchestra::http::supervisor_router;
use orchestra::model::{
    Backoff, DependsOn, DependsOnCondition, ProbeKind, ProcessSpec, RestartPolicy,
};
use orchestra::registry::ChildRegistry;
use orchestra::runtime::{self, RuntimeMode};
use orchestra::supervisor::Supervisor;
use orchestra::test_utils::env_lock;
use serde_json::Value;
use tempfile::tempdir;
use tokio::net::TcpListener;

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

fn set_test_home(path: &std::path::Path) {
    // SAFETY: serialized by `env_lock`; no other thread reads/writes `HOME`
    // for the duration this guard is held.
    unsafe { std::env::set_var("HOME", path) };
    runtime::init(RuntimeMode::User);
}

/// Boots a supervisor control API server on an ephemeral localhost port and
/// returns its base URL. The server task is detached; the test process
/// exiting tears down every spawned child via `kill_on_drop`.
async fn boot_server(registry: ChildRegistry) -> (String, std::sync::Arc<Supervisor>) {
    let supervisor = Supervisor::new(registry, None);
    let app = supervisor_router(supervisor.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), supervisor)
}

#[tokio::test]
async fn start_list_stop_round_trip() {
    let _guard = env_lock();
    let home = tempdir().unwrap();
    set_test_home(home.path());

    let mut registry = ChildRegistry::new();
    registry
        .register(spec("sleeper", "sleep 30", RestartPolicy::Never))
        .unwrap();

    let (base, _supervisor) = boot_server(registry).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/process/start/sleeper"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = client
        .get(format!("{base}/processes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = body["data"].as_array().unwrap();
    let sleeper = entries.iter().find(|e| e["name"] == "sleeper").unwrap();
    assert_eq!(sleeper["is_running"], true);
    assert_eq!(sleeper["restarts"], 0);

    let resp = client
        .patch(format!("{base}/process/stop/sleeper"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = client
        .get(format!("{base}/processes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = body["data"].as_array().unwrap();
    let sleeper = entries.iter().find(|e| e["name"] == "sleeper").unwrap();
    assert_eq!(sleeper["is_running"], false);
}

#[tokio::test]
async fn starting_unknown_process_is_404() {
    let _guard = env_lock();
    let home = tempdir().unwrap();
    set_test_home(home.path());

    let (base, _supervisor) = boot_server(ChildRegistry::new()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/process/start/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn dependency_gate_blocks_start_until_dependency_ready() {
    let _guard = env_lock();
    let home = tempdir().unwrap();
    set_test_home(home.path());

    let mut registry = ChildRegistry::new();
    let mut db = spec("db", "sleep 30", RestartPolicy::Never);
    db.readiness_probe = Some(orchestra::model::Probe {
        kind: ProbeKind::Exec {
            command: "true".to_string(),
        },
        initial_delay: Duration::ZERO,
        period: Duration::from_millis(10),
        timeout: Duration::from_secs(1),
        success_threshold: 1,
        failure_threshold: 1,
    });
    registry.register(db).unwrap();

    let mut api = spec("api", "sleep 30", RestartPolicy::Never);
    api.depends_on.push(DependsOn {
        name: "db".to_string(),
        condition: DependsOnCondition::ProcessHealthy,
    });
    registry.register(api).unwrap();

    let (base, supervisor) = boot_server(registry).await;
    let client = reqwest::Client::new();

    // "db" has not even been started: "api" must be gated.
    let resp = client
        .post(format!("{base}/process/start/api"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Start "db" and drive the poll loop by hand until its readiness probe
    // has flipped it to `ready` (starting -> running -> ready).
    client.post(format!("{base}/process/start/db")).send().await.unwrap();
    for _ in 0..10 {
        supervisor.poll_once().await;
        if supervisor.info("db").await.unwrap().status == orchestra::model::ProcessStatus::Ready {
            break;
        }
    }
    assert_eq!(
        supervisor.info("db").await.unwrap().status,
        orchestra::model::ProcessStatus::Ready
    );

    let resp = client
        .post(format!("{base}/process/start/api"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn scale_up_and_down_converges_replica_count() {
    let _guard = env_lock();
    let home = tempdir().unwrap();
    set_test_home(home.path());

    let mut registry = ChildRegistry::new();
    registry
        .register(spec("worker", "sleep 30", RestartPolicy::Never))
        .unwrap();

    let (base, _supervisor) = boot_server(registry).await;
    let client = reqwest::Client::new();

    let resp = client
        .patch(format!("{base}/process/scale/worker/3"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = client
        .get(format!("{base}/processes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let worker = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["name"] == "worker")
        .unwrap();
    assert_eq!(worker["replicas"], 3);

    let resp = client
        .patch(format!("{base}/process/scale/worker/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = client
        .get(format!("{base}/processes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let worker = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["name"] == "worker")
        .unwrap();
    assert_eq!(worker["replicas"], 0);
}

#[tokio::test]
async fn stop_many_reports_per_name_status() {
    let _guard = env_lock();
    let home = tempdir().unwrap();
    set_test_home(home.path());

    let mut registry = ChildRegistry::new();
    registry
        .register(spec("a", "sleep 30", RestartPolicy::Never))
        .unwrap();
    registry
        .register(spec("b", "sleep 30", RestartPolicy::Never))
        .unwrap();

    let (base, _supervisor) = boot_server(registry).await;
    let client = reqwest::Client::new();

    client.post(format!("{base}/process/start/a")).send().await.unwrap();
    client.post(format!("{base}/process/start/b")).send().await.unwrap();

    let resp = client
        .patch(format!("{base}/processes/stop"))
        .json(&vec!["a", "b", "ghost"])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 207);
    let body: HashMap<String, String> = resp.json().await.unwrap();
    assert_eq!(body.get("a"), Some(&"stopped".to_string()));
    assert_eq!(body.get("b"), Some(&"stopped".to_string()));
    assert_eq!(body.get("ghost"), Some(&"not_found".to_string()));
}

#[tokio::test]
async fn log_tail_limit_zero_returns_everything_and_negative_offset_clamps() {
    let _guard = env_lock();
    let home = tempdir().unwrap();
    set_test_home(home.path());

    let mut registry = ChildRegistry::new();
    registry
        .register(spec(
            "chatty",
            "for i in 1 2 3 4 5; do echo line$i; done; sleep 30",
            RestartPolicy::Never,
        ))
        .unwrap();

    let (base, supervisor) = boot_server(registry).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{base}/process/start/chatty"))
        .send()
        .await
        .unwrap();

    // Give the child a moment to emit its lines onto the log channel.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let lines = supervisor.logs("chatty", 0, 0).await;
        if lines.len() >= 5 || std::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let resp: Value = client
        .get(format!("{base}/process/logs/chatty/-5/0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let lines = resp["logs"].as_array().unwrap();
    assert!(lines.len() >= 5, "expected at least 5 lines, got {lines:?}");

    let resp = client
        .delete(format!("{base}/process/logs/chatty"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp: Value = client
        .get(format!("{base}/process/logs/chatty/0/0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(resp["logs"].as_array().unwrap().is_empty());
}
