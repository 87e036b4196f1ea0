//! End-to-end tests of the Desired-State Store's HTTP + SSE API (§6): a
//! real `axum` server over a real `Store`, exercised with `reqwest`.
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use orchestra::http::store_router;
use orchestra::model::{Region, ScaleSpec, ScaleStrategy, Service};
use orchestra::store::Store;
use serde_json::{json, Value};
use tokio::net::TcpListener;

fn service(id: &str, desired: u32) -> Service {
    Service {
        id: id.to_string(),
        display_name: None,
        description: None,
        scale: ScaleSpec {
            strategy: ScaleStrategy::Local,
            autoscale: orchestra::model::AutoscaleMode::Manual,
            cooldown: None,
            burst_ttl: None,
            regions: vec![Region {
                name: "iad".to_string(),
                min: 1,
                desired,
                max: 5,
            }],
        },
        storage: Default::default(),
        routing: Default::default(),
    }
}

async fn boot_server(store: std::sync::Arc<Store>) -> String {
    let app = store_router(store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn list_services_reflects_current_state() {
    let store = Store::empty();
    store.update(service("web", 2)).await.unwrap();
    let base = boot_server(store).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("{base}/v1/services"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let services = body["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["id"], "web");
}

#[tokio::test]
async fn update_service_returns_created_then_no_content_on_replace() {
    let store = Store::empty();
    let base = boot_server(store).await;
    let client = reqwest::Client::new();

    let resp = client
        .patch(format!("{base}/v1/services/update"))
        .json(&json!({ "service": service("web", 2) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = client
        .patch(format!("{base}/v1/services/update"))
        .json(&json!({ "service": service("web", 4) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let body: Value = client
        .get(format!("{base}/v1/services"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let services = body["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["scale"]["regions"][0]["desired"], 4);
}

#[tokio::test]
async fn update_service_rejects_invalid_region_bounds() {
    let store = Store::empty();
    let base = boot_server(store).await;
    let client = reqwest::Client::new();

    let mut bad = service("web", 2);
    bad.scale.regions[0].max = 1; // desired(2) > max(1): violates invariant
    let resp = client
        .patch(format!("{base}/v1/services/update"))
        .json(&json!({ "service": bad }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("web"));
}

#[tokio::test]
async fn update_service_rejects_empty_id() {
    let store = Store::empty();
    let base = boot_server(store).await;
    let client = reqwest::Client::new();

    let resp = client
        .patch(format!("{base}/v1/services/update"))
        .json(&json!({ "service": service("", 2) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn events_stream_emits_initial_then_update_records() {
    let store = Store::empty();
    store.update(service("web", 2)).await.unwrap();
    let base = boot_server(store.clone()).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{base}/v1/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut stream = resp.bytes_stream();

    // First SSE frame is the `initial` snapshot, delivered eagerly.
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("initial event did not arrive")
        .expect("stream closed before any event")
        .unwrap();
    let first = String::from_utf8_lossy(&first);
    assert!(first.contains("\"reason\":\"initial\""), "{first}");
    assert!(first.contains("\"web\""), "{first}");

    // Mutating the store through the normal API path produces an `update`
    // record on the same subscription.
    store.update(service("worker", 1)).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("update event did not arrive")
        .expect("stream closed before update event")
        .unwrap();
    let second = String::from_utf8_lossy(&second);
    assert!(second.contains("\"reason\":\"update\""), "{second}");
    assert!(second.contains("\"worker\""), "{second}");
}
