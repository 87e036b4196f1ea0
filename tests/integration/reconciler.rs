//! End-to-end test of the Reconciler (C7) driven by an HTTP-served
//! Desired-State Store: a service is declared over the real `/v1/services/
//! update` endpoint, and the reconcile loop is expected to pick it up
//! without a restart, converge its DNS records, and stay idempotent on
//! subsequent ticks.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use orchestra::http::store_router;
use orchestra::model::{DnsRecord, Region, RoutingSpec, ScaleSpec, ScaleStrategy, Service};
use orchestra::providers::{DnsRoutingProvider, NullMachinesProvider};
use orchestra::reconciler::Reconciler;
use orchestra::store::Store;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn service_with_dns(id: &str, fqdn_name: &str, content: &str) -> Service {
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
                desired: 2,
                max: 3,
            }],
        },
        storage: Default::default(),
        routing: RoutingSpec {
            provider: "dns".to_string(),
            zone: Some("example.com".to_string()),
            dns_records: vec![DnsRecord {
                name: fqdn_name.to_string(),
                record_type: "A".to_string(),
                ttl: 60,
                content: content.to_string(),
                comment: None,
            }],
            health_checks: vec![],
            load_balancing: Default::default(),
        },
    }
}

async fn boot_store_server(store: Arc<Store>) -> String {
    let app = store_router(store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn reconcile_loop_picks_up_update_without_restart() {
    let store = Store::empty();
    let base = boot_store_server(store.clone()).await;

    let routing = Arc::new(DnsRoutingProvider::new());
    let reconciler = Arc::new(Reconciler::new(
        store,
        Arc::new(NullMachinesProvider),
        routing.clone(),
        Duration::from_secs(3600), // long enough that only the update tick matters
    ));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(reconciler.clone().run(shutdown.clone()));

    // Startup pass runs against an empty store: nothing to converge yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(routing.snapshot().is_empty());

    let client = reqwest::Client::new();
    let resp = client
        .patch(format!("{base}/v1/services/update"))
        .json(&json!({ "service": service_with_dns("web", "web", "1.2.3.4") }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !routing.snapshot().is_empty() || std::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let snapshot = routing.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].content, "1.2.3.4");

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn second_reconcile_pass_is_a_noop_when_desired_state_is_unchanged() {
    let store = Store::empty();
    store
        .update(service_with_dns("web", "web", "1.2.3.4"))
        .await
        .unwrap();

    let routing = Arc::new(DnsRoutingProvider::new());
    let reconciler = Reconciler::new(
        store,
        Arc::new(NullMachinesProvider),
        routing.clone(),
        Duration::from_secs(30),
    );

    reconciler
        .reconcile_once(orchestra::reconciler::ReconcileReason::Startup)
        .await;
    let first_pass = routing.snapshot();
    reconciler
        .reconcile_once(orchestra::reconciler::ReconcileReason::Periodic)
        .await;
    let second_pass = routing.snapshot();

    assert_eq!(first_pass, second_pass);
}

#[tokio::test]
async fn one_failing_service_does_not_prevent_others_from_converging() {
    use async_trait::async_trait;
    use anyhow::Error as ProviderError;
    use orchestra::model::ServiceRuntimeState;
    use orchestra::providers::MachinesProvider;

    struct FlakyMachines;
    #[async_trait]
    impl MachinesProvider for FlakyMachines {
        async fn ensure_machines(&self, service: &Service) -> Result<ServiceRuntimeState, ProviderError> {
            if service.id == "broken" {
                return Err(anyhow::anyhow!("provider unreachable"));
            }
            let regions = service
                .scale
                .regions
                .iter()
                .map(|r| (r.name.clone(), r.desired))
                .collect();
            Ok(ServiceRuntimeState { regions })
        }
    }

    let store = Store::empty();
    store
        .update(service_with_dns("broken", "broken", "9.9.9.9"))
        .await
        .unwrap();
    store
        .update(service_with_dns("healthy", "healthy", "1.1.1.1"))
        .await
        .unwrap();

    let routing = Arc::new(DnsRoutingProvider::new());
    let reconciler = Reconciler::new(store, Arc::new(FlakyMachines), routing.clone(), Duration::from_secs(30));
    reconciler
        .reconcile_once(orchestra::reconciler::ReconcileReason::Startup)
        .await;

    let snapshot = routing.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].content, "1.1.1.1");
}
