//! Pluggable `MachinesProvider`/`RoutingProvider` interfaces (C7's
//! collaborators) and their null/local/illustrative-DNS implementations.
//!
//! Absence of credentials at construction time selects the no-op provider,
//! keeping the control plane runnable in local mode.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use anyhow::Error as ProviderError;
use crate::model::{DnsRecord, Service, ServiceRuntimeState};

/// Drives a `Service`'s replica counts toward its declared regions, on
/// whatever substrate backs this provider (local host, external fleet).
#[async_trait]
pub trait MachinesProvider: Send + Sync {
    /// Ensures the observed machine count for `service` converges toward
    /// its declared regions, returning the resulting runtime state.
    ///
    /// `ScaleStrategy::Infra` is interpreted by the provider, not by the
    /// reconciler: this trait is always called regardless of strategy.
    async fn ensure_machines(&self, service: &Service) -> Result<ServiceRuntimeState, ProviderError>;
}

/// Drives a `Service`'s routing configuration (DNS, load balancing) toward
/// its declared state, given the runtime state machines reported.
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    /// Ensures routing for `service` matches its declared state.
    async fn ensure_routing(
        &self,
        service: &Service,
        runtime: &ServiceRuntimeState,
    ) -> Result<(), ProviderError>;
}

/// A `MachinesProvider` that simply echoes each region's `desired` count as
/// the observed count, with no external effects. Selected when no
/// machines-provider credentials are configured.
#[derive(Debug, Default)]
pub struct NullMachinesProvider;

#[async_trait]
impl MachinesProvider for NullMachinesProvider {
    async fn ensure_machines(&self, service: &Service) -> Result<ServiceRuntimeState, ProviderError> {
        let regions = service
            .scale
            .regions
            .iter()
            .map(|region| (region.name.clone(), region.desired))
            .collect();
        Ok(ServiceRuntimeState { regions })
    }
}

/// A `RoutingProvider` that performs no external writes. Selected when no
/// routing-provider credentials are configured.
#[derive(Debug, Default)]
pub struct NullRoutingProvider;

#[async_trait]
impl RoutingProvider for NullRoutingProvider {
    async fn ensure_routing(
        &self,
        _service: &Service,
        _runtime: &ServiceRuntimeState,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// A single record as it exists at the illustrative DNS provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRecord {
    /// Fully-qualified name.
    pub name: String,
    /// Record type.
    pub record_type: String,
    /// Record content.
    pub content: String,
    /// Time-to-live in seconds.
    pub ttl: i64,
}

/// In-memory illustrative DNS provider: resolves a zone, lists/creates/
/// updates records by name+type, and is a deliberate no-op when content and
/// TTL already match (reconcile idempotence).
pub struct DnsRoutingProvider {
    /// Existing records, keyed by `(fully_qualified_name, type)`.
    records: Mutex<HashMap<(String, String), ExistingRecord>>,
}

impl DnsRoutingProvider {
    /// Builds a provider with no pre-existing records.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds the provider with an existing record, as if previously created
    /// out of band.
    pub fn seed(&self, record: ExistingRecord) {
        let key = (record.name.clone(), record.record_type.clone());
        self.records.lock().unwrap_or_else(|e| e.into_inner()).insert(key, record);
    }

    /// Returns a snapshot of every record currently held, for assertions.
    pub fn snapshot(&self) -> Vec<ExistingRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn fully_qualified_name(zone: &str, record: &DnsRecord) -> String {
        if record.name.ends_with(zone) || zone.is_empty() {
            record.name.clone()
        } else {
            format!("{}.{}", record.name, zone)
        }
    }
}

impl Default for DnsRoutingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingProvider for DnsRoutingProvider {
    async fn ensure_routing(
        &self,
        service: &Service,
        _runtime: &ServiceRuntimeState,
    ) -> Result<(), ProviderError> {
        let zone = service.routing.zone.clone().unwrap_or_default();
        for record in &service.routing.dns_records {
            if record.name.is_empty() || record.record_type.is_empty() || record.content.is_empty()
            {
                warn!(
                    service = %service.id,
                    "skipping DNS record with empty name, type, or content"
                );
                continue;
            }

            let ttl = record.ttl.max(0);
            let fqdn = Self::fully_qualified_name(&zone, record);
            let key = (fqdn.clone(), record.record_type.clone());
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

            match records.get(&key) {
                None => {
                    records.insert(
                        key,
                        ExistingRecord {
                            name: fqdn,
                            record_type: record.record_type.clone(),
                            content: record.content.clone(),
                            ttl,
                        },
                    );
                }
                Some(existing) if existing.content != record.content || existing.ttl != ttl => {
                    records.insert(
                        key,
                        ExistingRecord {
                            name: fqdn,
                            record_type: record.record_type.clone(),
                            content: record.content.clone(),
                            ttl,
                        },
                    );
                }
                Some(_) => {
                    // content and TTL already match: no-op.
                }
            }
        }
        Ok(())
    }
}
