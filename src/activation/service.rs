use std::sync::Arc;

use tokio::sync::mpsc;

use super::orchestrator::ActivationOrchestrator;
use super::registry::ServiceRegistry;
use super::validate::{validate_service, validate_update};
use crate::error::ActivationError;
use crate::models::{ConnectivityService, ServiceRequest};

/// ActivationService processes service requests one at a time on a worker task
pub struct ActivationService {
    registry: ServiceRegistry,
    orchestrator: Arc<ActivationOrchestrator>,
    pending_tx: mpsc::Sender<ServiceRequest>,
}

impl ActivationService {
    pub fn new(registry: ServiceRegistry, orchestrator: Arc<ActivationOrchestrator>, queue_depth: usize) -> Arc<Self> {
        let (pending_tx, pending_rx) = mpsc::channel(queue_depth.max(1));

        let service = Arc::new(Self {
            registry,
            orchestrator,
            pending_tx,
        });

        // Start the worker
        let worker_service = service.clone();
        tokio::spawn(async move {
            worker_service.worker(pending_rx).await;
        });

        service
    }

    /// Queue a request for the worker
    pub async fn submit(&self, request: ServiceRequest) {
        let service_id = request.service_id().to_string();
        if let Err(e) = self.pending_tx.send(request).await {
            tracing::warn!("Failed to submit request for service {}: {}", service_id, e);
        }
    }

    /// Activate stored services that have no activation record, which is
    /// what a crash between storing and activating leaves behind
    async fn recover_unrecorded(&self) {
        let services = match self.registry.list().await {
            Ok(services) => services,
            Err(e) => {
                tracing::error!("Failed to list services for recovery: {}", e);
                return;
            }
        };

        let mut recovered = 0;
        for service in services {
            match self.orchestrator.tracker().is_activatable(&service.service_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("Skipping recovery of service {}: {}", service.service_id, e);
                    continue;
                }
            }
            tracing::info!("Re-activating service {} (no activation record)", service.service_id);
            match self.orchestrator.activate(&service).await {
                Ok(()) => recovered += 1,
                Err(e) => tracing::warn!("Recovery of service {} failed: {}", service.service_id, e),
            }
        }
        if recovered > 0 {
            tracing::info!("Re-activated {} services", recovered);
        }
    }

    async fn worker(&self, mut rx: mpsc::Receiver<ServiceRequest>) {
        self.recover_unrecorded().await;

        while let Some(request) = rx.recv().await {
            let service_id = request.service_id().to_string();
            if let Err(e) = self.process(request).await {
                tracing::error!("Service {} request failed: {}", service_id, e);
            }
        }
    }

    /// Run one request inline. Returns the id of the affected service.
    pub async fn process(&self, request: ServiceRequest) -> Result<String, ActivationError> {
        match request {
            ServiceRequest::Create(service) => self.create(service).await,
            ServiceRequest::Update(service) => self.update(service).await,
            ServiceRequest::Delete(service_id) => self.delete(service_id).await,
        }
    }

    async fn create(&self, mut service: ConnectivityService) -> Result<String, ActivationError> {
        if service.service_id.is_empty() {
            service.service_id = ConnectivityService::generate_id();
        }
        validate_service(&service, self.orchestrator.resolver().parser())?;

        tracing::info!(
            "Creating {} service {} with {} endpoints",
            service.service_type,
            service.service_id,
            service.endpoints.len()
        );
        self.registry.create(&service).await?;
        self.orchestrator.activate(&service).await?;
        Ok(service.service_id)
    }

    async fn update(&self, service: ConnectivityService) -> Result<String, ActivationError> {
        let existing = self.registry.get(&service.service_id).await?;
        validate_update(existing.as_ref(), &service, self.orchestrator.resolver().parser())?;
        let Some(existing) = existing else {
            return Err(ActivationError::NotFound(service.service_id));
        };

        self.orchestrator.update(&existing, &service).await?;
        self.registry
            .replace_endpoints(&service.service_id, service.endpoints)
            .await?;
        Ok(service.service_id)
    }

    async fn delete(&self, service_id: String) -> Result<String, ActivationError> {
        let existing = self
            .registry
            .get(&service_id)
            .await?
            .ok_or_else(|| ActivationError::NotFound(service_id.clone()))?;

        tracing::info!("Deleting service {}", service_id);
        if self.orchestrator.tracker().is_deactivatable(&service_id).await? {
            self.orchestrator.deactivate(&existing).await?;
        }
        self.registry.remove(&service_id).await?;
        Ok(service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationStateTracker;
    use crate::db::{DataStore, MemoryStore};
    use crate::drivers::{DriverRepository, LoggingConfigurator, VlanTaggedDriverBuilder};
    use crate::models::{ActivationStatus, Endpoint, ServiceType};
    use crate::topology::{EndpointTopologyResolver, SipParser};
    use crate::vlan::{VlanPools, VlanRange};
    use std::time::Duration;
    use tokio_test::assert_err;

    struct Fixture {
        service: Arc<ActivationService>,
        registry: ServiceRegistry,
        tracker: ActivationStateTracker,
        pools: Arc<VlanPools>,
    }

    fn fixture_with_store(store: Arc<dyn DataStore>) -> Fixture {
        let pools = Arc::new(VlanPools::new("ctl-1", VlanRange::general(), store.clone()));
        let repository = DriverRepository::new().with_builder(Arc::new(VlanTaggedDriverBuilder::new(
            "vlan-tagged",
            SipParser::default(),
            pools.clone(),
            Arc::new(LoggingConfigurator),
        )));
        let tracker = ActivationStateTracker::new(store.clone());
        let orchestrator = Arc::new(ActivationOrchestrator::new(
            EndpointTopologyResolver::default(),
            Arc::new(repository),
            tracker.clone(),
        ));
        let registry = ServiceRegistry::new(store);
        let service = ActivationService::new(registry.clone(), orchestrator, 8);
        Fixture {
            service,
            registry,
            tracker,
            pools,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryStore::new()))
    }

    fn p2p(id: &str) -> ConnectivityService {
        ConnectivityService::new(
            id,
            ServiceType::PointToPoint,
            vec![Endpoint::new("t", "sip:r1:ge0"), Endpoint::new("t", "sip:r2:ge0")],
        )
    }

    async fn status(f: &Fixture, id: &str) -> Option<ActivationStatus> {
        f.tracker.record(id).await.unwrap().map(|r| r.status)
    }

    #[tokio::test]
    async fn test_create_activates_and_allocates() {
        let f = fixture();
        let id = f.service.process(ServiceRequest::Create(p2p("svc-1"))).await.unwrap();
        assert_eq!(id, "svc-1");
        assert_eq!(status(&f, "svc-1").await, Some(ActivationStatus::Active));
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, Some(1));
        assert_eq!(f.pools.pool("r2").await.unwrap().allocated("svc-1").await, Some(1));
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let f = fixture();
        let id = f.service.process(ServiceRequest::Create(p2p(""))).await.unwrap();
        assert!(id.contains(':'));
        assert!(f.registry.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_stored() {
        let f = fixture();
        let mut bad = p2p("bad");
        bad.endpoints.truncate(1);
        let err = assert_err!(f.service.process(ServiceRequest::Create(bad)).await);
        assert!(matches!(err, ActivationError::InvalidRequest(_)));
        assert!(f.registry.get("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_replaces_endpoints() {
        let f = fixture();
        f.service.process(ServiceRequest::Create(p2p("svc-1"))).await.unwrap();

        let mut updated = p2p("svc-1");
        updated.endpoints[1] = Endpoint::new("t", "sip:r3:ge0");
        f.service.process(ServiceRequest::Update(updated)).await.unwrap();

        let stored = f.registry.get("svc-1").await.unwrap().unwrap();
        assert_eq!(stored.endpoints[1].sip_id, "sip:r3:ge0");
        assert_eq!(status(&f, "svc-1").await, Some(ActivationStatus::Active));
        assert_eq!(f.pools.pool("r2").await.unwrap().allocated("svc-1").await, None);
        assert_eq!(f.pools.pool("r3").await.unwrap().allocated("svc-1").await, Some(1));
    }

    #[tokio::test]
    async fn test_update_unknown_service() {
        let f = fixture();
        let err = assert_err!(f.service.process(ServiceRequest::Update(p2p("ghost"))).await);
        assert!(matches!(err, ActivationError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_deactivates_and_removes() {
        let f = fixture();
        f.service.process(ServiceRequest::Create(p2p("svc-1"))).await.unwrap();
        f.service.process(ServiceRequest::Delete("svc-1".to_string())).await.unwrap();

        assert!(f.registry.get("svc-1").await.unwrap().is_none());
        assert_eq!(status(&f, "svc-1").await, None);
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, None);
    }

    #[tokio::test]
    async fn test_submit_runs_on_worker() {
        let f = fixture();
        f.service.submit(ServiceRequest::Create(p2p("svc-q"))).await;

        for _ in 0..50 {
            if status(&f, "svc-q").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status(&f, "svc-q").await, Some(ActivationStatus::Active));
    }

    #[tokio::test]
    async fn test_recovers_unrecorded_services() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
        ServiceRegistry::new(store.clone()).create(&p2p("orphan")).await.unwrap();

        let f = fixture_with_store(store);
        for _ in 0..50 {
            if status(&f, "orphan").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status(&f, "orphan").await, Some(ActivationStatus::Active));
    }
}
