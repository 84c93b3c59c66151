use std::sync::Arc;

use super::transaction::{ActivationTransaction, Operation};
use super::tracker::ActivationStateTracker;
use crate::drivers::{ActivationDriver, BuilderContext, DriverRepository};
use crate::error::ActivationError;
use crate::models::ConnectivityService;
use crate::topology::{EndpointTopologyResolver, WorkUnit};

/// ActivationOrchestrator turns a service into work units, resolves a
/// driver for each and runs them as one [`ActivationTransaction`].
///
/// Every finished run is recorded through the [`ActivationStateTracker`].
pub struct ActivationOrchestrator {
    resolver: EndpointTopologyResolver,
    repository: Arc<DriverRepository>,
    tracker: ActivationStateTracker,
}

impl ActivationOrchestrator {
    pub fn new(
        resolver: EndpointTopologyResolver,
        repository: Arc<DriverRepository>,
        tracker: ActivationStateTracker,
    ) -> Self {
        Self {
            resolver,
            repository,
            tracker,
        }
    }

    pub fn tracker(&self) -> &ActivationStateTracker {
        &self.tracker
    }

    pub fn resolver(&self) -> &EndpointTopologyResolver {
        &self.resolver
    }

    pub async fn activate(&self, service: &ConnectivityService) -> Result<(), ActivationError> {
        if !self.tracker.is_activatable(&service.service_id).await? {
            tracing::info!("Service {} already has an activation record, skipping activation", service.service_id);
            return Err(ActivationError::AlreadyActive(service.service_id.clone()));
        }
        self.run(service, Operation::Activate).await
    }

    pub async fn deactivate(&self, service: &ConnectivityService) -> Result<(), ActivationError> {
        if !self.tracker.is_deactivatable(&service.service_id).await? {
            tracing::info!("Service {} has no activation record, skipping deactivation", service.service_id);
            return Err(ActivationError::NotActive(service.service_id.clone()));
        }
        self.run(service, Operation::Deactivate).await
    }

    /// Deactivate `previous` when it is active, then activate `updated`
    pub async fn update(
        &self,
        previous: &ConnectivityService,
        updated: &ConnectivityService,
    ) -> Result<(), ActivationError> {
        tracing::info!(
            "Updating service {}: {} -> {} endpoints",
            updated.service_id,
            previous.endpoints.len(),
            updated.endpoints.len()
        );

        if self.tracker.is_deactivatable(&previous.service_id).await? {
            self.run(previous, Operation::Deactivate).await?;
        }
        self.run(updated, Operation::Activate).await
    }

    /// Resolve a driver for every work unit, in unit order
    pub fn resolve(&self, service: &ConnectivityService) -> Vec<(WorkUnit, Arc<dyn ActivationDriver>)> {
        let units = self.resolver.pairs_for(&service.endpoints, service.service_type);
        tracing::debug!("[{}] RESOLVING {} work units", service.service_id, units.len());

        let mut ctx = BuilderContext::new(service);
        let mut resolved = Vec::with_capacity(units.len());
        for unit in units {
            match self.repository.resolve(&unit, &mut ctx) {
                Some(driver) => resolved.push((unit, driver)),
                None => tracing::warn!("[{}] no driver for {}, skipping", service.service_id, unit),
            }
        }
        resolved
    }

    async fn run(&self, service: &ConnectivityService, op: Operation) -> Result<(), ActivationError> {
        let resolved = self.resolve(service);
        if resolved.is_empty() {
            tracing::warn!("[{}] no activation driver found", service.service_id);
            self.record_failure(service).await;
            return Err(ActivationError::DriverResolution(service.service_id.clone()));
        }

        let tx = ActivationTransaction::new(service, resolved);
        let outcome = match op {
            Operation::Activate => tx.activate().await,
            Operation::Deactivate => tx.deactivate().await,
        };

        match outcome {
            Ok(()) => self.record_success(service, op).await,
            Err(e) => {
                tracing::warn!("[{}] {} failed: {}", service.service_id, op, e);
                self.record_failure(service).await;
                Err(e)
            }
        }
    }

    async fn record_success(&self, service: &ConnectivityService, op: Operation) -> Result<(), ActivationError> {
        let persisted = match op {
            Operation::Activate => self.tracker.activated(service).await,
            Operation::Deactivate => self.tracker.deactivated(&service.service_id).await,
        };

        match persisted {
            Ok(()) => {
                tracing::info!("[{}] {} complete", service.service_id, op);
                Ok(())
            }
            Err(e) => {
                tracing::error!("[{}] {} succeeded but could not be recorded: {}", service.service_id, op, e);
                self.record_failure(service).await;
                Err(e.into())
            }
        }
    }

    async fn record_failure(&self, service: &ConnectivityService) {
        if let Err(e) = self.tracker.activation_failed(service).await {
            tracing::error!("[{}] could not record FAILED state: {}", service.service_id, e);
        }
    }
}
