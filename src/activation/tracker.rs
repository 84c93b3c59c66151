use std::sync::Arc;

use chrono::Utc;

use crate::db::{paths, read_json, write_json, DataStore, Partition};
use crate::error::StoreError;
use crate::models::{ActivationRecord, ActivationStatus, ConnectivityService};

/// ActivationStateTracker keeps the outcome of the last orchestration run of
/// each service in the operational partition
#[derive(Clone)]
pub struct ActivationStateTracker {
    store: Arc<dyn DataStore>,
}

impl ActivationStateTracker {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn activated(&self, service: &ConnectivityService) -> Result<(), StoreError> {
        self.write(&service.service_id, ActivationStatus::Active).await
    }

    pub async fn activation_failed(&self, service: &ConnectivityService) -> Result<(), StoreError> {
        self.write(&service.service_id, ActivationStatus::Failed).await
    }

    pub async fn deactivated(&self, service_id: &str) -> Result<(), StoreError> {
        self.store
            .delete(Partition::Operational, &paths::activation(service_id))
            .await
            .inspect_err(|e| tracing::warn!("Failed to remove activation record of {}: {}", service_id, e))
    }

    /// True when no record exists
    pub async fn is_activatable(&self, service_id: &str) -> Result<bool, StoreError> {
        Ok(self.record(service_id).await?.is_none())
    }

    /// True when a record (ACTIVE or FAILED) exists
    pub async fn is_deactivatable(&self, service_id: &str) -> Result<bool, StoreError> {
        Ok(self.record(service_id).await?.is_some())
    }

    pub async fn record(&self, service_id: &str) -> Result<Option<ActivationRecord>, StoreError> {
        read_json(self.store.as_ref(), Partition::Operational, &paths::activation(service_id))
            .await
            .inspect_err(|e| tracing::warn!("Cannot read activation record of {}: {}", service_id, e))
    }

    /// Service ids that have a record
    pub async fn service_ids(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.store.list(Partition::Operational, paths::ACTIVATION).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, _)| path.strip_prefix(paths::ACTIVATION).map(str::to_string))
            .collect())
    }

    async fn write(&self, service_id: &str, status: ActivationStatus) -> Result<(), StoreError> {
        let record = ActivationRecord {
            service_id: service_id.to_string(),
            status,
            updated_at: Utc::now(),
        };
        write_json(self.store.as_ref(), Partition::Operational, &paths::activation(service_id), &record)
            .await
            .inspect_err(|e| tracing::warn!("Failed to record {} for {}: {}", status, service_id, e))
    }
}
