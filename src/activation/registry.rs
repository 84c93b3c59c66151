use std::sync::Arc;

use crate::db::{paths, read_json, write_json, DataStore, Partition};
use crate::error::ActivationError;
use crate::models::{ConnectivityService, Endpoint};

/// ServiceRegistry persists service definitions in the configuration partition
#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn DataStore>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, service_id: &str) -> Result<Option<ConnectivityService>, ActivationError> {
        Ok(read_json(self.store.as_ref(), Partition::Configuration, &paths::service(service_id)).await?)
    }

    pub async fn list(&self) -> Result<Vec<ConnectivityService>, ActivationError> {
        let entries = self.store.list(Partition::Configuration, paths::SERVICES).await?;
        let mut services = Vec::with_capacity(entries.len());
        for (path, value) in entries {
            match serde_json::from_value(value) {
                Ok(service) => services.push(service),
                Err(e) => tracing::warn!("Skipping malformed service at {}: {}", path, e),
            }
        }
        Ok(services)
    }

    pub async fn create(&self, service: &ConnectivityService) -> Result<(), ActivationError> {
        if self.get(&service.service_id).await?.is_some() {
            return Err(ActivationError::AlreadyExists(service.service_id.clone()));
        }
        self.put(service).await
    }

    /// Replace the endpoint list of an existing service
    pub async fn replace_endpoints(
        &self,
        service_id: &str,
        endpoints: Vec<Endpoint>,
    ) -> Result<ConnectivityService, ActivationError> {
        let mut service = self
            .get(service_id)
            .await?
            .ok_or_else(|| ActivationError::NotFound(service_id.to_string()))?;
        service.endpoints = endpoints;
        self.put(&service).await?;
        Ok(service)
    }

    pub async fn remove(&self, service_id: &str) -> Result<(), ActivationError> {
        self.store
            .delete(Partition::Configuration, &paths::service(service_id))
            .await?;
        Ok(())
    }

    async fn put(&self, service: &ConnectivityService) -> Result<(), ActivationError> {
        write_json(
            self.store.as_ref(),
            Partition::Configuration,
            &paths::service(&service.service_id),
            service,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::ServiceType;

    fn service(id: &str) -> ConnectivityService {
        ConnectivityService::new(
            id,
            ServiceType::Multipoint,
            vec![Endpoint::new("t", "sip:a:1"), Endpoint::new("t", "sip:b:1")],
        )
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let registry = ServiceRegistry::new(Arc::new(MemoryStore::new()));
        registry.create(&service("s1")).await.unwrap();
        assert!(matches!(
            registry.create(&service("s1")).await,
            Err(ActivationError::AlreadyExists(_))
        ));

        assert_eq!(registry.get("s1").await.unwrap(), Some(service("s1")));
        registry.remove("s1").await.unwrap();
        assert!(registry.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_endpoints() {
        let registry = ServiceRegistry::new(Arc::new(MemoryStore::new()));
        registry.create(&service("s1")).await.unwrap();

        let updated = registry
            .replace_endpoints("s1", vec![Endpoint::new("t", "sip:c:1"), Endpoint::new("t", "sip:d:1")])
            .await
            .unwrap();
        assert_eq!(updated.endpoints[0].sip_id, "sip:c:1");
        assert_eq!(registry.get("s1").await.unwrap().unwrap().endpoints, updated.endpoints);

        assert!(matches!(
            registry.replace_endpoints("ghost", vec![]).await,
            Err(ActivationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list() {
        let store = Arc::new(MemoryStore::new());
        let registry = ServiceRegistry::new(store.clone());
        registry.create(&service("b")).await.unwrap();
        registry.create(&service("a")).await.unwrap();
        store
            .write(Partition::Configuration, "services/broken", serde_json::json!(42))
            .await
            .unwrap();

        let ids: Vec<String> = registry.list().await.unwrap().into_iter().map(|s| s.service_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
