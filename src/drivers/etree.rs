use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ActivationDriver, Arity, BuilderContext, ConfigIntent, DeviceConfigurator, DeviceFilter, DriverBuilder,
    DriverTarget,
};
use crate::error::DriverError;
use crate::models::{Endpoint, EndpointRole, ServiceType};
use crate::topology::{DriverFamily, SipParser, WorkUnit};
use crate::vlan::{EpRole, EtreeVlanPool, VlanPools};

const CONTEXT_KEY: &str = "etree-driver";

/// Builds one [`EtreeDriver`] per run for rooted-multipoint services.
///
/// Every endpoint of the run resolves to the same instance, kept in the
/// [`BuilderContext`].
pub struct EtreeDriverBuilder {
    devices: DeviceFilter,
    parser: SipParser,
    pools: Arc<VlanPools>,
    pool: Arc<EtreeVlanPool>,
    configurator: Arc<dyn DeviceConfigurator>,
}

impl EtreeDriverBuilder {
    /// `pools` supplies the per-node internal VLAN that selects each root
    /// endpoint's SPE sub-range
    pub fn new(
        parser: SipParser,
        pools: Arc<VlanPools>,
        pool: Arc<EtreeVlanPool>,
        configurator: Arc<dyn DeviceConfigurator>,
    ) -> Self {
        Self {
            devices: DeviceFilter::any(),
            parser,
            pools,
            pool,
            configurator,
        }
    }

    pub fn devices(mut self, devices: DeviceFilter) -> Self {
        self.devices = devices;
        self
    }
}

impl DriverBuilder for EtreeDriverBuilder {
    fn name(&self) -> &str {
        "etree"
    }

    fn arity(&self) -> Arity {
        Arity::Endpoint
    }

    fn driver_for(&self, target: DriverTarget<'_>, ctx: &mut BuilderContext) -> Option<Arc<dyn ActivationDriver>> {
        let DriverTarget::Endpoint(endpoint) = target else {
            return None;
        };
        if ctx.service_type() != ServiceType::RootedMultipoint
            || !self.devices.allows(self.parser.device_of(&endpoint.sip_id))
        {
            return None;
        }

        if let Some(shared) = ctx.get::<EtreeDriver>(CONTEXT_KEY) {
            return Some(shared);
        }

        let driver = Arc::new(EtreeDriver {
            parser: self.parser.clone(),
            pools: self.pools.clone(),
            pool: self.pool.clone(),
            configurator: self.configurator.clone(),
            state: Mutex::new(EtreeState::default()),
        });
        ctx.put(CONTEXT_KEY, driver.clone());
        Some(driver)
    }
}

#[derive(Default)]
struct EtreeState {
    service_id: Option<String>,
    is_exclusive: bool,
    endpoints: Vec<Endpoint>,
    applied: Vec<ConfigIntent>,
    allocated_root: bool,
    allocated_endpoints: bool,
    /// Nodes whose internal VLAN this run took from the pool
    allocated_internal: Vec<String>,
}

/// Configures every endpoint of an E-Tree service with its root VLAN and
/// a CPE (leaf) or SPE (root) endpoint tag
pub struct EtreeDriver {
    parser: SipParser,
    pools: Arc<VlanPools>,
    pool: Arc<EtreeVlanPool>,
    configurator: Arc<dyn DeviceConfigurator>,
    state: Mutex<EtreeState>,
}

impl EtreeDriver {
    fn snapshot(&self) -> Result<(String, bool, Vec<Endpoint>), DriverError> {
        let state = self.state.lock();
        let service_id = state.service_id.clone().ok_or(DriverError::NotInitialized)?;
        Ok((service_id, state.is_exclusive, state.endpoints.clone()))
    }

    fn intent(&self, service_id: &str, endpoint: &Endpoint, is_exclusive: bool, vlan_id: Option<u16>) -> ConfigIntent {
        let (device, port) = self
            .parser
            .split(&endpoint.sip_id)
            .unwrap_or((endpoint.sip_id.as_str(), endpoint.sip_id.as_str()));
        ConfigIntent {
            service_id: service_id.to_string(),
            device: device.to_string(),
            port: port.to_string(),
            family: DriverFamily::BridgeDomain,
            vlan_id,
            peer: None,
            exclusive: is_exclusive,
        }
    }
}

#[async_trait]
impl ActivationDriver for EtreeDriver {
    fn name(&self) -> &str {
        "etree"
    }

    /// Service parameters come from the first call; endpoints accumulate
    fn initialize(&self, unit: &WorkUnit, service_id: &str, is_exclusive: bool, _service_type: ServiceType) {
        let mut state = self.state.lock();
        if state.service_id.is_none() {
            state.service_id = Some(service_id.to_string());
            state.is_exclusive = is_exclusive;
        }
        if !state.endpoints.contains(&unit.local) {
            state.endpoints.push(unit.local.clone());
        }
    }

    async fn activate(&self) -> Result<(), DriverError> {
        let (service_id, is_exclusive, endpoints) = self.snapshot()?;

        let fresh_root = self.pool.root_vlan(&service_id).await.is_none();
        let root = self.pool.get_vlan_id(&service_id).await?;
        self.state.lock().allocated_root |= fresh_root;

        for endpoint in &endpoints {
            let device = self.parser.device_of(&endpoint.sip_id);
            let node_pool = self.pools.pool(device).await?;
            let fresh = node_pool.allocated(&service_id).await.is_none();
            let internal = node_pool.get_vlan_id(&service_id).await?;
            if fresh {
                self.state.lock().allocated_internal.push(device.to_string());
            }

            let role = match endpoint.role.unwrap_or(EndpointRole::Leaf) {
                EndpointRole::Leaf => EpRole::Cpe,
                EndpointRole::Root => EpRole::Spe(internal),
            };
            let vlan_id = self.pool.get_ep_vlan_id(&service_id, role).await?;
            self.state.lock().allocated_endpoints = true;

            let intent = self.intent(&service_id, endpoint, is_exclusive, Some(vlan_id));
            self.configurator.apply(&intent).await?;
            self.state.lock().applied.push(intent);
        }

        tracing::debug!("[{}] E-Tree root VLAN {} on {} endpoints", service_id, root, endpoints.len());
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), DriverError> {
        let (service_id, is_exclusive, endpoints) = self.snapshot()?;

        for endpoint in &endpoints {
            let intent = self.intent(&service_id, endpoint, is_exclusive, None);
            self.configurator.remove(&intent).await?;
        }
        self.pool.release_ep_tree_service_vlan(&service_id).await?;
        self.pool.release_tree_service_vlan(&service_id).await?;
        for endpoint in &endpoints {
            self.pools
                .release(self.parser.device_of(&endpoint.sip_id), &service_id)
                .await?;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), DriverError> {
        let state = self.state.lock();
        tracing::debug!("E-Tree driver committed {} intents", state.applied.len());
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        let (service_id, _, _) = self.snapshot()?;
        let (applied, allocated_root, allocated_endpoints, allocated_internal) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.applied),
                std::mem::replace(&mut state.allocated_root, false),
                std::mem::replace(&mut state.allocated_endpoints, false),
                std::mem::take(&mut state.allocated_internal),
            )
        };

        let mut first_error = None;
        for intent in &applied {
            if let Err(e) = self.configurator.remove(intent).await {
                tracing::warn!("[{}] rollback of {} failed: {}", service_id, intent, e);
                first_error.get_or_insert(e);
            }
        }
        if allocated_endpoints {
            if let Err(e) = self.pool.release_ep_tree_service_vlan(&service_id).await {
                first_error.get_or_insert(e.into());
            }
        }
        if allocated_root {
            if let Err(e) = self.pool.release_tree_service_vlan(&service_id).await {
                first_error.get_or_insert(e.into());
            }
        }
        for device in &allocated_internal {
            if let Err(e) = self.pools.release(device, &service_id).await {
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
