use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ActivationDriver, Arity, BuilderContext, ConfigIntent, DeviceConfigurator, DeviceFilter, DriverBuilder,
    DriverTarget,
};
use crate::error::DriverError;
use crate::models::ServiceType;
use crate::topology::{DriverFamily, SipParser, WorkUnit};
use crate::vlan::VlanPools;

/// Builds [`VlanTaggedDriver`]s for endpoint pairs.
///
/// Non-exclusive services get a VLAN from the pool of the local device;
/// exclusive services use the whole port untagged.
pub struct VlanTaggedDriverBuilder {
    name: String,
    families: Vec<DriverFamily>,
    devices: DeviceFilter,
    parser: SipParser,
    pools: Arc<VlanPools>,
    configurator: Arc<dyn DeviceConfigurator>,
}

impl VlanTaggedDriverBuilder {
    /// Serves every driver family on every device
    pub fn new(
        name: impl Into<String>,
        parser: SipParser,
        pools: Arc<VlanPools>,
        configurator: Arc<dyn DeviceConfigurator>,
    ) -> Self {
        Self {
            name: name.into(),
            families: vec![
                DriverFamily::CrossConnect,
                DriverFamily::Tunnel,
                DriverFamily::LocalBridgeDomain,
                DriverFamily::BridgeDomain,
            ],
            devices: DeviceFilter::any(),
            parser,
            pools,
            configurator,
        }
    }

    pub fn families(mut self, families: &[DriverFamily]) -> Self {
        self.families = families.to_vec();
        self
    }

    pub fn devices(mut self, devices: DeviceFilter) -> Self {
        self.devices = devices;
        self
    }
}

impl DriverBuilder for VlanTaggedDriverBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Arity {
        Arity::Pair
    }

    fn driver_for(&self, target: DriverTarget<'_>, _ctx: &mut BuilderContext) -> Option<Arc<dyn ActivationDriver>> {
        let DriverTarget::Pair(unit) = target else {
            return None;
        };
        if !self.families.contains(&unit.family) || !self.devices.allows(&unit.local_device) {
            return None;
        }

        Some(Arc::new(VlanTaggedDriver {
            name: self.name.clone(),
            parser: self.parser.clone(),
            pools: self.pools.clone(),
            configurator: self.configurator.clone(),
            state: Mutex::new(TaggedState::default()),
        }))
    }
}

#[derive(Default)]
struct TaggedState {
    unit: Option<WorkUnit>,
    service_id: String,
    is_exclusive: bool,
    applied: Vec<ConfigIntent>,
    /// VLAN was taken from the pool by this driver
    allocated: bool,
    /// Deactivated; the device VLAN goes back to the pool on commit
    release_on_commit: bool,
}

/// Configures the local end of one endpoint pair
pub struct VlanTaggedDriver {
    name: String,
    parser: SipParser,
    pools: Arc<VlanPools>,
    configurator: Arc<dyn DeviceConfigurator>,
    state: Mutex<TaggedState>,
}

impl VlanTaggedDriver {
    fn snapshot(&self) -> Result<(WorkUnit, String, bool), DriverError> {
        let state = self.state.lock();
        let unit = state.unit.clone().ok_or(DriverError::NotInitialized)?;
        Ok((unit, state.service_id.clone(), state.is_exclusive))
    }

    fn intent(&self, unit: &WorkUnit, service_id: &str, is_exclusive: bool, vlan_id: Option<u16>) -> ConfigIntent {
        let port_of = |sip: &str| self.parser.port_of(sip).unwrap_or(sip).to_string();
        let peer = (!unit.is_single()).then(|| format!("{}:{}", unit.remote_device, port_of(&unit.remote.sip_id)));

        ConfigIntent {
            service_id: service_id.to_string(),
            device: unit.local_device.clone(),
            port: port_of(&unit.local.sip_id),
            family: unit.family,
            vlan_id,
            peer,
            exclusive: is_exclusive,
        }
    }
}

#[async_trait]
impl ActivationDriver for VlanTaggedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, unit: &WorkUnit, service_id: &str, is_exclusive: bool, _service_type: ServiceType) {
        let mut state = self.state.lock();
        if state.unit.is_some() {
            return;
        }
        state.unit = Some(unit.clone());
        state.service_id = service_id.to_string();
        state.is_exclusive = is_exclusive;
    }

    async fn activate(&self) -> Result<(), DriverError> {
        let (unit, service_id, is_exclusive) = self.snapshot()?;

        let vlan_id = if is_exclusive {
            None
        } else {
            let pool = self.pools.pool(&unit.local_device).await?;
            let fresh = pool.allocated(&service_id).await.is_none();
            let vlan_id = pool.get_vlan_id(&service_id).await?;
            if fresh {
                self.state.lock().allocated = true;
            }
            Some(vlan_id)
        };

        let intent = self.intent(&unit, &service_id, is_exclusive, vlan_id);
        self.configurator.apply(&intent).await?;
        self.state.lock().applied.push(intent);
        Ok(())
    }

    /// Other units on the same device share the VLAN, so it is only
    /// released on commit, once every unit has removed its intent.
    async fn deactivate(&self) -> Result<(), DriverError> {
        let (unit, service_id, is_exclusive) = self.snapshot()?;

        let vlan_id = if is_exclusive {
            None
        } else {
            self.pools.pool(&unit.local_device).await?.allocated(&service_id).await
        };
        let intent = self.intent(&unit, &service_id, is_exclusive, vlan_id);
        self.configurator.remove(&intent).await?;

        self.state.lock().release_on_commit = vlan_id.is_some();
        Ok(())
    }

    async fn commit(&self) -> Result<(), DriverError> {
        let (unit, service_id, _) = self.snapshot()?;
        let (applied, release) = {
            let mut state = self.state.lock();
            (state.applied.len(), std::mem::replace(&mut state.release_on_commit, false))
        };

        if release {
            if let Some(vlan_id) = self.pools.release(&unit.local_device, &service_id).await? {
                tracing::debug!("[{}] released VLAN {} on {}", service_id, vlan_id, unit.local_device);
            }
        }
        tracing::debug!("[{}] {} committed {} intents", service_id, self.name, applied);
        Ok(())
    }

    /// Undo what `activate` did in this run
    async fn rollback(&self) -> Result<(), DriverError> {
        let (unit, service_id, _) = self.snapshot()?;
        let (applied, allocated) = {
            let mut state = self.state.lock();
            state.release_on_commit = false;
            (std::mem::take(&mut state.applied), std::mem::replace(&mut state.allocated, false))
        };

        let mut first_error = None;
        for intent in &applied {
            if let Err(e) = self.configurator.remove(intent).await {
                tracing::warn!("[{}] rollback of {} failed: {}", service_id, intent, e);
                first_error.get_or_insert(e);
            }
        }

        if allocated {
            if let Err(e) = self.pools.release(&unit.local_device, &service_id).await {
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationOrchestrator, ActivationStateTracker};
    use crate::db::MemoryStore;
    use crate::drivers::configurator::testing::RecordingConfigurator;
    use crate::drivers::DriverRepository;
    use crate::models::{ConnectivityService, Endpoint};
    use crate::topology::EndpointTopologyResolver;
    use crate::vlan::VlanRange;
    use tokio_test::assert_err;

    struct Fixture {
        builder: VlanTaggedDriverBuilder,
        pools: Arc<VlanPools>,
        configurator: Arc<RecordingConfigurator>,
    }

    fn fixture(range: VlanRange) -> Fixture {
        let pools = Arc::new(VlanPools::new("ctl-1", range, Arc::new(MemoryStore::new())));
        let configurator = Arc::new(RecordingConfigurator::default());
        let builder = VlanTaggedDriverBuilder::new("vlan-tagged", SipParser::default(), pools.clone(), configurator.clone());
        Fixture {
            builder,
            pools,
            configurator,
        }
    }

    fn p2p(exclusive: bool) -> ConnectivityService {
        ConnectivityService::new(
            "svc-1",
            ServiceType::PointToPoint,
            vec![Endpoint::new("t", "sip:r1:ge0"), Endpoint::new("t", "sip:r2:ge1")],
        )
        .exclusive(exclusive)
    }

    fn driver_for(f: &Fixture, service: &ConnectivityService, index: usize) -> Arc<dyn ActivationDriver> {
        let units = EndpointTopologyResolver::default().pairs_for(&service.endpoints, service.service_type);
        let mut ctx = BuilderContext::new(service);
        let driver = f.builder.driver_for(DriverTarget::Pair(&units[index]), &mut ctx).unwrap();
        driver.initialize(&units[index], &service.service_id, service.is_exclusive, service.service_type);
        driver
    }

    #[test]
    fn test_builder_filters() {
        let f = fixture(VlanRange::general());
        let builder = f.builder.families(&[DriverFamily::CrossConnect]);
        let service = p2p(false);
        let units = EndpointTopologyResolver::default().pairs_for(&service.endpoints, service.service_type);
        let mut ctx = BuilderContext::new(&service);
        // r1 -> r2 is a tunnel
        assert!(builder.driver_for(DriverTarget::Pair(&units[0]), &mut ctx).is_none());
        assert!(builder.driver_for(DriverTarget::Endpoint(&units[0].local), &mut ctx).is_none());

        let f = fixture(VlanRange::general());
        let builder = f.builder.devices(DeviceFilter::only(["r2"]));
        assert!(builder.driver_for(DriverTarget::Pair(&units[0]), &mut ctx).is_none());
        assert!(builder.driver_for(DriverTarget::Pair(&units[1]), &mut ctx).is_some());
    }

    #[tokio::test]
    async fn test_activate_allocates_local_vlan() {
        let f = fixture(VlanRange::general());
        let service = p2p(false);
        let driver = driver_for(&f, &service, 0);
        driver.activate().await.unwrap();
        driver.commit().await.unwrap();

        let applied = f.configurator.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].device, "r1");
        assert_eq!(applied[0].port, "ge0");
        assert_eq!(applied[0].vlan_id, Some(1));
        assert_eq!(applied[0].peer.as_deref(), Some("r2:ge1"));
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, Some(1));
    }

    #[tokio::test]
    async fn test_exclusive_service_is_untagged() {
        let f = fixture(VlanRange::general());
        let service = p2p(true);
        let driver = driver_for(&f, &service, 0);
        driver.activate().await.unwrap();
        assert_eq!(f.configurator.applied()[0].vlan_id, None);
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, None);
    }

    #[tokio::test]
    async fn test_rollback_releases_vlan() {
        let f = fixture(VlanRange::general());
        let service = p2p(false);
        let driver = driver_for(&f, &service, 0);
        driver.activate().await.unwrap();
        driver.rollback().await.unwrap();

        assert_eq!(f.configurator.removed().len(), 1);
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, None);
    }

    #[tokio::test]
    async fn test_rollback_keeps_vlan_it_did_not_allocate() {
        let f = fixture(VlanRange::general());
        let service = p2p(false);
        f.pools.get_vlan_id("r1", "svc-1").await.unwrap();

        let driver = driver_for(&f, &service, 0);
        driver.activate().await.unwrap();
        driver.rollback().await.unwrap();
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, Some(1));
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_activation() {
        let f = fixture(VlanRange::new(1, 1).unwrap());
        f.pools.get_vlan_id("r1", "other").await.unwrap();

        let driver = driver_for(&f, &p2p(false), 0);
        let err = assert_err!(driver.activate().await);
        assert!(matches!(err, DriverError::Vlan(_)));
        assert!(f.configurator.applied().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_releases() {
        let f = fixture(VlanRange::general());
        let service = p2p(false);
        driver_for(&f, &service, 0).activate().await.unwrap();

        let driver = driver_for(&f, &service, 0);
        driver.deactivate().await.unwrap();
        assert_eq!(f.configurator.removed()[0].vlan_id, Some(1));
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, Some(1));

        driver.commit().await.unwrap();
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, None);
    }

    #[tokio::test]
    async fn test_failed_deactivation_keeps_vlan() {
        let f = fixture(VlanRange::general());
        let service = p2p(false);
        driver_for(&f, &service, 0).activate().await.unwrap();

        let driver = driver_for(&f, &service, 0);
        driver.deactivate().await.unwrap();
        driver.rollback().await.unwrap();
        driver.commit().await.unwrap();
        assert_eq!(f.pools.pool("r1").await.unwrap().allocated("svc-1").await, Some(1));
    }

    #[tokio::test]
    async fn test_deactivate_service_with_shared_device_vlan() {
        let f = fixture(VlanRange::general());
        let configurator = f.configurator.clone();
        let pools = f.pools.clone();
        let orchestrator = ActivationOrchestrator::new(
            EndpointTopologyResolver::default(),
            Arc::new(DriverRepository::new().with_builder(Arc::new(f.builder))),
            ActivationStateTracker::new(Arc::new(MemoryStore::new())),
        );
        // Each device is the local end of two units
        let service = ConnectivityService::new(
            "svc-3",
            ServiceType::PointToPoint,
            vec![
                Endpoint::new("t", "sip:a:ge0"),
                Endpoint::new("t", "sip:b:ge0"),
                Endpoint::new("t", "sip:c:ge0"),
            ],
        );

        orchestrator.activate(&service).await.unwrap();
        orchestrator.deactivate(&service).await.unwrap();

        let on_a = |intents: Vec<ConfigIntent>| -> Vec<Option<u16>> {
            intents.into_iter().filter(|i| i.device == "a").map(|i| i.vlan_id).collect()
        };
        assert_eq!(on_a(configurator.applied()), vec![Some(1), Some(1)]);
        assert_eq!(on_a(configurator.removed()), vec![Some(1), Some(1)]);
        assert_eq!(configurator.removed().len(), 6);
        assert!(configurator.removed().iter().all(|i| i.vlan_id == Some(1)));
        for device in ["a", "b", "c"] {
            assert_eq!(pools.pool(device).await.unwrap().allocated("svc-3").await, None);
        }
    }

    #[tokio::test]
    async fn test_uninitialized_driver() {
        let f = fixture(VlanRange::general());
        let service = p2p(false);
        let units = EndpointTopologyResolver::default().pairs_for(&service.endpoints, service.service_type);
        let mut ctx = BuilderContext::new(&service);
        let driver = f.builder.driver_for(DriverTarget::Pair(&units[0]), &mut ctx).unwrap();
        assert!(matches!(driver.activate().await, Err(DriverError::NotInitialized)));
    }
}
