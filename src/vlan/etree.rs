use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{lowest_free, scoped_pool_name, VlanRange, VLAN_ID_MAX};
use crate::db::{paths, read_json, write_json, DataStore, Partition};
use crate::error::VlanError;
use crate::models::VlanAllocation;

const ROOT_POOL: &str = "etree-root";
const ENDPOINT_POOL: &str = "etree-endpoints";

/// Endpoint tag tier.
///
/// SPE tags come from the sub-range keyed by the service's internal VLAN,
/// the id the service holds in the general pool of the endpoint's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpRole {
    Cpe,
    Spe(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EndpointVlans {
    service_name: String,
    vlan_ids: Vec<u16>,
}

struct EtreeState {
    cpe: VlanRange,
    /// internal VLAN -> SPE sub-range
    spe_table: BTreeMap<u16, VlanRange>,
    roots: BTreeMap<String, u16>,
    used_roots: BTreeSet<u16>,
    /// endpoint VLAN -> owning service
    endpoint_owner: BTreeMap<u16, String>,
}

impl EtreeState {
    fn endpoint_vlans(&self, service_name: &str) -> Vec<u16> {
        self.endpoint_owner
            .iter()
            .filter(|(_, owner)| owner.as_str() == service_name)
            .map(|(vlan, _)| *vlan)
            .collect()
    }
}

/// Build the VLAN -> SPE sub-range table.
///
/// Keys run from 1 upward. Each gets a sub-range as wide as the CPE range;
/// the first starts at `spe_base + |cpe|` and each next one follows
/// directly. Generation stops when a sub-range would end above 4093.
pub(crate) fn generate_pre_pop_vlan(cpe: &VlanRange, spe_base: u16) -> Result<BTreeMap<u16, VlanRange>, VlanError> {
    let width = cpe.len() as u32;
    let ceiling = u32::from(VLAN_ID_MAX);
    let mut start = u32::from(spe_base) + width;
    let mut end = start + width - 1;

    let mut table = BTreeMap::new();
    for key in VlanRange::general().iter() {
        if end > ceiling {
            break;
        }
        table.insert(
            key,
            VlanRange {
                start: start as u16,
                end: end as u16,
            },
        );
        start += width;
        end += width;
    }

    let (Some(first), Some(last)) = (table.values().next(), table.values().next_back()) else {
        return Err(VlanError::InvalidRange {
            start: cpe.start,
            end: cpe.end,
            reason: format!("no SPE sub-range fits between base {} and {}", spe_base, ceiling),
        });
    };

    let spe_span = VlanRange {
        start: first.start,
        end: last.end,
    };
    if cpe.overlaps(&spe_span) {
        return Err(VlanError::InvalidRange {
            start: cpe.start,
            end: cpe.end,
            reason: format!("CPE range overlaps SPE sub-ranges {}", spe_span),
        });
    }

    Ok(table)
}

/// EtreeVlanPool allocates root VLANs for E-Tree services and the CPE/SPE
/// endpoint tags that go with them.
///
/// Endpoint tags are unique across all E-Tree services of the controller.
pub struct EtreeVlanPool {
    root_pool: String,
    endpoint_pool: String,
    root_range: VlanRange,
    spe_base: u16,
    store: Arc<dyn DataStore>,
    state: Mutex<EtreeState>,
}

impl EtreeVlanPool {
    pub async fn open(
        controller_id: &str,
        root_range: VlanRange,
        cpe: VlanRange,
        spe_base: u16,
        store: Arc<dyn DataStore>,
    ) -> Result<Self, VlanError> {
        let spe_table = generate_pre_pop_vlan(&cpe, spe_base)?;
        tracing::info!(
            "E-Tree pool: roots {}, CPE range {}, SPE sub-ranges for VLANs 1-{}",
            root_range,
            cpe,
            spe_table.len()
        );

        let root_pool = scoped_pool_name(controller_id, ROOT_POOL);
        let endpoint_pool = scoped_pool_name(controller_id, ENDPOINT_POOL);

        let mut state = EtreeState {
            cpe,
            spe_table,
            roots: BTreeMap::new(),
            used_roots: BTreeSet::new(),
            endpoint_owner: BTreeMap::new(),
        };

        for (path, _) in store.list(Partition::Operational, &paths::vlan_pool(&root_pool)).await? {
            if let Some(a) = read_json::<VlanAllocation>(store.as_ref(), Partition::Operational, &path).await? {
                state.used_roots.insert(a.vlan_id);
                state.roots.insert(a.service_name, a.vlan_id);
            }
        }
        for (path, _) in store.list(Partition::Operational, &paths::vlan_pool(&endpoint_pool)).await? {
            if let Some(e) = read_json::<EndpointVlans>(store.as_ref(), Partition::Operational, &path).await? {
                for vlan in e.vlan_ids {
                    state.endpoint_owner.insert(vlan, e.service_name.clone());
                }
            }
        }

        Ok(Self {
            root_pool,
            endpoint_pool,
            root_range,
            spe_base,
            store,
            state: Mutex::new(state),
        })
    }

    pub async fn cpe_vlan_range(&self) -> VlanRange {
        self.state.lock().await.cpe
    }

    /// Replace the CPE range and regenerate the SPE table
    pub async fn set_cpe_range(&self, cpe: VlanRange) -> Result<(), VlanError> {
        let table = generate_pre_pop_vlan(&cpe, self.spe_base)?;
        let mut state = self.state.lock().await;
        state.cpe = cpe;
        state.spe_table = table;
        tracing::info!("E-Tree pool: CPE range now {}, SPE table regenerated", cpe);
        Ok(())
    }

    /// SPE sub-range of internal VLAN `vlan`
    pub async fn spe_vlan_range(&self, vlan: u16) -> Result<VlanRange, VlanError> {
        self.state
            .lock()
            .await
            .spe_table
            .get(&vlan)
            .copied()
            .ok_or(VlanError::NoSubRange(vlan))
    }

    /// Snapshot of the VLAN -> SPE sub-range table
    pub async fn sub_ranges(&self) -> Vec<(u16, VlanRange)> {
        self.state
            .lock()
            .await
            .spe_table
            .iter()
            .map(|(vlan, range)| (*vlan, *range))
            .collect()
    }

    /// Root VLAN for an E-Tree service, lowest free id of the root range
    pub async fn get_vlan_id(&self, service_name: &str) -> Result<u16, VlanError> {
        let mut state = self.state.lock().await;
        if let Some(vlan_id) = state.roots.get(service_name) {
            return Ok(*vlan_id);
        }

        let Some(vlan_id) = lowest_free(&self.root_range, &state.used_roots) else {
            tracing::warn!("E-Tree root pool exhausted, cannot allocate for {}", service_name);
            return Err(VlanError::PoolExhausted(self.root_pool.clone()));
        };

        let allocation = VlanAllocation {
            service_name: service_name.to_string(),
            vlan_id,
        };
        write_json(
            self.store.as_ref(),
            Partition::Operational,
            &paths::vlan_allocation(&self.root_pool, service_name),
            &allocation,
        )
        .await?;

        state.used_roots.insert(vlan_id);
        state.roots.insert(allocation.service_name, vlan_id);
        tracing::debug!("E-Tree root VLAN {} allocated to {}", vlan_id, service_name);
        Ok(vlan_id)
    }

    pub async fn root_vlan(&self, service_name: &str) -> Option<u16> {
        self.state.lock().await.roots.get(service_name).copied()
    }

    pub async fn release_tree_service_vlan(&self, service_name: &str) -> Result<Option<u16>, VlanError> {
        let mut state = self.state.lock().await;
        let Some(vlan_id) = state.roots.get(service_name).copied() else {
            return Ok(None);
        };

        self.store
            .delete(Partition::Operational, &paths::vlan_allocation(&self.root_pool, service_name))
            .await?;

        state.roots.remove(service_name);
        state.used_roots.remove(&vlan_id);
        Ok(Some(vlan_id))
    }

    /// Allocate one endpoint tag for `service_name`. Each call takes a new id.
    pub async fn get_ep_vlan_id(&self, service_name: &str, role: EpRole) -> Result<u16, VlanError> {
        let mut state = self.state.lock().await;
        let range = match role {
            EpRole::Cpe => state.cpe,
            EpRole::Spe(vlan) => *state.spe_table.get(&vlan).ok_or(VlanError::NoSubRange(vlan))?,
        };

        let used: BTreeSet<u16> = state.endpoint_owner.keys().copied().collect();
        let Some(vlan_id) = lowest_free(&range, &used) else {
            tracing::warn!("E-Tree endpoint range {} exhausted, cannot allocate for {}", range, service_name);
            return Err(VlanError::PoolExhausted(self.endpoint_pool.clone()));
        };

        let mut vlan_ids = state.endpoint_vlans(service_name);
        vlan_ids.push(vlan_id);
        let record = EndpointVlans {
            service_name: service_name.to_string(),
            vlan_ids,
        };
        write_json(
            self.store.as_ref(),
            Partition::Operational,
            &paths::vlan_allocation(&self.endpoint_pool, service_name),
            &record,
        )
        .await?;

        state.endpoint_owner.insert(vlan_id, record.service_name);
        tracing::debug!("E-Tree endpoint VLAN {} ({:?}) allocated to {}", vlan_id, role, service_name);
        Ok(vlan_id)
    }

    /// Free every endpoint tag held by `service_name`
    pub async fn release_ep_tree_service_vlan(&self, service_name: &str) -> Result<Vec<u16>, VlanError> {
        let mut state = self.state.lock().await;
        let vlan_ids = state.endpoint_vlans(service_name);
        if vlan_ids.is_empty() {
            return Ok(vlan_ids);
        }

        self.store
            .delete(Partition::Operational, &paths::vlan_allocation(&self.endpoint_pool, service_name))
            .await?;

        for vlan in &vlan_ids {
            state.endpoint_owner.remove(vlan);
        }
        Ok(vlan_ids)
    }

    pub async fn endpoint_vlans(&self, service_name: &str) -> Vec<u16> {
        self.state.lock().await.endpoint_vlans(service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use tokio_test::assert_err;

    fn root_range() -> VlanRange {
        VlanRange::new(2048, 4093).unwrap()
    }

    fn cpe() -> VlanRange {
        VlanRange::new(10, 19).unwrap()
    }

    async fn open(store: Arc<MemoryStore>) -> EtreeVlanPool {
        EtreeVlanPool::open("ctl-1", root_range(), cpe(), 1000, store).await.unwrap()
    }

    #[test]
    fn test_pre_pop_table_layout() {
        let table = generate_pre_pop_vlan(&cpe(), 1000).unwrap();
        assert_eq!(table.get(&1), Some(&VlanRange { start: 1010, end: 1019 }));
        assert_eq!(table.get(&2), Some(&VlanRange { start: 1020, end: 1029 }));
        assert!(table.values().all(|r| r.end <= 4093));
        // (4093 - 1009) / 10 full sub-ranges fit
        assert_eq!(table.len(), 308);
        assert_eq!(table.keys().next_back(), Some(&308));
        assert_eq!(table.get(&308), Some(&VlanRange { start: 4080, end: 4089 }));
    }

    #[test]
    fn test_sub_ranges_disjoint() {
        let table = generate_pre_pop_vlan(&cpe(), 1000).unwrap();
        let ranges: Vec<VlanRange> = table.values().copied().collect();
        for (i, a) in ranges.iter().enumerate() {
            assert!(!a.overlaps(&cpe()), "{} overlaps CPE", a);
            assert_eq!(a.len(), cpe().len());
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "{} overlaps {}", a, b);
            }
        }
    }

    #[test]
    fn test_overlapping_cpe_rejected() {
        let bad_cpe = VlanRange::new(1015, 1024).unwrap();
        let err = assert_err!(generate_pre_pop_vlan(&bad_cpe, 1000));
        assert!(matches!(err, VlanError::InvalidRange { .. }));

        let no_room = assert_err!(generate_pre_pop_vlan(&cpe(), 4090));
        assert!(matches!(no_room, VlanError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn test_set_cpe_range_regenerates() {
        let pool = open(Arc::new(MemoryStore::new())).await;
        assert_eq!(pool.spe_vlan_range(1).await.unwrap(), VlanRange { start: 1010, end: 1019 });

        pool.set_cpe_range(VlanRange::new(10, 29).unwrap()).await.unwrap();
        assert_eq!(pool.cpe_vlan_range().await.len(), 20);
        assert_eq!(pool.spe_vlan_range(1).await.unwrap(), VlanRange { start: 1020, end: 1039 });
        assert!(matches!(pool.spe_vlan_range(2048).await, Err(VlanError::NoSubRange(2048))));
    }

    #[tokio::test]
    async fn test_root_and_endpoint_allocation() {
        let pool = open(Arc::new(MemoryStore::new())).await;
        let root = pool.get_vlan_id("tree-1").await.unwrap();
        assert_eq!(root, 2048);
        assert_eq!(pool.get_vlan_id("tree-1").await.unwrap(), root);

        let leaf_a = pool.get_ep_vlan_id("tree-1", EpRole::Cpe).await.unwrap();
        let leaf_b = pool.get_ep_vlan_id("tree-1", EpRole::Cpe).await.unwrap();
        let hub = pool.get_ep_vlan_id("tree-1", EpRole::Spe(1)).await.unwrap();
        assert_eq!((leaf_a, leaf_b, hub), (10, 11, 1010));

        // Endpoint tags are shared across services
        assert_eq!(pool.get_ep_vlan_id("tree-2", EpRole::Cpe).await.unwrap(), 12);

        let released = pool.release_ep_tree_service_vlan("tree-1").await.unwrap();
        assert_eq!(released, vec![10, 11, 1010]);
        assert_eq!(pool.endpoint_vlans("tree-2").await, vec![12]);
        assert_eq!(pool.get_ep_vlan_id("tree-3", EpRole::Cpe).await.unwrap(), 10);

        assert_eq!(pool.release_tree_service_vlan("tree-1").await.unwrap(), Some(2048));
        assert_eq!(pool.release_tree_service_vlan("tree-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_spe_without_sub_range() {
        let pool = open(Arc::new(MemoryStore::new())).await;
        let err = assert_err!(pool.get_ep_vlan_id("tree-1", EpRole::Spe(309)).await);
        assert!(matches!(err, VlanError::NoSubRange(309)));
        assert!(pool.endpoint_vlans("tree-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_cpe_exhaustion() {
        let pool = open(Arc::new(MemoryStore::new())).await;
        for _ in 0..10 {
            pool.get_ep_vlan_id("tree", EpRole::Cpe).await.unwrap();
        }
        let err = assert_err!(pool.get_ep_vlan_id("other", EpRole::Cpe).await);
        assert!(matches!(err, VlanError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_root_pool_spans_whole_range() {
        let pool = open(Arc::new(MemoryStore::new())).await;
        for i in 0..root_range().len() {
            let root = pool.get_vlan_id(&format!("tree-{}", i)).await.unwrap();
            assert_eq!(usize::from(root), 2048 + i);
        }
        let err = assert_err!(pool.get_vlan_id("one-too-many").await);
        assert!(matches!(err, VlanError::PoolExhausted(ref name) if name == "ctl-1/etree-root"));

        pool.release_tree_service_vlan("tree-7").await.unwrap();
        assert_eq!(pool.get_vlan_id("one-too-many").await.unwrap(), 2055);
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = Arc::new(MemoryStore::new());
        let pool = open(store.clone()).await;
        let root = pool.get_vlan_id("tree-1").await.unwrap();
        pool.get_ep_vlan_id("tree-1", EpRole::Cpe).await.unwrap();
        pool.get_ep_vlan_id("tree-1", EpRole::Spe(1)).await.unwrap();

        let reopened = open(store.clone()).await;
        assert_eq!(reopened.get_vlan_id("tree-1").await.unwrap(), root);
        assert_eq!(reopened.endpoint_vlans("tree-1").await, vec![10, 1010]);
        assert_eq!(reopened.get_vlan_id("tree-2").await.unwrap(), 2049);

        let other = EtreeVlanPool::open("ctl-2", root_range(), cpe(), 1000, store).await.unwrap();
        assert_eq!(other.root_vlan("tree-1").await, None);
    }
}
