//! VLAN tag allocation.
//!
//! [`VlanPool`] hands out one tag per service name from an inclusive range,
//! lowest free id first. [`VlanPools`] keeps one pool per node and
//! [`EtreeVlanPool`] implements the two-tier E-Tree scheme.

mod etree;

pub use etree::{EpRole, EtreeVlanPool};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::db::{paths, read_json, write_json, DataStore, Partition};
use crate::error::VlanError;
use crate::models::VlanAllocation;

/// Lowest usable VLAN id
pub const VLAN_ID_MIN: u16 = 1;
/// Highest id handed out by default
pub const VLAN_ID_MAX: u16 = 4093;
/// Highest id a range may name
pub const VLAN_ID_LIMIT: u16 = 4094;

/// Inclusive VLAN id range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VlanRange {
    pub start: u16,
    pub end: u16,
}

impl VlanRange {
    pub fn new(start: u16, end: u16) -> Result<Self, VlanError> {
        let reason = if start > end {
            Some("start is above end")
        } else if start < VLAN_ID_MIN {
            Some("VLAN 0 is reserved")
        } else if end > VLAN_ID_LIMIT {
            Some("end is above 4094")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(VlanError::InvalidRange {
                start,
                end,
                reason: reason.to_string(),
            }),
            None => Ok(Self { start, end }),
        }
    }

    /// Default general-purpose range, 1-4093
    pub fn general() -> Self {
        Self {
            start: VLAN_ID_MIN,
            end: VLAN_ID_MAX,
        }
    }

    pub fn contains(&self, vlan: u16) -> bool {
        vlan >= self.start && vlan <= self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false: `new` rejects `start > end`
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn overlaps(&self, other: &VlanRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for VlanRange {
    type Err = VlanError;

    /// Parse `"start-end"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VlanError::InvalidRange {
            start: 0,
            end: 0,
            reason: format!("cannot parse {:?}", s),
        };
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse().map_err(|_| invalid())?;
        let end = end.trim().parse().map_err(|_| invalid())?;
        Self::new(start, end)
    }
}

/// Lowest id in `range` that is not in `used`
pub(crate) fn lowest_free(range: &VlanRange, used: &BTreeSet<u16>) -> Option<u16> {
    range.iter().find(|vlan| !used.contains(vlan))
}

#[derive(Default)]
struct PoolState {
    by_service: BTreeMap<String, u16>,
    used: BTreeSet<u16>,
}

impl PoolState {
    fn insert(&mut self, service_name: String, vlan_id: u16) {
        self.used.insert(vlan_id);
        self.by_service.insert(service_name, vlan_id);
    }
}

/// VlanPool maps service names to VLAN ids within one range.
///
/// State is loaded from the operational partition when the pool is opened
/// and every change is written back before it becomes visible. The lock is
/// held across the store write so allocate and release are atomic.
pub struct VlanPool {
    name: String,
    range: VlanRange,
    store: Arc<dyn DataStore>,
    state: Mutex<PoolState>,
}

impl VlanPool {
    pub async fn open(
        name: impl Into<String>,
        range: VlanRange,
        store: Arc<dyn DataStore>,
    ) -> Result<Self, VlanError> {
        let name = name.into();
        let mut state = PoolState::default();

        for (path, _) in store.list(Partition::Operational, &paths::vlan_pool(&name)).await? {
            let Some(allocation) = read_json::<VlanAllocation>(store.as_ref(), Partition::Operational, &path).await?
            else {
                continue;
            };
            if !range.contains(allocation.vlan_id) {
                tracing::warn!(
                    "VLAN pool {}: restored VLAN {} for {} is outside {}",
                    name, allocation.vlan_id, allocation.service_name, range
                );
            }
            state.insert(allocation.service_name, allocation.vlan_id);
        }

        if !state.by_service.is_empty() {
            tracing::debug!("VLAN pool {}: restored {} allocations", name, state.by_service.len());
        }

        Ok(Self {
            name,
            range,
            store,
            state: Mutex::new(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> VlanRange {
        self.range
    }

    /// VLAN id for `service_name`, allocating the lowest free id on first use
    pub async fn get_vlan_id(&self, service_name: &str) -> Result<u16, VlanError> {
        let mut state = self.state.lock().await;
        if let Some(vlan_id) = state.by_service.get(service_name) {
            return Ok(*vlan_id);
        }

        let Some(vlan_id) = lowest_free(&self.range, &state.used) else {
            tracing::warn!("VLAN pool {} exhausted, cannot allocate for {}", self.name, service_name);
            return Err(VlanError::PoolExhausted(self.name.clone()));
        };

        let allocation = VlanAllocation {
            service_name: service_name.to_string(),
            vlan_id,
        };
        write_json(
            self.store.as_ref(),
            Partition::Operational,
            &paths::vlan_allocation(&self.name, service_name),
            &allocation,
        )
        .await?;

        state.insert(allocation.service_name, vlan_id);
        tracing::debug!("VLAN pool {}: allocated {} to {}", self.name, vlan_id, service_name);
        Ok(vlan_id)
    }

    /// Free the id held by `service_name`. Returns the freed id, if any.
    pub async fn release(&self, service_name: &str) -> Result<Option<u16>, VlanError> {
        let mut state = self.state.lock().await;
        let Some(vlan_id) = state.by_service.get(service_name).copied() else {
            return Ok(None);
        };

        self.store
            .delete(Partition::Operational, &paths::vlan_allocation(&self.name, service_name))
            .await?;

        state.by_service.remove(service_name);
        state.used.remove(&vlan_id);
        tracing::debug!("VLAN pool {}: released {} from {}", self.name, vlan_id, service_name);
        Ok(Some(vlan_id))
    }

    pub async fn allocated(&self, service_name: &str) -> Option<u16> {
        self.state.lock().await.by_service.get(service_name).copied()
    }

    pub async fn allocations(&self) -> Vec<VlanAllocation> {
        self.state
            .lock()
            .await
            .by_service
            .iter()
            .map(|(service_name, vlan_id)| VlanAllocation {
                service_name: service_name.clone(),
                vlan_id: *vlan_id,
            })
            .collect()
    }

    /// Number of ids still free
    pub async fn available(&self) -> usize {
        let state = self.state.lock().await;
        self.range.iter().filter(|vlan| !state.used.contains(vlan)).count()
    }
}

/// Pool name of `pool` within the state of one controller
pub fn scoped_pool_name(controller_id: &str, pool: &str) -> String {
    format!("{}/{}", controller_id, pool)
}

/// VlanPools keeps one [`VlanPool`] per node, opened on first use.
///
/// Pools are named `{controller_id}/{node_id}`, so controllers sharing a
/// store never see each other's allocations.
pub struct VlanPools {
    controller_id: String,
    range: VlanRange,
    store: Arc<dyn DataStore>,
    pools: Mutex<HashMap<String, Arc<VlanPool>>>,
}

impl VlanPools {
    pub fn new(controller_id: impl Into<String>, range: VlanRange, store: Arc<dyn DataStore>) -> Self {
        Self {
            controller_id: controller_id.into(),
            range,
            store,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub async fn pool(&self, node_id: &str) -> Result<Arc<VlanPool>, VlanError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(node_id) {
            return Ok(pool.clone());
        }

        let name = scoped_pool_name(&self.controller_id, node_id);
        let pool = Arc::new(VlanPool::open(name, self.range, self.store.clone()).await?);
        pools.insert(node_id.to_string(), pool.clone());
        Ok(pool)
    }

    pub async fn get_vlan_id(&self, node_id: &str, service_name: &str) -> Result<u16, VlanError> {
        self.pool(node_id).await?.get_vlan_id(service_name).await
    }

    pub async fn release(&self, node_id: &str, service_name: &str) -> Result<Option<u16>, VlanError> {
        self.pool(node_id).await?.release(service_name).await
    }
}
