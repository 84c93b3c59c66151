//! Activation drivers and the builders that produce them.
//!
//! A [`DriverBuilder`] looks at one work unit (or one endpoint of it) and
//! may return a driver. The [`DriverRepository`] tries builders in
//! registration order and the first match wins.

mod configurator;
mod etree;
mod repository;
mod tagged;

pub use configurator::{ConfigIntent, DeviceConfigurator, LoggingConfigurator};
pub use etree::EtreeDriverBuilder;
pub use repository::DriverRepository;
pub use tagged::VlanTaggedDriverBuilder;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::models::{ConnectivityService, Endpoint, ServiceType};
use crate::topology::WorkUnit;

/// ActivationDriver configures one technology for the work units it is bound to.
///
/// Lifecycle: `initialize` once per bound unit, then `activate` or
/// `deactivate`, then `commit` or `rollback`. A driver instance may be bound
/// to several units of one run; parameters from the first `initialize`
/// call win.
#[async_trait]
pub trait ActivationDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Capture parameters only, no side effects
    fn initialize(&self, unit: &WorkUnit, service_id: &str, is_exclusive: bool, service_type: ServiceType);

    async fn activate(&self) -> Result<(), DriverError>;

    async fn deactivate(&self) -> Result<(), DriverError>;

    async fn commit(&self) -> Result<(), DriverError>;

    async fn rollback(&self) -> Result<(), DriverError>;

    /// Lower runs first
    fn priority(&self) -> i32 {
        0
    }
}

/// Which part of a work unit a builder inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Endpoint,
    Pair,
}

/// What the repository hands to a builder lookup
#[derive(Debug, Clone, Copy)]
pub enum DriverTarget<'a> {
    Endpoint(&'a Endpoint),
    Pair(&'a WorkUnit),
}

pub trait DriverBuilder: Send + Sync {
    fn name(&self) -> &str;

    fn arity(&self) -> Arity;

    /// A driver for `target`, or None when this builder does not handle it
    fn driver_for(&self, target: DriverTarget<'_>, ctx: &mut BuilderContext) -> Option<Arc<dyn ActivationDriver>>;
}

/// Per-run blackboard passed to every builder lookup.
///
/// Values live for one orchestration run only.
pub struct BuilderContext {
    service_id: String,
    service_type: ServiceType,
    is_exclusive: bool,
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl BuilderContext {
    pub fn new(service: &ConnectivityService) -> Self {
        Self {
            service_id: service.service_id.clone(),
            service_type: service.service_type,
            is_exclusive: service.is_exclusive,
            values: HashMap::new(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.values.insert(key.into(), value);
    }

    /// None when the key is missing or holds another type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key).cloned()?.downcast::<T>().ok()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Optional restriction of a builder to a set of device ids
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    devices: Option<HashSet<String>>,
}

impl DeviceFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn only<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: Some(devices.into_iter().map(Into::into).collect()),
        }
    }

    pub fn allows(&self, device: &str) -> bool {
        self.devices.as_ref().map_or(true, |set| set.contains(device))
    }
}
