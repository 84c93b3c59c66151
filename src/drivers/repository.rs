use std::sync::Arc;

use super::{ActivationDriver, Arity, BuilderContext, DriverBuilder, DriverTarget};
use crate::topology::WorkUnit;

/// DriverRepository holds the registered builders in lookup order.
///
/// Builders registered first are tried first. Nothing is cached between
/// calls; sharing an instance within a run goes through the [`BuilderContext`].
#[derive(Default, Clone)]
pub struct DriverRepository {
    builders: Vec<Arc<dyn DriverBuilder>>,
}

impl DriverRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a builder after the ones already registered
    pub fn register(&mut self, builder: Arc<dyn DriverBuilder>) {
        tracing::info!("Registered driver builder {} ({:?})", builder.name(), builder.arity());
        self.builders.push(builder);
    }

    pub fn with_builder(mut self, builder: Arc<dyn DriverBuilder>) -> Self {
        self.register(builder);
        self
    }

    pub fn builder_names(&self) -> Vec<&str> {
        self.builders.iter().map(|b| b.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// First driver any builder offers for `unit`
    pub fn resolve(&self, unit: &WorkUnit, ctx: &mut BuilderContext) -> Option<Arc<dyn ActivationDriver>> {
        for builder in &self.builders {
            let target = match builder.arity() {
                Arity::Endpoint => DriverTarget::Endpoint(&unit.local),
                Arity::Pair => DriverTarget::Pair(unit),
            };
            if let Some(driver) = builder.driver_for(target, ctx) {
                tracing::debug!("Builder {} resolved {} to driver {}", builder.name(), unit, driver.name());
                return Some(driver);
            }
        }
        None
    }
}
