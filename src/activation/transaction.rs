use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::drivers::ActivationDriver;
use crate::error::{ActivationError, Phase};
use crate::models::ConnectivityService;
use crate::topology::WorkUnit;

/// Direction of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Activate,
    Deactivate,
}

impl Operation {
    fn phase(self) -> Phase {
        match self {
            Operation::Activate => Phase::Activate,
            Operation::Deactivate => Phase::Deactivate,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Activate => f.write_str("activation"),
            Operation::Deactivate => f.write_str("deactivation"),
        }
    }
}

/// A driver together with the first work unit it was bound to
pub struct Binding {
    pub unit: WorkUnit,
    pub driver: Arc<dyn ActivationDriver>,
}

/// ActivationTransaction runs the initialized drivers of one service through
/// activate (or deactivate) and then commit, or rollback on the first failure.
///
/// A driver bound to several units appears once, at its first position.
/// Drivers are ordered by ascending priority; equal priorities keep
/// resolution order.
pub struct ActivationTransaction {
    run_id: Uuid,
    service_id: String,
    bindings: Vec<Binding>,
}

impl ActivationTransaction {
    /// Initialize every `(unit, driver)` pair and build the run
    pub fn new(service: &ConnectivityService, resolved: Vec<(WorkUnit, Arc<dyn ActivationDriver>)>) -> Self {
        let mut bindings: Vec<Binding> = Vec::with_capacity(resolved.len());
        for (unit, driver) in resolved {
            driver.initialize(&unit, &service.service_id, service.is_exclusive, service.service_type);
            if !bindings.iter().any(|b| Arc::ptr_eq(&b.driver, &driver)) {
                bindings.push(Binding { unit, driver });
            }
        }
        bindings.sort_by_key(|b| b.driver.priority());

        Self {
            run_id: Uuid::new_v4(),
            service_id: service.service_id.clone(),
            bindings,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub async fn activate(&self) -> Result<(), ActivationError> {
        self.execute(Operation::Activate).await
    }

    pub async fn deactivate(&self) -> Result<(), ActivationError> {
        self.execute(Operation::Deactivate).await
    }

    async fn execute(&self, op: Operation) -> Result<(), ActivationError> {
        tracing::debug!(
            "[{}] run {} EXECUTING {} with {} drivers",
            self.service_id,
            self.run_id,
            op,
            self.bindings.len()
        );

        for (i, binding) in self.bindings.iter().enumerate() {
            let result = match op {
                Operation::Activate => binding.driver.activate().await,
                Operation::Deactivate => binding.driver.deactivate().await,
            };

            if let Err(source) = result {
                tracing::warn!(
                    "[{}] driver {} failed {} of {}: {}",
                    self.service_id,
                    binding.driver.name(),
                    op,
                    binding.unit,
                    source
                );
                self.rollback(i).await;
                return Err(ActivationError::DriverActivation {
                    driver: binding.driver.name().to_string(),
                    phase: op.phase(),
                    unit: binding.unit.to_string(),
                    source,
                });
            }
        }

        self.commit().await
    }

    /// Commit every driver. Later drivers are still committed after a failure;
    /// the first failure is returned.
    async fn commit(&self) -> Result<(), ActivationError> {
        tracing::debug!("[{}] run {} COMMITTING", self.service_id, self.run_id);

        let mut first_error = None;
        for binding in &self.bindings {
            if let Err(source) = binding.driver.commit().await {
                tracing::error!(
                    "[{}] driver {} failed to commit: {}",
                    self.service_id,
                    binding.driver.name(),
                    source
                );
                first_error.get_or_insert(ActivationError::Commit {
                    driver: binding.driver.name().to_string(),
                    source,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Roll back drivers `0..=failed` in initialization order
    async fn rollback(&self, failed: usize) {
        tracing::warn!(
            "[{}] run {} ROLLING_BACK {} drivers",
            self.service_id,
            self.run_id,
            failed + 1
        );

        for binding in &self.bindings[..=failed] {
            if let Err(e) = binding.driver.rollback().await {
                tracing::error!(
                    "[{}] rollback of driver {} failed: {}",
                    self.service_id,
                    binding.driver.name(),
                    e
                );
            }
        }
    }
}
