//! Service activation: request handling, orchestration runs and their
//! recorded outcome.

mod orchestrator;
mod registry;
mod service;
mod tracker;
mod transaction;
mod validate;

pub use orchestrator::ActivationOrchestrator;
pub use registry::ServiceRegistry;
pub use service::ActivationService;
pub use tracker::ActivationStateTracker;
pub use transaction::{ActivationTransaction, Binding, Operation};
pub use validate::{validate_service, validate_update};
