pub mod resource_coordinator;

pub use resource_coordinator::{ResourceCoordinator, WorkerPermit};
