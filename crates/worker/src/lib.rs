pub mod components;

pub use components::{ResourceCoordinator, WorkerPermit};
