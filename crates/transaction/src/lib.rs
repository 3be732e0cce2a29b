pub mod coordinator;
pub mod lock_tracker;
pub mod transaction;

pub use coordinator::TransactionCoordinator;
pub use lock_tracker::{LockOutcome, LockTracker, LockTrackerConfig};
pub use transaction::{Transaction, TransactionState};
