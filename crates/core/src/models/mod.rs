pub mod contention;
pub mod failure;
pub mod ids;
pub mod lock;
pub mod priority;

pub use contention::{ConflictingTask, ContentionReport};
pub use failure::{FailureKind, TaskFailure};
pub use ids::{IdentityId, NodeId, ObjectId, TaskId, TxnId};
pub use lock::{ConflictType, LockConflict, LockInfo, LockType};
pub use priority::{Priority, PriorityOrdering};
