pub mod failure_detector;
pub mod group_coordinator;
pub mod identity_map;
pub mod node;
pub mod node_registry;
pub mod strategies;

pub use failure_detector::{FailureDetectorConfig, NodeFailureHandler, NodeListener};
pub use group_coordinator::{CoordinatorState, GroupCoordinator, OffloadResult};
pub use identity_map::{IdentityMap, IdentityMoveParticipant, MoveStart};
pub use node::{NodeEvent, NodeInfo, NodeStatus};
pub use node_registry::NodeRegistry;
pub use strategies::{policy_from_config, LocalNodePolicy, NodeAssignPolicy, RoundRobinPolicy};
