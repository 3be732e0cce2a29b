pub mod ownership;
pub mod participant;

pub use ownership::{IdentityLocation, IdentityOwnership};
pub use participant::{Participant, PrepareVote};
