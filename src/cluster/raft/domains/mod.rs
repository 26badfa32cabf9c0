//! Domain state composed by the replicated state machine.
//!
//! - **Lock**: named leases with owner and metadata
//! - **Assignment**: partition owners and key assignments of one group
//!
//! Each domain holds plain data and applies commands deterministically,
//! using only the timestamp carried by the command.

pub mod assignment;
pub mod lock;

pub use assignment::{AssignmentDomainState, DomainOutcome};
pub use lock::LockDomainState;
