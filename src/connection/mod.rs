//! Connection lifecycle: per-target state machine, its supervising task,
//! group coordination and status reporting

pub mod coordination;
pub mod manager;
pub mod producer;
pub mod state;
pub mod status;

pub use coordination::{CoordinationTable, ManagerId};
pub use manager::{ConnectionManager, ManagerHandle};
pub use state::{ConnectionState, Phase, Target};
pub use status::{ConnectionEvent, EventKind, StatusReporter, StatusSnapshot};
