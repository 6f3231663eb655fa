//! Core steward library API surface.

pub mod agent;
pub mod document;
pub mod events;
pub mod feed;
pub mod hostlock;
pub mod incoming;
pub mod locks;
pub mod outcome;
pub mod outgoing;
pub mod process;
pub mod qmp;
pub mod registry;
pub mod rpc;
pub mod status;
pub mod storage;
pub mod timeout;
pub mod volumes;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, Tuning, raise_if_inconsistent};
pub use document::{ConfigStore, VmDocument, VmParameters};
pub use events::{Event, Reporter, VmState};
pub use feed::{Dispatcher, FeedOutcome, Notification, SubprocessDispatcher};
pub use hostlock::LockMode;
pub use outcome::{
    EnsureOutcome, IncomingOutcome, LifecycleOutcome, LockOutcome, OperationOutput,
    OperationResult, OutgoingOutcome, SessionStatus, SnapshotOutcome,
};
pub use status::StatusReport;
