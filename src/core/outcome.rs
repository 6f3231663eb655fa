use std::fmt;

use super::events::{Event, VmState};
use super::locks::LockChange;
use super::storage::VolumeRef;

/// Result wrapper returned by agent operations.
pub type OperationResult<T> = crate::error::Result<OperationOutput<T>>;

/// Envelope for successful operation outcomes.
#[derive(Debug)]
pub struct OperationOutput<T> {
    /// Primary value produced by the operation.
    pub value: T,
    /// Structured events captured during the run.
    pub events: Vec<Event>,
}

impl<T> OperationOutput<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }
}

/// Outcome of `ensure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    /// Generation active when the last pass finished.
    pub generation: u64,
    /// State observed at the start of the last pass.
    pub from: VmState,
    /// State reached by the last pass.
    pub to: VmState,
    /// Number of passes, more than one when newer configs arrived mid-flight.
    pub passes: usize,
}

/// Lifecycle of one incoming migration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Listening, no authenticated call yet.
    Waiting,
    InProgress,
    Success,
    Cancelled,
    Destroyed,
    /// Timed out or could not be rescued.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Waiting | Self::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in progress",
            Self::Success => "success",
            Self::Cancelled => "cancelled",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        })
    }
}

/// Outcome of `inmigrate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOutcome {
    pub status: SessionStatus,
    /// Authenticated calls served.
    pub calls: usize,
}

impl IncomingOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Success
    }
}

/// Outcome of `outmigrate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingOutcome {
    /// The VM now runs on `destination`.
    Migrated { destination: String },
    /// The transfer failed but the destination took the VM over.
    RescuedRemote { destination: String },
    /// The transfer failed and the VM keeps running here.
    ContinuedLocal,
    /// Neither side could keep the VM; it was destroyed.
    Destroyed,
}

impl OutgoingOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for OutgoingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Migrated { destination } => write!(f, "migrated to {destination}"),
            Self::RescuedRemote { destination } => write!(f, "rescued by {destination}"),
            Self::ContinuedLocal => f.write_str("continued locally"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// Outcome of `start`, `stop` and `restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleOutcome {
    pub stopped: bool,
    pub started: bool,
}

/// Outcome of `lock`, `unlock` and `force-unlock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOutcome {
    pub changes: Vec<(VolumeRef, LockChange)>,
}

/// Outcome of `snapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub name: String,
    /// `false` if a snapshot with this name already existed.
    pub created: bool,
    /// The guest filesystem was frozen while the snapshot was taken.
    pub frozen: bool,
}
