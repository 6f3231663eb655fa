use std::fmt;

use super::locks::LockChange;
use super::process::MigrationStatus;
use super::storage::PoolMigrationState;

/// VM state as derived at the start of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Offline,
    OnlineLocal,
    OnlineRemote,
    Migrating,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::OnlineLocal => "online (local)",
            Self::OnlineRemote => "online (remote)",
            Self::Migrating => "migrating",
        })
    }
}

/// Structured event emitted during long-running operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A staged document replaced the active one.
    ConfigPromoted {
        /// Name of the VM.
        vm: String,
        /// Generation that was active before, if any.
        from: Option<u64>,
        /// Generation now active.
        to: u64,
    },
    /// A staged document could not be used and was removed.
    ConfigPurged {
        /// Name of the VM.
        vm: String,
        /// Why the staged copy was rejected.
        reason: String,
    },
    /// A document from the feed was written as the staged copy.
    ConfigStaged {
        /// Name of the VM.
        vm: String,
        /// Generation of the staged document.
        generation: u64,
    },
    /// A document from the feed was not newer than what this host already has.
    ConfigUnchanged {
        /// Name of the VM.
        vm: String,
        /// Generation carried by the notification.
        generation: u64,
        /// Highest generation already known.
        current: u64,
    },
    /// Outcome of comparing desired and observed state at the end of a pass.
    Transition {
        /// Name of the VM.
        vm: String,
        /// State observed when the pass started.
        from: VmState,
        /// State reached when the pass ended.
        to: VmState,
    },
    /// A volume was created.
    VolumeCreated {
        /// Name of the VM.
        vm: String,
        /// `pool/name` of the volume.
        volume: String,
        /// Size in bytes.
        size: u64,
    },
    /// A volume was grown.
    VolumeGrown {
        /// Name of the VM.
        vm: String,
        /// `pool/name` of the volume.
        volume: String,
        /// Previous size in bytes.
        from: u64,
        /// New size in bytes.
        to: u64,
    },
    /// A pool migration is under way and will be resumed by a later pass.
    VolumeMigrating {
        /// Name of the VM.
        vm: String,
        /// `pool/name` of the target volume.
        volume: String,
        /// State reported by the cluster.
        state: PoolMigrationState,
    },
    /// A pool migration committed.
    VolumeMigrated {
        /// Name of the VM.
        vm: String,
        /// `pool/name` of the target volume.
        volume: String,
        /// Pool the volume came from.
        from: String,
    },
    /// A volume lock was taken or released.
    LockChanged {
        /// Name of the VM.
        vm: String,
        /// `pool/name` of the volume.
        volume: String,
        /// What happened to the lock.
        change: LockChange,
    },
    /// The VM process was launched.
    VmStarted {
        /// Name of the VM.
        vm: String,
        /// Launched waiting for an incoming migration stream.
        incoming: bool,
    },
    /// The VM process stopped.
    VmStopped {
        /// Name of the VM.
        vm: String,
    },
    /// The VM process was torn down without guest cooperation.
    VmDestroyed {
        /// Name of the VM.
        vm: String,
    },
    /// A service was registered.
    ServiceRegistered {
        /// Service id.
        service: String,
    },
    /// A service was deregistered.
    ServiceDeregistered {
        /// Service id.
        service: String,
    },
    /// One migration status snapshot.
    MigrationProgress {
        /// Name of the VM.
        vm: String,
        /// Snapshot reported by the control channel.
        status: MigrationStatus,
    },
    /// A migration attempt ended.
    MigrationFinished {
        /// Name of the VM.
        vm: String,
        /// Short description of the outcome.
        outcome: String,
    },
    /// Result of the consistency check.
    Consistency {
        /// Name of the VM.
        vm: String,
        /// Control channel reports the guest running.
        running: bool,
        /// Pidfile names a live process of this VM.
        pid_valid: bool,
        /// Every volume is locked by this host.
        locked: bool,
    },
    /// A root volume snapshot was requested.
    SnapshotCreated {
        /// Name of the VM.
        vm: String,
        /// Snapshot name.
        name: String,
        /// `false` if it already existed.
        created: bool,
    },
}

impl Event {
    /// Writes the event to the log.
    pub fn log(&self) {
        match self {
            Self::ConfigPromoted { vm, from, to } => {
                tracing::info!(vm = %vm, from = ?from, to, "promoted staged config")
            }
            Self::ConfigPurged { vm, reason } => {
                tracing::warn!(vm = %vm, reason = %reason, "purged staged config")
            }
            Self::ConfigStaged { vm, generation } => {
                tracing::info!(vm = %vm, generation, "staged config")
            }
            Self::ConfigUnchanged {
                vm,
                generation,
                current,
            } => tracing::info!(vm = %vm, generation, current, "config is unchanged"),
            Self::Transition { vm, from, to } if from == to => {
                tracing::info!(vm = %vm, state = %to, "no state change")
            }
            Self::Transition { vm, from, to } => {
                tracing::info!(vm = %vm, from = %from, to = %to, "state transition")
            }
            Self::VolumeCreated { vm, volume, size } => {
                tracing::info!(vm = %vm, volume = %volume, size, "volume created")
            }
            Self::VolumeGrown { vm, volume, from, to } => {
                tracing::info!(vm = %vm, volume = %volume, from, to, "volume grown")
            }
            Self::VolumeMigrating { vm, volume, state } => {
                tracing::info!(vm = %vm, volume = %volume, state = ?state, "pool migration in progress")
            }
            Self::VolumeMigrated { vm, volume, from } => {
                tracing::info!(vm = %vm, volume = %volume, from = %from, "pool migration finished")
            }
            Self::LockChanged { vm, volume, change } => {
                tracing::info!(vm = %vm, volume = %volume, change = ?change, "lock changed")
            }
            Self::VmStarted { vm, incoming } => {
                tracing::info!(vm = %vm, incoming, "VM started")
            }
            Self::VmStopped { vm } => tracing::info!(vm = %vm, "VM stopped"),
            Self::VmDestroyed { vm } => tracing::warn!(vm = %vm, "VM destroyed"),
            Self::ServiceRegistered { service } => {
                tracing::debug!(service = %service, "service registered")
            }
            Self::ServiceDeregistered { service } => {
                tracing::debug!(service = %service, "service deregistered")
            }
            Self::MigrationProgress { vm, status } => tracing::info!(
                vm = %vm,
                status = %status.status,
                transferred = status.transferred,
                remaining = status.remaining,
                total = status.total,
                "migration progress"
            ),
            Self::MigrationFinished { vm, outcome } => {
                tracing::info!(vm = %vm, outcome = %outcome, "migration finished")
            }
            Self::Consistency {
                vm,
                running,
                pid_valid,
                locked,
            } => tracing::debug!(vm = %vm, running, pid_valid, locked, "consistency check"),
            Self::SnapshotCreated { vm, name, created } => {
                tracing::info!(vm = %vm, snapshot = %name, created, "snapshot")
            }
        }
    }
}

/// Receives events as operations produce them.
pub trait Reporter {
    fn report(&mut self, event: Event);
}

impl Reporter for () {
    fn report(&mut self, _event: Event) {}
}

impl Reporter for Vec<Event> {
    fn report(&mut self, event: Event) {
        self.push(event);
    }
}

/// Logs `event` and hands it to `reporter`.
pub fn emit(reporter: &mut dyn Reporter, event: Event) {
    event.log();
    reporter.report(event);
}
