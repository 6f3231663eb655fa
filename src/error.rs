use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

/// Exit code signalling a soft failure that the caller should retry later.
pub const EX_TEMPFAIL: u8 = 75;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("A newer configuration for VM `{vm}` arrived; restarting the pass.")]
    ConfigChanged { vm: String },
    #[error("Another steward process holds the agent lock at {path}.")]
    HostLockContended { path: PathBuf },
    #[error("Volume `{volume}` is locked by `{holder}`.")]
    LockBusy { volume: String, holder: String },
    #[error("Refusing to release volume `{volume}`: lock is held by `{holder}`.")]
    LockDenied { volume: String, holder: String },
    #[error("Rejected `{method}` call: invalid migration cookie.")]
    Authentication { method: String },
    #[error("Migration of VM `{vm}` failed: {message}")]
    Migration { vm: String, message: String },
    #[error(
        "VM `{vm}` is in an inconsistent state (running={running}, pidfile valid={pid_valid}, locked={locked})."
    )]
    VmStateInconsistent {
        vm: String,
        running: bool,
        pid_valid: bool,
        locked: bool,
    },
    #[error("Storage operation `{operation}` on `{target}` failed: {stderr}")]
    Storage {
        operation: String,
        target: String,
        stderr: String,
    },
    #[error("Cannot {command} VM `{vm}`: {message}")]
    InvalidCommand {
        vm: String,
        command: &'static str,
        message: String,
    },
    #[error("No configuration for VM `{vm}` at {path}.")]
    VmConfigNotFound { vm: String, path: PathBuf },
    #[error("Control protocol error for VM `{vm}`: {message}")]
    ControlProtocol { vm: String, message: String },
    #[error("Service registry `{operation}` failed: {message}")]
    Registry { operation: String, message: String },
    #[error("RPC call `{method}` to {peer} failed: {message}")]
    Rpc {
        peer: String,
        method: String,
        message: String,
    },
    #[error("Timed out waiting for {what}.")]
    TimedOut { what: String },
    #[error("Failed to launch VM `{vm}`: {message}")]
    LaunchFailed { vm: String, message: String },
    #[error("Failed to stop VM `{vm}`: {message}")]
    ShutdownFailed { vm: String, message: String },
    #[error("Failed to read configuration file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write configuration file at {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration at {path} could not be parsed: {message}")]
    ParseConfig { path: PathBuf, message: String },
    #[error("Malformed change notification: {message}")]
    InvalidEvent { message: String },
    #[error("Dispatching work for VM `{vm}` failed: {message}")]
    Dispatch { vm: String, message: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn migration(vm: &str, message: impl Into<String>) -> Self {
        Self::Migration {
            vm: vm.to_string(),
            message: message.into(),
        }
    }

    /// Failures that are part of normal convergence and get logged without a trace.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::ConfigChanged { .. }
                | Self::HostLockContended { .. }
                | Self::LockBusy { .. }
                | Self::InvalidCommand { .. }
                | Self::VmConfigNotFound { .. }
        )
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::ConfigChanged { .. } => ExitCode::from(EX_TEMPFAIL),
            Self::HostLockContended { .. } => ExitCode::from(EX_TEMPFAIL),
            Self::LockBusy { .. } => ExitCode::from(EX_TEMPFAIL),
            Self::InvalidCommand { .. } => ExitCode::from(69),
            Self::VmConfigNotFound { .. } => ExitCode::from(69),
            Self::ParseConfig { .. } => ExitCode::from(65),
            Self::InvalidEvent { .. } => ExitCode::from(65),
            Self::ReadConfig { .. } => ExitCode::from(74),
            Self::WriteConfig { .. } => ExitCode::from(74),
            Self::Migration { .. } => ExitCode::from(1),
            Self::LockDenied { .. }
            | Self::Authentication { .. }
            | Self::VmStateInconsistent { .. }
            | Self::Storage { .. }
            | Self::ControlProtocol { .. }
            | Self::Registry { .. }
            | Self::Rpc { .. }
            | Self::TimedOut { .. }
            | Self::LaunchFailed { .. }
            | Self::ShutdownFailed { .. }
            | Self::Dispatch { .. }
            | Self::Io { .. } => ExitCode::from(70),
        }
    }
}
