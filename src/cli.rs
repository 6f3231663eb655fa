use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

const VERSION: &str = env!("STEWARD_VERSION");

/// Top-level CLI definition for the `steward` agent.
#[derive(Debug, Parser)]
#[command(
    name = "steward",
    version = VERSION,
    about = "Per-host agent that keeps a VM's process, storage locks and registration in line with its desired state.",
    long_about = "steward reconciles one VM at a time against the document published by the \
                  config-management feed: it starts, stops and live-migrates the VM, and makes sure \
                  at most one host ever holds its storage."
)]
pub struct Cli {
    /// Path to the agent configuration. Defaults to $STEWARD_CONFIG, then /etc/steward/agent.toml.
    #[arg(
        global = true,
        short,
        long = "config",
        value_name = "PATH",
        help = "Load the agent configuration from PATH instead of $STEWARD_CONFIG or /etc/steward/agent.toml"
    )]
    pub config: Option<PathBuf>,

    /// Log at debug level unless STEWARD_LOG says otherwise.
    #[arg(global = true, short, long, help = "Enable debug logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show process, lock and registration state of a VM on this host.
    Status(StatusArgs),
    /// Converge the VM towards its desired state, including migrations.
    Ensure(VmArgs),
    /// Start the VM here.
    Start(VmArgs),
    /// Power the VM down, escalating to kill after the configured grace period.
    Stop(VmArgs),
    /// Stop the VM if it runs, then start it again.
    Restart(VmArgs),
    /// Acquire this host's locks on all VM volumes.
    Lock(VmArgs),
    /// Release this host's locks on all VM volumes.
    Unlock(VmArgs),
    /// Break every lock on the VM's volumes, whoever holds it.
    ForceUnlock(VmArgs),
    /// Snapshot the VM's root volume.
    Snapshot(SnapshotArgs),
    /// Wait for the source host to push a running VM here.
    Inmigrate(VmArgs),
    /// Push the running VM to the host named by its document.
    Outmigrate(VmArgs),
    /// Read a batch of change notifications from stdin and reconcile every affected VM.
    HandleEvent,
}

#[derive(Debug, Args)]
pub struct VmArgs {
    /// Name of the VM.
    #[arg(value_name = "VM")]
    pub vm: String,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Exit non-zero unless the VM runs here consistently; for registry health checks.
    #[arg(long, help = "Exit 2 unless the VM runs on this host with consistent state")]
    pub check: bool,

    #[arg(value_name = "VM")]
    pub vm: String,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    #[arg(value_name = "VM")]
    pub vm: String,

    /// Snapshot name; creating an existing name is a no-op.
    #[arg(value_name = "NAME")]
    pub name: String,
}
