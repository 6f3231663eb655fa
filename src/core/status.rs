//! Read-only view of one VM on this host.

use std::fmt;
use std::time::SystemTime;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::agent::Agent;
use super::events::VmState;
use super::registry::{freshest, vm_service_name};
use super::storage::VolumeRef;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub vm: String,
    pub generation: u64,
    /// Desired online flag of the active document.
    pub online: bool,
    /// Host the active document assigns the VM to.
    pub kvm_host: String,
    /// This host.
    pub host: String,
    pub running: bool,
    pub pid: Option<u32>,
    /// Process start time in RFC 3339.
    pub started: Option<String>,
    /// Lock holder per volume.
    pub locks: Vec<(VolumeRef, Option<String>)>,
    pub consistent: bool,
    pub state: VmState,
}

impl StatusReport {
    /// What the registry health check asks: the VM runs here and nothing contradicts it.
    pub fn healthy(&self) -> bool {
        self.running && self.consistent
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vm:         {}", self.vm)?;
        writeln!(f, "generation: {}", self.generation)?;
        writeln!(
            f,
            "desired:    {} on {}",
            if self.online { "online" } else { "offline" },
            self.kvm_host
        )?;
        writeln!(f, "state:      {} (this host: {})", self.state, self.host)?;
        match (self.pid, &self.started) {
            (Some(pid), Some(started)) => writeln!(f, "process:    pid {pid}, started {started}")?,
            (Some(pid), None) => writeln!(f, "process:    pid {pid}")?,
            (None, _) => writeln!(f, "process:    none")?,
        }
        for (volume, holder) in &self.locks {
            writeln!(
                f,
                "lock:       {volume} {}",
                holder.as_deref().unwrap_or("unlocked")
            )?;
        }
        write!(
            f,
            "consistent: {}",
            if self.consistent { "yes" } else { "no" }
        )
    }
}

fn format_started(started: SystemTime) -> Option<String> {
    OffsetDateTime::from(started).format(&Rfc3339).ok()
}

impl Agent {
    /// Collects the VM's state without taking the host lock or changing anything.
    pub fn status(&mut self) -> Result<StatusReport> {
        let document = self.ctx.store.load_active()?;
        let running = self.process.is_running()?;
        let pid_valid = self.process.pid_valid();
        let info = self.process.process_info();

        let volumes = self.ctx.volumes(&document);
        let holders = volumes.locked_by()?;
        let locked = volumes.locked_by_me()?;
        let remote = if running {
            None
        } else {
            let entries = self.ctx.registry.lookup(&vm_service_name(&self.ctx.vm))?;
            freshest(&entries)
                .filter(|entry| entry.node != self.ctx.config.host)
                .map(|entry| entry.node.clone())
                .or(volumes.locked_elsewhere()?)
        };
        let state = match (running, remote) {
            (true, _) => VmState::OnlineLocal,
            (false, Some(_)) => VmState::OnlineRemote,
            (false, None) => VmState::Offline,
        };

        Ok(StatusReport {
            vm: self.ctx.vm.clone(),
            generation: document.generation,
            online: document.parameters.online,
            kvm_host: document.parameters.kvm_host.clone(),
            host: self.ctx.config.host.clone(),
            running,
            pid: info.map(|info| info.pid),
            started: info.and_then(|info| info.started).and_then(format_started),
            locks: holders
                .into_iter()
                .map(|(volume, holder)| (volume, holder.map(|holder| holder.owner)))
                .collect(),
            consistent: running == pid_valid && pid_valid == locked,
            state,
        })
    }
}
