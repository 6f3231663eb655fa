//! Per-VM reconciliation: converges what runs on this host towards the active document.

use std::sync::Arc;
use std::time::Duration;

use super::document::{ConfigStore, Promotion, VmDocument};
use super::events::{Event, VmState, emit};
use super::hostlock::{HostLock, LockMode};
use super::locks::LockChange;
use super::outcome::{
    EnsureOutcome, LifecycleOutcome, LockOutcome, OperationOutput, OperationResult,
    OutgoingOutcome, SnapshotOutcome,
};
use super::process::{Qemu, VmPaths, VmProcess, render_launch_config, stop_with_escalation};
use super::registry::{
    Consul, HealthCheck, ServiceRegistration, ServiceRegistry, freshest, vm_service_name,
};
use super::storage::{PoolCache, RbdCli, StorageCluster, VolumeRef};
use super::volumes::{PoolMigrationPolicy, Presence, SizeChange, VolumeRole, VolumeSet, VolumeSpec};
use crate::config::AgentConfig;
use crate::error::{Error, Result};

const WATCHDOG_ACTION: &str = "reset";
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Poll intervals and retry shapes of the agent's bounded waits. The hard cutoffs live in
/// [`crate::config::TimeoutSettings`].
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    /// Interval for host-local waits such as the powerdown poll.
    pub poll_interval: Duration,
    /// Interval between registry lookups while searching for the migration peer.
    pub discovery_interval: Duration,
    /// Idle tick of the incoming migration server.
    pub server_tick: Duration,
    /// Connect, read and write timeout of a single migration RPC.
    pub rpc_timeout: Duration,
    /// Minimum session lifetime granted by a ping without an explicit timeout.
    pub soft_extension: Duration,
    /// Slot length of the randomized backoff between migration lock attempts.
    pub lock_slot: Duration,
    /// Number of backoff escalations before giving up on the migration locks.
    pub lock_escalations: u32,
    pub migration_poll: Duration,
    pub migration_poll_max: Duration,
    pub pool_migration: PoolMigrationPolicy,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            discovery_interval: Duration::from_secs(1),
            server_tick: Duration::from_millis(100),
            rpc_timeout: Duration::from_secs(30),
            soft_extension: Duration::from_secs(60),
            lock_slot: Duration::from_millis(10),
            lock_escalations: 11,
            migration_poll: Duration::from_millis(500),
            migration_poll_max: Duration::from_secs(5),
            pool_migration: PoolMigrationPolicy::default(),
        }
    }
}

/// Handles shared by every operation on one VM.
pub struct Context {
    pub(super) config: AgentConfig,
    pub(super) vm: String,
    pub(super) store: ConfigStore,
    pub(super) cluster: Arc<dyn StorageCluster>,
    pub(super) registry: Arc<dyn ServiceRegistry>,
    pub(super) pools: PoolCache,
    pub(super) paths: VmPaths,
    pub(super) tuning: Tuning,
}

impl Context {
    pub(super) fn volumes(&self, document: &VmDocument) -> VolumeSet<'_> {
        VolumeSet::new(
            &*self.cluster,
            &self.pools,
            &self.config.host,
            self.config.ceph.lock_attempts,
            VolumeSpec::for_document(document),
        )
        .with_migration_policy(self.tuning.pool_migration)
    }

    fn vm_registration(&self) -> ServiceRegistration {
        let id = vm_service_name(&self.vm);
        ServiceRegistration {
            name: id.clone(),
            id,
            address: self.config.advertised_address().to_string(),
            port: 0,
            tags: vec![self.config.host.clone()],
            check: Some(HealthCheck::Command {
                args: vec![
                    "steward".to_string(),
                    "status".to_string(),
                    "--check".to_string(),
                    self.vm.clone(),
                ],
                interval: HEALTH_CHECK_INTERVAL,
            }),
        }
    }
}

/// The reconciliation agent of one VM on this host.
pub struct Agent {
    pub(super) ctx: Context,
    pub(super) process: Box<dyn VmProcess>,
    pub(super) events: Vec<Event>,
    host_lock: HostLock,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        vm: &str,
        cluster: Arc<dyn StorageCluster>,
        registry: Arc<dyn ServiceRegistry>,
        process: Box<dyn VmProcess>,
    ) -> Self {
        let paths = VmPaths::new(&config.run_dir, vm);
        let store = ConfigStore::new(vm, config.active_document(vm), config.staged_document(vm));
        Self {
            host_lock: HostLock::new(&paths.agent_lock),
            process,
            events: Vec::new(),
            ctx: Context {
                vm: vm.to_string(),
                pools: PoolCache::new(config.ceph.pool_cache_ttl),
                store,
                cluster,
                registry,
                paths,
                tuning: Tuning::default(),
                config,
            },
        }
    }

    /// Agent wired to the production collaborators: `rbd`, Consul and QEMU.
    pub fn open(config: AgentConfig, vm: &str) -> Self {
        let cluster = Arc::new(RbdCli::new(&config.ceph));
        let registry = Arc::new(Consul::new(&config.consul));
        let process = Box::new(Qemu::new(vm, &config));
        Self::new(config, vm, cluster, registry, process)
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.ctx.tuning = tuning;
        self
    }

    pub fn vm(&self) -> &str {
        &self.ctx.vm
    }

    pub fn config(&self) -> &AgentConfig {
        &self.ctx.config
    }

    pub(super) fn output<T>(&mut self, value: T) -> OperationOutput<T> {
        OperationOutput::new(value).with_events(std::mem::take(&mut self.events))
    }

    pub(super) fn lock_host(&self, mode: LockMode) -> Result<super::hostlock::HostLockGuard> {
        self.host_lock.acquire(mode)
    }

    fn invalid(&self, command: &'static str, message: &str) -> Error {
        Error::InvalidCommand {
            vm: self.ctx.vm.clone(),
            command,
            message: message.to_string(),
        }
    }

    /// Runs reconciliation passes until no newer config is staged.
    ///
    /// `LockMode::NonBlocking` is meant for event-triggered runs: when another process already
    /// reconciles this VM the call fails with `HostLockContended` and the trigger retries later.
    pub fn ensure(&mut self, mode: LockMode) -> OperationResult<EnsureOutcome> {
        self.events.clear();
        let _guard = self.lock_host(mode)?;
        let mut passes = 0;
        loop {
            passes += 1;
            let (generation, from, to) = match self.pass() {
                Ok(result) => result,
                Err(Error::ConfigChanged { .. }) => {
                    tracing::info!(vm = %self.ctx.vm, passes, "newer config arrived mid-pass; restarting");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if self.ctx.store.has_new_config()? {
                tracing::info!(vm = %self.ctx.vm, generation, "newer config staged; running another pass");
                continue;
            }
            return Ok(self.output(EnsureOutcome {
                generation,
                from,
                to,
                passes,
            }));
        }
    }

    fn pass(&mut self) -> Result<(u64, VmState, VmState)> {
        match self.ctx.store.promote()? {
            Promotion::Promoted { from, to } => emit(
                &mut self.events,
                Event::ConfigPromoted {
                    vm: self.ctx.vm.clone(),
                    from,
                    to,
                },
            ),
            Promotion::Purged { reason } => emit(
                &mut self.events,
                Event::ConfigPurged {
                    vm: self.ctx.vm.clone(),
                    reason,
                },
            ),
            Promotion::Unchanged => {}
        }

        let document = self.ctx.store.load_active()?;
        let from = self.observe(&document)?;
        tracing::debug!(
            vm = %self.ctx.vm,
            generation = document.generation,
            online = document.parameters.online,
            kvm_host = %document.parameters.kvm_host,
            observed = %from,
            "reconciling"
        );

        let converged = match self.converge(&document, from) {
            Err(err @ Error::ConfigChanged { .. }) => return Err(err),
            other => other,
        };
        let checked = self.check_consistency(&document);
        converged?;
        checked?;

        let to = self.observe(&document)?;
        emit(
            &mut self.events,
            Event::Transition {
                vm: self.ctx.vm.clone(),
                from,
                to,
            },
        );
        Ok((document.generation, from, to))
    }

    fn observe(&mut self, document: &VmDocument) -> Result<VmState> {
        if self.process.is_running()? {
            return Ok(VmState::OnlineLocal);
        }
        Ok(match self.remote_host(document)? {
            Some(_) => VmState::OnlineRemote,
            None => VmState::Offline,
        })
    }

    /// Host that appears to run the VM elsewhere, judged by its registry entry or foreign
    /// volume locks.
    fn remote_host(&self, document: &VmDocument) -> Result<Option<String>> {
        let entries = self.ctx.registry.lookup(&vm_service_name(&self.ctx.vm))?;
        if let Some(entry) = freshest(&entries).filter(|entry| entry.node != self.ctx.config.host)
        {
            return Ok(Some(entry.node.clone()));
        }
        self.ctx.volumes(document).locked_elsewhere()
    }

    fn converge(&mut self, document: &VmDocument, observed: VmState) -> Result<()> {
        let running = observed == VmState::OnlineLocal;
        if !document.parameters.online {
            if running {
                self.stop_vm(document)?;
            }
            return Ok(());
        }

        if document.parameters.kvm_host != self.ctx.config.host {
            if !running {
                return self.release_local(document);
            }
            // Cleanup belongs to the successful migration; a VM still running here is retried.
            return match self.outgoing_migration(document)? {
                OutgoingOutcome::Migrated { .. } | OutgoingOutcome::RescuedRemote { .. } => Ok(()),
                outcome => Err(Error::migration(
                    &self.ctx.vm,
                    format!("outgoing migration {outcome}"),
                )),
            };
        }

        match observed {
            VmState::OnlineRemote => {
                let outcome = self.incoming_session(document)?;
                if !outcome.succeeded() {
                    return Err(Error::migration(
                        &self.ctx.vm,
                        format!("incoming migration ended as {}", outcome.status),
                    ));
                }
            }
            VmState::Offline => self.cold_start(document)?,
            VmState::OnlineLocal | VmState::Migrating => {}
        }
        self.reconcile(document)
    }

    fn cold_start(&mut self, document: &VmDocument) -> Result<()> {
        let vm = self.ctx.vm.clone();
        let launch = {
            let volumes = self.ctx.volumes(document);
            for spec in volumes.specs() {
                let presence = volumes.ensure_presence(spec)?;
                report_presence(&mut self.events, &vm, &spec.volume, spec.size, presence);
                let size = volumes.ensure_size(&spec.volume, spec.size)?;
                report_size(&mut self.events, &vm, &spec.volume, size);
            }
            report_locks(&mut self.events, &vm, volumes.lock_all()?);
            render_launch_config(document, volumes.specs(), &self.ctx.paths, &self.ctx.config)
        };

        if let Err(err) = self.process.start(&launch) {
            tracing::warn!(vm = %vm, error = %err, "start failed; releasing locks");
            match self.ctx.volumes(document).unlock_all(false) {
                Ok(changes) => report_locks(&mut self.events, &vm, changes),
                Err(unlock) => tracing::error!(vm = %vm, error = %unlock, "could not release locks"),
            }
            return Err(err);
        }
        emit(
            &mut self.events,
            Event::VmStarted {
                vm,
                incoming: false,
            },
        );
        Ok(())
    }

    /// Re-applies everything derived from the document to a VM running here.
    fn reconcile(&mut self, document: &VmDocument) -> Result<()> {
        let vm = self.ctx.vm.clone();
        let root_size = {
            let volumes = self.ctx.volumes(document);
            for spec in volumes.specs() {
                let size = volumes.ensure_size(&spec.volume, spec.size)?;
                report_size(&mut self.events, &vm, &spec.volume, size);
            }
            volumes.spec(VolumeRole::Root).map(|spec| spec.size)
        };
        if let Some(size) = root_size {
            if self.process.resize_root(size)? {
                tracing::info!(vm = %vm, size, "grew root device");
            }
        }
        if let Some(iops) = document.parameters.iops {
            self.process
                .block_io_throttle(VolumeRole::Root.suffix(), iops)?;
        }
        self.process.watchdog_action(WATCHDOG_ACTION)?;

        let changes = self.ctx.volumes(document).lock_all()?;
        report_locks(&mut self.events, &vm, changes);
        self.register_vm()
    }

    fn stop_vm(&mut self, document: &VmDocument) -> Result<bool> {
        let stopped = stop_with_escalation(
            &self.ctx.vm,
            self.process.as_mut(),
            self.ctx.config.timeouts.graceful_shutdown,
            self.ctx.tuning.poll_interval,
        )?;
        if stopped {
            emit(
                &mut self.events,
                Event::VmStopped {
                    vm: self.ctx.vm.clone(),
                },
            );
        }
        self.release_local(document)?;
        Ok(stopped)
    }

    /// Drops everything this host holds for a VM that does not run here.
    fn release_local(&mut self, document: &VmDocument) -> Result<()> {
        let changes = self.ctx.volumes(document).unlock_all(false)?;
        report_locks(&mut self.events, &self.ctx.vm, changes);
        self.deregister_vm()?;
        self.process.cleanup()
    }

    pub(super) fn register_vm(&mut self) -> Result<()> {
        let registration = self.ctx.vm_registration();
        self.ctx.registry.register(&registration)?;
        emit(
            &mut self.events,
            Event::ServiceRegistered {
                service: registration.id,
            },
        );
        Ok(())
    }

    pub(super) fn deregister_vm(&mut self) -> Result<()> {
        let service = vm_service_name(&self.ctx.vm);
        let registered_here = self
            .ctx
            .registry
            .lookup(&service)?
            .iter()
            .any(|entry| entry.node == self.ctx.config.host);
        if registered_here {
            self.ctx.registry.deregister(&service)?;
            emit(&mut self.events, Event::ServiceDeregistered { service });
        }
        Ok(())
    }

    fn check_consistency(&mut self, document: &VmDocument) -> Result<()> {
        let running = self.process.is_running()?;
        let pid_valid = self.process.pid_valid();
        let locked = self.ctx.volumes(document).locked_by_me()?;
        emit(
            &mut self.events,
            Event::Consistency {
                vm: self.ctx.vm.clone(),
                running,
                pid_valid,
                locked,
            },
        );
        if let Err(err) = raise_if_inconsistent(&self.ctx.vm, running, pid_valid, locked) {
            tracing::error!(vm = %self.ctx.vm, running, pid_valid, locked, "inconsistent VM state; destroying");
            self.destroy_local(document);
            return Err(err);
        }
        Ok(())
    }

    /// Best-effort teardown of the local process, own locks, registration and runtime files.
    pub(super) fn destroy_local(&mut self, document: &VmDocument) {
        let vm = self.ctx.vm.clone();
        let present = self.process.pid_valid() || self.process.is_running().unwrap_or(true);
        if present {
            match self.process.destroy(true) {
                Ok(()) => emit(&mut self.events, Event::VmDestroyed { vm: vm.clone() }),
                Err(err) => tracing::error!(vm = %vm, error = %err, "destroy failed"),
            }
        }
        match self.ctx.volumes(document).unlock_all(false) {
            Ok(changes) => report_locks(&mut self.events, &vm, changes),
            Err(err) => tracing::error!(vm = %vm, error = %err, "could not release locks"),
        }
        if let Err(err) = self.deregister_vm() {
            tracing::warn!(vm = %vm, error = %err, "could not deregister VM");
        }
        if let Err(err) = self.process.cleanup() {
            tracing::warn!(vm = %vm, error = %err, "could not remove runtime files");
        }
    }

    pub fn start(&mut self) -> OperationResult<LifecycleOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;
        if self.process.is_running()? {
            return Err(self.invalid("start", "VM is already running"));
        }
        self.cold_start(&document)?;
        self.reconcile(&document)?;
        Ok(self.output(LifecycleOutcome {
            stopped: false,
            started: true,
        }))
    }

    pub fn stop(&mut self) -> OperationResult<LifecycleOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;
        if !self.process.is_running()? {
            return Err(self.invalid("stop", "VM is not running"));
        }
        let stopped = self.stop_vm(&document)?;
        Ok(self.output(LifecycleOutcome {
            stopped,
            started: false,
        }))
    }

    pub fn restart(&mut self) -> OperationResult<LifecycleOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;
        let stopped = self.process.is_running()? && self.stop_vm(&document)?;
        self.cold_start(&document)?;
        self.reconcile(&document)?;
        Ok(self.output(LifecycleOutcome {
            stopped,
            started: true,
        }))
    }

    pub fn lock(&mut self) -> OperationResult<LockOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;
        let changes = self.ctx.volumes(&document).lock_all()?;
        report_locks(&mut self.events, &self.ctx.vm, changes.clone());
        Ok(self.output(LockOutcome { changes }))
    }

    /// Releases this host's locks. Refused while the VM runs here.
    pub fn unlock(&mut self) -> OperationResult<LockOutcome> {
        self.release_locks("unlock", false)
    }

    /// Breaks every lock on the VM's volumes, whoever holds it. Refused while the VM runs here.
    pub fn force_unlock(&mut self) -> OperationResult<LockOutcome> {
        self.release_locks("force-unlock", true)
    }

    fn release_locks(&mut self, command: &'static str, force: bool) -> OperationResult<LockOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;
        if self.process.is_running()? {
            return Err(self.invalid(command, "VM is running on this host"));
        }
        let changes = self.ctx.volumes(&document).unlock_all(force)?;
        report_locks(&mut self.events, &self.ctx.vm, changes.clone());
        Ok(self.output(LockOutcome { changes }))
    }

    /// Snapshots the root volume, freezing the guest filesystem around it when the VM runs.
    pub fn snapshot(&mut self, name: &str) -> OperationResult<SnapshotOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;

        let frozen = if self.process.is_running()? {
            match self.process.freeze() {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(vm = %self.ctx.vm, error = %err, "could not freeze guest filesystem");
                    false
                }
            }
        } else {
            false
        };
        let created = self.ctx.volumes(&document).create_snapshot(name);
        if frozen {
            if let Err(err) = self.process.thaw() {
                tracing::warn!(vm = %self.ctx.vm, error = %err, "could not thaw guest filesystem");
            }
        }
        let created = created?;

        emit(
            &mut self.events,
            Event::SnapshotCreated {
                vm: self.ctx.vm.clone(),
                name: name.to_string(),
                created,
            },
        );
        Ok(self.output(SnapshotOutcome {
            name: name.to_string(),
            created,
            frozen,
        }))
    }
}

/// Fails unless running, pidfile validity and lock ownership all agree.
pub fn raise_if_inconsistent(vm: &str, running: bool, pid_valid: bool, locked: bool) -> Result<()> {
    if running == pid_valid && pid_valid == locked {
        return Ok(());
    }
    Err(Error::VmStateInconsistent {
        vm: vm.to_string(),
        running,
        pid_valid,
        locked,
    })
}

pub(super) fn report_locks(events: &mut Vec<Event>, vm: &str, changes: Vec<(VolumeRef, LockChange)>) {
    for (volume, change) in changes {
        if change.changed() {
            emit(
                events,
                Event::LockChanged {
                    vm: vm.to_string(),
                    volume: volume.to_string(),
                    change,
                },
            );
        }
    }
}

fn report_presence(
    events: &mut Vec<Event>,
    vm: &str,
    volume: &VolumeRef,
    size: u64,
    presence: Presence,
) {
    let vm = vm.to_string();
    let volume = volume.to_string();
    match presence {
        Presence::Existing => {}
        Presence::Created => emit(events, Event::VolumeCreated { vm, volume, size }),
        Presence::Migrating(state) => emit(events, Event::VolumeMigrating { vm, volume, state }),
        Presence::Migrated { from } => emit(events, Event::VolumeMigrated { vm, volume, from }),
    }
}

fn report_size(events: &mut Vec<Event>, vm: &str, volume: &VolumeRef, change: SizeChange) {
    if let SizeChange::Grown { from, to } = change {
        emit(
            events,
            Event::VolumeGrown {
                vm: vm.to_string(),
                volume: volume.to_string(),
                from,
                to,
            },
        );
    }
}
