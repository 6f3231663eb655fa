//! In-memory collaborators for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::agent::{Agent, Tuning};
use super::document::{ConfigStore, VmDocument};
use super::process::{LaunchConfig, MigrationStatus, ProcessInfo, VmProcess};
use super::registry::{ServiceEntry, ServiceRegistration, ServiceRegistry};
use super::storage::{
    LockAttempt, LockHolder, PoolMigration, PoolMigrationState, Snapshot, StorageCluster,
    VolumeInfo, VolumeRef,
};
use super::volumes::PoolMigrationPolicy;
use crate::config::{AgentConfig, TimeoutSettings};
use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct Image {
    size: u64,
    lock: Option<LockHolder>,
    snapshots: Vec<Snapshot>,
}

#[derive(Debug, Default)]
struct ClusterState {
    pools: BTreeMap<String, BTreeMap<String, Image>>,
    migrations: BTreeMap<VolumeRef, PoolMigration>,
    busy_lock_adds: u32,
    stall_migrations: bool,
    prepare_calls: usize,
    next_id: u64,
}

impl ClusterState {
    fn image(&mut self, volume: &VolumeRef) -> Result<&mut Image> {
        self.pools
            .get_mut(&volume.pool)
            .and_then(|pool| pool.get_mut(&volume.name))
            .ok_or_else(|| missing(volume))
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn missing(volume: &VolumeRef) -> Error {
    Error::Storage {
        operation: "lookup".to_string(),
        target: volume.to_string(),
        stderr: "(2) No such file or directory".to_string(),
    }
}

/// Storage cluster shared by every clone, standing in for several hosts' view of one cluster.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new(pools: &[&str]) -> Self {
        let cluster = Self::default();
        {
            let mut state = lock(&cluster.state);
            for pool in pools {
                state.pools.insert(pool.to_string(), BTreeMap::new());
            }
        }
        cluster
    }

    pub fn add_pool(&self, pool: &str) {
        lock(&self.state).pools.entry(pool.to_string()).or_default();
    }

    pub fn size(&self, volume: &VolumeRef) -> Option<u64> {
        let state = lock(&self.state);
        state
            .pools
            .get(&volume.pool)?
            .get(&volume.name)
            .map(|image| image.size)
    }

    pub fn holder(&self, volume: &VolumeRef) -> Option<String> {
        let state = lock(&self.state);
        state
            .pools
            .get(&volume.pool)?
            .get(&volume.name)?
            .lock
            .as_ref()
            .map(|holder| holder.owner.clone())
    }

    /// The next `count` lock adds report contention.
    pub fn inject_busy_lock_adds(&self, count: u32) {
        lock(&self.state).busy_lock_adds = count;
    }

    /// While stalled, executing migrations do not finish.
    pub fn stall_migrations(&self, stall: bool) {
        lock(&self.state).stall_migrations = stall;
    }

    pub fn prepare_calls(&self) -> usize {
        lock(&self.state).prepare_calls
    }
}

impl StorageCluster for MemoryCluster {
    fn pools(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state).pools.keys().cloned().collect())
    }

    fn volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        let state = lock(&self.state);
        let images = state.pools.get(pool).ok_or_else(|| Error::Storage {
            operation: "ls".to_string(),
            target: pool.to_string(),
            stderr: "(2) No such file or directory".to_string(),
        })?;
        Ok(images
            .iter()
            .map(|(name, image)| VolumeInfo {
                name: name.clone(),
                size: image.size,
            })
            .collect())
    }

    fn create(&self, volume: &VolumeRef, size: u64) -> Result<()> {
        let mut state = lock(&self.state);
        let pool = state.pools.get_mut(&volume.pool).ok_or_else(|| missing(volume))?;
        if pool.contains_key(&volume.name) {
            return Err(Error::Storage {
                operation: "create".to_string(),
                target: volume.to_string(),
                stderr: "(17) File exists".to_string(),
            });
        }
        pool.insert(
            volume.name.clone(),
            Image {
                size,
                lock: None,
                snapshots: Vec::new(),
            },
        );
        Ok(())
    }

    fn resize(&self, volume: &VolumeRef, size: u64) -> Result<()> {
        lock(&self.state).image(volume)?.size = size;
        Ok(())
    }

    fn lock_list(&self, volume: &VolumeRef) -> Result<Vec<LockHolder>> {
        let mut state = lock(&self.state);
        Ok(match state.image(volume) {
            Ok(image) => image.lock.iter().cloned().collect(),
            Err(_) => Vec::new(),
        })
    }

    fn lock_add(&self, volume: &VolumeRef, owner: &str) -> Result<LockAttempt> {
        let mut state = lock(&self.state);
        if state.busy_lock_adds > 0 {
            state.busy_lock_adds -= 1;
            return Ok(LockAttempt::Busy);
        }
        let locker = format!("client.{}", state.next_id());
        let image = state.image(volume)?;
        if image.lock.is_some() {
            return Ok(LockAttempt::Busy);
        }
        image.lock = Some(LockHolder {
            owner: owner.to_string(),
            locker,
            address: None,
        });
        Ok(LockAttempt::Acquired)
    }

    fn lock_remove(&self, volume: &VolumeRef, holder: &LockHolder) -> Result<()> {
        let mut state = lock(&self.state);
        if let Ok(image) = state.image(volume) {
            if image.lock.as_ref() == Some(holder) {
                image.lock = None;
            }
        }
        Ok(())
    }

    fn snapshots(&self, volume: &VolumeRef) -> Result<Vec<Snapshot>> {
        Ok(lock(&self.state).image(volume)?.snapshots.clone())
    }

    fn snapshot_create(&self, volume: &VolumeRef, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let id = state.next_id();
        let image = state.image(volume)?;
        if !image.snapshots.iter().any(|snapshot| snapshot.name == name) {
            let size = image.size;
            image.snapshots.push(Snapshot {
                id,
                name: name.to_string(),
                size,
            });
        }
        Ok(())
    }

    fn snapshot_remove(&self, volume: &VolumeRef, name: &str) -> Result<()> {
        lock(&self.state)
            .image(volume)?
            .snapshots
            .retain(|snapshot| snapshot.name != name);
        Ok(())
    }

    fn migration_status(&self, volume: &VolumeRef) -> Result<Option<PoolMigration>> {
        let mut state = lock(&self.state);
        let stalled = state.stall_migrations;
        Ok(state.migrations.get_mut(volume).map(|migration| {
            if migration.state == PoolMigrationState::Executing && !stalled {
                migration.state = PoolMigrationState::Executed;
            }
            migration.clone()
        }))
    }

    fn migration_prepare(&self, source: &VolumeRef, target: &VolumeRef) -> Result<()> {
        let mut state = lock(&self.state);
        state.prepare_calls += 1;
        if state.migrations.contains_key(target) {
            return Err(Error::Storage {
                operation: "migration prepare".to_string(),
                target: target.to_string(),
                stderr: "(16) Device or resource busy".to_string(),
            });
        }
        let image = state
            .pools
            .get_mut(&source.pool)
            .and_then(|pool| pool.remove(&source.name))
            .ok_or_else(|| missing(source))?;
        state
            .pools
            .get_mut(&target.pool)
            .ok_or_else(|| missing(target))?
            .insert(target.name.clone(), image);
        state.migrations.insert(
            target.clone(),
            PoolMigration {
                source: source.clone(),
                target: target.clone(),
                state: PoolMigrationState::Prepared,
            },
        );
        Ok(())
    }

    fn migration_execute(&self, target: &VolumeRef) -> Result<()> {
        let mut state = lock(&self.state);
        let stalled = state.stall_migrations;
        let migration = state.migrations.get_mut(target).ok_or_else(|| missing(target))?;
        migration.state = if stalled {
            PoolMigrationState::Executing
        } else {
            PoolMigrationState::Executed
        };
        Ok(())
    }

    fn migration_commit(&self, target: &VolumeRef) -> Result<()> {
        let mut state = lock(&self.state);
        let executed = matches!(
            state.migrations.get(target).map(|migration| &migration.state),
            Some(PoolMigrationState::Executed)
        );
        if !executed {
            return Err(Error::Storage {
                operation: "migration commit".to_string(),
                target: target.to_string(),
                stderr: "(22) Invalid argument".to_string(),
            });
        }
        state.migrations.remove(target);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    services: BTreeMap<(String, String), ServiceEntry>,
    index: u64,
}

/// Catalog shared by every handle; each handle registers services on its own node.
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    node: String,
    state: Arc<Mutex<RegistryState>>,
}

impl MemoryRegistry {
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            state: Arc::default(),
        }
    }

    /// Handle on the same catalog acting as agent of `node`.
    pub fn for_node(&self, node: &str) -> Self {
        Self {
            node: node.to_string(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn nodes_with(&self, name: &str) -> Vec<String> {
        lock(&self.state)
            .services
            .values()
            .filter(|entry| entry.name == name)
            .map(|entry| entry.node.clone())
            .collect()
    }
}

impl ServiceRegistry for MemoryRegistry {
    fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let mut state = lock(&self.state);
        state.index += 1;
        let entry = ServiceEntry {
            id: registration.id.clone(),
            name: registration.name.clone(),
            node: self.node.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: registration.tags.clone(),
            modify_index: state.index,
        };
        state
            .services
            .insert((self.node.clone(), registration.id.clone()), entry);
        Ok(())
    }

    fn deregister(&self, service_id: &str) -> Result<()> {
        lock(&self.state)
            .services
            .remove(&(self.node.clone(), service_id.to_string()));
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Vec<ServiceEntry>> {
        Ok(lock(&self.state)
            .services
            .values()
            .filter(|entry| entry.name == name)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct FakeVm {
    host: String,
    /// The process exists.
    alive: bool,
    /// The guest runs (QMP status `running`).
    running: bool,
    pid: u32,
    pid_valid_override: Option<bool>,
    launch: Option<LaunchConfig>,
    incoming_uri: Option<String>,
    migration_script: VecDeque<String>,
    migration_destination: Option<Arc<Mutex<FakeVm>>>,
    last_migration_status: Option<String>,
    migration_lock: bool,
    ignore_powerdown: bool,
    fail_start: bool,
    fail_guest_agent: bool,
    starts: usize,
    kills: usize,
    destroys: usize,
    cleanups: usize,
    root_size: u64,
    iops: HashMap<String, u64>,
    watchdog: Option<String>,
    guest_ops: Vec<String>,
    /// Staged into the given store by the next successful start.
    stage_on_start: Option<(ConfigStore, VmDocument)>,
}

#[derive(Debug, Default)]
struct FabricState {
    listeners: HashMap<String, Arc<Mutex<FakeVm>>>,
    next: u32,
}

/// Connects fake processes on different "hosts" so a migration can reach its destination.
#[derive(Debug, Clone, Default)]
pub struct FakeFabric {
    state: Arc<Mutex<FabricState>>,
}

/// Scriptable stand-in for a QEMU process. Clones share state, so a test can keep a handle
/// after moving the process into an agent.
#[derive(Debug, Clone)]
pub struct FakeProcess {
    fabric: FakeFabric,
    vm: Arc<Mutex<FakeVm>>,
}

impl FakeProcess {
    pub fn new(fabric: &FakeFabric, host: &str) -> Self {
        Self {
            fabric: fabric.clone(),
            vm: Arc::new(Mutex::new(FakeVm {
                host: host.to_string(),
                ..FakeVm::default()
            })),
        }
    }

    pub fn running(fabric: &FakeFabric, host: &str) -> Self {
        let process = Self::new(fabric, host);
        {
            let mut vm = lock(&process.vm);
            vm.alive = true;
            vm.running = true;
            vm.pid = 4242;
            vm.launch = Some(LaunchConfig {
                args: vec!["-m".to_string(), "1024M".to_string()],
                config: String::new(),
            });
        }
        process
    }

    fn state(&self) -> MutexGuard<'_, FakeVm> {
        lock(&self.vm)
    }

    pub fn script_migration(&self, statuses: &[&str]) {
        self.state().migration_script = statuses.iter().map(|s| s.to_string()).collect();
    }

    pub fn ignore_powerdown(&self, ignore: bool) {
        self.state().ignore_powerdown = ignore;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    pub fn fail_guest_agent(&self, fail: bool) {
        self.state().fail_guest_agent = fail;
    }

    /// Overrides what the pidfile check reports, `None` to follow the process state.
    pub fn set_pid_valid(&self, valid: Option<bool>) {
        self.state().pid_valid_override = valid;
    }

    /// Simulates another migration attempt holding the host-local migration lock.
    pub fn hold_migration_lock(&self, held: bool) {
        self.state().migration_lock = held;
    }

    pub fn migration_lock_held(&self) -> bool {
        self.state().migration_lock
    }

    pub fn alive(&self) -> bool {
        self.state().alive
    }

    pub fn guest_running(&self) -> bool {
        self.state().running
    }

    pub fn start_count(&self) -> usize {
        self.state().starts
    }

    pub fn kill_count(&self) -> usize {
        self.state().kills
    }

    pub fn destroy_count(&self) -> usize {
        self.state().destroys
    }

    pub fn root_size(&self) -> u64 {
        self.state().root_size
    }

    pub fn iops(&self, device: &str) -> Option<u64> {
        self.state().iops.get(device).copied()
    }

    pub fn watchdog(&self) -> Option<String> {
        self.state().watchdog.clone()
    }

    pub fn guest_ops(&self) -> Vec<String> {
        self.state().guest_ops.clone()
    }

    /// Simulates a config update that lands while the VM is being started.
    pub fn stage_on_start(&self, store: ConfigStore, document: VmDocument) {
        self.state().stage_on_start = Some((store, document));
    }

    pub fn launch(&self) -> Option<LaunchConfig> {
        self.state().launch.clone()
    }

    fn unregister_listener(&self) {
        let uri = self.state().incoming_uri.take();
        if let Some(uri) = uri {
            lock(&self.fabric.state).listeners.remove(&uri);
        }
    }

    fn stop(&self) {
        self.unregister_listener();
        let mut vm = self.state();
        vm.alive = false;
        vm.running = false;
        vm.migration_destination = None;
    }
}

impl VmProcess for FakeProcess {
    fn is_running(&mut self) -> Result<bool> {
        Ok(self.state().running)
    }

    fn pid_valid(&mut self) -> bool {
        let vm = self.state();
        vm.pid_valid_override.unwrap_or(vm.alive)
    }

    fn process_info(&mut self) -> Option<ProcessInfo> {
        let vm = self.state();
        vm.alive.then_some(ProcessInfo {
            pid: vm.pid,
            started: None,
        })
    }

    fn start(&mut self, launch: &LaunchConfig) -> Result<()> {
        let mut vm = self.state();
        if vm.running {
            return Err(Error::InvalidCommand {
                vm: "fake".to_string(),
                command: "start",
                message: "VM is already running".to_string(),
            });
        }
        if vm.fail_start {
            return Err(Error::LaunchFailed {
                vm: "fake".to_string(),
                message: "injected failure".to_string(),
            });
        }
        vm.alive = true;
        vm.running = true;
        vm.starts += 1;
        vm.pid = 1000 + vm.starts as u32;
        vm.launch = Some(launch.clone());
        if let Some((store, document)) = vm.stage_on_start.take() {
            store.stage(&document)?;
        }
        Ok(())
    }

    fn start_incoming(&mut self, launch: &LaunchConfig) -> Result<String> {
        {
            let mut vm = self.state();
            if vm.alive {
                return Err(Error::InvalidCommand {
                    vm: "fake".to_string(),
                    command: "start",
                    message: "VM process already exists".to_string(),
                });
            }
            vm.alive = true;
            vm.running = false;
            vm.starts += 1;
            vm.launch = Some(launch.clone());
        }
        let mut fabric = lock(&self.fabric.state);
        fabric.next += 1;
        let uri = format!("tcp:{}:{}", self.state().host, 49000 + fabric.next);
        fabric.listeners.insert(uri.clone(), Arc::clone(&self.vm));
        self.state().incoming_uri = Some(uri.clone());
        Ok(uri)
    }

    fn graceful_shutdown(&mut self) -> Result<()> {
        if !self.state().ignore_powerdown {
            self.stop();
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.state().kills += 1;
        self.stop();
        Ok(())
    }

    fn destroy(&mut self, _kill_supervisor: bool) -> Result<()> {
        self.state().destroys += 1;
        self.stop();
        Ok(())
    }

    fn acquire_migration_lock(&mut self) -> Result<bool> {
        let mut vm = self.state();
        if vm.migration_lock {
            return Ok(false);
        }
        vm.migration_lock = true;
        Ok(true)
    }

    fn release_migration_lock(&mut self) {
        self.state().migration_lock = false;
    }

    fn running_config(&mut self) -> Result<LaunchConfig> {
        self.state().launch.clone().ok_or_else(|| Error::ControlProtocol {
            vm: "fake".to_string(),
            message: "not running".to_string(),
        })
    }

    fn migrate(&mut self, uri: &str) -> Result<()> {
        let destination = lock(&self.fabric.state).listeners.get(uri).cloned();
        let mut vm = self.state();
        match destination {
            Some(destination) => {
                if vm.migration_script.is_empty() {
                    vm.migration_script =
                        ["setup", "active", "completed"].iter().map(|s| s.to_string()).collect();
                }
                vm.migration_destination = Some(destination);
            }
            None => vm.migration_script = VecDeque::from(["failed".to_string()]),
        }
        Ok(())
    }

    fn migration_status(&mut self) -> Result<MigrationStatus> {
        let mut vm = self.state();
        let status = match vm.migration_script.pop_front() {
            Some(status) => status,
            None => vm
                .last_migration_status
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        };
        if status == "completed" && vm.last_migration_status.as_deref() != Some("completed") {
            vm.running = false;
            if let Some(destination) = vm.migration_destination.take() {
                let launch = vm.launch.clone();
                let mut destination = lock(&destination);
                destination.running = true;
                destination.launch = launch;
            }
        }
        vm.last_migration_status = Some(status.clone());
        Ok(MigrationStatus {
            status,
            transferred: 0,
            remaining: 0,
            total: 0,
        })
    }

    fn cancel_migration(&mut self) -> Result<()> {
        let mut vm = self.state();
        vm.migration_script.clear();
        vm.migration_destination = None;
        if vm.last_migration_status.as_deref() != Some("completed") {
            vm.last_migration_status = Some("cancelled".to_string());
        }
        Ok(())
    }

    fn resize_root(&mut self, size: u64) -> Result<bool> {
        let mut vm = self.state();
        if vm.root_size >= size {
            return Ok(false);
        }
        vm.root_size = size;
        Ok(true)
    }

    fn block_io_throttle(&mut self, device: &str, iops: u64) -> Result<bool> {
        let mut vm = self.state();
        if vm.iops.get(device) == Some(&iops) {
            return Ok(false);
        }
        vm.iops.insert(device.to_string(), iops);
        Ok(true)
    }

    fn watchdog_action(&mut self, action: &str) -> Result<()> {
        self.state().watchdog = Some(action.to_string());
        Ok(())
    }

    fn freeze(&mut self) -> Result<()> {
        let mut vm = self.state();
        if vm.fail_guest_agent {
            return Err(Error::ControlProtocol {
                vm: "fake".to_string(),
                message: "guest agent not responding".to_string(),
            });
        }
        vm.guest_ops.push("freeze".to_string());
        Ok(())
    }

    fn thaw(&mut self) -> Result<()> {
        let mut vm = self.state();
        if vm.fail_guest_agent {
            return Err(Error::ControlProtocol {
                vm: "fake".to_string(),
                message: "guest agent not responding".to_string(),
            });
        }
        vm.guest_ops.push("thaw".to_string());
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.state().cleanups += 1;
        Ok(())
    }
}

/// Agent configuration for `host` with every directory under `root` and short timeouts.
pub fn test_config(root: &Path, host: &str) -> AgentConfig {
    let mut config = AgentConfig::defaults();
    config.host = host.to_string();
    config.vm_config_dir = root.join(host).join("vm");
    config.run_dir = root.join(host).join("run");
    config.qemu.migration_address = "127.0.0.1".to_string();
    config.qemu.advertise_address = Some("127.0.0.1".to_string());
    config.ceph.lock_attempts = 3;
    config.timeouts = TimeoutSettings {
        graceful_shutdown: Duration::from_millis(100),
        kill: Duration::from_millis(100),
        discovery: Duration::from_secs(5),
        incoming: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(50),
        migration: Duration::from_secs(5),
    };
    config
}

pub fn test_tuning() -> Tuning {
    Tuning {
        poll_interval: Duration::from_millis(10),
        discovery_interval: Duration::from_millis(10),
        server_tick: Duration::from_millis(5),
        rpc_timeout: Duration::from_secs(2),
        soft_extension: Duration::from_secs(2),
        lock_slot: Duration::from_millis(1),
        lock_escalations: 3,
        migration_poll: Duration::from_millis(1),
        migration_poll_max: Duration::from_millis(5),
        pool_migration: PoolMigrationPolicy {
            wait: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        },
    }
}

/// One simulated hypervisor host: its configuration, its fake VM process and its handles on the
/// shared cluster and registry.
pub struct TestHost {
    pub config: AgentConfig,
    pub process: FakeProcess,
    cluster: MemoryCluster,
    registry: MemoryRegistry,
}

impl TestHost {
    pub fn new(
        root: &Path,
        host: &str,
        cluster: &MemoryCluster,
        registry: &MemoryRegistry,
        fabric: &FakeFabric,
    ) -> Self {
        Self::with_process(root, host, cluster, registry, FakeProcess::new(fabric, host))
    }

    /// A host whose VM process is already up, as after an agent restart.
    pub fn running(
        root: &Path,
        host: &str,
        cluster: &MemoryCluster,
        registry: &MemoryRegistry,
        fabric: &FakeFabric,
    ) -> Self {
        Self::with_process(root, host, cluster, registry, FakeProcess::running(fabric, host))
    }

    fn with_process(
        root: &Path,
        host: &str,
        cluster: &MemoryCluster,
        registry: &MemoryRegistry,
        process: FakeProcess,
    ) -> Self {
        Self {
            config: test_config(root, host),
            process,
            cluster: cluster.clone(),
            registry: registry.for_node(host),
        }
    }

    pub fn agent(&self, vm: &str) -> Agent {
        Agent::new(
            self.config.clone(),
            vm,
            Arc::new(self.cluster.clone()),
            Arc::new(self.registry.clone()),
            Box::new(self.process.clone()),
        )
        .with_tuning(test_tuning())
    }

    pub fn store(&self, vm: &str) -> ConfigStore {
        ConfigStore::new(
            vm,
            self.config.active_document(vm),
            self.config.staged_document(vm),
        )
    }

    /// Writes `document` as this host's staged copy.
    pub fn stage(&self, document: &VmDocument) {
        self.store(&document.name).stage(document).unwrap();
    }

    pub fn active(&self, vm: &str) -> VmDocument {
        self.store(vm).load_active().unwrap()
    }
}
