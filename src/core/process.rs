//! Host-local VM process control.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use libc::pid_t;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sysinfo::{Pid, System};

use super::document::VmDocument;
use super::hostlock::MigrationLock;
use super::qmp::{QmpClient, guest_agent_execute};
use super::timeout::Timeout;
use super::volumes::{VolumeRole, VolumeSpec};
use crate::config::AgentConfig;
use crate::error::{Error, Result};

/// QMP run states in which the guest counts as running on this host.
pub const RUNNING_STATUSES: &[&str] = &["running", "paused", "finish-migrate"];

const ROOT_DEVICE: &str = "root";
const QMP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to launch the VM: the command line and the generated `-readconfig` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub args: Vec<String>,
    pub config: String,
}

impl LaunchConfig {
    /// Memory in MiB as given by the `-m` argument.
    pub fn memory_mib(&self) -> Option<u64> {
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if arg == "-m" {
                return args.next().and_then(|value| parse_memory(value));
            }
        }
        None
    }
}

fn parse_memory(value: &str) -> Option<u64> {
    let value = value
        .split(',')
        .find_map(|part| match part.split_once('=') {
            Some(("size", size)) => Some(size),
            Some(_) => None,
            None => Some(part),
        })?
        .trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(index) => value.split_at(index),
        None => (value, "M"),
    };
    let number: u64 = digits.parse().ok()?;
    match unit.to_ascii_uppercase().as_str() {
        "M" | "MB" | "MIB" => Some(number),
        "G" | "GB" | "GIB" => number.checked_mul(1024),
        "T" | "TB" | "TIB" => number.checked_mul(1024 * 1024),
        _ => None,
    }
}

/// One `query-migrate` snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub status: String,
    pub transferred: u64,
    pub remaining: u64,
    pub total: u64,
}

impl MigrationStatus {
    pub fn from_qmp(value: &Value) -> Self {
        let ram = |key: &str| {
            value
                .get("ram")
                .and_then(|ram| ram.get(key))
                .and_then(Value::as_u64)
                .unwrap_or_default()
        };
        Self {
            status: value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("none")
                .to_string(),
            transferred: ram("transferred"),
            remaining: ram("remaining"),
            total: ram("total"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub started: Option<SystemTime>,
}

/// Operations on the VM's process. Implementations own the single control connection.
pub trait VmProcess: Send {
    /// Authoritative: asks the control channel, not the pidfile.
    fn is_running(&mut self) -> Result<bool>;
    /// The pidfile names a live process that is this VM.
    fn pid_valid(&mut self) -> bool;
    fn process_info(&mut self) -> Option<ProcessInfo>;

    /// Fails with `InvalidCommand` if the VM is already running.
    fn start(&mut self, launch: &LaunchConfig) -> Result<()>;
    /// Launches the VM waiting for a migration stream; returns the URI the sender should use.
    fn start_incoming(&mut self, launch: &LaunchConfig) -> Result<String>;
    fn graceful_shutdown(&mut self) -> Result<()>;
    fn kill(&mut self) -> Result<()>;
    /// Tears the process down and waits until the control channel is gone.
    fn destroy(&mut self, kill_supervisor: bool) -> Result<()>;

    fn acquire_migration_lock(&mut self) -> Result<bool>;
    fn release_migration_lock(&mut self);
    fn running_config(&mut self) -> Result<LaunchConfig>;
    fn migrate(&mut self, uri: &str) -> Result<()>;
    fn migration_status(&mut self) -> Result<MigrationStatus>;
    fn cancel_migration(&mut self) -> Result<()>;

    /// Grows the root device; returns `false` if it already was at least `size` bytes.
    fn resize_root(&mut self, size: u64) -> Result<bool>;
    /// Returns `false` if the device was already throttled to `iops`.
    fn block_io_throttle(&mut self, device: &str, iops: u64) -> Result<bool>;
    fn watchdog_action(&mut self, action: &str) -> Result<()>;
    fn freeze(&mut self) -> Result<()>;
    fn thaw(&mut self) -> Result<()>;
    /// Removes runtime files left behind by a stopped VM.
    fn cleanup(&mut self) -> Result<()>;
}

/// Stops the VM cooperatively, escalating to `kill` when it does not go away in time.
pub fn stop_with_escalation(
    vm: &str,
    process: &mut dyn VmProcess,
    graceful: Duration,
    interval: Duration,
) -> Result<bool> {
    if !process.is_running()? {
        return Ok(false);
    }
    if let Err(err) = process.graceful_shutdown() {
        tracing::warn!(vm, error = %err, "cooperative powerdown failed");
    } else {
        let mut timeout = Timeout::new(graceful, interval, format!("VM `{vm}` to power down"));
        while process.is_running()? {
            if !timeout.tick() {
                break;
            }
        }
        if !process.is_running()? {
            tracing::info!(vm, "VM powered down");
            return Ok(true);
        }
    }
    tracing::warn!(vm, "escalating to kill");
    process.kill()?;
    Ok(true)
}

const TRANSIENT_MIGRATION_STATUSES: &[&str] = &["setup", "active", "pre-switchover", "device"];

/// Restartable sequence of migration snapshots. Ends after yielding the first snapshot with the
/// target status; any status that is neither transient nor the target ends it with an error.
pub struct MigrationPoller<'a> {
    vm: &'a str,
    process: &'a mut dyn VmProcess,
    target: &'a str,
    interval: Duration,
    max_interval: Duration,
    timeout: Timeout,
    first: bool,
    done: bool,
}

impl<'a> MigrationPoller<'a> {
    pub fn new(
        vm: &'a str,
        process: &'a mut dyn VmProcess,
        target: &'a str,
        limit: Duration,
    ) -> Self {
        Self {
            vm,
            process,
            target,
            interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            timeout: Timeout::new(limit, Duration::from_millis(500), format!("migration of `{vm}`")),
            first: true,
            done: false,
        }
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.interval = initial;
        self.max_interval = max.max(initial);
        self
    }

    fn poll(&mut self) -> Result<MigrationStatus> {
        if self.first {
            self.first = false;
        } else {
            self.timeout.set_interval(self.interval);
            self.timeout.tick_or_fail()?;
            self.interval = (self.interval * 3 / 2).min(self.max_interval);
        }
        let status = self.process.migration_status()?;
        if status.status == self.target {
            self.done = true;
        } else if !TRANSIENT_MIGRATION_STATUSES.contains(&status.status.as_str()) {
            self.done = true;
            return Err(Error::migration(
                self.vm,
                format!("unexpected migration status `{}`", status.status),
            ));
        }
        Ok(status)
    }
}

impl Iterator for MigrationPoller<'_> {
    type Item = Result<MigrationStatus>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.poll();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Runtime file locations of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    pub pidfile: PathBuf,
    pub qmp: PathBuf,
    pub guest_agent: PathBuf,
    pub config: PathBuf,
    pub log: PathBuf,
    pub migration_lock: PathBuf,
    /// Serializes reconciliation passes of this VM on the host.
    pub agent_lock: PathBuf,
}

impl VmPaths {
    pub fn new(run_dir: &Path, vm: &str) -> Self {
        Self {
            pidfile: run_dir.join(format!("{vm}.pid")),
            qmp: run_dir.join(format!("{vm}.qmp")),
            guest_agent: run_dir.join(format!("{vm}.qga")),
            config: run_dir.join(format!("{vm}.cfg")),
            log: run_dir.join(format!("{vm}.log")),
            migration_lock: run_dir.join(format!("{vm}.migration.lock")),
            agent_lock: run_dir.join(format!("{vm}.lock")),
        }
    }
}

/// Process name marker that identifies our QEMU in the process table.
pub fn process_marker(vm: &str) -> String {
    format!("kvm.{vm}")
}

const CONFIG_TEMPLATE: &str = r#"# generated by steward for {name}, generation {generation}
[machine]
  type = "pc"
{accel}
[memory]
  size = "{memory}M"

[smp-opts]
  cpus = "{cores}"

[drive "root"]
  file = "rbd:{root}:id={client}:conf={ceph_conf}"
  format = "raw"
  if = "virtio"
  cache = "none"
  aio = "threads"

[drive "swap"]
  file = "rbd:{swap}:id={client}:conf={ceph_conf}"
  format = "raw"
  if = "virtio"
  cache = "none"

[drive "tmp"]
  file = "rbd:{tmp}:id={client}:conf={ceph_conf}"
  format = "raw"
  if = "virtio"
  cache = "none"
{interfaces}"#;

/// Renders the launch configuration for `document` from the built-in template.
pub fn render_launch_config(
    document: &VmDocument,
    volumes: &[VolumeSpec],
    paths: &VmPaths,
    settings: &AgentConfig,
) -> LaunchConfig {
    let volume = |role: VolumeRole| {
        volumes
            .iter()
            .find(|spec| spec.role == role)
            .map(|spec| spec.volume.to_string())
            .unwrap_or_default()
    };
    let accel = settings
        .qemu
        .accelerator
        .as_ref()
        .map(|accel| format!("  accel = \"{accel}\"\n"))
        .unwrap_or_default();

    let mut interfaces = String::new();
    for (name, interface) in &document.parameters.interfaces {
        interfaces.push_str(&format!(
            "\n[netdev \"net-{name}\"]\n  type = \"tap\"\n  ifname = \"t{name}{vm}\"\n  script = \"no\"\n  downscript = \"no\"\n",
            vm = document.name
        ));
        interfaces.push_str(&format!(
            "\n[device \"nic-{name}\"]\n  driver = \"virtio-net-pci\"\n  netdev = \"net-{name}\"\n  mac = \"{}\"\n",
            interface.mac
        ));
    }

    let config = CONFIG_TEMPLATE
        .replace("{name}", &document.name)
        .replace("{generation}", &document.generation.to_string())
        .replace("{accel}", &accel)
        .replace("{memory}", &document.parameters.memory.to_string())
        .replace("{cores}", &document.parameters.cores.to_string())
        .replace("{root}", &volume(VolumeRole::Root))
        .replace("{swap}", &volume(VolumeRole::Swap))
        .replace("{tmp}", &volume(VolumeRole::Tmp))
        .replace("{client}", &settings.ceph.client_id)
        .replace("{ceph_conf}", &settings.ceph.conf.display().to_string())
        .replace("{interfaces}", &interfaces);

    let marker = process_marker(&document.name);
    let mut args = vec![
        "-name".to_string(),
        format!("{marker},process={marker}"),
        "-nodefaults".to_string(),
        "-display".to_string(),
        "none".to_string(),
        "-daemonize".to_string(),
        "-pidfile".to_string(),
        paths.pidfile.display().to_string(),
        "-qmp".to_string(),
        format!("unix:{},server=on,wait=off", paths.qmp.display()),
        "-chardev".to_string(),
        guest_agent_chardev(paths),
        "-device".to_string(),
        "virtio-serial".to_string(),
        "-device".to_string(),
        "virtserialport,chardev=qga0,name=org.qemu.guest_agent.0".to_string(),
        "-watchdog".to_string(),
        "i6300esb".to_string(),
        "-readconfig".to_string(),
        paths.config.display().to_string(),
        "-m".to_string(),
        format!("{}M", document.parameters.memory),
    ];
    if let Some(model) = &document.parameters.cpu_model {
        args.push("-cpu".to_string());
        args.push(model.clone());
    }

    LaunchConfig { args, config }
}

/// Rewrites host-specific paths in a launch configuration received from a peer and drops any
/// `-incoming` it carried over from its own arrival.
pub fn adapt_incoming(launch: &LaunchConfig, paths: &VmPaths) -> LaunchConfig {
    let mut args = Vec::with_capacity(launch.args.len());
    let mut iter = launch.args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-incoming" => {
                iter.next();
            }
            "-pidfile" | "-readconfig" | "-qmp" | "-chardev" => {
                args.push(arg.clone());
                if let Some(value) = iter.next() {
                    args.push(local_path_arg(arg, value, paths));
                }
            }
            _ => args.push(arg.clone()),
        }
    }
    LaunchConfig {
        args,
        config: launch.config.clone(),
    }
}

fn local_path_arg(flag: &str, value: &str, paths: &VmPaths) -> String {
    match flag {
        "-pidfile" => paths.pidfile.display().to_string(),
        "-readconfig" => paths.config.display().to_string(),
        "-qmp" => format!("unix:{},server=on,wait=off", paths.qmp.display()),
        "-chardev" if value.starts_with("socket,id=qga0,") => guest_agent_chardev(paths),
        _ => value.to_string(),
    }
}

fn guest_agent_chardev(paths: &VmPaths) -> String {
    format!(
        "socket,id=qga0,path={},server=on,wait=off",
        paths.guest_agent.display()
    )
}

/// QEMU driven through its command line, pidfile and QMP socket.
pub struct Qemu {
    vm: String,
    binary: PathBuf,
    paths: VmPaths,
    listen_address: String,
    advertise_address: String,
    kill_timeout: Duration,
    qmp: QmpClient,
    migration_lock: MigrationLock,
}

impl Qemu {
    pub fn new(vm: &str, settings: &AgentConfig) -> Self {
        let paths = VmPaths::new(&settings.run_dir, vm);
        Self {
            vm: vm.to_string(),
            binary: settings.qemu.binary.clone(),
            qmp: QmpClient::new(vm, &paths.qmp, QMP_TIMEOUT),
            migration_lock: MigrationLock::new(&paths.migration_lock),
            listen_address: settings.qemu.migration_address.clone(),
            advertise_address: settings.advertised_address().to_string(),
            kill_timeout: settings.timeouts.kill,
            paths,
        }
    }

    fn launch_failed(&self, message: impl Into<String>) -> Error {
        Error::LaunchFailed {
            vm: self.vm.clone(),
            message: message.into(),
        }
    }

    fn read_pid(&self) -> Option<pid_t> {
        fs::read_to_string(&self.paths.pidfile)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn launch(&mut self, launch: &LaunchConfig, extra: &[String]) -> Result<()> {
        if self.is_running()? {
            return Err(Error::InvalidCommand {
                vm: self.vm.clone(),
                command: "start",
                message: "VM is already running".to_string(),
            });
        }
        self.qmp.disconnect();
        for stale in [&self.paths.pidfile, &self.paths.qmp, &self.paths.guest_agent] {
            remove_file_if_exists(stale)
                .map_err(|err| self.launch_failed(format!("removing {}: {err}", stale.display())))?;
        }
        if let Some(parent) = self.paths.config.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| self.launch_failed(format!("creating {}: {err}", parent.display())))?;
        }
        fs::write(&self.paths.config, &launch.config).map_err(|err| {
            self.launch_failed(format!("writing {}: {err}", self.paths.config.display()))
        })?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.log)
            .map_err(|err| {
                self.launch_failed(format!("opening log {}: {err}", self.paths.log.display()))
            })?;
        let log_clone = log
            .try_clone()
            .map_err(|err| self.launch_failed(format!("duplicating log handle: {err}")))?;

        tracing::debug!(vm = %self.vm, binary = %self.binary.display(), ?extra, "launching QEMU");
        let status = Command::new(&self.binary)
            .args(&launch.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_clone))
            .status()
            .map_err(|err| {
                self.launch_failed(format!("failed to spawn {}: {err}", self.binary.display()))
            })?;
        if !status.success() {
            return Err(self.launch_failed(format!(
                "{} exited with status {}; see {}",
                self.binary.display(),
                status.code().unwrap_or(-1),
                self.paths.log.display()
            )));
        }

        let mut wait = Timeout::new(
            Duration::from_secs(10),
            Duration::from_millis(100),
            format!("pidfile {}", self.paths.pidfile.display()),
        );
        while !self.paths.pidfile.exists() {
            wait.tick_or_fail()?;
        }
        tracing::info!(vm = %self.vm, pid = self.read_pid().unwrap_or_default(), "QEMU launched");
        Ok(())
    }

    fn signal(&self, pid: pid_t, signal: libc::c_int) -> Result<bool> {
        let res = unsafe { libc::kill(pid, signal) };
        if res == 0 {
            return Ok(true);
        }
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or_default();
        if errno == libc::ESRCH {
            return Ok(false);
        }
        Err(Error::ShutdownFailed {
            vm: self.vm.clone(),
            message: format!("failed to send signal {signal} to pid {pid}: errno {errno}"),
        })
    }

    fn query_root(&mut self) -> Result<Option<Value>> {
        let devices = self.qmp.execute("query-block", None)?;
        Ok(devices.as_array().and_then(|devices| {
            devices
                .iter()
                .find(|device| device.get("device").and_then(Value::as_str) == Some(ROOT_DEVICE))
                .cloned()
        }))
    }

    fn guest_agent(&self, command: &str) -> Result<()> {
        guest_agent_execute(&self.vm, &self.paths.guest_agent, command, QMP_TIMEOUT).map(drop)
    }
}

impl VmProcess for Qemu {
    fn is_running(&mut self) -> Result<bool> {
        if !self.qmp.reachable() {
            return Ok(false);
        }
        match self.qmp.execute("query-status", None) {
            Ok(status) => {
                let status = status.get("status").and_then(Value::as_str).unwrap_or("unknown");
                tracing::trace!(vm = %self.vm, status, "QMP status");
                Ok(RUNNING_STATUSES.contains(&status))
            }
            Err(err) => {
                tracing::debug!(vm = %self.vm, error = %err, "status query failed");
                Ok(false)
            }
        }
    }

    fn pid_valid(&mut self) -> bool {
        let Some(pid) = self.read_pid() else {
            return false;
        };
        let Ok(pid) = u32::try_from(pid) else {
            return false;
        };
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        let marker = process_marker(&self.vm);
        system
            .process(pid)
            .is_some_and(|process| process.cmd().iter().any(|arg| arg.contains(&marker)))
    }

    fn process_info(&mut self) -> Option<ProcessInfo> {
        let pid = u32::try_from(self.read_pid()?).ok()?;
        let started = fs::metadata(&self.paths.pidfile)
            .and_then(|metadata| metadata.modified())
            .ok();
        Some(ProcessInfo { pid, started })
    }

    fn start(&mut self, launch: &LaunchConfig) -> Result<()> {
        self.launch(launch, &[])
    }

    fn start_incoming(&mut self, launch: &LaunchConfig) -> Result<String> {
        let port = TcpListener::bind((self.listen_address.as_str(), 0))
            .and_then(|listener| listener.local_addr())
            .map_err(|err| self.launch_failed(format!("reserving migration port: {err}")))?
            .port();
        let listen = format!("tcp:{}:{port}", self.listen_address);
        self.launch(launch, &["-incoming".to_string(), listen])?;
        Ok(format!("tcp:{}:{port}", self.advertise_address))
    }

    fn graceful_shutdown(&mut self) -> Result<()> {
        self.qmp.execute("system_powerdown", None).map(drop)
    }

    fn kill(&mut self) -> Result<()> {
        self.qmp.disconnect();
        let Some(pid) = self.read_pid() else {
            return Ok(());
        };
        if !self.signal(pid, libc::SIGTERM)? {
            return Ok(());
        }
        tracing::info!(vm = %self.vm, pid, "sent SIGTERM");
        if wait_for_process_exit(pid, self.kill_timeout) {
            return Ok(());
        }
        if self.signal(pid, libc::SIGKILL)? {
            tracing::warn!(vm = %self.vm, pid, "sent SIGKILL");
        }
        if wait_for_process_exit(pid, self.kill_timeout) {
            Ok(())
        } else {
            Err(Error::ShutdownFailed {
                vm: self.vm.clone(),
                message: format!("process {pid} did not exit after SIGKILL"),
            })
        }
    }

    fn destroy(&mut self, kill_supervisor: bool) -> Result<()> {
        // `quit` regularly reports a closed connection even though it worked.
        if let Err(err) = self.qmp.execute("quit", None) {
            tracing::debug!(vm = %self.vm, error = %err, "quit reported an error");
        }
        self.qmp.disconnect();
        if kill_supervisor {
            if let Some(pid) = self.read_pid() {
                self.signal(pid, libc::SIGKILL)?;
            }
        }

        let mut timeout = Timeout::new(
            self.kill_timeout,
            Duration::from_millis(200),
            format!("VM `{}` to disappear", self.vm),
        );
        while self.qmp.reachable() || self.pid_valid() {
            self.qmp.disconnect();
            if !timeout.tick() {
                return Err(Error::ShutdownFailed {
                    vm: self.vm.clone(),
                    message: "process still present after destroy".to_string(),
                });
            }
        }
        self.qmp.disconnect();
        tracing::info!(vm = %self.vm, "VM destroyed");
        Ok(())
    }

    fn acquire_migration_lock(&mut self) -> Result<bool> {
        self.migration_lock.try_acquire()
    }

    fn release_migration_lock(&mut self) {
        self.migration_lock.release();
    }

    fn running_config(&mut self) -> Result<LaunchConfig> {
        let unavailable = |message: String| Error::ControlProtocol {
            vm: self.vm.clone(),
            message,
        };
        let pid = self
            .read_pid()
            .and_then(|pid| u32::try_from(pid).ok())
            .ok_or_else(|| unavailable("no pidfile".to_string()))?;
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_process(pid);
        let args = system
            .process(pid)
            .map(|process| process.cmd().iter().skip(1).cloned().collect::<Vec<_>>())
            .ok_or_else(|| unavailable(format!("process {pid} not found")))?;
        let config = fs::read_to_string(&self.paths.config).map_err(|err| {
            unavailable(format!("reading {}: {err}", self.paths.config.display()))
        })?;
        Ok(LaunchConfig { args, config })
    }

    fn migrate(&mut self, uri: &str) -> Result<()> {
        self.qmp.execute(
            "migrate-set-capabilities",
            Some(json!({ "capabilities": [{ "capability": "auto-converge", "state": true }] })),
        )?;
        self.qmp.execute("migrate", Some(json!({ "uri": uri }))).map(drop)
    }

    fn migration_status(&mut self) -> Result<MigrationStatus> {
        let value = self.qmp.execute("query-migrate", None)?;
        Ok(MigrationStatus::from_qmp(&value))
    }

    fn cancel_migration(&mut self) -> Result<()> {
        self.qmp.execute("migrate_cancel", None).map(drop)
    }

    fn resize_root(&mut self, size: u64) -> Result<bool> {
        let current = self
            .query_root()?
            .and_then(|device| device.pointer("/inserted/image/virtual-size")?.as_u64())
            .unwrap_or_default();
        if current >= size {
            return Ok(false);
        }
        self.qmp.execute(
            "block_resize",
            Some(json!({ "device": ROOT_DEVICE, "size": size })),
        )?;
        tracing::info!(vm = %self.vm, from = current, to = size, "resized root device");
        Ok(true)
    }

    fn block_io_throttle(&mut self, device: &str, iops: u64) -> Result<bool> {
        let devices = self.qmp.execute("query-block", None)?;
        let current = devices
            .as_array()
            .and_then(|devices| {
                devices
                    .iter()
                    .find(|entry| entry.get("device").and_then(Value::as_str) == Some(device))
            })
            .and_then(|entry| entry.pointer("/inserted/iops")?.as_u64());
        if current == Some(iops) {
            return Ok(false);
        }
        self.qmp.execute(
            "block_set_io_throttle",
            Some(json!({
                "device": device,
                "iops": iops,
                "iops_rd": 0,
                "iops_wr": 0,
                "bps": 0,
                "bps_rd": 0,
                "bps_wr": 0,
            })),
        )?;
        tracing::info!(vm = %self.vm, device, iops, "applied IO throttle");
        Ok(true)
    }

    fn watchdog_action(&mut self, action: &str) -> Result<()> {
        self.qmp
            .execute("watchdog-set-action", Some(json!({ "action": action })))
            .map(drop)
    }

    fn freeze(&mut self) -> Result<()> {
        self.guest_agent("guest-fsfreeze-freeze")
    }

    fn thaw(&mut self) -> Result<()> {
        self.guest_agent("guest-fsfreeze-thaw")
    }

    fn cleanup(&mut self) -> Result<()> {
        self.qmp.disconnect();
        for path in [
            &self.paths.pidfile,
            &self.paths.qmp,
            &self.paths.guest_agent,
            &self.paths.config,
        ] {
            remove_file_if_exists(path)
                .map_err(|err| Error::io(format!("Failed to remove {}", path.display()), err))?;
        }
        Ok(())
    }
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn wait_for_process_exit(pid: pid_t, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        let res = unsafe { libc::kill(pid, 0) };
        if res == -1
            && io::Error::last_os_error().raw_os_error().unwrap_or_default() == libc::ESRCH
        {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(200));
    }
}
