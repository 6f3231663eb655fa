use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sysinfo::System;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/steward/agent.toml";
pub const CONFIG_ENV: &str = "STEWARD_CONFIG";

const DEFAULT_VM_CONFIG_DIR: &str = "/etc/steward/vm";
const DEFAULT_RUN_DIR: &str = "/run/steward";
const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";
const DEFAULT_CEPH_CLIENT: &str = "admin";
const DEFAULT_CEPH_CONF: &str = "/etc/ceph/ceph.conf";
const DEFAULT_QEMU_BINARY: &str = "qemu-system-x86_64";
const DEFAULT_WORKERS: usize = 4;

/// Validated host agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// File the configuration was loaded from, `None` when built-in defaults apply.
    pub file_path: Option<PathBuf>,
    /// Name of this host. Used as the lock owner and to match `kvm_host`.
    pub host: String,
    /// Directory holding the active and staged VM documents.
    pub vm_config_dir: PathBuf,
    /// Directory for pidfiles, QMP sockets, generated QEMU configs and lock files.
    pub run_dir: PathBuf,
    /// Optional file that receives a copy of the agent log.
    pub log_file: Option<PathBuf>,
    pub consul: ConsulSettings,
    pub ceph: CephSettings,
    pub qemu: QemuSettings,
    pub timeouts: TimeoutSettings,
    /// Size of the worker pool used by `handle-event`.
    pub workers: usize,
    /// Non-fatal issues found while loading.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConsulSettings {
    pub address: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CephSettings {
    pub client_id: String,
    pub conf: PathBuf,
    pub rbd: PathBuf,
    pub ceph: PathBuf,
    /// Attempts made by `acquire` when a lock disappears between query and add.
    pub lock_attempts: u32,
    pub pool_cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct QemuSettings {
    pub binary: PathBuf,
    /// Address the incoming migration server and QEMU's `-incoming` listener bind to.
    pub migration_address: String,
    /// Address peers use to reach this host; defaults to the host name.
    pub advertise_address: Option<String>,
    pub accelerator: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutSettings {
    /// Wait after a cooperative powerdown before escalating to signals.
    pub graceful_shutdown: Duration,
    /// Wait after SIGTERM/SIGKILL for the process to disappear.
    pub kill: Duration,
    /// How long the outgoing side searches for the peer's incoming service.
    pub discovery: Duration,
    /// Initial inactivity cutoff of the incoming migration server.
    pub incoming: Duration,
    /// Interval between heartbeat pings during an outgoing migration.
    pub heartbeat_interval: Duration,
    /// Upper bound for the live transfer itself.
    pub migration: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            graceful_shutdown: Duration::from_secs(120),
            kill: Duration::from_secs(10),
            discovery: Duration::from_secs(3600),
            incoming: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(10),
            migration: Duration::from_secs(3600),
        }
    }
}

impl AgentConfig {
    /// Built-in defaults, used when no configuration file exists at the default location.
    pub fn defaults() -> Self {
        Self {
            file_path: None,
            host: default_host_name(),
            vm_config_dir: PathBuf::from(DEFAULT_VM_CONFIG_DIR),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            log_file: None,
            consul: ConsulSettings {
                address: DEFAULT_CONSUL_ADDRESS.to_string(),
                token: None,
            },
            ceph: CephSettings {
                client_id: DEFAULT_CEPH_CLIENT.to_string(),
                conf: PathBuf::from(DEFAULT_CEPH_CONF),
                rbd: PathBuf::from("rbd"),
                ceph: PathBuf::from("ceph"),
                lock_attempts: 3,
                pool_cache_ttl: Duration::from_secs(300),
            },
            qemu: QemuSettings {
                binary: PathBuf::from(DEFAULT_QEMU_BINARY),
                migration_address: "0.0.0.0".to_string(),
                advertise_address: None,
                accelerator: Some("kvm".to_string()),
            },
            timeouts: TimeoutSettings::default(),
            workers: DEFAULT_WORKERS,
            warnings: Vec::new(),
        }
    }

    /// Path of the active document for `vm`.
    pub fn active_document(&self, vm: &str) -> PathBuf {
        self.vm_config_dir.join(format!("{vm}.json"))
    }

    pub fn advertised_address(&self) -> &str {
        self.qemu.advertise_address.as_deref().unwrap_or(&self.host)
    }

    /// Path of the staged document for `vm`.
    pub fn staged_document(&self, vm: &str) -> PathBuf {
        self.vm_config_dir.join(format!("{vm}.json.staged"))
    }
}

/// Where the agent configuration should come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPath {
    /// Path given on the command line or through `STEWARD_CONFIG`; must exist.
    Explicit(PathBuf),
    /// The default location; defaults apply when it is absent.
    Default(PathBuf),
}

pub fn resolve_config_path(explicit: Option<&Path>) -> ConfigPath {
    if let Some(path) = explicit {
        return ConfigPath::Explicit(path.to_path_buf());
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(value) if !value.is_empty() => ConfigPath::Explicit(PathBuf::from(value)),
        _ => ConfigPath::Default(PathBuf::from(DEFAULT_CONFIG_PATH)),
    }
}

pub fn load_agent_config(explicit: Option<&Path>) -> Result<AgentConfig> {
    let path = match resolve_config_path(explicit) {
        ConfigPath::Explicit(path) => path,
        ConfigPath::Default(path) => {
            if !path.is_file() {
                return Ok(AgentConfig::defaults());
            }
            path
        }
    };

    let contents = fs::read_to_string(&path).map_err(|source| Error::ReadConfig {
        path: path.clone(),
        source,
    })?;
    parse_agent_config(&path, &contents)
}

pub(crate) fn parse_agent_config(path: &Path, contents: &str) -> Result<AgentConfig> {
    let value: toml::Value = toml::from_str(contents).map_err(|err| Error::ParseConfig {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let mut warnings = detect_unknown_fields(&value);

    let raw: RawAgentConfig = value.try_into().map_err(|err: toml::de::Error| {
        Error::ParseConfig {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    })?;

    let mut config = raw.into_validated(path, &mut warnings)?;
    config.file_path = Some(path.to_path_buf());
    config.warnings = warnings;
    Ok(config)
}

fn invalid_config(path: &Path, message: impl Into<String>) -> Error {
    Error::ParseConfig {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn default_host_name() -> String {
    System::host_name()
        .map(|name| short_host_name(&name).to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn short_host_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn detect_unknown_fields(value: &toml::Value) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(table) = value.as_table() else {
        return warnings;
    };

    warn_table(
        table,
        &[
            "host",
            "vm_config_dir",
            "run_dir",
            "log_file",
            "workers",
            "consul",
            "ceph",
            "qemu",
            "timeouts",
        ],
        "top level",
        &mut warnings,
    );

    let sections: [(&str, &[&str]); 4] = [
        ("consul", &["address", "token"]),
        (
            "ceph",
            &[
                "client_id",
                "conf",
                "rbd",
                "ceph",
                "lock_attempts",
                "pool_cache_ttl_secs",
            ],
        ),
        (
            "qemu",
            &[
                "binary",
                "migration_address",
                "advertise_address",
                "accelerator",
            ],
        ),
        (
            "timeouts",
            &[
                "graceful_shutdown_secs",
                "kill_secs",
                "discovery_secs",
                "incoming_secs",
                "heartbeat_interval_secs",
                "migration_secs",
            ],
        ),
    ];
    for (name, allowed) in sections {
        match table.get(name) {
            Some(toml::Value::Table(section)) => {
                warn_table(section, allowed, &format!("[{name}]"), &mut warnings)
            }
            Some(_) => warnings.push(format!("Expected [{name}] to be a table.")),
            None => {}
        }
    }

    warnings
}

fn warn_table(
    table: &toml::map::Map<String, toml::Value>,
    allowed: &[&str],
    context: &str,
    warnings: &mut Vec<String>,
) {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            warnings.push(format!(
                "Unknown field `{key}` at {context}; this value will be ignored."
            ));
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAgentConfig {
    host: Option<String>,
    vm_config_dir: Option<PathBuf>,
    run_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
    workers: Option<usize>,
    #[serde(default)]
    consul: RawConsul,
    #[serde(default)]
    ceph: RawCeph,
    #[serde(default)]
    qemu: RawQemu,
    #[serde(default)]
    timeouts: RawTimeouts,
}

#[derive(Debug, Deserialize, Default)]
struct RawConsul {
    address: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawCeph {
    client_id: Option<String>,
    conf: Option<PathBuf>,
    rbd: Option<PathBuf>,
    ceph: Option<PathBuf>,
    lock_attempts: Option<u32>,
    pool_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawQemu {
    binary: Option<PathBuf>,
    migration_address: Option<String>,
    advertise_address: Option<String>,
    accelerator: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTimeouts {
    graceful_shutdown_secs: Option<u64>,
    kill_secs: Option<u64>,
    discovery_secs: Option<u64>,
    incoming_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    migration_secs: Option<u64>,
}

impl RawAgentConfig {
    fn into_validated(self, path: &Path, warnings: &mut Vec<String>) -> Result<AgentConfig> {
        let defaults = AgentConfig::defaults();

        let host = match self.host {
            Some(host) if host.trim().is_empty() => {
                return Err(invalid_config(path, "Field `host` must not be empty."));
            }
            Some(host) => host,
            None => defaults.host,
        };

        let workers = match self.workers {
            Some(0) => {
                warnings.push(format!(
                    "`workers = 0` is not usable; falling back to {DEFAULT_WORKERS}."
                ));
                DEFAULT_WORKERS
            }
            Some(count) => count,
            None => DEFAULT_WORKERS,
        };

        let lock_attempts = match self.ceph.lock_attempts {
            Some(0) => {
                return Err(invalid_config(
                    path,
                    "Field `ceph.lock_attempts` must be at least 1.",
                ));
            }
            Some(attempts) => attempts,
            None => defaults.ceph.lock_attempts,
        };

        let base = path.parent().unwrap_or_else(|| Path::new("/"));
        let base_timeouts = defaults.timeouts;
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };

        Ok(AgentConfig {
            file_path: None,
            host,
            vm_config_dir: self
                .vm_config_dir
                .map(|dir| resolve_path(base, dir))
                .unwrap_or(defaults.vm_config_dir),
            run_dir: self
                .run_dir
                .map(|dir| resolve_path(base, dir))
                .unwrap_or(defaults.run_dir),
            log_file: self.log_file.map(|file| resolve_path(base, file)),
            consul: ConsulSettings {
                address: self
                    .consul
                    .address
                    .map(|address| address.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.consul.address),
                token: self.consul.token.filter(|token| !token.is_empty()),
            },
            ceph: CephSettings {
                client_id: self.ceph.client_id.unwrap_or(defaults.ceph.client_id),
                conf: self.ceph.conf.unwrap_or(defaults.ceph.conf),
                rbd: self.ceph.rbd.unwrap_or(defaults.ceph.rbd),
                ceph: self.ceph.ceph.unwrap_or(defaults.ceph.ceph),
                lock_attempts,
                pool_cache_ttl: secs(
                    self.ceph.pool_cache_ttl_secs,
                    defaults.ceph.pool_cache_ttl,
                ),
            },
            qemu: QemuSettings {
                binary: self.qemu.binary.unwrap_or(defaults.qemu.binary),
                migration_address: self
                    .qemu
                    .migration_address
                    .unwrap_or(defaults.qemu.migration_address),
                advertise_address: self
                    .qemu
                    .advertise_address
                    .filter(|address| !address.trim().is_empty()),
                accelerator: match self.qemu.accelerator {
                    Some(accel) if accel.is_empty() || accel == "none" => None,
                    Some(accel) => Some(accel),
                    None => defaults.qemu.accelerator,
                },
            },
            timeouts: TimeoutSettings {
                graceful_shutdown: secs(
                    self.timeouts.graceful_shutdown_secs,
                    base_timeouts.graceful_shutdown,
                ),
                kill: secs(self.timeouts.kill_secs, base_timeouts.kill),
                discovery: secs(self.timeouts.discovery_secs, base_timeouts.discovery),
                incoming: secs(self.timeouts.incoming_secs, base_timeouts.incoming),
                heartbeat_interval: secs(
                    self.timeouts.heartbeat_interval_secs,
                    base_timeouts.heartbeat_interval,
                ),
                migration: secs(self.timeouts.migration_secs, base_timeouts.migration),
            },
            workers,
            warnings: Vec::new(),
        })
    }
}

fn resolve_path(base: &Path, input: PathBuf) -> PathBuf {
    if input.is_absolute() {
        input
    } else {
        base.join(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_full_configuration() {
        let contents = r#"
host = "kvm01"
vm_config_dir = "vms"
run_dir = "/var/run/steward"
workers = 8

[consul]
address = "http://consul.local:8500/"
token = "secret"

[ceph]
client_id = "host1"
lock_attempts = 5
pool_cache_ttl_secs = 60

[qemu]
migration_address = "10.0.0.5"
accelerator = "none"

[timeouts]
heartbeat_interval_secs = 3
"#;
        let config = parse_agent_config(Path::new("/etc/steward/agent.toml"), contents).unwrap();
        assert_eq!(config.host, "kvm01");
        assert_eq!(config.vm_config_dir, PathBuf::from("/etc/steward/vms"));
        assert_eq!(config.run_dir, PathBuf::from("/var/run/steward"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.consul.address, "http://consul.local:8500");
        assert_eq!(config.consul.token.as_deref(), Some("secret"));
        assert_eq!(config.ceph.client_id, "host1");
        assert_eq!(config.ceph.lock_attempts, 5);
        assert_eq!(config.ceph.pool_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.qemu.migration_address, "10.0.0.5");
        assert!(config.qemu.accelerator.is_none());
        assert_eq!(config.timeouts.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.timeouts.discovery, Duration::from_secs(3600));
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn unknown_fields_produce_warnings() {
        let contents = r#"
host = "kvm01"
colour = "blue"

[ceph]
keyring = "/etc/ceph/keyring"
"#;
        let config = parse_agent_config(Path::new("agent.toml"), contents).unwrap();
        assert_eq!(config.warnings.len(), 2);
        assert!(config.warnings.iter().any(|w| w.contains("`colour`")));
        assert!(config.warnings.iter().any(|w| w.contains("[ceph]")));
    }

    #[test]
    fn rejects_zero_lock_attempts() {
        let err = parse_agent_config(Path::new("agent.toml"), "[ceph]\nlock_attempts = 0\n")
            .unwrap_err();
        assert!(matches!(err, Error::ParseConfig { .. }));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("agent.toml");
        let err = load_agent_config(Some(&missing)).unwrap_err();
        assert!(matches!(err, Error::ReadConfig { .. }));
    }

    #[test]
    fn environment_override_selects_explicit_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "host = \"from-env\"\n").unwrap();

        temp_env::with_var(CONFIG_ENV, Some(path.as_os_str()), || {
            assert_eq!(resolve_config_path(None), ConfigPath::Explicit(path.clone()));
            let config = load_agent_config(None).unwrap();
            assert_eq!(config.host, "from-env");
            assert_eq!(config.file_path.as_deref(), Some(path.as_path()));
        });
    }

    #[test]
    fn short_host_name_strips_domain() {
        assert_eq!(short_host_name("kvm01.example.com"), "kvm01");
        assert_eq!(short_host_name("kvm01"), "kvm01");
    }
}
