//! Narrow client interface to the networked block-storage cluster.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;

use crate::config::CephSettings;
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;
const ENOENT: i32 = 2;
const EBUSY: i32 = 16;
const EEXIST: i32 = 17;

/// A volume addressed by pool and image name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeRef {
    pub pool: String,
    pub name: String,
}

impl VolumeRef {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }

    pub fn in_pool(&self, pool: &str) -> Self {
        Self::new(pool, self.name.clone())
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.name)
    }
}

/// One exclusive lock as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Lock id; steward records the owning host name here.
    pub owner: String,
    /// Cluster client session that placed the lock, needed to break it.
    pub locker: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Somebody else placed a lock between our query and our add.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolMigrationState {
    Preparing,
    Prepared,
    Executing,
    Executed,
    Committing,
    Committed,
    Aborting,
    Error(String),
}

impl PoolMigrationState {
    pub fn parse(state: &str, description: &str) -> Self {
        match state {
            "preparing" => Self::Preparing,
            "prepared" => Self::Prepared,
            "executing" => Self::Executing,
            "executed" => Self::Executed,
            "committing" => Self::Committing,
            "committed" => Self::Committed,
            "aborting" => Self::Aborting,
            other if description.is_empty() => Self::Error(other.to_string()),
            other => Self::Error(format!("{other}: {description}")),
        }
    }
}

/// An online move of a volume between pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMigration {
    pub source: VolumeRef,
    pub target: VolumeRef,
    pub state: PoolMigrationState,
}

/// Operations the agent needs from the storage cluster. Every call goes to the cluster;
/// nothing about lock ownership is cached.
pub trait StorageCluster: Send + Sync {
    fn pools(&self) -> Result<Vec<String>>;
    fn volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>>;
    fn create(&self, volume: &VolumeRef, size: u64) -> Result<()>;
    fn resize(&self, volume: &VolumeRef, size: u64) -> Result<()>;

    /// Empty for volumes that do not exist.
    fn lock_list(&self, volume: &VolumeRef) -> Result<Vec<LockHolder>>;
    fn lock_add(&self, volume: &VolumeRef, owner: &str) -> Result<LockAttempt>;
    /// Removing a lock that no longer exists is not an error.
    fn lock_remove(&self, volume: &VolumeRef, holder: &LockHolder) -> Result<()>;

    fn snapshots(&self, volume: &VolumeRef) -> Result<Vec<Snapshot>>;
    /// Creating a snapshot whose name already exists is not an error.
    fn snapshot_create(&self, volume: &VolumeRef, name: &str) -> Result<()>;
    fn snapshot_remove(&self, volume: &VolumeRef, name: &str) -> Result<()>;

    /// Status of a pool migration whose target is `volume`, if any.
    fn migration_status(&self, volume: &VolumeRef) -> Result<Option<PoolMigration>>;
    fn migration_prepare(&self, source: &VolumeRef, target: &VolumeRef) -> Result<()>;
    fn migration_execute(&self, target: &VolumeRef) -> Result<()>;
    fn migration_commit(&self, target: &VolumeRef) -> Result<()>;
}

/// Pool names rarely change; keep them for a bounded time instead of asking on every pass.
#[derive(Debug)]
pub struct PoolCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Vec<String>)>>,
}

impl PoolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn pools(&self, cluster: &dyn StorageCluster) -> Result<Vec<String>> {
        let mut entry = self
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((fetched, pools)) = entry.as_ref() {
            if fetched.elapsed() < self.ttl {
                return Ok(pools.clone());
            }
        }
        let pools = cluster.pools()?;
        *entry = Some((Instant::now(), pools.clone()));
        Ok(pools)
    }

    pub fn invalidate(&self) {
        let mut entry = self
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *entry = None;
    }
}

/// Storage cluster client driving the `rbd` and `ceph` command line tools.
#[derive(Debug, Clone)]
pub struct RbdCli {
    rbd: PathBuf,
    ceph: PathBuf,
    client_id: String,
    conf: PathBuf,
}

impl RbdCli {
    pub fn new(settings: &CephSettings) -> Self {
        Self {
            rbd: settings.rbd.clone(),
            ceph: settings.ceph.clone(),
            client_id: settings.client_id.clone(),
            conf: settings.conf.clone(),
        }
    }

    fn command(&self, program: &PathBuf) -> Command {
        let mut command = Command::new(program);
        command
            .arg("--id")
            .arg(&self.client_id)
            .arg("-c")
            .arg(&self.conf);
        command
    }

    fn output(&self, program: &PathBuf, operation: &str, target: &str, args: &[&str]) -> Result<Output> {
        tracing::trace!(program = %program.display(), ?args, "running storage tool");
        self.command(program)
            .args(args)
            .output()
            .map_err(|err| Error::Storage {
                operation: operation.to_string(),
                target: target.to_string(),
                stderr: format!("failed to invoke `{}`: {err}", program.display()),
            })
    }

    fn rbd(&self, operation: &str, target: &str, args: &[&str]) -> Result<Output> {
        self.output(&self.rbd, operation, target, args)
    }

    fn checked(operation: &str, target: &str, output: Output) -> Result<Vec<u8>> {
        if output.status.success() {
            return Ok(output.stdout);
        }
        Err(storage_error(operation, target, &output))
    }

    fn json<T: for<'de> Deserialize<'de>>(operation: &str, target: &str, stdout: &[u8]) -> Result<T> {
        serde_json::from_slice(stdout).map_err(|err| Error::Storage {
            operation: operation.to_string(),
            target: target.to_string(),
            stderr: format!("unparsable JSON output: {err}"),
        })
    }
}

impl StorageCluster for RbdCli {
    fn pools(&self) -> Result<Vec<String>> {
        let output = self.output(
            &self.ceph,
            "osd pool ls",
            "cluster",
            &["osd", "pool", "ls", "--format", "json"],
        )?;
        let stdout = Self::checked("osd pool ls", "cluster", output)?;
        Self::json("osd pool ls", "cluster", &stdout)
    }

    fn volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        #[derive(Deserialize)]
        struct Entry {
            image: String,
            #[serde(default)]
            size: u64,
            #[serde(default)]
            snapshot: Option<String>,
        }

        let output = self.rbd("ls", pool, &["ls", "-l", "--format", "json", "-p", pool])?;
        let stdout = Self::checked("ls", pool, output)?;
        let entries: Vec<Entry> = Self::json("ls", pool, &stdout)?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.snapshot.is_none())
            .map(|entry| VolumeInfo {
                name: entry.image,
                size: entry.size,
            })
            .collect())
    }

    fn create(&self, volume: &VolumeRef, size: u64) -> Result<()> {
        let target = volume.to_string();
        let size = format!("{}M", size.div_ceil(MIB));
        let output = self.rbd("create", &target, &["create", "--size", &size, &target])?;
        Self::checked("create", &target, output).map(drop)
    }

    fn resize(&self, volume: &VolumeRef, size: u64) -> Result<()> {
        let target = volume.to_string();
        let size = format!("{}M", size.div_ceil(MIB));
        let output = self.rbd("resize", &target, &["resize", "--size", &size, &target])?;
        Self::checked("resize", &target, output).map(drop)
    }

    fn lock_list(&self, volume: &VolumeRef) -> Result<Vec<LockHolder>> {
        let target = volume.to_string();
        let output = self.rbd(
            "lock ls",
            &target,
            &["lock", "ls", "--format", "json", &target],
        )?;
        // A volume that does not exist holds no locks.
        if has_errno(&output, ENOENT) {
            return Ok(Vec::new());
        }
        let stdout = Self::checked("lock ls", &target, output)?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let value: Value = Self::json("lock ls", &target, &stdout)?;
        Ok(parse_lock_list(&value))
    }

    fn lock_add(&self, volume: &VolumeRef, owner: &str) -> Result<LockAttempt> {
        let target = volume.to_string();
        let output = self.rbd("lock add", &target, &["lock", "add", &target, owner])?;
        if has_errno(&output, EBUSY) || has_errno(&output, EEXIST) {
            return Ok(LockAttempt::Busy);
        }
        Self::checked("lock add", &target, output).map(|_| LockAttempt::Acquired)
    }

    fn lock_remove(&self, volume: &VolumeRef, holder: &LockHolder) -> Result<()> {
        let target = volume.to_string();
        let output = self.rbd(
            "lock rm",
            &target,
            &["lock", "rm", &target, &holder.owner, &holder.locker],
        )?;
        if has_errno(&output, ENOENT) {
            return Ok(());
        }
        Self::checked("lock rm", &target, output).map(drop)
    }

    fn snapshots(&self, volume: &VolumeRef) -> Result<Vec<Snapshot>> {
        let target = volume.to_string();
        let output = self.rbd(
            "snap ls",
            &target,
            &["snap", "ls", "--format", "json", &target],
        )?;
        let stdout = Self::checked("snap ls", &target, output)?;
        Self::json("snap ls", &target, &stdout)
    }

    fn snapshot_create(&self, volume: &VolumeRef, name: &str) -> Result<()> {
        let target = format!("{volume}@{name}");
        let output = self.rbd("snap create", &target, &["snap", "create", &target])?;
        if has_errno(&output, EEXIST) {
            return Ok(());
        }
        Self::checked("snap create", &target, output).map(drop)
    }

    fn snapshot_remove(&self, volume: &VolumeRef, name: &str) -> Result<()> {
        let target = format!("{volume}@{name}");
        let output = self.rbd("snap rm", &target, &["snap", "rm", &target])?;
        if has_errno(&output, ENOENT) {
            return Ok(());
        }
        Self::checked("snap rm", &target, output).map(drop)
    }

    fn migration_status(&self, volume: &VolumeRef) -> Result<Option<PoolMigration>> {
        let target = volume.to_string();
        let output = self.rbd("status", &target, &["status", "--format", "json", &target])?;
        if has_errno(&output, ENOENT) {
            return Ok(None);
        }
        let stdout = Self::checked("status", &target, output)?;
        let value: Value = Self::json("status", &target, &stdout)?;
        Ok(parse_migration_status(&value))
    }

    fn migration_prepare(&self, source: &VolumeRef, target: &VolumeRef) -> Result<()> {
        let source_name = source.to_string();
        let target_name = target.to_string();
        let output = self.rbd(
            "migration prepare",
            &target_name,
            &["migration", "prepare", &source_name, &target_name],
        )?;
        Self::checked("migration prepare", &target_name, output).map(drop)
    }

    fn migration_execute(&self, target: &VolumeRef) -> Result<()> {
        let target_name = target.to_string();
        let output = self.rbd(
            "migration execute",
            &target_name,
            &["migration", "execute", &target_name],
        )?;
        Self::checked("migration execute", &target_name, output).map(drop)
    }

    fn migration_commit(&self, target: &VolumeRef) -> Result<()> {
        let target_name = target.to_string();
        let output = self.rbd(
            "migration commit",
            &target_name,
            &["migration", "commit", &target_name],
        )?;
        Self::checked("migration commit", &target_name, output).map(drop)
    }
}

fn storage_error(operation: &str, target: &str, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Error::Storage {
        operation: operation.to_string(),
        target: target.to_string(),
        stderr: if stderr.is_empty() {
            format!("exited with code {}", output.status.code().unwrap_or(-1))
        } else {
            stderr
        },
    }
}

/// `rbd` reports failures as `... (16) Device or resource busy` and exits with the errno.
fn has_errno(output: &Output, errno: i32) -> bool {
    if output.status.success() {
        return false;
    }
    if output.status.code() == Some(errno) {
        return true;
    }
    String::from_utf8_lossy(&output.stderr).contains(&format!("({errno})"))
}

/// Accepts both the list form (`[{"id", "locker", "address"}]`) and the older
/// map form (`{"<id>": {"locker", "address"}}`).
fn parse_lock_list(value: &Value) -> Vec<LockHolder> {
    let field = |entry: &Value, key: &str| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    match value {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| {
                Some(LockHolder {
                    owner: field(entry, "id")?,
                    locker: field(entry, "locker")?,
                    address: field(entry, "address"),
                })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(id, entry)| {
                Some(LockHolder {
                    owner: id.clone(),
                    locker: field(entry, "locker")?,
                    address: field(entry, "address"),
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_migration_status(value: &Value) -> Option<PoolMigration> {
    let migration = value.get("migration")?;
    let text = |key: &str| {
        migration
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(PoolMigration {
        source: VolumeRef::new(text("source_pool_name"), text("source_image_name")),
        target: VolumeRef::new(text("dest_pool_name"), text("dest_image_name")),
        state: PoolMigrationState::parse(&text("state"), &text("state_description")),
    })
}
