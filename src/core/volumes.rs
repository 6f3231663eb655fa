//! The set of storage volumes owned by one VM: presence, size, locks and snapshots.

use std::fmt;
use std::time::Duration;

use super::document::VmDocument;
use super::locks::{DistributedLock, LockChange};
use super::storage::{
    LockHolder, PoolCache, PoolMigration, PoolMigrationState, Snapshot, StorageCluster, VolumeRef,
};
use super::timeout::Timeout;
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VolumeRole {
    Root,
    Swap,
    Tmp,
}

impl VolumeRole {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Swap => "swap",
            Self::Tmp => "tmp",
        }
    }
}

impl fmt::Display for VolumeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Swap grows with the square root of memory, never below 1 GiB.
pub fn swap_size(memory_mib: u64) -> u64 {
    let scaled = (32.0 * (memory_mib as f64).sqrt()).ceil() as u64;
    scaled.max(1024) * MIB
}

/// Scratch space grows with the square root of the root disk, never below 5 GiB.
pub fn tmp_size(disk_gib: u64) -> u64 {
    let scaled = (disk_gib as f64).sqrt().ceil() as u64;
    scaled.max(5) * GIB
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub role: VolumeRole,
    pub volume: VolumeRef,
    /// Desired size in bytes.
    pub size: u64,
}

impl VolumeSpec {
    pub fn for_document(document: &VmDocument) -> Vec<VolumeSpec> {
        let pool = &document.parameters.rbd_pool;
        let spec = |role: VolumeRole, size: u64| VolumeSpec {
            role,
            volume: VolumeRef::new(pool.clone(), format!("{}.{}", document.name, role.suffix())),
            size,
        };
        vec![
            spec(VolumeRole::Root, document.root_size_bytes()),
            spec(VolumeRole::Swap, swap_size(document.parameters.memory)),
            spec(VolumeRole::Tmp, tmp_size(document.parameters.disk)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Existing,
    Created,
    /// A pool migration towards the desired pool was started or advanced but is not done yet.
    Migrating(PoolMigrationState),
    /// A pool migration towards the desired pool was committed during this call.
    Migrated { from: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeChange {
    Unchanged,
    Grown { from: u64, to: u64 },
}

/// Knobs for the pool-migration sub-protocol.
#[derive(Debug, Clone, Copy)]
pub struct PoolMigrationPolicy {
    /// How long one `ensure_presence` call waits on an in-flight migration before returning.
    pub wait: Duration,
    pub poll_interval: Duration,
}

impl Default for PoolMigrationPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct VolumeSet<'a> {
    cluster: &'a dyn StorageCluster,
    pools: &'a PoolCache,
    lock: DistributedLock<'a>,
    specs: Vec<VolumeSpec>,
    migration: PoolMigrationPolicy,
}

impl<'a> VolumeSet<'a> {
    pub fn new(
        cluster: &'a dyn StorageCluster,
        pools: &'a PoolCache,
        owner: &'a str,
        lock_attempts: u32,
        specs: Vec<VolumeSpec>,
    ) -> Self {
        Self {
            cluster,
            pools,
            lock: DistributedLock::new(cluster, owner, lock_attempts),
            specs,
            migration: PoolMigrationPolicy::default(),
        }
    }

    pub fn with_migration_policy(mut self, policy: PoolMigrationPolicy) -> Self {
        self.migration = policy;
        self
    }

    pub fn specs(&self) -> &[VolumeSpec] {
        &self.specs
    }

    pub fn volumes(&self) -> Vec<VolumeRef> {
        self.specs.iter().map(|spec| spec.volume.clone()).collect()
    }

    pub fn spec(&self, role: VolumeRole) -> Option<&VolumeSpec> {
        self.specs.iter().find(|spec| spec.role == role)
    }

    fn size_of(&self, volume: &VolumeRef) -> Result<Option<u64>> {
        Ok(self
            .cluster
            .volumes(&volume.pool)?
            .into_iter()
            .find(|info| info.name == volume.name)
            .map(|info| info.size))
    }

    /// Makes sure the volume exists in its desired pool. A copy living in another pool is moved
    /// with an online pool migration instead of being recreated; interrupted migrations resume
    /// from whatever state the cluster reports.
    pub fn ensure_presence(&self, spec: &VolumeSpec) -> Result<Presence> {
        if let Some(migration) = self.cluster.migration_status(&spec.volume)? {
            if migration.target == spec.volume {
                return self.advance_pool_migration(migration);
            }
        }

        if self.size_of(&spec.volume)?.is_some() {
            return Ok(Presence::Existing);
        }

        if let Some(presence) = self.migrate_from_other_pool(spec)? {
            return Ok(presence);
        }
        // The cached pool list may predate the pool holding the volume.
        self.pools.invalidate();
        if let Some(presence) = self.migrate_from_other_pool(spec)? {
            return Ok(presence);
        }

        tracing::info!(volume = %spec.volume, size = spec.size, "creating volume");
        self.cluster.create(&spec.volume, spec.size)?;
        Ok(Presence::Created)
    }

    fn migrate_from_other_pool(&self, spec: &VolumeSpec) -> Result<Option<Presence>> {
        for pool in self.pools.pools(self.cluster)? {
            if pool == spec.volume.pool {
                continue;
            }
            let source = spec.volume.in_pool(&pool);
            if self.size_of(&source)?.is_none() {
                continue;
            }
            tracing::info!(volume = %spec.volume, from = %source, "preparing pool migration");
            self.cluster.migration_prepare(&source, &spec.volume)?;
            return match self.cluster.migration_status(&spec.volume)? {
                Some(migration) => self.advance_pool_migration(migration).map(Some),
                None => Err(Error::Storage {
                    operation: "migration prepare".to_string(),
                    target: spec.volume.to_string(),
                    stderr: "no migration status after prepare".to_string(),
                }),
            };
        }
        Ok(None)
    }

    fn advance_pool_migration(&self, mut migration: PoolMigration) -> Result<Presence> {
        let target = migration.target.clone();
        let from = migration.source.pool.clone();
        let mut timeout = Timeout::new(
            self.migration.wait,
            self.migration.poll_interval,
            format!("pool migration of {target}"),
        );

        loop {
            tracing::debug!(volume = %target, state = ?migration.state, "pool migration state");
            match &migration.state {
                PoolMigrationState::Prepared => self.cluster.migration_execute(&target)?,
                PoolMigrationState::Executed => self.cluster.migration_commit(&target)?,
                PoolMigrationState::Committed => {
                    tracing::info!(volume = %target, from = %from, "pool migration committed");
                    return Ok(Presence::Migrated { from });
                }
                PoolMigrationState::Error(reason) => {
                    return Err(Error::Storage {
                        operation: "pool migration".to_string(),
                        target: target.to_string(),
                        stderr: reason.clone(),
                    });
                }
                PoolMigrationState::Preparing
                | PoolMigrationState::Executing
                | PoolMigrationState::Committing
                | PoolMigrationState::Aborting => {
                    if !timeout.tick() {
                        return Ok(Presence::Migrating(migration.state));
                    }
                }
            }

            match self.cluster.migration_status(&target)? {
                Some(next) => migration = next,
                None => {
                    // The cluster drops migration metadata once the commit finished.
                    tracing::info!(volume = %target, from = %from, "pool migration committed");
                    return Ok(Presence::Migrated { from });
                }
            }
        }
    }

    /// Grows the volume to `target` bytes. Smaller targets are ignored: shrinking could cut off
    /// data the guest still references.
    pub fn ensure_size(&self, volume: &VolumeRef, target: u64) -> Result<SizeChange> {
        let Some(current) = self.size_of(volume)? else {
            return Err(Error::Storage {
                operation: "resize".to_string(),
                target: volume.to_string(),
                stderr: "volume does not exist".to_string(),
            });
        };
        if target <= current {
            if target < current {
                tracing::debug!(volume = %volume, current, target, "not shrinking volume");
            }
            return Ok(SizeChange::Unchanged);
        }
        self.cluster.resize(volume, target)?;
        tracing::info!(volume = %volume, from = current, to = target, "grew volume");
        Ok(SizeChange::Grown {
            from: current,
            to: target,
        })
    }

    pub fn lock_all(&self) -> Result<Vec<(VolumeRef, LockChange)>> {
        self.specs
            .iter()
            .map(|spec| Ok((spec.volume.clone(), self.lock.acquire(&spec.volume)?)))
            .collect()
    }

    /// Without `force` only our own locks are released; foreign locks are left alone.
    pub fn unlock_all(&self, force: bool) -> Result<Vec<(VolumeRef, LockChange)>> {
        let mut changes = Vec::new();
        for spec in &self.specs {
            let change = if force {
                self.lock.release(&spec.volume, true)?
            } else {
                match self.lock.holder(&spec.volume)? {
                    Some(holder) if holder.owner == self.lock.owner() => {
                        self.lock.release(&spec.volume, false)?
                    }
                    Some(_) => continue,
                    None => LockChange::AlreadyUnlocked,
                }
            };
            changes.push((spec.volume.clone(), change));
        }
        Ok(changes)
    }

    /// Holder of each volume's lock.
    pub fn locked_by(&self) -> Result<Vec<(VolumeRef, Option<LockHolder>)>> {
        self.lock.list(&self.volumes())
    }

    pub fn is_unlocked(&self) -> Result<bool> {
        Ok(self.locked_by()?.iter().all(|(_, holder)| holder.is_none()))
    }

    pub fn locked_by_me(&self) -> Result<bool> {
        Ok(self.locked_by()?.iter().all(|(_, holder)| {
            holder
                .as_ref()
                .is_some_and(|holder| holder.owner == self.lock.owner())
        }))
    }

    /// Another owner holds at least one volume.
    pub fn locked_elsewhere(&self) -> Result<Option<String>> {
        Ok(self.locked_by()?.into_iter().find_map(|(_, holder)| {
            holder
                .filter(|holder| holder.owner != self.lock.owner())
                .map(|holder| holder.owner)
        }))
    }

    pub fn auth_cookie(&self) -> Result<String> {
        self.lock.auth_cookie(&self.volumes())
    }

    fn root(&self) -> Result<&VolumeSpec> {
        self.spec(VolumeRole::Root).ok_or_else(|| Error::Storage {
            operation: "snapshot".to_string(),
            target: "root".to_string(),
            stderr: "VM has no root volume".to_string(),
        })
    }

    /// Root volume snapshots, oldest first.
    pub fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.cluster.snapshots(&self.root()?.volume)?;
        snapshots.sort_by_key(|snapshot| snapshot.id);
        Ok(snapshots)
    }

    /// Returns `false` if a snapshot with this name already existed.
    pub fn create_snapshot(&self, name: &str) -> Result<bool> {
        if self.snapshots()?.iter().any(|snapshot| snapshot.name == name) {
            tracing::info!(snapshot = name, "snapshot already exists");
            return Ok(false);
        }
        let root = &self.root()?.volume;
        self.cluster.snapshot_create(root, name)?;
        tracing::info!(volume = %root, snapshot = name, "created snapshot");
        Ok(true)
    }

    /// Removes every root snapshot. Returns how many were removed.
    pub fn purge_snapshots(&self) -> Result<usize> {
        let root = &self.root()?.volume;
        let snapshots = self.snapshots()?;
        for snapshot in &snapshots {
            self.cluster.snapshot_remove(root, &snapshot.name)?;
            tracing::info!(volume = %root, snapshot = %snapshot.name, "removed snapshot");
        }
        Ok(snapshots.len())
    }
}
