//! Exclusive per-volume locks arbitrated by the storage cluster.

use std::fmt;

use sha2::{Digest, Sha256};

use super::storage::{LockAttempt, LockHolder, StorageCluster, VolumeRef};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockChange {
    Acquired,
    AlreadyHeld,
    Released,
    AlreadyUnlocked,
}

impl LockChange {
    pub fn changed(self) -> bool {
        matches!(self, Self::Acquired | Self::Released)
    }
}

impl fmt::Display for LockChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acquired => "locked",
            Self::AlreadyHeld => "already locked",
            Self::Released => "unlocked",
            Self::AlreadyUnlocked => "already unlocked",
        })
    }
}

/// Lock client acting on behalf of one owner (this host).
///
/// Ownership is always queried from the cluster; other hosts can change it at any time.
pub struct DistributedLock<'a> {
    cluster: &'a dyn StorageCluster,
    owner: &'a str,
    attempts: u32,
}

impl<'a> DistributedLock<'a> {
    pub fn new(cluster: &'a dyn StorageCluster, owner: &'a str, attempts: u32) -> Self {
        Self {
            cluster,
            owner,
            attempts: attempts.max(1),
        }
    }

    pub fn owner(&self) -> &str {
        self.owner
    }

    pub fn holder(&self, volume: &VolumeRef) -> Result<Option<LockHolder>> {
        Ok(self.cluster.lock_list(volume)?.into_iter().next())
    }

    /// Current holder of each volume, in the order given.
    pub fn list(&self, volumes: &[VolumeRef]) -> Result<Vec<(VolumeRef, Option<LockHolder>)>> {
        volumes
            .iter()
            .map(|volume| Ok((volume.clone(), self.holder(volume)?)))
            .collect()
    }

    pub fn acquire(&self, volume: &VolumeRef) -> Result<LockChange> {
        let mut last_holder = None;
        for attempt in 1..=self.attempts {
            match self.holder(volume)? {
                Some(holder) if holder.owner == self.owner => return Ok(LockChange::AlreadyHeld),
                Some(holder) => {
                    return Err(Error::LockBusy {
                        volume: volume.to_string(),
                        holder: holder.owner,
                    });
                }
                None => {}
            }

            match self.cluster.lock_add(volume, self.owner)? {
                LockAttempt::Acquired => {
                    tracing::info!(volume = %volume, owner = self.owner, "acquired lock");
                    return Ok(LockChange::Acquired);
                }
                LockAttempt::Busy => {
                    tracing::debug!(volume = %volume, attempt, "lock appeared while acquiring; retrying");
                    last_holder = self.holder(volume)?.map(|holder| holder.owner);
                }
            }
        }

        Err(Error::LockBusy {
            volume: volume.to_string(),
            holder: last_holder.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Releases our lock. Locks held by other owners are only broken with `force`.
    pub fn release(&self, volume: &VolumeRef, force: bool) -> Result<LockChange> {
        let holders = self.cluster.lock_list(volume)?;
        if holders.is_empty() {
            return Ok(LockChange::AlreadyUnlocked);
        }
        for holder in &holders {
            if holder.owner != self.owner && !force {
                return Err(Error::LockDenied {
                    volume: volume.to_string(),
                    holder: holder.owner.clone(),
                });
            }
        }
        for holder in &holders {
            self.cluster.lock_remove(volume, holder)?;
            tracing::info!(volume = %volume, holder = %holder.owner, force, "released lock");
        }
        Ok(LockChange::Released)
    }

    /// Digest over the current lock ownership of `volumes`; see [`lock_cookie`].
    pub fn auth_cookie(&self, volumes: &[VolumeRef]) -> Result<String> {
        let mut pairs = Vec::new();
        for volume in volumes {
            for holder in self.cluster.lock_list(volume)? {
                pairs.push((volume.to_string(), holder.owner));
            }
        }
        Ok(lock_cookie(
            pairs.iter().map(|(volume, owner)| (volume.as_str(), owner.as_str())),
        ))
    }
}

/// Hex SHA-256 over the sorted `(volume, owner)` pairs, so the result only depends on the
/// set of held locks and not on the order they were observed or acquired in.
pub fn lock_cookie<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut pairs: Vec<(&str, &str)> = pairs.into_iter().collect();
    pairs.sort_unstable();
    pairs.dedup();

    let mut hasher = Sha256::new();
    for (volume, owner) in pairs {
        hasher.update(volume.as_bytes());
        hasher.update(b"\0");
        hasher.update(owner.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::MemoryCluster;
    use regex::Regex;

    fn volumes() -> Vec<VolumeRef> {
        ["test.root", "test.swap", "test.tmp"]
            .iter()
            .map(|name| VolumeRef::new("rbd.ssd", *name))
            .collect()
    }

    fn cluster_with_volumes() -> MemoryCluster {
        let cluster = MemoryCluster::new(&["rbd.ssd"]);
        for volume in volumes() {
            cluster.create(&volume, 1024).unwrap();
        }
        cluster
    }

    #[test]
    fn cookie_is_invariant_under_insertion_order() {
        let pairs = [
            ("rbd.ssd/test.root", "host1"),
            ("rbd.ssd/test.swap", "host1"),
            ("rbd.ssd/test.tmp", "host2"),
        ];
        let forward = lock_cookie(pairs.iter().copied());
        let reversed = lock_cookie(pairs.iter().rev().copied());
        let rotated = lock_cookie([pairs[1], pairs[2], pairs[0]]);
        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);

        let hex = Regex::new("^[0-9a-f]{64}$").unwrap();
        assert!(hex.is_match(&forward));
    }

    #[test]
    fn cookie_depends_on_ownership() {
        let a = lock_cookie([("rbd.ssd/test.root", "host1")]);
        let b = lock_cookie([("rbd.ssd/test.root", "host2")]);
        let empty = lock_cookie(std::iter::empty());
        assert_ne!(a, b);
        assert_ne!(a, empty);
    }

    #[test]
    fn cookie_changes_only_when_ownership_changes() {
        let cluster = cluster_with_volumes();
        let lock = DistributedLock::new(&cluster, "host1", 3);
        let volumes = volumes();

        for volume in &volumes {
            lock.acquire(volume).unwrap();
        }
        let held = lock.auth_cookie(&volumes).unwrap();

        assert_eq!(lock.acquire(&volumes[0]).unwrap(), LockChange::AlreadyHeld);
        assert_eq!(lock.auth_cookie(&volumes).unwrap(), held);

        for volume in &volumes {
            lock.release(volume, false).unwrap();
        }
        assert_ne!(lock.auth_cookie(&volumes).unwrap(), held);

        for volume in volumes.iter().rev() {
            lock.acquire(volume).unwrap();
        }
        assert_eq!(lock.auth_cookie(&volumes).unwrap(), held);
    }

    #[test]
    fn acquire_and_release_are_idempotent() {
        let cluster = cluster_with_volumes();
        let lock = DistributedLock::new(&cluster, "host1", 3);
        let root = &volumes()[0];

        assert_eq!(lock.release(root, false).unwrap(), LockChange::AlreadyUnlocked);
        assert_eq!(lock.acquire(root).unwrap(), LockChange::Acquired);
        assert_eq!(lock.acquire(root).unwrap(), LockChange::AlreadyHeld);
        assert_eq!(lock.release(root, false).unwrap(), LockChange::Released);
        assert_eq!(lock.release(root, false).unwrap(), LockChange::AlreadyUnlocked);
    }

    #[test]
    fn foreign_lock_is_busy_and_not_mutated() {
        let cluster = cluster_with_volumes();
        let root = &volumes()[0];
        DistributedLock::new(&cluster, "host2", 3)
            .acquire(root)
            .unwrap();

        let lock = DistributedLock::new(&cluster, "host1", 3);
        match lock.acquire(root) {
            Err(Error::LockBusy { holder, .. }) => assert_eq!(holder, "host2"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(lock.holder(root).unwrap().unwrap().owner, "host2");

        assert!(matches!(
            lock.release(root, false),
            Err(Error::LockDenied { .. })
        ));
        assert_eq!(lock.holder(root).unwrap().unwrap().owner, "host2");

        assert_eq!(lock.release(root, true).unwrap(), LockChange::Released);
        assert!(lock.holder(root).unwrap().is_none());
    }

    #[test]
    fn acquire_retries_when_a_lock_vanishes_mid_race() {
        let cluster = cluster_with_volumes();
        let root = &volumes()[0];
        cluster.inject_busy_lock_adds(2);

        let lock = DistributedLock::new(&cluster, "host1", 3);
        assert_eq!(lock.acquire(root).unwrap(), LockChange::Acquired);

        cluster.inject_busy_lock_adds(5);
        let other = &volumes()[1];
        assert!(matches!(
            lock.acquire(other),
            Err(Error::LockBusy { .. })
        ));
    }
}
