//! Desired-state documents and the active/staged copies kept on disk per VM.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Desired state of one VM as published by the config-management feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDocument {
    pub name: String,
    #[serde(default)]
    pub generation: u64,
    pub parameters: VmParameters,
    /// Fields steward does not interpret, kept so the document round-trips unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmParameters {
    pub online: bool,
    /// Host that should run the VM.
    pub kvm_host: String,
    /// Memory in MiB.
    pub memory: u64,
    pub cores: u32,
    /// Root disk size in GiB.
    pub disk: u64,
    pub rbd_pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
    /// Root disk IOPS limit; `None` leaves the disk unthrottled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u64>,
    #[serde(default)]
    pub interfaces: BTreeMap<String, Interface>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VmDocument {
    pub fn parse(source: &Path, bytes: &[u8]) -> Result<Self> {
        let document: Self = serde_json::from_slice(bytes).map_err(|err| Error::ParseConfig {
            path: source.to_path_buf(),
            message: err.to_string(),
        })?;
        document.validate(source)?;
        Ok(document)
    }

    fn validate(&self, source: &Path) -> Result<()> {
        let invalid = |message: String| Error::ParseConfig {
            path: source.to_path_buf(),
            message,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("VM name must not be empty".to_string()));
        }
        if self.parameters.memory == 0 {
            return Err(invalid(format!("VM `{}` declares zero memory", self.name)));
        }
        if self.parameters.cores == 0 {
            return Err(invalid(format!("VM `{}` declares zero cores", self.name)));
        }
        if self.parameters.rbd_pool.trim().is_empty() {
            return Err(invalid(format!("VM `{}` declares no rbd_pool", self.name)));
        }
        Ok(())
    }

    pub fn root_size_bytes(&self) -> u64 {
        self.parameters.disk.saturating_mul(GIB)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Staged { generation: u64 },
    /// The document is not newer than what is already active or staged.
    Unchanged { generation: u64, current: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    Promoted { from: Option<u64>, to: u64 },
    /// Nothing staged, or the staged copy was not newer and has been discarded.
    Unchanged,
    /// The staged copy could not be parsed and has been removed.
    Purged { reason: String },
}

/// The two on-disk copies of a VM document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    vm: String,
    active: PathBuf,
    staged: PathBuf,
}

impl ConfigStore {
    pub fn new(vm: impl Into<String>, active: PathBuf, staged: PathBuf) -> Self {
        Self {
            vm: vm.into(),
            active,
            staged,
        }
    }

    pub fn load_active(&self) -> Result<VmDocument> {
        match read_document(&self.active)? {
            Some(document) => Ok(document),
            None => Err(Error::VmConfigNotFound {
                vm: self.vm.clone(),
                path: self.active.clone(),
            }),
        }
    }

    pub fn active_generation(&self) -> Result<Option<u64>> {
        match read_document(&self.active) {
            Ok(document) => Ok(document.map(|doc| doc.generation)),
            Err(Error::ParseConfig { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn load_staged(&self) -> Result<Option<VmDocument>> {
        read_document(&self.staged)
    }

    /// Writes `document` as the staged copy if it is newer than both existing copies.
    pub fn stage(&self, document: &VmDocument) -> Result<StageOutcome> {
        let active = self.active_generation()?;
        let staged = match self.load_staged() {
            Ok(staged) => staged.map(|doc| doc.generation),
            Err(Error::ParseConfig { .. }) => None,
            Err(err) => return Err(err),
        };
        let current = active.max(staged);
        if let Some(current) = current {
            if document.generation <= current {
                return Ok(StageOutcome::Unchanged {
                    generation: document.generation,
                    current,
                });
            }
        }

        write_document(&self.staged, document)?;
        Ok(StageOutcome::Staged {
            generation: document.generation,
        })
    }

    /// Overwrites the active copy in place, keeping its generation.
    pub fn save_active(&self, document: &VmDocument) -> Result<()> {
        write_document(&self.active, document)
    }

    /// True if a staged copy exists whose generation is newer than the active one.
    pub fn has_new_config(&self) -> Result<bool> {
        let staged = match self.load_staged() {
            Ok(Some(staged)) => staged.generation,
            Ok(None) | Err(Error::ParseConfig { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(match self.active_generation()? {
            Some(active) => staged > active,
            None => true,
        })
    }

    /// Replaces the active copy with the staged one if it is strictly newer.
    pub fn promote(&self) -> Result<Promotion> {
        let staged = match self.load_staged() {
            Ok(Some(staged)) => staged,
            Ok(None) => return Ok(Promotion::Unchanged),
            Err(Error::ParseConfig { message, .. }) => {
                remove_if_exists(&self.staged)?;
                return Ok(Promotion::Purged { reason: message });
            }
            Err(err) => return Err(err),
        };
        if staged.name != self.vm {
            remove_if_exists(&self.staged)?;
            return Ok(Promotion::Purged {
                reason: format!("staged document names VM `{}`", staged.name),
            });
        }

        let active = self.active_generation()?;
        if let Some(active) = active {
            if staged.generation <= active {
                remove_if_exists(&self.staged)?;
                return Ok(Promotion::Unchanged);
            }
        }

        fs::rename(&self.staged, &self.active).map_err(|source| Error::WriteConfig {
            path: self.active.clone(),
            source,
        })?;
        Ok(Promotion::Promoted {
            from: active,
            to: staged.generation,
        })
    }
}

fn read_document(path: &Path) -> Result<Option<VmDocument>> {
    match fs::read(path) {
        Ok(bytes) => VmDocument::parse(path, &bytes).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::WriteConfig {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_document(path: &Path, document: &VmDocument) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(document).map_err(|err| Error::ParseConfig {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    write_atomically(path, &bytes)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| Error::WriteConfig {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|source| Error::WriteConfig {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| Error::WriteConfig {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) fn sample_document(name: &str, generation: u64, host: &str) -> VmDocument {
    VmDocument {
        name: name.to_string(),
        generation,
        parameters: VmParameters {
            online: true,
            kvm_host: host.to_string(),
            memory: 1024,
            cores: 2,
            disk: 10,
            rbd_pool: "rbd.ssd".to_string(),
            cpu_model: None,
            iops: Some(1000),
            interfaces: BTreeMap::new(),
            extra: BTreeMap::new(),
        },
        extra: BTreeMap::new(),
    }
}
