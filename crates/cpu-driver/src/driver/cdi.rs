//! Container Device Interface registry
//!
//! Each prepared claim becomes one CDI device whose only edit is an
//! environment variable carrying the claim's CPU list.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::info;

pub const CDI_VENDOR: &str = "dra.cpu";
pub const CDI_CLASS: &str = "cpu";
pub const CDI_VERSION: &str = "0.6.0";
pub const CDI_ENV_VAR_PREFIX: &str = "DRA_CPUSET";
pub const CDI_SPEC_FILE_NAME: &str = "dra.cpu.json";

#[derive(Debug, Error)]
pub enum CdiError {
    #[error("failed to write CDI spec {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read CDI spec {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode CDI spec {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode CDI spec: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where prepared claims are made visible to the container runtime.
pub trait CdiRegistry: Send + Sync {
    /// Adds or replaces the device `name` with a single env edit.
    fn add_device(&self, name: &str, env: &str) -> Result<(), CdiError>;

    /// Removing an unknown device succeeds.
    fn remove_device(&self, name: &str) -> Result<(), CdiError>;
}

/// `dra.cpu/cpu=<name>`
pub fn qualified_name(device_name: &str) -> String {
    format!("{CDI_VENDOR}/{CDI_CLASS}={device_name}")
}

/// CDI device name of a claim
pub fn claim_device_name(claim_uid: &str) -> String {
    format!("claim-{claim_uid}")
}

/// `DRA_CPUSET_<uid>=<cpulist>`
pub fn cpuset_env(claim_uid: &str, cpus: &impl std::fmt::Display) -> String {
    format!("{CDI_ENV_VAR_PREFIX}_{claim_uid}={cpus}")
}

/// Registry kept only in memory.
#[derive(Debug, Default)]
pub struct InMemoryCdiRegistry {
    devices: DashMap<String, String>,
}

impl InMemoryCdiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Env edit of a registered device
    pub fn env(&self, name: &str) -> Option<String> {
        self.devices.get(name).map(|env| env.clone())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl CdiRegistry for InMemoryCdiRegistry {
    fn add_device(&self, name: &str, env: &str) -> Result<(), CdiError> {
        self.devices.insert(name.to_string(), env.to_string());
        Ok(())
    }

    fn remove_device(&self, name: &str) -> Result<(), CdiError> {
        self.devices.remove(name);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    pub kind: String,
    pub devices: Vec<CdiDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    pub name: String,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerEdits {
    #[serde(default)]
    pub env: Vec<String>,
}

/// Registry persisted as one CDI spec file that the runtime reads.
///
/// The whole file is rewritten on every change through a temporary file and a
/// rename, so the runtime never sees a partial spec. Devices found in an
/// existing file are kept, so claims prepared before a restart stay visible.
#[derive(Debug)]
pub struct CdiSpecFile {
    path: PathBuf,
    /// device name -> env edits
    devices: Mutex<BTreeMap<String, Vec<String>>>,
}

impl CdiSpecFile {
    /// Opens the spec file `dra.cpu.json` inside `dir`, loading the devices it
    /// already lists. A missing file starts empty; the directory must exist
    /// before the first write.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CdiError> {
        let path = dir.as_ref().join(CDI_SPEC_FILE_NAME);
        let devices = match fs::read(&path) {
            Ok(data) => {
                let spec: CdiSpec =
                    serde_json::from_slice(&data).map_err(|source| CdiError::Decode {
                        path: path.clone(),
                        source,
                    })?;
                spec.devices
                    .into_iter()
                    .map(|device| (device.name, device.container_edits.env))
                    .collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(CdiError::Read { path, source }),
        };
        info!(path = ?path, devices = devices.len(), "opened CDI spec");
        Ok(Self {
            path,
            devices: Mutex::new(devices),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spec(devices: &BTreeMap<String, Vec<String>>) -> CdiSpec {
        CdiSpec {
            cdi_version: CDI_VERSION.to_string(),
            kind: format!("{CDI_VENDOR}/{CDI_CLASS}"),
            devices: devices
                .iter()
                .map(|(name, env)| CdiDevice {
                    name: name.clone(),
                    container_edits: ContainerEdits {
                        env: env.clone(),
                    },
                })
                .collect(),
        }
    }

    fn write(&self, devices: &BTreeMap<String, Vec<String>>) -> Result<(), CdiError> {
        let data = serde_json::to_vec_pretty(&Self::spec(devices))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| CdiError::Write {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = ?self.path, devices = devices.len(), "wrote CDI spec");
        Ok(())
    }
}

impl CdiRegistry for CdiSpecFile {
    fn add_device(&self, name: &str, env: &str) -> Result<(), CdiError> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = devices.insert(name.to_string(), vec![env.to_string()]);
        if let Err(e) = self.write(&devices) {
            match previous {
                Some(previous) => devices.insert(name.to_string(), previous),
                None => devices.remove(name),
            };
            return Err(e);
        }
        info!(device = name, env, "added CDI device");
        Ok(())
    }

    fn remove_device(&self, name: &str) -> Result<(), CdiError> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(previous) = devices.remove(name) else {
            return Ok(());
        };
        if let Err(e) = self.write(&devices) {
            devices.insert(name.to_string(), previous);
            return Err(e);
        }
        info!(device = name, "removed CDI device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn names_and_env() {
        assert_eq!(claim_device_name("abc"), "claim-abc");
        assert_eq!(qualified_name("claim-abc"), "dra.cpu/cpu=claim-abc");
        assert_eq!(cpuset_env("abc", &"0-3,8"), "DRA_CPUSET_abc=0-3,8");
    }

    #[test]
    fn in_memory_add_and_remove() {
        let registry = InMemoryCdiRegistry::new();
        registry.add_device("claim-a", "DRA_CPUSET_a=1").unwrap();
        registry.add_device("claim-a", "DRA_CPUSET_a=2").unwrap();
        assert_eq!(registry.env("claim-a").as_deref(), Some("DRA_CPUSET_a=2"));

        registry.remove_device("claim-a").unwrap();
        registry.remove_device("claim-a").unwrap();
        assert!(registry.is_empty());
    }

    fn read_spec(registry: &CdiSpecFile) -> CdiSpec {
        serde_json::from_slice(&fs::read(registry.path()).unwrap()).unwrap()
    }

    #[test]
    fn spec_file_tracks_devices() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CdiSpecFile::open(dir.path()).unwrap();

        registry.add_device("claim-b", "DRA_CPUSET_b=4-5").unwrap();
        registry.add_device("claim-a", "DRA_CPUSET_a=0").unwrap();

        let spec = read_spec(&registry);
        assert_eq!(spec.kind, "dra.cpu/cpu");
        assert_eq!(spec.cdi_version, CDI_VERSION);
        let names: Vec<&str> = spec.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["claim-a", "claim-b"]);
        assert_eq!(
            spec.devices[1].container_edits.env,
            vec!["DRA_CPUSET_b=4-5".to_string()]
        );

        registry.remove_device("claim-a").unwrap();
        assert_eq!(read_spec(&registry).devices.len(), 1);
        assert!(!dir.path().join("dra.cpu.json.tmp").exists());
    }

    #[test]
    fn reopening_keeps_existing_devices() {
        let dir = tempfile::tempdir().unwrap();
        let before = CdiSpecFile::open(dir.path()).unwrap();
        before.add_device("claim-a", "DRA_CPUSET_a=0-1").unwrap();
        drop(before);

        let after = CdiSpecFile::open(dir.path()).unwrap();
        after.add_device("claim-b", "DRA_CPUSET_b=2").unwrap();

        let spec = read_spec(&after);
        let names: Vec<&str> = spec.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["claim-a", "claim-b"]);
        assert_eq!(
            spec.devices[0].container_edits.env,
            vec!["DRA_CPUSET_a=0-1".to_string()]
        );
    }

    #[test]
    fn corrupt_spec_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CDI_SPEC_FILE_NAME), "not json").unwrap();

        let err = CdiSpecFile::open(dir.path()).unwrap_err();
        assert!(matches!(err, CdiError::Decode { .. }));
    }

    #[test]
    fn spec_file_write_failure_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CdiSpecFile::open(dir.path().join("missing")).unwrap();

        let err = registry.add_device("claim-a", "DRA_CPUSET_a=0").unwrap_err();
        assert!(matches!(err, CdiError::Write { .. }));
        // Nothing was recorded, so removal is a no-op.
        registry.remove_device("claim-a").unwrap();
    }
}
