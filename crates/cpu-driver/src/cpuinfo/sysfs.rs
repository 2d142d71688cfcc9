//! Topology discovery from the Linux sysfs tree

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CoreType;
use super::CpuInfo;
use super::CpuInfoProvider;
use super::TopologyError;
use crate::cpuset::CpuSet;

/// Reads CPU topology from `<root>/devices/system/{cpu,node}`.
#[derive(Debug, Clone)]
pub struct SysfsCpuInfo {
    root: PathBuf,
}

impl SysfsCpuInfo {
    /// `root` is normally `/sys`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn cpu_dir(&self) -> PathBuf {
        self.root.join("devices/system/cpu")
    }

    fn read_cpu(
        &self,
        cpu_id: u32,
        cpu_to_node: &HashMap<u32, u32>,
        core_types: &CoreTypes,
    ) -> Result<CpuInfo, Report<TopologyError>> {
        let dir = self.cpu_dir().join(format!("cpu{cpu_id}"));
        let topology = dir.join("topology");

        // Offline or virtual packages may report -1, which reads as 0.
        let socket_id = read_id(&topology.join("physical_package_id"))?;
        let core_id = read_id(&topology.join("core_id"))?;
        let siblings = read_cpuset(&topology.join("thread_siblings_list"))?;
        let sibling_cpu_id = siblings.iter().find(|&cpu| cpu != cpu_id);

        let cache_id = dir.join("cache/index3/id");
        let uncore_cache_id = if cache_id.exists() {
            read_id(&cache_id)?
        } else {
            socket_id
        };

        Ok(CpuInfo {
            cpu_id,
            core_id,
            socket_id,
            numa_node_id: cpu_to_node.get(&cpu_id).copied().unwrap_or(0),
            uncore_cache_id,
            sibling_cpu_id,
            core_type: core_types.of(cpu_id),
        })
    }

    /// Maps CPUs to NUMA nodes; an absent node directory means a single node.
    fn numa_nodes(&self) -> Result<HashMap<u32, u32>, Report<TopologyError>> {
        let node_dir = self.root.join("devices/system/node");
        let mut cpu_to_node = HashMap::new();
        if !node_dir.is_dir() {
            debug!("no NUMA information at {}", node_dir.display());
            return Ok(cpu_to_node);
        }

        let entries = fs::read_dir(&node_dir)
            .change_context(TopologyError::ReadFailed)
            .attach_printable_lazy(|| format!("path: {}", node_dir.display()))?;
        for entry in entries {
            let entry = entry
                .change_context(TopologyError::ReadFailed)
                .attach_printable_lazy(|| format!("path: {}", node_dir.display()))?;
            let name = entry.file_name();
            let Some(node_id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            for cpu in read_cpuset(&entry.path().join("cpulist"))?.iter() {
                cpu_to_node.insert(cpu, node_id);
            }
        }
        Ok(cpu_to_node)
    }

    fn core_types(&self) -> Result<CoreTypes, Report<TopologyError>> {
        let read_optional = |name: &str| -> Result<Option<CpuSet>, Report<TopologyError>> {
            let path = self.root.join("devices").join(name).join("cpus");
            if path.exists() {
                read_cpuset(&path).map(Some)
            } else {
                Ok(None)
            }
        };
        Ok(CoreTypes {
            performance: read_optional("cpu_core")?,
            efficiency: read_optional("cpu_atom")?,
        })
    }
}

impl CpuInfoProvider for SysfsCpuInfo {
    fn cpu_infos(&self) -> Result<Vec<CpuInfo>, Report<TopologyError>> {
        let online = read_cpuset(&self.cpu_dir().join("online"))?;
        let cpu_to_node = self.numa_nodes()?;
        let core_types = self.core_types()?;

        let infos = online
            .iter()
            .map(|cpu_id| self.read_cpu(cpu_id, &cpu_to_node, &core_types))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            cpus = infos.len(),
            online = %online,
            root = %self.root.display(),
            "discovered CPU topology from sysfs"
        );
        Ok(infos)
    }
}

/// Hybrid core membership; both sets are absent on non-hybrid processors.
struct CoreTypes {
    performance: Option<CpuSet>,
    efficiency: Option<CpuSet>,
}

impl CoreTypes {
    fn of(&self, cpu_id: u32) -> CoreType {
        match (&self.performance, &self.efficiency) {
            (None, None) => CoreType::Performance,
            (Some(p), _) if p.contains(cpu_id) => CoreType::Performance,
            (_, Some(e)) if e.contains(cpu_id) => CoreType::Efficiency,
            _ => CoreType::Unknown,
        }
    }
}

fn read_trimmed(path: &Path) -> Result<String, Report<TopologyError>> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .change_context(TopologyError::ReadFailed)
        .attach_printable_lazy(|| format!("path: {}", path.display()))
}

fn read_id(path: &Path) -> Result<u32, Report<TopologyError>> {
    let raw = read_trimmed(path)?;
    let id: i64 = raw
        .parse::<i64>()
        .change_context(TopologyError::ParseFailed)
        .attach_printable_lazy(|| format!("path: {}, value: {raw:?}", path.display()))?;
    match u32::try_from(id) {
        Ok(id) => Ok(id),
        Err(_) => {
            warn!(path = %path.display(), value = id, "topology ID out of range, using 0");
            Ok(0)
        }
    }
}

fn read_cpuset(path: &Path) -> Result<CpuSet, Report<TopologyError>> {
    let raw = read_trimmed(path)?;
    raw.parse::<CpuSet>()
        .change_context(TopologyError::ParseFailed)
        .attach_printable_lazy(|| format!("path: {}", path.display()))
}
