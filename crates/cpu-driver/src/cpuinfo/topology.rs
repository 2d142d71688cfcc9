use std::collections::BTreeMap;
use std::collections::BTreeSet;

use derive_more::Display;
use serde::Deserialize;
use serde::Serialize;

use crate::cpuset::CpuSet;

/// Microarchitecture class of a core on hybrid processors
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreType {
    #[default]
    #[display("P-core")]
    Performance,
    #[display("E-core")]
    Efficiency,
    #[display("unknown")]
    Unknown,
}

/// Facts about a single logical CPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cpu_id: u32,
    /// Physical core ID, unique only within a socket
    pub core_id: u32,
    pub socket_id: u32,
    pub numa_node_id: u32,
    /// Last-level (L3) cache domain
    pub uncore_cache_id: u32,
    /// Hyperthread sibling, `None` when the core runs a single thread
    #[serde(default)]
    pub sibling_cpu_id: Option<u32>,
    #[serde(default)]
    pub core_type: CoreType,
}

/// Physical core coordinate; core IDs repeat across sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreKey {
    pub socket_id: u32,
    pub core_id: u32,
}

/// Per-CPU facts keyed by CPU ID, with grouping queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDetails {
    cpus: BTreeMap<u32, CpuInfo>,
}

impl CpuDetails {
    pub fn get(&self, cpu_id: u32) -> Option<&CpuInfo> {
        self.cpus.get(&cpu_id)
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// CPU facts in ascending CPU ID order
    pub fn iter(&self) -> impl Iterator<Item = &CpuInfo> + '_ {
        self.cpus.values()
    }

    pub fn cpus(&self) -> CpuSet {
        self.cpus.keys().copied().collect()
    }

    /// Socket IDs in ascending order
    pub fn sockets(&self) -> Vec<u32> {
        self.distinct(|info| info.socket_id)
    }

    /// NUMA node IDs in ascending order
    pub fn numa_nodes(&self) -> Vec<u32> {
        self.distinct(|info| info.numa_node_id)
    }

    pub fn uncore_caches(&self) -> Vec<u32> {
        self.distinct(|info| info.uncore_cache_id)
    }

    pub fn cores(&self) -> Vec<CoreKey> {
        self.distinct(Self::core_key)
    }

    pub fn cpus_in_sockets(&self, ids: &[u32]) -> CpuSet {
        self.select(|info| ids.contains(&info.socket_id))
    }

    pub fn cpus_in_numa_nodes(&self, ids: &[u32]) -> CpuSet {
        self.select(|info| ids.contains(&info.numa_node_id))
    }

    pub fn cpus_in_uncore_caches(&self, ids: &[u32]) -> CpuSet {
        self.select(|info| ids.contains(&info.uncore_cache_id))
    }

    pub fn cpus_in_core(&self, core: CoreKey) -> CpuSet {
        self.select(|info| Self::core_key(info) == core)
    }

    /// Restricts the details to the CPUs in `cpus`.
    pub fn keep_only(&self, cpus: &CpuSet) -> CpuDetails {
        self.cpus
            .iter()
            .filter(|(id, _)| cpus.contains(**id))
            .map(|(id, info)| (*id, info.clone()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    pub fn core_key(info: &CpuInfo) -> CoreKey {
        CoreKey {
            socket_id: info.socket_id,
            core_id: info.core_id,
        }
    }

    fn distinct<K: Ord>(&self, key: impl Fn(&CpuInfo) -> K) -> Vec<K> {
        self.cpus
            .values()
            .map(key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn select(&self, predicate: impl Fn(&CpuInfo) -> bool) -> CpuSet {
        self.cpus
            .values()
            .filter(|info| predicate(info))
            .map(|info| info.cpu_id)
            .collect()
    }
}

impl From<BTreeMap<u32, CpuInfo>> for CpuDetails {
    fn from(cpus: BTreeMap<u32, CpuInfo>) -> Self {
        Self { cpus }
    }
}

/// A snapshot of the node's CPU topology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopology {
    pub smt_enabled: bool,
    pub cpu_details: CpuDetails,
}

impl CpuTopology {
    /// Builds a topology from discovered CPUs. SMT counts as enabled when any
    /// CPU reports a sibling.
    pub fn from_cpu_infos(infos: impl IntoIterator<Item = CpuInfo>) -> Self {
        let cpus: BTreeMap<u32, CpuInfo> =
            infos.into_iter().map(|info| (info.cpu_id, info)).collect();
        let smt_enabled = cpus.values().any(|info| info.sibling_cpu_id.is_some());
        Self {
            smt_enabled,
            cpu_details: cpus.into(),
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.cpu_details.len()
    }

    pub fn num_sockets(&self) -> usize {
        self.cpu_details.sockets().len()
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.cpu_details.numa_nodes().len()
    }

    pub fn num_cores(&self) -> usize {
        self.cpu_details.cores().len()
    }
}
