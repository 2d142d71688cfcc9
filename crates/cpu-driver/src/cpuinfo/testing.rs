//! Synthetic topologies for tests

use super::CpuInfo;
use super::CpuTopology;

/// Builds a regular topology with Linux-style numbering: the first hardware
/// thread of every core comes first, then all second threads, so CPU `n` and
/// `n + cores` are siblings. Each NUMA node has its own L3 domain.
pub(crate) fn build_topology(
    sockets: u32,
    numa_per_socket: u32,
    cores_per_numa: u32,
    smt: bool,
) -> CpuTopology {
    let cores_per_socket = numa_per_socket * cores_per_numa;
    let total_cores = sockets * cores_per_socket;
    let threads = if smt { 2 } else { 1 };

    let infos = (0..total_cores * threads).map(|cpu_id| {
        let core = cpu_id % total_cores;
        let numa = core / cores_per_numa;
        let sibling_cpu_id = smt.then(|| {
            if cpu_id < total_cores {
                cpu_id + total_cores
            } else {
                cpu_id - total_cores
            }
        });
        CpuInfo {
            cpu_id,
            core_id: core % cores_per_socket,
            socket_id: core / cores_per_socket,
            numa_node_id: numa,
            uncore_cache_id: numa,
            sibling_cpu_id,
            core_type: Default::default(),
        }
    });

    CpuTopology::from_cpu_infos(infos)
}

/// 2 sockets, one NUMA node each, 4 cores per socket, SMT on: 16 CPUs
pub(crate) fn two_socket_topology() -> CpuTopology {
    build_topology(2, 1, 4, true)
}

/// CPUs 0-3 where 0/2 and 1/3 are siblings
pub(crate) fn four_cpu_topology() -> CpuTopology {
    build_topology(1, 1, 2, true)
}
