//! Topology-aware selection of exact CPU IDs from a pool
//!
//! Selection walks the hierarchy from the largest unit down: whole NUMA
//! nodes / sockets, whole L3 domains, whole physical cores, then single
//! hardware threads. With the packed strategy the leftover threads come from
//! the groups that are already the most used, so free capacity stays
//! concentrated in as few groups as possible.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::cpuinfo::CoreKey;
use crate::cpuinfo::CpuDetails;
use crate::cpuinfo::CpuTopology;
use crate::cpuset::CpuSet;

/// Order in which single hardware threads are handed out once no whole
/// group fits the remaining request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSortingStrategy {
    /// Fill a core's threads before moving to the next core.
    Packed,
    /// Hand out one thread per core before reusing a core.
    Spread,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TakeError {
    #[error(
        "not enough cpus available to satisfy request: requested={requested}, available={available}"
    )]
    NotEnoughCpus { requested: usize, available: usize },
}

/// Selects exactly `num_cpus` CPUs from `available`.
///
/// The result is deterministic for a given topology and pool. Asking for zero
/// CPUs yields the empty set; asking for more than the pool holds fails
/// without selecting anything.
pub fn take_by_topology_numa_packed(
    topo: &CpuTopology,
    available: &CpuSet,
    num_cpus: usize,
    strategy: CpuSortingStrategy,
    prefer_align_by_uncore_cache: bool,
) -> Result<CpuSet, TakeError> {
    let mut acc = CpuAccumulator::new(topo, available, num_cpus, strategy);
    if acc.is_satisfied() {
        return Ok(acc.result);
    }
    if acc.is_failed() {
        return Err(TakeError::NotEnoughCpus {
            requested: num_cpus,
            available: acc.details.len(),
        });
    }

    // Multiple sockets sharing one NUMA node makes the node the larger unit.
    if topo.num_numa_nodes() < topo.num_sockets() {
        acc.take_full_numa_nodes();
        acc.take_full_sockets();
    } else {
        acc.take_full_sockets();
        acc.take_full_numa_nodes();
    }

    if prefer_align_by_uncore_cache {
        acc.take_full_uncore_caches();
        acc.take_partial_uncore_cache();
    }

    if strategy == CpuSortingStrategy::Packed {
        acc.take_full_cores();
    }
    acc.take_remaining_cpus();

    debug!(
        requested = num_cpus,
        pool = %available,
        selected = %acc.result,
        "selected CPUs by topology"
    );
    Ok(acc.result)
}

struct CpuAccumulator<'a> {
    topo: &'a CpuTopology,
    /// Details of the CPUs still available for selection.
    details: CpuDetails,
    needed: usize,
    result: CpuSet,
    strategy: CpuSortingStrategy,
}

impl<'a> CpuAccumulator<'a> {
    fn new(
        topo: &'a CpuTopology,
        available: &CpuSet,
        needed: usize,
        strategy: CpuSortingStrategy,
    ) -> Self {
        Self {
            topo,
            details: topo.cpu_details.keep_only(available),
            needed,
            result: CpuSet::new(),
            strategy,
        }
    }

    fn is_satisfied(&self) -> bool {
        self.needed == 0
    }

    fn is_failed(&self) -> bool {
        self.needed > self.details.len()
    }

    fn take(&mut self, cpus: &CpuSet) {
        self.result = self.result.union(cpus);
        self.details = self
            .details
            .keep_only(&self.details.cpus().difference(cpus));
        self.needed = self.needed.saturating_sub(cpus.size());
    }

    /// Takes every group whose CPUs are all still available and that fits
    /// the remaining need, in the given order.
    fn take_full_groups(&mut self, groups: Vec<CpuSet>) {
        for group in groups {
            if self.is_satisfied() {
                return;
            }
            let free = group.is_subset_of(&self.details.cpus());
            if free && !group.is_empty() && group.size() <= self.needed {
                debug!(cpus = %group, "taking full group");
                self.take(&group);
            }
        }
    }

    fn take_full_sockets(&mut self) {
        let all = &self.topo.cpu_details;
        let groups = all
            .sockets()
            .into_iter()
            .map(|id| all.cpus_in_sockets(&[id]))
            .collect();
        self.take_full_groups(groups);
    }

    fn take_full_numa_nodes(&mut self) {
        let all = &self.topo.cpu_details;
        let groups = all
            .numa_nodes()
            .into_iter()
            .map(|id| all.cpus_in_numa_nodes(&[id]))
            .collect();
        self.take_full_groups(groups);
    }

    fn take_full_uncore_caches(&mut self) {
        let all = &self.topo.cpu_details;
        let groups = all
            .uncore_caches()
            .into_iter()
            .map(|id| all.cpus_in_uncore_caches(&[id]))
            .collect();
        self.take_full_groups(groups);
    }

    /// Satisfies the rest of the request from a single L3 domain when one has
    /// room, picking the tightest fit.
    fn take_partial_uncore_cache(&mut self) {
        if self.is_satisfied() {
            return;
        }
        let best = self
            .details
            .uncore_caches()
            .into_iter()
            .map(|id| (self.details.cpus_in_uncore_caches(&[id]), id))
            .filter(|(cpus, _)| cpus.size() >= self.needed)
            .min_by_key(|(cpus, id)| (cpus.size(), *id));
        let Some((cache_cpus, cache_id)) = best else {
            return;
        };

        debug!(uncore_cache = cache_id, cpus = %cache_cpus, "aligning to L3 domain");
        let cores = self.sorted_cores_within(&cache_cpus);
        if self.strategy == CpuSortingStrategy::Packed {
            self.take_whole_cores(&cores);
        }
        let cores = self.sorted_cores_within(&cache_cpus);
        let cpus = self.sorted_cpus(&cores);
        self.take_first(cpus);
    }

    fn take_full_cores(&mut self) {
        let cores = self.sorted_cores_within(&self.details.cpus());
        self.take_whole_cores(&cores);
    }

    fn take_whole_cores(&mut self, cores: &[CoreKey]) {
        let all = &self.topo.cpu_details;
        let groups = cores.iter().map(|core| all.cpus_in_core(*core)).collect();
        self.take_full_groups(groups);
    }

    fn take_remaining_cpus(&mut self) {
        if self.is_satisfied() {
            return;
        }
        let cores = self.sorted_cores_within(&self.details.cpus());
        let cpus = self.sorted_cpus(&cores);
        self.take_first(cpus);
    }

    fn take_first(&mut self, cpus: Vec<u32>) {
        let picked: CpuSet = cpus.into_iter().take(self.needed).collect();
        if !picked.is_empty() {
            self.take(&picked);
        }
    }

    /// Available sockets, most used first.
    fn sorted_sockets(&self, within: &CpuSet) -> Vec<u32> {
        let mut sockets: Vec<(usize, u32)> = self
            .details
            .sockets()
            .into_iter()
            .map(|id| {
                let free = self.details.cpus_in_sockets(&[id]).intersection(within);
                (free.size(), id)
            })
            .filter(|(free, _)| *free > 0)
            .collect();
        sockets.sort_unstable();
        sockets.into_iter().map(|(_, id)| id).collect()
    }

    /// Cores with available CPUs in `within`, grouped by socket in packed
    /// socket order, most used core first inside each socket.
    fn sorted_cores_within(&self, within: &CpuSet) -> Vec<CoreKey> {
        let mut free_per_core: BTreeMap<CoreKey, usize> = BTreeMap::new();
        for info in self.details.iter().filter(|i| within.contains(i.cpu_id)) {
            *free_per_core.entry(CpuDetails::core_key(info)).or_default() += 1;
        }

        let mut cores = Vec::with_capacity(free_per_core.len());
        for socket_id in self.sorted_sockets(within) {
            let mut in_socket: Vec<(usize, CoreKey)> = free_per_core
                .iter()
                .filter(|(core, _)| core.socket_id == socket_id)
                .map(|(core, free)| (*free, *core))
                .collect();
            in_socket.sort_unstable();
            cores.extend(in_socket.into_iter().map(|(_, core)| core));
        }
        cores
    }

    /// Available CPUs of the given cores in strategy order.
    fn sorted_cpus(&self, cores: &[CoreKey]) -> Vec<u32> {
        let per_core: Vec<Vec<u32>> = cores
            .iter()
            .map(|core| self.details.cpus_in_core(*core).list())
            .collect();

        match self.strategy {
            CpuSortingStrategy::Packed => per_core.into_iter().flatten().collect(),
            CpuSortingStrategy::Spread => {
                let depth = per_core.iter().map(Vec::len).max().unwrap_or(0);
                (0..depth)
                    .flat_map(|i| per_core.iter().filter_map(move |cpus| cpus.get(i).copied()))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cpuinfo::testing::build_topology;
    use crate::cpuinfo::testing::two_socket_topology;

    fn take(topo: &CpuTopology, available: &CpuSet, n: usize) -> Result<CpuSet, TakeError> {
        take_by_topology_numa_packed(topo, available, n, CpuSortingStrategy::Packed, true)
    }

    #[test]
    fn zero_cpus_is_empty_set() {
        let topo = two_socket_topology();
        let cpus = take(&topo, &CpuSet::new(), 0).unwrap();
        assert!(cpus.is_empty());
    }

    #[test]
    fn insufficient_pool_fails() {
        let topo = two_socket_topology();
        let err = take(&topo, &CpuSet::from([0, 1, 2]), 4).unwrap_err();
        assert_eq!(
            err,
            TakeError::NotEnoughCpus {
                requested: 4,
                available: 3
            }
        );
    }

    #[test]
    fn pool_outside_topology_is_ignored() {
        let topo = two_socket_topology();
        let err = take(&topo, &CpuSet::from([0, 100, 101]), 2).unwrap_err();
        assert_eq!(
            err,
            TakeError::NotEnoughCpus {
                requested: 2,
                available: 1
            }
        );
    }

    #[test]
    fn takes_whole_socket_when_it_fits() {
        let topo = two_socket_topology();
        let all = topo.cpu_details.cpus();
        let cpus = take(&topo, &all, 8).unwrap();
        assert_eq!(cpus.to_string(), "0-3,8-11");
    }

    #[test]
    fn prefers_whole_cores() {
        let topo = two_socket_topology();
        let all = topo.cpu_details.cpus();
        let cpus = take(&topo, &all, 4).unwrap();
        // Two full cores on socket 0.
        assert_eq!(cpus, CpuSet::from([0, 1, 8, 9]));
    }

    #[test]
    fn odd_request_completes_a_partial_core() {
        let topo = two_socket_topology();
        // Core 0 of socket 0 is half used (CPU 8 missing).
        let available = topo.cpu_details.cpus().difference(&CpuSet::from([8]));
        let cpus = take(&topo, &available, 1).unwrap();
        assert_eq!(cpus, CpuSet::from([0]));
    }

    #[test]
    fn packs_into_most_used_socket() {
        let topo = two_socket_topology();
        // Socket 1 has only two free CPUs left on core 4.
        let available = topo
            .cpu_details
            .cpus_in_sockets(&[0])
            .union(&CpuSet::from([4, 12]));
        let cpus = take(&topo, &available, 2).unwrap();
        assert_eq!(cpus, CpuSet::from([4, 12]));
    }

    #[test]
    fn aligns_to_single_uncore_cache() {
        // One socket, two NUMA nodes each with its own L3 domain.
        let topo = build_topology(1, 2, 2, true);
        // NUMA/L3 0: cores 0,1 -> CPUs 0,1,4,5; L3 1: cores 2,3 -> CPUs 2,3,6,7.
        // Leave three CPUs in L3 0 and all four in L3 1.
        let available = topo.cpu_details.cpus().difference(&CpuSet::from([5]));
        let cpus = take(&topo, &available, 3).unwrap();
        assert_eq!(cpus, CpuSet::from([0, 1, 4]));
    }

    #[test]
    fn spread_strategy_uses_one_thread_per_core_first() {
        let topo = two_socket_topology();
        let available = topo.cpu_details.cpus_in_sockets(&[0]);
        let cpus = take_by_topology_numa_packed(
            &topo,
            &available,
            2,
            CpuSortingStrategy::Spread,
            false,
        )
        .unwrap();
        assert_eq!(cpus, CpuSet::from([0, 1]));
    }

    #[test]
    fn result_is_always_exact_and_within_pool() {
        let topo = build_topology(2, 2, 3, true);
        let available = topo
            .cpu_details
            .cpus()
            .difference(&CpuSet::from([0, 7, 13, 20]));
        for n in 0..=available.size() {
            let cpus = take(&topo, &available, n).unwrap();
            assert_eq!(cpus.size(), n);
            assert!(cpus.is_subset_of(&available));
            assert_eq!(cpus, take(&topo, &available, n).unwrap());
        }
    }
}
