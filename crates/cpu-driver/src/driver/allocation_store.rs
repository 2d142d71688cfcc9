//! CPU bookkeeping per prepared claim

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use dashmap::DashMap;
use tracing::debug;
use tracing::info;

use crate::cpuinfo::CpuTopology;
use crate::cpuset::CpuSet;
use crate::device::SharedCpuPool;

/// Tracks which CPUs each prepared claim holds.
///
/// Reads are lock-free. Preparation holds [`CpuAllocationStore::lock_pool`]
/// from reading [`CpuAllocationStore::free_cpus`] until the picked CPUs are
/// committed, so two claims never end up with the same CPU.
#[derive(Debug)]
pub struct CpuAllocationStore {
    /// claim UID -> CPUs
    allocations: DashMap<String, CpuSet>,
    allocatable_cpus: CpuSet,
    pool_lock: Mutex<()>,
}

/// Held across "read free pool, pick, commit".
pub struct PoolGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl CpuAllocationStore {
    pub fn new(topology: &CpuTopology, reserved_cpus: &CpuSet) -> Self {
        Self {
            allocations: DashMap::new(),
            allocatable_cpus: topology.cpu_details.cpus().difference(reserved_cpus),
            pool_lock: Mutex::new(()),
        }
    }

    pub fn lock_pool(&self) -> PoolGuard<'_> {
        // The guarded section never leaves the map half-written.
        let guard = self
            .pool_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        PoolGuard { _guard: guard }
    }

    /// All unreserved CPUs not held by any claim.
    pub fn free_cpus(&self) -> CpuSet {
        self.allocations
            .iter()
            .fold(self.allocatable_cpus.clone(), |free, entry| {
                free.difference(entry.value())
            })
    }

    /// Records the claim's CPUs, replacing any previous record for the UID.
    pub fn add_resource_claim_allocation(&self, claim_uid: &str, cpus: CpuSet) {
        info!(claim_uid, cpus = %cpus, "recording CPU allocation");
        self.allocations.insert(claim_uid.to_string(), cpus);
    }

    /// Releases the claim's CPUs; returns them if the claim was known.
    pub fn remove_resource_claim_allocation(&self, claim_uid: &str) -> Option<CpuSet> {
        let removed = self.allocations.remove(claim_uid).map(|(_, cpus)| cpus);
        match &removed {
            Some(cpus) => info!(claim_uid, cpus = %cpus, "released CPU allocation"),
            None => debug!(claim_uid, "no CPU allocation to release"),
        }
        removed
    }

    pub fn allocation(&self, claim_uid: &str) -> Option<CpuSet> {
        self.allocations.get(claim_uid).map(|cpus| cpus.clone())
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

impl SharedCpuPool for CpuAllocationStore {
    fn free_cpus(&self) -> CpuSet {
        CpuAllocationStore::free_cpus(self)
    }
}
