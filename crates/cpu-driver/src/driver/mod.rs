//! Claim preparation on top of a device manager
//!
//! [`CpuDriver`] publishes the node's catalog, turns allocated claims into
//! concrete CPU sets, records them in the [`CpuAllocationStore`] and exposes
//! them to containers through a [`CdiRegistry`].

mod allocation_store;
pub mod cdi;

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::PrepareResult;
use api_types::PreparedDevice;
use api_types::ResourceClaim;
use api_types::ResourcePool;
use api_types::ResourceSlice;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use allocation_store::CpuAllocationStore;
pub use allocation_store::PoolGuard;
pub use cdi::CdiRegistry;
pub use cdi::CdiSpecFile;
pub use cdi::InMemoryCdiRegistry;

use crate::cpuinfo::CpuTopology;
use crate::cpuset::CpuSet;
use crate::device::new_device_manager;
use crate::device::DeviceError;
use crate::device::DeviceManager;
use crate::device::DeviceMode;
use crate::device::SharedCpuPool;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("claim {claim} has no allocation")]
    MissingAllocation { claim: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Cdi(#[from] cdi::CdiError),
}

/// Node-local CPU driver.
///
/// [`CpuDriver::publish_resources`] must run before claims are prepared:
/// until then the device index is empty and every claim naming one of this
/// driver's devices fails with [`DeviceError::UnknownDevice`].
pub struct CpuDriver {
    driver_name: String,
    node_name: String,
    device_manager: Box<dyn DeviceManager>,
    store: Arc<CpuAllocationStore>,
    cdi: Arc<dyn CdiRegistry>,
}

impl CpuDriver {
    pub fn new(
        driver_name: impl Into<String>,
        node_name: impl Into<String>,
        mode: DeviceMode,
        topology: Arc<CpuTopology>,
        reserved_cpus: CpuSet,
        cdi: Arc<dyn CdiRegistry>,
    ) -> Self {
        let driver_name = driver_name.into();
        let node_name = node_name.into();
        let store = Arc::new(CpuAllocationStore::new(&topology, &reserved_cpus));
        let shared_pool: Arc<dyn SharedCpuPool> = store.clone();
        info!(
            driver = %driver_name,
            node = %node_name,
            %mode,
            cpus = topology.num_cpus(),
            reserved = %reserved_cpus,
            "creating CPU driver"
        );
        let device_manager =
            new_device_manager(mode, driver_name.clone(), topology, reserved_cpus, shared_pool);
        Self {
            driver_name,
            node_name,
            device_manager,
            store,
            cdi,
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn allocation_store(&self) -> &CpuAllocationStore {
        &self.store
    }

    /// Builds the catalog as one pool named after the node, one slice per
    /// chunk. Returns `None` when there is nothing to advertise.
    pub fn publish_resources(&self) -> Option<ResourcePool> {
        info!(node = %self.node_name, "publishing resources");
        let chunks = self.device_manager.create_slices();
        if chunks.is_empty() {
            warn!(node = %self.node_name, "no devices to publish");
            return None;
        }

        let pool = ResourcePool {
            name: self.node_name.clone(),
            slices: chunks
                .into_iter()
                .map(|devices| ResourceSlice { devices })
                .collect(),
        };
        info!(
            slices = pool.slices.len(),
            devices = pool.device_count(),
            "resources published"
        );
        Some(pool)
    }

    /// Prepares every claim independently; a failing claim only fails its
    /// own entry.
    #[tracing::instrument(skip_all, fields(claims = claims.len()))]
    pub fn prepare_resource_claims(
        &self,
        claims: &[ResourceClaim],
    ) -> BTreeMap<String, PrepareResult> {
        claims
            .iter()
            .map(|claim| {
                let result = match self.prepare_resource_claim(claim) {
                    Ok(devices) => PrepareResult {
                        devices,
                        error: None,
                    },
                    Err(e) => {
                        error!(claim = %claim.key(), error = %e, "failed to prepare claim");
                        PrepareResult::failed(e)
                    }
                };
                (claim.uid().to_string(), result)
            })
            .collect()
    }

    #[tracing::instrument(skip_all, fields(claim = %claim.key()))]
    fn prepare_resource_claim(
        &self,
        claim: &ResourceClaim,
    ) -> Result<Vec<PreparedDevice>, DriverError> {
        if claim.status.allocation.is_none() {
            return Err(DriverError::MissingAllocation { claim: claim.key() });
        }
        let uid = claim.uid();
        let device_name = cdi::claim_device_name(uid);

        // Resolve, commit and register under one guard so an unprepare of the
        // same UID sees either nothing or both the CPUs and the CDI device.
        let pool = self.store.lock_pool();
        let (cpus, newly_allocated) = match self.store.allocation(uid) {
            Some(cpus) => {
                debug!(cpus = %cpus, "claim already prepared");
                (cpus, false)
            }
            None => {
                let cpus = self.device_manager.allocate_cpus(claim)?;
                self.store.add_resource_claim_allocation(uid, cpus.clone());
                (cpus, true)
            }
        };

        let env = cdi::cpuset_env(uid, &cpus);
        if let Err(e) = self.cdi.add_device(&device_name, &env) {
            if newly_allocated {
                self.store.remove_resource_claim_allocation(uid);
            }
            return Err(e.into());
        }
        drop(pool);

        let cdi_device_id = cdi::qualified_name(&device_name);
        info!(cdi_device = %cdi_device_id, env = %env, "prepared claim");
        Ok(claim
            .results()
            .iter()
            .filter(|alloc| alloc.driver == self.driver_name)
            .map(|alloc| PreparedDevice {
                pool_name: alloc.pool.clone(),
                device_name: alloc.device.clone(),
                cdi_device_ids: vec![cdi_device_id.clone()],
                requests: vec![alloc.request.clone()],
            })
            .collect())
    }

    /// Releases the CPUs and CDI device of each claim. Unknown UIDs succeed.
    #[tracing::instrument(skip_all, fields(claims = claim_uids.len()))]
    pub fn unprepare_resource_claims(
        &self,
        claim_uids: &[String],
    ) -> BTreeMap<String, Result<(), DriverError>> {
        claim_uids
            .iter()
            .map(|uid| {
                let result = self.unprepare_resource_claim(uid);
                if let Err(e) = &result {
                    error!(claim_uid = %uid, error = %e, "failed to unprepare claim");
                }
                (uid.clone(), result)
            })
            .collect()
    }

    fn unprepare_resource_claim(&self, claim_uid: &str) -> Result<(), DriverError> {
        let _pool = self.store.lock_pool();
        self.store.remove_resource_claim_allocation(claim_uid);
        self.cdi.remove_device(&cdi::claim_device_name(claim_uid))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cpuinfo::testing::two_socket_topology;
    use crate::device::testing::claim;
    use crate::device::testing::result;
    use crate::device::testing::DRIVER;
    use crate::device::GroupBy;

    fn driver(mode: DeviceMode, reserved: CpuSet) -> (CpuDriver, Arc<InMemoryCdiRegistry>) {
        let cdi = Arc::new(InMemoryCdiRegistry::new());
        let driver = CpuDriver::new(
            DRIVER,
            "node-a",
            mode,
            Arc::new(two_socket_topology()),
            reserved,
            cdi.clone(),
        );
        (driver, cdi)
    }

    #[test]
    fn publish_uses_node_pool() {
        let (driver, _) = driver(DeviceMode::Individual, CpuSet::from([0, 8]));
        let pool = driver.publish_resources().unwrap();
        assert_eq!(pool.name, "node-a");
        assert_eq!(pool.slices.len(), 1);
        assert_eq!(pool.device_count(), 14);
    }

    #[test]
    fn publish_nothing_when_everything_is_reserved() {
        let all = two_socket_topology().cpu_details.cpus();
        let (driver, _) = driver(DeviceMode::Grouped(GroupBy::Socket), all);
        assert_eq!(driver.publish_resources(), None);
    }

    #[test]
    fn prepare_individual_claim() {
        let (driver, cdi) = driver(DeviceMode::Individual, CpuSet::new());
        driver.publish_resources();

        let claim = claim(
            "uid-1",
            vec![
                result(DRIVER, "cpudev000", None),
                result(DRIVER, "cpudev001", None),
                result("gpu.example.com", "gpu0", None),
            ],
        );
        let results = driver.prepare_resource_claims(&[claim]);
        let prepared = &results["uid-1"];

        assert_eq!(prepared.error, None);
        assert_eq!(prepared.devices.len(), 2);
        assert_eq!(prepared.devices[0].device_name, "cpudev000");
        assert_eq!(prepared.devices[0].pool_name, "node-a");
        assert_eq!(prepared.devices[0].cdi_device_ids, vec!["dra.cpu/cpu=claim-uid-1".to_string()]);
        assert_eq!(prepared.devices[1].requests, vec!["cpus".to_string()]);
        // cpudev000/001 are the sibling pair 0 and 8.
        assert_eq!(driver.allocation_store().allocation("uid-1"), Some(CpuSet::from([0, 8])));
        assert_eq!(cdi.env("claim-uid-1").as_deref(), Some("DRA_CPUSET_uid-1=0,8"));
    }

    #[test]
    fn grouped_claims_do_not_share_cpus() {
        let (driver, _) = driver(DeviceMode::Grouped(GroupBy::NumaNode), CpuSet::new());
        driver.publish_resources();

        let claims = vec![
            claim("a", vec![result(DRIVER, "cpudevnuma000", Some(3))]),
            claim("b", vec![result(DRIVER, "cpudevnuma000", Some(5))]),
        ];
        let results = driver.prepare_resource_claims(&claims);
        assert!(results.values().all(|r| r.error.is_none()));

        let store = driver.allocation_store();
        let a = store.allocation("a").unwrap();
        let b = store.allocation("b").unwrap();
        assert_eq!(a.size(), 3);
        assert_eq!(b.size(), 5);
        assert!(a.intersection(&b).is_empty());
        assert_eq!(a.union(&b), two_socket_topology().cpu_details.cpus_in_numa_nodes(&[0]));

        // The node is full now.
        let full = claim("c", vec![result(DRIVER, "cpudevnuma000", Some(1))]);
        let results = driver.prepare_resource_claims(&[full]);
        assert!(results["c"].error.as_deref().unwrap().contains("not enough cpus"));
        assert_eq!(store.allocation("c"), None);
    }

    #[test]
    fn failures_stay_per_claim() {
        let (driver, cdi) = driver(DeviceMode::Individual, CpuSet::new());
        driver.publish_resources();

        let mut unallocated = claim("no-alloc", Vec::new());
        unallocated.status.allocation = None;
        let claims = vec![
            unallocated,
            claim("bad", vec![result(DRIVER, "cpudev999", None)]),
            claim("good", vec![result(DRIVER, "cpudev002", None)]),
        ];
        let results = driver.prepare_resource_claims(&claims);

        assert_eq!(
            results["no-alloc"].error.as_deref(),
            Some("claim default/claim-no-alloc has no allocation")
        );
        assert!(results["bad"].error.as_deref().unwrap().contains("cpudev999"));
        assert_eq!(results["good"].error, None);
        assert_eq!(driver.allocation_store().len(), 1);
        assert_eq!(cdi.len(), 1);
    }

    #[test]
    fn prepare_is_idempotent() {
        let (driver, _) = driver(DeviceMode::Grouped(GroupBy::Socket), CpuSet::new());
        driver.publish_resources();

        let claim = claim("uid-1", vec![result(DRIVER, "cpudevsocket001", Some(2))]);
        driver.prepare_resource_claims(std::slice::from_ref(&claim));
        let first = driver.allocation_store().allocation("uid-1").unwrap();
        let free = driver.allocation_store().free_cpus();

        let again = driver.prepare_resource_claims(&[claim]);
        assert_eq!(again["uid-1"].error, None);
        assert_eq!(driver.allocation_store().allocation("uid-1"), Some(first));
        assert_eq!(driver.allocation_store().free_cpus(), free);
    }

    #[test]
    fn unprepare_releases_cpus() {
        let (driver, cdi) = driver(DeviceMode::Grouped(GroupBy::Socket), CpuSet::new());
        driver.publish_resources();
        let claim = claim("uid-1", vec![result(DRIVER, "cpudevsocket000", Some(8))]);
        driver.prepare_resource_claims(&[claim]);
        assert_eq!(driver.allocation_store().free_cpus().size(), 8);

        let uids = ["uid-1".to_string(), "unknown".to_string()];
        let results = driver.unprepare_resource_claims(&uids);
        assert!(results.values().all(Result::is_ok));
        assert_eq!(driver.allocation_store().free_cpus().size(), 16);
        assert!(cdi.is_empty());
    }

    #[test]
    fn failing_result_discards_earlier_picks() {
        let (driver, cdi) = driver(DeviceMode::Grouped(GroupBy::Socket), CpuSet::new());
        driver.publish_resources();
        let free = driver.allocation_store().free_cpus();

        let claim = claim(
            "partial",
            vec![
                result(DRIVER, "cpudevsocket000", Some(2)),
                result(DRIVER, "cpudevsocket000", Some(99)),
            ],
        );
        let results = driver.prepare_resource_claims(&[claim]);

        let error = results["partial"].error.as_deref().unwrap();
        assert!(error.contains("not enough cpus"), "{error}");
        assert!(results["partial"].devices.is_empty());
        assert_eq!(driver.allocation_store().allocation("partial"), None);
        assert_eq!(driver.allocation_store().free_cpus(), free);
        assert!(cdi.is_empty());
    }

    #[test]
    fn concurrent_prepares_get_disjoint_cpus() {
        let (driver, cdi) = driver(DeviceMode::Grouped(GroupBy::NumaNode), CpuSet::new());
        driver.publish_resources();
        let driver = Arc::new(driver);

        // 8 single-CPU claims on node 0, 4 two-CPU claims on node 1.
        let requests: Vec<(String, &str, u64)> = (0..8)
            .map(|i| (format!("n0-{i}"), "cpudevnuma000", 1))
            .chain((0..4).map(|i| (format!("n1-{i}"), "cpudevnuma001", 2)))
            .collect();

        let handles: Vec<_> = requests
            .iter()
            .map(|(uid, device, cpus)| {
                let driver = driver.clone();
                let claim = claim(uid, vec![result(DRIVER, device, Some(*cpus))]);
                thread::spawn(move || driver.prepare_resource_claims(&[claim]))
            })
            .collect();
        for handle in handles {
            let results = handle.join().unwrap();
            assert!(results.values().all(|r| r.error.is_none()), "{results:?}");
        }

        let store = driver.allocation_store();
        let mut all = CpuSet::new();
        for (uid, device, cpus) in &requests {
            let picked = store.allocation(uid).unwrap();
            assert_eq!(picked.size() as u64, *cpus);
            let node = if *device == "cpudevnuma000" { 0 } else { 1 };
            let node_cpus = two_socket_topology().cpu_details.cpus_in_numa_nodes(&[node]);
            assert!(picked.is_subset_of(&node_cpus), "{uid} got {picked}");
            assert!(all.intersection(&picked).is_empty(), "{uid} overlaps: {picked}");
            all = all.union(&picked);
        }
        assert_eq!(all, two_socket_topology().cpu_details.cpus());
        assert!(store.free_cpus().is_empty());
        assert_eq!(cdi.len(), requests.len());
    }

    #[test]
    fn racing_prepare_and_unprepare_stay_consistent() {
        let (driver, cdi) = driver(DeviceMode::Grouped(GroupBy::Socket), CpuSet::new());
        driver.publish_resources();
        let driver = Arc::new(driver);
        let uids = ["racy".to_string()];

        let preparer = {
            let driver = driver.clone();
            let claim = claim("racy", vec![result(DRIVER, "cpudevsocket000", Some(2))]);
            thread::spawn(move || {
                for _ in 0..200 {
                    driver.prepare_resource_claims(std::slice::from_ref(&claim));
                }
            })
        };
        let unpreparer = {
            let driver = driver.clone();
            let uids = uids.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    driver.unprepare_resource_claims(&uids);
                }
            })
        };
        preparer.join().unwrap();
        unpreparer.join().unwrap();

        let allocated = driver.allocation_store().allocation("racy");
        assert_eq!(allocated.is_some(), cdi.env("claim-racy").is_some());
        if let Some(cpus) = allocated {
            assert_eq!(
                cdi.env("claim-racy"),
                Some(format!("DRA_CPUSET_racy={cpus}"))
            );
        }
    }
}
