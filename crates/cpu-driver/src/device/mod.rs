//! CPU device catalogs and claim resolution
//!
//! A [`DeviceManager`] turns the node topology into published devices at one
//! of three granularities and later maps allocated devices back to CPU IDs:
//!
//! * [`IndividualCoreManager`]: one unshareable device per CPU, siblings on
//!   adjacent indices.
//! * [`SocketGroupedManager`] / [`NumaGroupedManager`]: one shareable device
//!   per socket or NUMA node with the allocatable CPU count as capacity.

mod attributes;
pub mod consts;
mod grouped;
mod index;
mod individual;

use std::sync::Arc;

use api_types::Device;
use api_types::ResourceClaim;
use derive_more::Display;
use thiserror::Error;

pub use attributes::insert_numa_node;
pub use attributes::make_grouped_attributes;
pub use attributes::make_individual_attributes;
pub use attributes::Attributes;
pub use grouped::Granularity;
pub use grouped::GroupedManager;
pub use grouped::NumaGroupedManager;
pub use grouped::NumaNode;
pub use grouped::Socket;
pub use grouped::SocketGroupedManager;
pub use index::DeviceIndex;
pub use individual::IndividualCoreManager;

use crate::cpuinfo::CpuTopology;
use crate::cpumanager::TakeError;
use crate::cpuset::CpuSet;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The claim names a device this manager never published.
    #[error("device {device:?} not found in {manager} device index")]
    UnknownDevice {
        device: String,
        manager: &'static str,
    },
    #[error(transparent)]
    InsufficientCpus(#[from] TakeError),
}

/// Capability shared by the three grouping strategies.
pub trait DeviceManager: Send + Sync {
    /// Builds the device catalog, split into slices of at most
    /// [`consts::MAX_DEVICES_PER_RESOURCE_SLICE`] devices, and publishes the
    /// name index used by [`DeviceManager::allocate_cpus`]. An empty result
    /// means there is nothing to advertise.
    fn create_slices(&self) -> Vec<Vec<Device>>;

    /// Resolves the claim's results for this driver into CPU IDs. Results of
    /// other drivers are skipped; no matching result yields the empty set.
    fn allocate_cpus(&self, claim: &ResourceClaim) -> Result<CpuSet, DeviceError>;
}

/// The currently unallocated CPUs, read fresh on every call.
pub trait SharedCpuPool: Send + Sync {
    fn free_cpus(&self) -> CpuSet;
}

impl<F> SharedCpuPool for F
where
    F: Fn() -> CpuSet + Send + Sync,
{
    fn free_cpus(&self) -> CpuSet {
        self()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    #[display("socket")]
    Socket,
    #[display("numa-node")]
    NumaNode,
}

/// Granularity at which CPUs are advertised
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    #[display("individual")]
    Individual,
    #[display("grouped by {_0}")]
    Grouped(GroupBy),
}

/// Creates the manager for `mode`, bound to a topology snapshot and a fixed
/// reserved set.
pub fn new_device_manager(
    mode: DeviceMode,
    driver_name: impl Into<String>,
    topology: Arc<CpuTopology>,
    reserved_cpus: CpuSet,
    shared_pool: Arc<dyn SharedCpuPool>,
) -> Box<dyn DeviceManager> {
    let driver_name = driver_name.into();
    match mode {
        DeviceMode::Individual => Box::new(IndividualCoreManager::new(
            driver_name,
            topology,
            reserved_cpus,
        )),
        DeviceMode::Grouped(GroupBy::Socket) => Box::new(SocketGroupedManager::new(
            driver_name,
            topology,
            reserved_cpus,
            shared_pool,
        )),
        DeviceMode::Grouped(GroupBy::NumaNode) => Box::new(NumaGroupedManager::new(
            driver_name,
            topology,
            reserved_cpus,
            shared_pool,
        )),
    }
}

/// Splits a catalog into consecutive chunks of at most
/// [`consts::MAX_DEVICES_PER_RESOURCE_SLICE`] devices, keeping global order.
pub(crate) fn chunk_devices(devices: Vec<Device>) -> Vec<Vec<Device>> {
    let mut chunks =
        Vec::with_capacity(devices.len().div_ceil(consts::MAX_DEVICES_PER_RESOURCE_SLICE));
    let mut devices = devices.into_iter().peekable();
    while devices.peek().is_some() {
        chunks.push(
            devices
                .by_ref()
                .take(consts::MAX_DEVICES_PER_RESOURCE_SLICE)
                .collect(),
        );
    }
    chunks
}

/// `cpudev007`-style device names
pub(crate) fn device_name(prefix: &str, index: u32) -> String {
    format!("{prefix}{index:03}")
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use api_types::AllocationResult;
    use api_types::DeviceAllocationResult;
    use api_types::DeviceRequestAllocationResult;
    use api_types::ObjectMeta;
    use api_types::Quantity;
    use api_types::ResourceClaimStatus;

    use super::*;

    pub(crate) const DRIVER: &str = "dra.cpu";

    /// An allocation result; `cpus` becomes the consumed capacity when set.
    pub(crate) fn result(
        driver: &str,
        device: &str,
        cpus: Option<u64>,
    ) -> DeviceRequestAllocationResult {
        DeviceRequestAllocationResult {
            request: "cpus".to_string(),
            driver: driver.to_string(),
            pool: "node-a".to_string(),
            device: device.to_string(),
            consumed_capacity: cpus
                .map(|n| {
                    BTreeMap::from([(
                        consts::CPU_RESOURCE_QUALIFIED_NAME.to_string(),
                        Quantity::from_units(n),
                    )])
                })
                .unwrap_or_default(),
        }
    }

    pub(crate) fn claim(uid: &str, results: Vec<DeviceRequestAllocationResult>) -> ResourceClaim {
        ResourceClaim {
            metadata: ObjectMeta {
                namespace: "default".to_string(),
                name: format!("claim-{uid}"),
                uid: uid.to_string(),
            },
            status: ResourceClaimStatus {
                allocation: Some(AllocationResult {
                    devices: DeviceAllocationResult { results },
                }),
            },
        }
    }
}
