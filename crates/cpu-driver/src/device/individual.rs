use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use api_types::Device;
use api_types::ResourceClaim;
use tracing::debug;
use tracing::info;

use super::attributes::make_individual_attributes;
use super::chunk_devices;
use super::consts::CPU_DEVICE_PREFIX;
use super::device_name;
use super::DeviceError;
use super::DeviceIndex;
use super::DeviceManager;
use crate::cpuinfo::CpuInfo;
use crate::cpuinfo::CpuTopology;
use crate::cpuset::CpuSet;

/// Advertises one device per CPU.
///
/// CPUs are grouped by physical core so hyperthread siblings get consecutive
/// device indices. The scheduler requests devices in contiguous blocks, so
/// this places a workload on both threads of a core where possible.
#[derive(Debug)]
pub struct IndividualCoreManager {
    driver_name: String,
    topology: Arc<CpuTopology>,
    reserved_cpus: CpuSet,
    /// device name -> CPU ID
    index: DeviceIndex<u32>,
}

impl IndividualCoreManager {
    pub fn new(
        driver_name: impl Into<String>,
        topology: Arc<CpuTopology>,
        reserved_cpus: CpuSet,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            topology,
            reserved_cpus,
            index: DeviceIndex::new(),
        }
    }

    /// Unreserved CPUs grouped by core, ordered by each group's lowest CPU.
    /// A CPU whose sibling is missing or reserved forms a group of its own.
    fn core_groups(&self) -> Vec<Vec<&CpuInfo>> {
        let details = &self.topology.cpu_details;
        let mut processed = HashSet::new();
        let mut groups = Vec::new();

        for cpu in details
            .iter()
            .filter(|cpu| !self.reserved_cpus.contains(cpu.cpu_id))
        {
            if !processed.insert(cpu.cpu_id) {
                continue;
            }
            let sibling = cpu
                .sibling_cpu_id
                .filter(|id| !self.reserved_cpus.contains(*id) && !processed.contains(id))
                .and_then(|id| details.get(id));
            match sibling {
                Some(sibling) => {
                    processed.insert(sibling.cpu_id);
                    groups.push(vec![cpu, sibling]);
                }
                None => groups.push(vec![cpu]),
            }
        }

        groups.sort_by_key(|group| group.first().map(|cpu| cpu.cpu_id));
        groups
    }
}

impl DeviceManager for IndividualCoreManager {
    fn create_slices(&self) -> Vec<Vec<Device>> {
        let mut index = HashMap::new();
        let mut devices = Vec::new();

        for cpu in self.core_groups().into_iter().flatten() {
            let dev_id = u32::try_from(devices.len()).unwrap_or(u32::MAX);
            let name = device_name(CPU_DEVICE_PREFIX, dev_id);
            index.insert(name.clone(), cpu.cpu_id);
            devices.push(Device {
                name,
                attributes: make_individual_attributes(cpu),
                ..Default::default()
            });
        }

        info!(
            devices = devices.len(),
            reserved = %self.reserved_cpus,
            "created individual CPU devices"
        );
        self.index.publish(index);
        chunk_devices(devices)
    }

    #[tracing::instrument(skip_all, fields(claim = %claim.key()))]
    fn allocate_cpus(&self, claim: &ResourceClaim) -> Result<CpuSet, DeviceError> {
        let index = self.index.snapshot();
        let mut claim_cpu_ids = Vec::new();

        for alloc in claim.results() {
            if alloc.driver != self.driver_name {
                continue;
            }
            let cpu_id = index
                .get(&alloc.device)
                .copied()
                .ok_or_else(|| DeviceError::UnknownDevice {
                    device: alloc.device.clone(),
                    manager: "individual",
                })?;
            claim_cpu_ids.push(cpu_id);
        }

        if claim_cpu_ids.is_empty() {
            debug!("no CPU allocations for this driver");
            return Ok(CpuSet::new());
        }

        let cpus: CpuSet = claim_cpu_ids.into_iter().collect();
        info!(cpus = %cpus, "resolved individual CPU devices");
        Ok(cpus)
    }
}
