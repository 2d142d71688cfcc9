use std::collections::BTreeMap;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use api_types::Device;
use api_types::DeviceCapacity;
use api_types::Quantity;
use api_types::ResourceClaim;
use tracing::debug;
use tracing::info;

use super::attributes::insert_numa_node;
use super::attributes::make_grouped_attributes;
use super::attributes::Attributes;
use super::chunk_devices;
use super::consts::CPU_DEVICE_NUMA_GROUPED_PREFIX;
use super::consts::CPU_DEVICE_SOCKET_GROUPED_PREFIX;
use super::consts::CPU_RESOURCE_QUALIFIED_NAME;
use super::device_name;
use super::DeviceError;
use super::DeviceIndex;
use super::DeviceManager;
use super::SharedCpuPool;
use crate::cpuinfo::CpuTopology;
use crate::cpumanager::take_by_topology_numa_packed;
use crate::cpumanager::CpuSortingStrategy;
use crate::cpuset::CpuSet;

/// A level of the topology that grouped devices are built around.
pub trait Granularity: Send + Sync + 'static {
    /// Used in logs and errors.
    const NAME: &'static str;
    const DEVICE_PREFIX: &'static str;

    /// Sorted IDs of every unit of this granularity.
    fn coordinates(topo: &CpuTopology) -> Vec<u32>;

    fn cpus_in(topo: &CpuTopology, id: u32) -> CpuSet;

    fn attributes(topo: &CpuTopology, id: u32, allocatable: &CpuSet) -> Attributes;
}

#[derive(Debug)]
pub struct Socket;

impl Granularity for Socket {
    const NAME: &'static str = "socket";
    const DEVICE_PREFIX: &'static str = CPU_DEVICE_SOCKET_GROUPED_PREFIX;

    fn coordinates(topo: &CpuTopology) -> Vec<u32> {
        topo.cpu_details.sockets()
    }

    fn cpus_in(topo: &CpuTopology, id: u32) -> CpuSet {
        topo.cpu_details.cpus_in_sockets(&[id])
    }

    fn attributes(topo: &CpuTopology, id: u32, allocatable: &CpuSet) -> Attributes {
        make_grouped_attributes(topo, id, allocatable)
    }
}

#[derive(Debug)]
pub struct NumaNode;

impl Granularity for NumaNode {
    const NAME: &'static str = "numa node";
    const DEVICE_PREFIX: &'static str = CPU_DEVICE_NUMA_GROUPED_PREFIX;

    fn coordinates(topo: &CpuTopology) -> Vec<u32> {
        topo.cpu_details.numa_nodes()
    }

    fn cpus_in(topo: &CpuTopology, id: u32) -> CpuSet {
        topo.cpu_details.cpus_in_numa_nodes(&[id])
    }

    fn attributes(topo: &CpuTopology, id: u32, allocatable: &CpuSet) -> Attributes {
        // A NUMA node never spans sockets, so any of its CPUs names the socket.
        let socket_id = allocatable
            .first()
            .and_then(|cpu| topo.cpu_details.get(cpu))
            .map_or(0, |cpu| cpu.socket_id);
        let mut attrs = make_grouped_attributes(topo, socket_id, allocatable);
        insert_numa_node(&mut attrs, id);
        attrs
    }
}

/// Advertises one shareable device per socket or NUMA node.
///
/// The device's capacity is the number of unreserved CPUs in the group.
/// Claims consume part of that capacity and get concrete CPUs picked from
/// whatever the shared pool has free in the group at prepare time.
pub struct GroupedManager<G> {
    driver_name: String,
    topology: Arc<CpuTopology>,
    reserved_cpus: CpuSet,
    shared_pool: Arc<dyn SharedCpuPool>,
    /// device name -> socket or NUMA node ID
    index: DeviceIndex<u32>,
    _granularity: PhantomData<G>,
}

pub type SocketGroupedManager = GroupedManager<Socket>;
pub type NumaGroupedManager = GroupedManager<NumaNode>;

impl<G: Granularity> GroupedManager<G> {
    pub fn new(
        driver_name: impl Into<String>,
        topology: Arc<CpuTopology>,
        reserved_cpus: CpuSet,
        shared_pool: Arc<dyn SharedCpuPool>,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            topology,
            reserved_cpus,
            shared_pool,
            index: DeviceIndex::new(),
            _granularity: PhantomData,
        }
    }
}

impl<G: Granularity> DeviceManager for GroupedManager<G> {
    fn create_slices(&self) -> Vec<Vec<Device>> {
        info!(group_by = G::NAME, "creating grouped CPU devices");
        let mut index = HashMap::new();
        let mut devices = Vec::new();

        for id in G::coordinates(&self.topology) {
            let allocatable = G::cpus_in(&self.topology, id).difference(&self.reserved_cpus);
            if allocatable.is_empty() {
                debug!(group_by = G::NAME, id, "skipping group without allocatable CPUs");
                continue;
            }

            let name = device_name(G::DEVICE_PREFIX, id);
            let capacity = BTreeMap::from([(
                CPU_RESOURCE_QUALIFIED_NAME.to_string(),
                DeviceCapacity {
                    value: Quantity::from_units(allocatable.size() as u64),
                },
            )]);
            index.insert(name.clone(), id);
            devices.push(Device {
                name,
                attributes: G::attributes(&self.topology, id, &allocatable),
                capacity,
                allow_multiple_allocations: Some(true),
            });
        }

        self.index.publish(index);
        chunk_devices(devices)
    }

    #[tracing::instrument(skip_all, fields(claim = %claim.key(), group_by = G::NAME))]
    fn allocate_cpus(&self, claim: &ResourceClaim) -> Result<CpuSet, DeviceError> {
        let index = self.index.snapshot();
        let mut assignment = CpuSet::new();

        for alloc in claim.results() {
            if alloc.driver != self.driver_name {
                continue;
            }
            let requested = alloc
                .consumed_capacity
                .get(CPU_RESOURCE_QUALIFIED_NAME)
                .map_or(0, Quantity::value);
            let id = index
                .get(&alloc.device)
                .copied()
                .ok_or_else(|| DeviceError::UnknownDevice {
                    device: alloc.device.clone(),
                    manager: G::NAME,
                })?;

            let group_cpus = G::cpus_in(&self.topology, id);
            let available = self
                .shared_pool
                .free_cpus()
                .intersection(&group_cpus)
                .difference(&assignment)
                .difference(&self.reserved_cpus);
            info!(
                device = %alloc.device,
                id,
                requested,
                total = %group_cpus,
                available = %available,
                "picking CPUs from group"
            );

            let picked = take_by_topology_numa_packed(
                &self.topology,
                &available,
                usize::try_from(requested).unwrap_or(usize::MAX),
                CpuSortingStrategy::Packed,
                true,
            )?;
            assignment = assignment.union(&picked);
            info!(device = %alloc.device, picked = %picked, total = %assignment, "CPU assignment");
        }

        if assignment.is_empty() {
            debug!("no CPU allocations for this driver");
        }
        Ok(assignment)
    }
}

impl<G: Granularity> std::fmt::Debug for GroupedManager<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupedManager")
            .field("group_by", &G::NAME)
            .field("driver_name", &self.driver_name)
            .field("reserved_cpus", &self.reserved_cpus)
            .field("devices", &self.index.len())
            .finish()
    }
}
