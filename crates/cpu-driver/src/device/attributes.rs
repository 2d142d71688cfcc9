use std::collections::BTreeMap;

use api_types::DeviceAttribute;

use super::consts::*;
use crate::cpuinfo::CpuInfo;
use crate::cpuinfo::CpuTopology;
use crate::cpuset::CpuSet;

pub type Attributes = BTreeMap<String, DeviceAttribute>;

/// Attributes of a device backed by a single CPU.
pub fn make_individual_attributes(cpu: &CpuInfo) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert(ATTR_CACHE_L3_ID.into(), cpu.uncore_cache_id.into());
    attrs.insert(ATTR_CORE_TYPE.into(), cpu.core_type.to_string().into());
    attrs.insert(ATTR_SOCKET_ID.into(), cpu.socket_id.into());
    attrs.insert(ATTR_CORE_ID.into(), cpu.core_id.into());
    attrs.insert(ATTR_CPU_ID.into(), cpu.cpu_id.into());
    insert_numa_node(&mut attrs, cpu.numa_node_id);
    attrs
}

/// Attributes shared by socket- and NUMA-grouped devices.
pub fn make_grouped_attributes(
    topo: &CpuTopology,
    socket_id: u32,
    allocatable_cpus: &CpuSet,
) -> Attributes {
    let num_cpus = i64::try_from(allocatable_cpus.size()).unwrap_or(i64::MAX);
    let mut attrs = Attributes::new();
    attrs.insert(ATTR_SOCKET_ID.into(), socket_id.into());
    attrs.insert(ATTR_NUM_CPUS.into(), num_cpus.into());
    attrs.insert(ATTR_SMT_ENABLED.into(), topo.smt_enabled.into());
    attrs
}

/// Publishes the NUMA node under both the CPU key and the network-device key.
pub fn insert_numa_node(attrs: &mut Attributes, numa_node_id: u32) {
    attrs.insert(ATTR_NUMA_NODE_ID.into(), numa_node_id.into());
    attrs.insert(ATTR_NET_NUMA_NODE.into(), numa_node_id.into());
}
