/// Maximum number of devices in a single published resource slice. This is a
/// hard limit of the resource API; longer catalogs are split into chunks.
pub const MAX_DEVICES_PER_RESOURCE_SLICE: usize = 128;

pub const CPU_DEVICE_PREFIX: &str = "cpudev";
pub const CPU_DEVICE_SOCKET_GROUPED_PREFIX: &str = "cpudevsocket";
pub const CPU_DEVICE_NUMA_GROUPED_PREFIX: &str = "cpudevnuma";

/// Capacity key consumed by claims against grouped devices.
pub const CPU_RESOURCE_QUALIFIED_NAME: &str = "dra.cpu/cpu";

pub const ATTR_NUMA_NODE_ID: &str = "dra.cpu/numaNodeID";
pub const ATTR_CACHE_L3_ID: &str = "dra.cpu/cacheL3ID";
pub const ATTR_CORE_TYPE: &str = "dra.cpu/coreType";
pub const ATTR_SOCKET_ID: &str = "dra.cpu/socketID";
pub const ATTR_CORE_ID: &str = "dra.cpu/coreID";
pub const ATTR_CPU_ID: &str = "dra.cpu/cpuID";
pub const ATTR_NUM_CPUS: &str = "dra.cpu/numCPUs";
pub const ATTR_SMT_ENABLED: &str = "dra.cpu/smtEnabled";
/// NUMA attribute under the key network devices publish, so claims can
/// align CPUs with NICs on the same node.
pub const ATTR_NET_NUMA_NODE: &str = "dra.net/numaNode";
