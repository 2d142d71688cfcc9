use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use clap::ValueEnum;

use crate::cpuinfo::CpuInfoProvider;
use crate::cpuinfo::FileCpuInfo;
use crate::cpuinfo::SysfsCpuInfo;
use crate::cpuset::CpuSet;
use crate::device::DeviceMode;
use crate::device::GroupBy;
use crate::driver::cdi::CdiError;
use crate::driver::CdiRegistry;
use crate::driver::CdiSpecFile;
use crate::driver::InMemoryCdiRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CpuDeviceMode {
    /// One device per CPU
    Individual,
    /// One shareable device per socket or NUMA node
    Grouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GroupByArg {
    Socket,
    NumaNode,
}

impl From<GroupByArg> for GroupBy {
    fn from(arg: GroupByArg) -> Self {
        match arg {
            GroupByArg::Socket => GroupBy::Socket,
            GroupByArg::NumaNode => GroupBy::NumaNode,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct DriverArgs {
    #[arg(
        long,
        env = "DRA_DRIVER_NAME",
        default_value = "dra.cpu",
        help = "Driver name published with every device"
    )]
    pub driver_name: String,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Node name, used as the resource pool name"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "DRA_CPU_RESERVED_CPUS",
        default_value = "",
        value_parser = parse_cpuset,
        help = "CPUs never advertised or allocated, as a cpulist, e.g. 0-1,8"
    )]
    pub reserved_cpus: CpuSet,

    #[arg(long, value_enum, default_value_t = CpuDeviceMode::Individual)]
    pub cpu_device_mode: CpuDeviceMode,

    #[arg(
        long,
        value_enum,
        default_value_t = GroupByArg::NumaNode,
        help = "Grouping used when --cpu-device-mode=grouped"
    )]
    pub group_by: GroupByArg,

    #[arg(
        long,
        env = "DRA_CPU_TOPOLOGY_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML or JSON list of CPU records to use instead of sysfs"
    )]
    pub topology_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = "/sys",
        value_hint = clap::ValueHint::DirPath,
        help = "Root of the sysfs tree to discover the topology from"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        env = "CDI_SPEC_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory to write the CDI spec to, e.g. /var/run/cdi (in memory when unset)"
    )]
    pub cdi_spec_dir: Option<PathBuf>,

    #[arg(
        long,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_path: Option<PathBuf>,
}

impl DriverArgs {
    pub fn device_mode(&self) -> DeviceMode {
        match self.cpu_device_mode {
            CpuDeviceMode::Individual => DeviceMode::Individual,
            CpuDeviceMode::Grouped => DeviceMode::Grouped(self.group_by.into()),
        }
    }

    /// A topology file takes precedence over sysfs.
    pub fn cpu_info_provider(&self) -> Box<dyn CpuInfoProvider> {
        match &self.topology_file {
            Some(path) => Box::new(FileCpuInfo::new(path.clone())),
            None => Box::new(SysfsCpuInfo::new(self.sysfs_root.clone())),
        }
    }

    pub fn cdi_registry(&self) -> Result<Arc<dyn CdiRegistry>, CdiError> {
        let registry: Arc<dyn CdiRegistry> = match &self.cdi_spec_dir {
            Some(dir) => Arc::new(CdiSpecFile::open(dir)?),
            None => Arc::new(InMemoryCdiRegistry::new()),
        };
        Ok(registry)
    }
}

fn parse_cpuset(s: &str) -> Result<CpuSet, String> {
    s.parse().map_err(|e| format!("invalid cpu list: {e}"))
}
