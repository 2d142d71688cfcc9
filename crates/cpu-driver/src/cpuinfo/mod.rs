//! CPU topology model and discovery

mod file;
mod sysfs;
#[cfg(test)]
pub(crate) mod testing;
mod topology;

use error_stack::Report;
use thiserror::Error;

pub use file::FileCpuInfo;
pub use sysfs::SysfsCpuInfo;
pub use topology::CoreKey;
pub use topology::CoreType;
pub use topology::CpuDetails;
pub use topology::CpuInfo;
pub use topology::CpuTopology;

/// Errors that can occur while discovering the CPU topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology source")]
    ReadFailed,
    #[error("failed to parse topology data")]
    ParseFailed,
    #[error("no CPUs discovered")]
    NoCpus,
}

/// Source of per-CPU topology facts
pub trait CpuInfoProvider: Send + Sync {
    fn cpu_infos(&self) -> Result<Vec<CpuInfo>, Report<TopologyError>>;

    /// Discovers the topology; an empty CPU list is an error.
    fn topology(&self) -> Result<CpuTopology, Report<TopologyError>> {
        let infos = self.cpu_infos()?;
        if infos.is_empty() {
            return Err(Report::new(TopologyError::NoCpus));
        }
        Ok(CpuTopology::from_cpu_infos(infos))
    }
}
