use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

use super::CpuInfo;
use super::CpuInfoProvider;
use super::TopologyError;

/// Reads a static topology from a YAML or JSON list of CPU records.
#[derive(Debug, Clone)]
pub struct FileCpuInfo {
    path: PathBuf,
}

impl FileCpuInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CpuInfoProvider for FileCpuInfo {
    fn cpu_infos(&self) -> Result<Vec<CpuInfo>, Report<TopologyError>> {
        let content = std::fs::read_to_string(&self.path)
            .change_context(TopologyError::ReadFailed)
            .attach_printable_lazy(|| format!("path: {}", self.path.display()))?;
        // YAML is a superset of JSON, so one parser covers both.
        let infos: Vec<CpuInfo> = serde_yaml::from_str(&content)
            .change_context(TopologyError::ParseFailed)
            .attach_printable_lazy(|| format!("path: {}", self.path.display()))?;
        info!(cpus = infos.len(), path = %self.path.display(), "loaded CPU topology from file");
        Ok(infos)
    }
}
