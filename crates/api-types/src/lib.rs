//! Shared API type definitions
//!
//! This crate contains the resource-allocation API shapes exchanged between the
//! CPU driver and the node agent: published devices and slices, allocated
//! resource claims, and the per-claim preparation results.

mod quantity;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

pub use quantity::Quantity;
pub use quantity::QuantityError;

/// A typed attribute value published on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAttribute {
    Int(i64),
    String(String),
    Bool(bool),
}

impl DeviceAttribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for DeviceAttribute {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for DeviceAttribute {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<String> for DeviceAttribute {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for DeviceAttribute {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Capacity of a shareable device for a single resource key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapacity {
    pub value: Quantity,
}

/// A schedulable device advertised to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device name, unique within the driver's pool
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, DeviceAttribute>,
    /// Empty for singleton devices that can only back one claim
    #[serde(default)]
    pub capacity: BTreeMap<String, DeviceCapacity>,
    /// Set for devices whose capacity can be split across concurrent claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_multiple_allocations: Option<bool>,
}

/// One published collection of devices
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSlice {
    pub devices: Vec<Device>,
}

/// All slices published for one pool (one pool per node)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourcePool {
    pub name: String,
    pub slices: Vec<ResourceSlice>,
}

impl ResourcePool {
    pub fn device_count(&self) -> usize {
        self.slices.iter().map(|s| s.devices.len()).sum()
    }
}

/// Object metadata carried by a claim
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// An allocated resource claim as seen by the node agent
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ResourceClaimStatus,
}

impl ResourceClaim {
    /// `namespace/name`, used in logs and error messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// Allocation results, empty when the claim is not allocated
    pub fn results(&self) -> &[DeviceRequestAllocationResult] {
        self.status
            .allocation
            .as_ref()
            .map(|a| a.devices.results.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationResult {
    #[serde(default)]
    pub devices: DeviceAllocationResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceAllocationResult {
    #[serde(default)]
    pub results: Vec<DeviceRequestAllocationResult>,
}

/// A single device allocated to a claim request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestAllocationResult {
    #[serde(default)]
    pub request: String,
    pub driver: String,
    #[serde(default)]
    pub pool: String,
    pub device: String,
    /// Capacity consumed from a shareable device, keyed by resource name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumed_capacity: BTreeMap<String, Quantity>,
}

/// A device prepared for a container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDevice {
    pub pool_name: String,
    pub device_name: String,
    #[serde(rename = "cdiDeviceIDs")]
    pub cdi_device_ids: Vec<String>,
    pub requests: Vec<String>,
}

/// Outcome of preparing one claim
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrepareResult {
    #[serde(default)]
    pub devices: Vec<PreparedDevice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PrepareResult {
    pub fn failed(error: impl ToString) -> Self {
        Self {
            devices: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}
