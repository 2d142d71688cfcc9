//! Node-local CPU driver for dynamic resource allocation
//!
//! Discovers the node's CPU topology, advertises CPUs as devices at one of
//! three granularities and turns allocated claims into exclusive CPU sets
//! handed to containers through CDI.

pub mod config;
pub mod cpuinfo;
pub mod cpumanager;
pub mod cpuset;
pub mod device;
pub mod driver;
