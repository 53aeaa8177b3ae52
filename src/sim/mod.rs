//! Simulated hypervisor and controller.
//!
//! Both backends keep their state in memory, can be seeded from a JSON
//! fixture describing one host, and record every mutation the agent makes
//! so callers can inspect it afterwards.

mod controller;
mod hypervisor;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::neutron::DeviceDetail;
use crate::pvm::{NetworkBridge, Partition, SriovPhysicalPort, Vif};

pub use controller::SimNeutron;
pub use hypervisor::SimPowerVm;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimPartition {
    #[serde(flatten)]
    pub partition: Partition,
    #[serde(default)]
    pub vifs: Vec<Vif>,
}

impl SimPartition {
    pub fn new(partition: Partition, vifs: Vec<Vif>) -> Self {
        Self { partition, vifs }
    }
}

/// One host as seen by both the management API and the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimFixture {
    pub host_uuid: String,
    #[serde(default)]
    pub partitions: Vec<SimPartition>,
    #[serde(default)]
    pub bridges: Vec<NetworkBridge>,
    #[serde(default)]
    pub sriov_ports: Vec<SriovPhysicalPort>,
    /// Ports the controller owns.
    #[serde(default)]
    pub ports: Vec<DeviceDetail>,
}

impl SimFixture {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading sim fixture {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing sim fixture {}", path.display()))
    }
}
