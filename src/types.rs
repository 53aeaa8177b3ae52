//! Small value types shared across the agent.
//!
//! These are serialised with [`serde`](https://serde.rs/) because they show
//! up both in the configuration file and in the JSON payload of the custom
//! client events emitted by the compute driver.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Whether a device should end up plugged (marked up) or unplugged (marked
/// down) once its request is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Plug,
    Unplug,
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plug" => Ok(Action::Plug),
            "unplug" => Ok(Action::Unplug),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Plug => write!(f, "plug"),
            Action::Unplug => write!(f, "unplug"),
        }
    }
}

/// Backend tag for a VIF.  The SEA and SR-IOV agents share one event stream
/// and use this tag to pick out the events meant for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VifType {
    #[serde(rename = "pvm_sea")]
    Sea,
    #[serde(rename = "pvm_sriov")]
    Sriov,
}

impl VifType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VifType::Sea => "pvm_sea",
            VifType::Sriov => "pvm_sriov",
        }
    }
}

impl fmt::Display for VifType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temporal shape of the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Heal on its own timer; provision as soon as event batches arrive.
    EventDriven,
    /// No event listener: heal when due and pick up Neutron port updates
    /// between sleeps.
    Polling,
}
