//! Fatal agent errors.
//!
//! Everything here is raised during start-up; once the agent is running,
//! failures are contained by the reconciliation loop and surface as
//! `anyhow::Error` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("expected exactly one host; found {count}")]
    MultipleHostsFound { count: usize },

    #[error(
        "there are no network bridges (shared ethernet adapters) on the system; \
         can not start the agent"
    )]
    NoNetworkBridges,

    #[error(
        "the system has more than one network bridge, but bridge_mappings have \
         not been specified; configure bridge_mappings before proceeding"
    )]
    MultiBridgeNoMapping,

    #[error(
        "device {dev} on virtual I/O server {vios} was not found; unable to set \
         up physical network {phys_net}"
    )]
    DeviceNotFound {
        dev: String,
        vios: String,
        phys_net: String,
    },

    #[error("invalid bridge mapping entry {0:?}; expected <physnet>:<device>:<vios>")]
    InvalidBridgeMapping(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no hypervisor backend configured (set sim_fixture)")]
    NoBackend,
}
