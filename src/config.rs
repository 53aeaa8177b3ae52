use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AgentError;
use crate::types::{LoopMode, VifType};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub host: String,
    pub agent_type: VifType,
    /// Seconds between idle polls of the event queue and updated ports.
    pub polling_interval: u64,
    pub heal_and_optimize_interval: u64,
    /// Seconds to back off after an iteration fails.
    pub exception_interval: u64,
    /// Heartbeat period in seconds; 0 disables state reporting.
    pub report_interval: u64,
    /// How many looper ticks a client adapter gets to show up before its
    /// port is marked down.
    pub pvid_update_loops: u32,
    pub automated_powervm_vlan_cleanup: bool,
    /// `<physnet>:<sea device>:<vios name>,...`
    pub bridge_mappings: String,
    pub vnic_required_vfs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnic_vf_capacity: Option<f64>,
    pub loop_mode: LoopMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_failures: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sim_fixture: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            agent_type: VifType::Sea,
            polling_interval: 2,
            heal_and_optimize_interval: 1800,
            exception_interval: 5,
            report_interval: 30,
            pvid_update_loops: 180,
            automated_powervm_vlan_cleanup: true,
            bridge_mappings: String::new(),
            vnic_required_vfs: 2,
            vnic_vf_capacity: None,
            loop_mode: LoopMode::EventDriven,
            max_consecutive_failures: None,
            sim_fixture: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let toml_path =
            std::env::var("PVM_AGENT_CONFIG_FILE").unwrap_or_else(|_| "pvm-agent.toml".into());

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml_path))
            .merge(Json::file("pvm-agent.json"))
            .merge(Env::prefixed("PVM_AGENT_").ignore(&["config_file"]))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.polling_interval == 0 {
            return Err(AgentError::InvalidConfig(
                "polling_interval must be at least 1 second".into(),
            ));
        }
        if self.pvid_update_loops == 0 {
            return Err(AgentError::InvalidConfig(
                "pvid_update_loops must be at least 1".into(),
            ));
        }
        if self.vnic_required_vfs < 1 {
            return Err(AgentError::InvalidConfig(
                "vnic_required_vfs must be at least 1".into(),
            ));
        }
        if let Some(capacity) = self.vnic_vf_capacity {
            if !(0.0..=1.0).contains(&capacity) {
                return Err(AgentError::InvalidConfig(format!(
                    "vnic_vf_capacity {} is outside 0.0..=1.0",
                    capacity
                )));
            }
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval)
    }

    pub fn heal_and_optimize_interval(&self) -> Duration {
        Duration::from_secs(self.heal_and_optimize_interval)
    }

    pub fn exception_interval(&self) -> Duration {
        Duration::from_secs(self.exception_interval)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval > 0).then(|| Duration::from_secs(self.report_interval))
    }

    /// Id the controller knows this agent by, e.g. `sea-agent-host1`.
    pub fn agent_id(&self) -> String {
        match self.agent_type {
            VifType::Sea => format!("sea-agent-{}", self.host),
            VifType::Sriov => format!("sriov-agent-{}", self.host),
        }
    }
}
