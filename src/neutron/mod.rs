//! Boundary to the Neutron controller.
//!
//! The agent calls out through [`PluginRpc`] and is called back through
//! [`RpcCallbacks`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::queue::DrainQueue;

/// Port detail as returned by the controller for a device (MAC).
///
/// The controller answers for any MAC, even ones it does not own; in that
/// case only `device` is filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetail {
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
}

impl DeviceDetail {
    /// The record returned for a MAC the controller knows nothing about.
    pub fn unknown(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }
}

/// A port as pushed by the controller in a `port_update` cast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// The owning instance UUID, in OpenStack form.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default, rename = "binding:host_id")]
    pub binding_host_id: Option<String>,
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub binary: String,
    pub host: String,
    pub topic: String,
    pub agent_type: String,
    pub configurations: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_flag: Option<bool>,
}

#[async_trait]
pub trait PluginRpc: Send + Sync {
    async fn get_device_details(&self, device: &str, agent_id: &str) -> Result<DeviceDetail>;

    async fn get_devices_details_list(
        &self,
        devices: &[String],
        agent_id: &str,
    ) -> Result<Vec<DeviceDetail>>;

    async fn update_device_up(&self, device: &str, agent_id: &str, host: &str) -> Result<()>;

    async fn update_device_down(&self, device: &str, agent_id: &str, host: &str) -> Result<()>;

    async fn report_state(&self, state: &AgentState) -> Result<()>;
}

/// Inbound casts from the controller.
#[derive(Debug, Clone)]
pub struct RpcCallbacks {
    updated_ports: Arc<DrainQueue<Port>>,
}

impl RpcCallbacks {
    pub fn new(updated_ports: Arc<DrainQueue<Port>>) -> Self {
        Self { updated_ports }
    }

    pub async fn port_update(&self, port: Port) {
        info!(
            "Neutron API indicated port update for {}. Checking if hosted by this system.",
            port.mac_address.as_deref().unwrap_or("<unknown>")
        );
        self.updated_ports.push(port).await;
    }

    pub async fn network_delete(&self, network_id: &str) {
        debug!("network_delete RPC received for network: {}", network_id);
    }
}
