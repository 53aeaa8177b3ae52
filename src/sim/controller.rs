use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;

use super::SimFixture;
use crate::neutron::{AgentState, DeviceDetail, PluginRpc, Port, RpcCallbacks};
use crate::utils::norm_mac;

#[derive(Debug, Default)]
struct ControllerState {
    /// Keyed by normalized MAC.
    ports: HashMap<String, DeviceDetail>,
    detail_lookups: Vec<String>,
    up: Vec<String>,
    down: Vec<String>,
    reports: Vec<AgentState>,
    fail_reports: bool,
    fail_down: bool,
    callbacks: Option<RpcCallbacks>,
}

/// In-memory Neutron plugin endpoint.
#[derive(Debug, Default)]
pub struct SimNeutron {
    state: Mutex<ControllerState>,
}

impl SimNeutron {
    pub fn from_fixture(fixture: &SimFixture) -> Self {
        let ports = fixture
            .ports
            .iter()
            .filter_map(|dev| Some((norm_mac(dev.mac_address.as_deref()?), dev.clone())))
            .collect();
        Self {
            state: Mutex::new(ControllerState {
                ports,
                ..Default::default()
            }),
        }
    }

    pub async fn add_port(&self, dev: DeviceDetail) {
        if let Some(mac) = dev.mac_address.as_deref() {
            let mac = norm_mac(mac);
            self.state.lock().await.ports.insert(mac, dev);
        }
    }

    /// Wires up the agent's inbound callbacks so `push_port_update` can reach
    /// it.
    pub async fn register_callbacks(&self, callbacks: RpcCallbacks) {
        self.state.lock().await.callbacks = Some(callbacks);
    }

    pub async fn push_port_update(&self, port: Port) -> Result<()> {
        let callbacks = self.state.lock().await.callbacks.clone();
        match callbacks {
            Some(cb) => {
                cb.port_update(port).await;
                Ok(())
            }
            None => bail!("no agent callbacks registered"),
        }
    }

    pub async fn set_fail_reports(&self, fail: bool) {
        self.state.lock().await.fail_reports = fail;
    }

    /// Makes every following `update_device_down` call fail.
    pub async fn set_fail_down(&self, fail: bool) {
        self.state.lock().await.fail_down = fail;
    }

    /// Devices the agent asked about, as it passed them.
    pub async fn detail_lookups(&self) -> Vec<String> {
        self.state.lock().await.detail_lookups.clone()
    }

    pub async fn devices_up(&self) -> Vec<String> {
        self.state.lock().await.up.clone()
    }

    pub async fn devices_down(&self) -> Vec<String> {
        self.state.lock().await.down.clone()
    }

    pub async fn reports(&self) -> Vec<AgentState> {
        self.state.lock().await.reports.clone()
    }

    fn lookup(state: &ControllerState, device: &str) -> DeviceDetail {
        state
            .ports
            .get(&norm_mac(device))
            .cloned()
            .unwrap_or_else(|| DeviceDetail::unknown(device))
    }
}

#[async_trait]
impl PluginRpc for SimNeutron {
    async fn get_device_details(&self, device: &str, _agent_id: &str) -> Result<DeviceDetail> {
        let mut state = self.state.lock().await;
        state.detail_lookups.push(device.to_string());
        Ok(Self::lookup(&state, device))
    }

    async fn get_devices_details_list(
        &self,
        devices: &[String],
        _agent_id: &str,
    ) -> Result<Vec<DeviceDetail>> {
        let mut state = self.state.lock().await;
        state.detail_lookups.extend(devices.iter().cloned());
        Ok(devices.iter().map(|d| Self::lookup(&state, d)).collect())
    }

    async fn update_device_up(&self, device: &str, agent_id: &str, host: &str) -> Result<()> {
        debug!("{} reported {} up on {}", agent_id, device, host);
        self.state.lock().await.up.push(device.to_string());
        Ok(())
    }

    async fn update_device_down(&self, device: &str, agent_id: &str, host: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_down {
            bail!("simulated update_device_down failure for {}", device);
        }
        debug!("{} reported {} down on {}", agent_id, device, host);
        state.down.push(device.to_string());
        Ok(())
    }

    async fn report_state(&self, state: &AgentState) -> Result<()> {
        let mut inner = self.state.lock().await;
        if inner.fail_reports {
            bail!("simulated report_state failure");
        }
        inner.reports.push(state.clone());
        Ok(())
    }
}
