//! The agent: shared plumbing plus the SEA and SR-IOV backends.
//!
//! [`AgentCore`] owns the connections to the management API and the
//! controller.  A [`NetworkAgent`] implementation adds the backend specific
//! heal-and-optimize and provisioning steps, and [`start`] wires everything
//! into running tasks.

pub mod event;
pub mod pvid;
pub mod rpc_loop;
pub mod sea;
pub mod sriov;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::neutron::{AgentState, DeviceDetail, PluginRpc, Port, RpcCallbacks};
use crate::prov_req::ProvisionRequest;
use crate::pvm::{Partition, PartitionFilter, PowerVm, PvmEvent, Vif, VifKind};
use crate::queue::DrainQueue;
use crate::types::{Action, LoopMode, VifType};
use crate::utils;

pub use rpc_loop::Reconciler;
pub use sea::SeaAgent;
pub use sriov::SriovAgent;

/// Topic the L2 agents report under.
const L2_AGENT_TOPIC: &str = "N/A";

/// Depth of the event batch channel between the listener and the loop.
const EVENT_CHANNEL_DEPTH: usize = 128;

/// Connections and state shared by every part of one agent process.
pub struct AgentCore {
    pub config: Arc<Config>,
    pub pvm: Arc<dyn PowerVm>,
    pub plugin: Arc<dyn PluginRpc>,
    pub host_uuid: String,
    pub agent_id: String,
    pub vif_type: VifType,
    updated_ports: Arc<DrainQueue<Port>>,
    state: Mutex<AgentState>,
    device_count: AtomicUsize,
}

impl AgentCore {
    pub async fn new(
        config: Arc<Config>,
        pvm: Arc<dyn PowerVm>,
        plugin: Arc<dyn PluginRpc>,
    ) -> Result<Self> {
        let host_uuid = utils::get_host_uuid(pvm.as_ref()).await?;
        let vif_type = config.agent_type;
        let (binary, agent_type) = match vif_type {
            VifType::Sea => (
                "networking-powervm-sharedethernet-agent",
                "PowerVM Shared Ethernet agent",
            ),
            VifType::Sriov => ("networking-powervm-sriov-agent", "PowerVM SR-IOV Ethernet agent"),
        };
        let state = AgentState {
            binary: binary.into(),
            host: config.host.clone(),
            topic: L2_AGENT_TOPIC.into(),
            agent_type: agent_type.into(),
            configurations: serde_json::Map::new(),
            start_flag: Some(true),
        };

        Ok(Self {
            agent_id: config.agent_id(),
            config,
            pvm,
            plugin,
            host_uuid,
            vif_type,
            updated_ports: Arc::new(DrainQueue::new()),
            state: Mutex::new(state),
            device_count: AtomicUsize::new(0),
        })
    }

    /// Handle for the controller to call back into this agent.
    pub fn callbacks(&self) -> RpcCallbacks {
        RpcCallbacks::new(Arc::clone(&self.updated_ports))
    }

    pub async fn get_device_details(&self, mac: &str) -> Result<DeviceDetail> {
        self.plugin
            .get_device_details(mac, &self.agent_id)
            .await
            .with_context(|| format!("getting device details for {}", mac))
    }

    pub async fn get_devices_details_list(&self, macs: &[String]) -> Result<Vec<DeviceDetail>> {
        self.plugin
            .get_devices_details_list(macs, &self.agent_id)
            .await
            .context("getting device details list")
    }

    pub async fn update_device_up(&self, device: &DeviceDetail) -> Result<()> {
        debug!("Sending device up to Neutron for {}", device.device);
        self.plugin
            .update_device_up(&device.device, &self.agent_id, &self.config.host)
            .await
    }

    pub async fn update_device_down(&self, device: &DeviceDetail) -> Result<()> {
        warn!("Sending device DOWN to Neutron for {}", device.device);
        self.plugin
            .update_device_down(&device.device, &self.agent_id, &self.config.host)
            .await
    }

    /// Non-management LPARs and their VIFs of `kind`.
    pub async fn client_vifs(&self, kind: VifKind) -> Result<Vec<(Partition, Vec<Vif>)>> {
        let lpars = self
            .pvm
            .list_partitions(&self.host_uuid, PartitionFilter::Lpars)
            .await?
            .into_iter()
            .filter(|p| !p.is_mgmt_partition())
            .collect();
        utils::list_vifs_by_partition(self.pvm.as_ref(), lpars, kind).await
    }

    /// Publishes a value under `configurations` in the heartbeat.
    pub async fn set_configuration(&self, key: &str, value: serde_json::Value) {
        self.state
            .lock()
            .await
            .configurations
            .insert(key.to_string(), value);
    }

    pub async fn agent_state(&self) -> AgentState {
        self.state.lock().await.clone()
    }

    pub fn set_device_count(&self, count: usize) {
        self.device_count.store(count, Ordering::Relaxed);
    }

    /// Sends one heartbeat.  The start flag is kept until a report succeeds.
    pub async fn report_state(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.configurations.insert(
                "devices".into(),
                self.device_count.load(Ordering::Relaxed).into(),
            );
            state.clone()
        };
        match self.plugin.report_state(&snapshot).await {
            Ok(()) => {
                self.state.lock().await.start_flag = None;
            }
            Err(e) => error!("Failed reporting state! {:?}", e),
        }
    }

    pub async fn report_state_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.report_state().await;
        }
    }

    /// Turns the ports the controller pushed since the last call into plug
    /// requests.  Ports bound to another host are dropped.
    pub async fn build_prov_requests_from_neutron(&self) -> Result<Vec<ProvisionRequest>> {
        let ports = self.updated_ports.drain().await;
        let macs: Vec<String> = ports
            .iter()
            .filter_map(|p| p.mac_address.clone())
            .collect();
        if macs.is_empty() {
            return Ok(Vec::new());
        }
        debug!("get device details: {:?}", macs);
        let devices = self.get_devices_details_list(&macs).await?;

        let mut resp = Vec::new();
        for port in &ports {
            let Some(port_id) = port.id.as_deref() else {
                continue;
            };
            if port.binding_host_id.as_deref() != Some(self.config.host.as_str()) {
                continue;
            }
            let Some(device_id) = port.device_id.as_deref() else {
                continue;
            };
            let lpar_uuid = utils::convert_uuid_to_pvm(device_id);
            for dev in devices
                .iter()
                .filter(|dev| dev.port_id.as_deref() == Some(port_id))
            {
                let Some(mac) = dev.mac_address.as_deref() else {
                    continue;
                };
                if !utils::device_detail_valid(dev, mac) {
                    continue;
                }
                resp.push(ProvisionRequest::new(
                    Action::Plug,
                    dev.clone(),
                    lpar_uuid.clone(),
                    Some(self.vif_type),
                ));
            }
        }
        Ok(resp)
    }
}

/// Backend specific half of an agent.
#[async_trait]
pub trait NetworkAgent: Send + Sync {
    fn core(&self) -> &AgentCore;

    /// Kind of VIF this backend provisions.
    fn vif_kind(&self) -> VifKind;

    /// Re-derives the bridging the whole host needs and enforces it.
    async fn heal_and_optimize(&self) -> Result<()>;

    /// Applies a batch of requests.  Fails with the underlying bridge error
    /// without reporting any device state for the batch.
    async fn provision_devices(&self, requests: &[ProvisionRequest]) -> Result<()>;

    /// Whether `event` means the bridging of the whole host should be
    /// re-validated.
    fn is_hao_event(&self, _event: &PvmEvent) -> bool {
        false
    }
}

/// Provisions `requests`, marking every one of them down if that fails.
/// The provisioning error is returned afterwards.
pub async fn attempt_provision(
    agent: &dyn NetworkAgent,
    requests: &[ProvisionRequest],
) -> Result<()> {
    debug!(
        "Provisioning ports for mac addresses [ {} ]",
        requests
            .iter()
            .map(|r| r.mac_address.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    );
    if let Err(e) = agent.provision_devices(requests).await {
        for p_req in requests {
            if let Err(down_err) = agent.core().update_device_down(&p_req.rpc_device).await {
                error!(
                    "Failed to mark {} down after provisioning failure: {:?}",
                    p_req.mac_address, down_err
                );
            }
        }
        return Err(e);
    }
    Ok(())
}

/// A running agent: the reconciliation loop plus its helper tasks.
pub struct RunningAgent {
    pub callbacks: RpcCallbacks,
    pub main_loop: JoinHandle<Result<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningAgent {
    pub fn abort(self) {
        self.main_loop.abort();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Builds the agent for `config.agent_type` and spawns its tasks.
pub async fn start(
    config: Arc<Config>,
    pvm: Arc<dyn PowerVm>,
    plugin: Arc<dyn PluginRpc>,
) -> Result<RunningAgent> {
    let core = Arc::new(AgentCore::new(Arc::clone(&config), Arc::clone(&pvm), plugin).await?);
    let mut tasks = Vec::new();

    let agent: Arc<dyn NetworkAgent> = match config.agent_type {
        VifType::Sea => {
            let sea = SeaAgent::new(Arc::clone(&core)).await?;
            tasks.push(tokio::spawn(sea.pvid_updater().looping_call()));
            info!("Shared Ethernet Agent initialized and running");
            Arc::new(sea)
        }
        VifType::Sriov => {
            let sriov = SriovAgent::new(Arc::clone(&core)).await?;
            info!("PowerVM SR-IOV Agent initialized and running.");
            Arc::new(sriov)
        }
    };

    if let Some(interval) = config.report_interval() {
        tasks.push(tokio::spawn(Arc::clone(&core).report_state_loop(interval)));
    }

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    if config.loop_mode == LoopMode::EventDriven {
        tasks.push(tokio::spawn(async move {
            if let Err(e) = pvm.listen(event_tx).await {
                error!("Event listener failed: {:?}", e);
            }
        }));
    }

    let reconciler = Reconciler::new(agent, event_rx);
    let main_loop = tokio::spawn(reconciler.run());

    Ok(RunningAgent {
        callbacks: core.callbacks(),
        main_loop,
        tasks,
    })
}
