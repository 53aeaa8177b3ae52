//! Fixtures shared by the unit tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};

use crate::agent::AgentCore;
use crate::config::Config;
use crate::neutron::DeviceDetail;
use crate::pvm::{
    EventType, LoadGroup, NetworkBridge, Partition, PartitionFilter, PartitionKind, PowerVm,
    PvmEvent, SharedEthernetAdapter, SriovPhysicalPort, Vif, VifKind,
};
use crate::sim::{SimFixture, SimNeutron, SimPartition, SimPowerVm};
use crate::types::{LoopMode, VifType};
use crate::utils;

pub const HOST: &str = "compute1";
pub const HOST_UUID: &str = "5A8C2D3E-1111-2222-3333-444455556666";
pub const VIOS1: &str = "1F00BEEF-0000-0000-0000-00000000000A";
pub const MGMT: &str = "2E11ABCD-0000-0000-0000-0000000000FF";
pub const LPAR1: &str = "3ABC1234-0000-1111-2222-000000000001";
pub const LPAR2: &str = "3ABC1234-0000-1111-2222-000000000002";
pub const MAC1: &str = "fa:16:3e:00:00:01";
pub const MAC2: &str = "fa:16:3e:00:00:02";
pub const NB1: &str = "NB-1";

static NEXT_VIF: AtomicU32 = AtomicU32::new(1);

fn vif(mac: &str, pvid: u16, kind: VifKind) -> Vif {
    Vif {
        uuid: format!("VIF-{}", NEXT_VIF.fetch_add(1, Ordering::Relaxed)),
        mac: utils::sanitize_mac_for_api(mac),
        pvid,
        tagged_vlans: Vec::new(),
        vswitch_id: 0,
        is_trunk: false,
        kind,
    }
}

pub fn cna(mac: &str, pvid: u16) -> Vif {
    vif(mac, pvid, VifKind::Cna)
}

pub fn vnic(mac: &str) -> Vif {
    vif(mac, 0, VifKind::Vnic)
}

fn partition(uuid: &str, name: &str, kind: PartitionKind, vifs: Vec<Vif>) -> SimPartition {
    SimPartition::new(
        Partition {
            uuid: uuid.into(),
            name: name.into(),
            kind,
        },
        vifs,
    )
}

pub fn lpar(uuid: &str, name: &str, vifs: Vec<Vif>) -> SimPartition {
    partition(uuid, name, PartitionKind::Lpar, vifs)
}

pub fn vios(uuid: &str, name: &str, vifs: Vec<Vif>) -> SimPartition {
    partition(uuid, name, PartitionKind::Vios, vifs)
}

pub fn mgmt(vifs: Vec<Vif>) -> SimPartition {
    partition(MGMT, "mgmt", PartitionKind::Management, vifs)
}

/// A bridge on vswitch 0 whose primary load group carries `pvid` and
/// `primary_tagged`.
pub fn bridge(uuid: &str, pvid: u16, primary_tagged: Vec<u16>) -> NetworkBridge {
    NetworkBridge {
        uuid: uuid.into(),
        vswitch_id: 0,
        load_groups: vec![LoadGroup {
            pvid,
            tagged_vlans: primary_tagged,
        }],
        seas: vec![SharedEthernetAdapter {
            dev_name: "ent8".into(),
            vios_uuid: VIOS1.into(),
        }],
    }
}

/// The controller's record of a port it owns.
pub fn port(mac: &str, vlan: u16, physnet: &str) -> DeviceDetail {
    let mac = utils::norm_mac(mac);
    DeviceDetail {
        device: mac.clone(),
        port_id: Some(format!("port-{}", mac)),
        mac_address: Some(mac),
        segmentation_id: Some(vlan),
        physical_network: Some(physnet.into()),
        device_owner: Some("compute:nova".into()),
        network_type: Some("vlan".into()),
    }
}

/// A custom client event as the compute VIF driver emits it.
pub fn custom_event(action: &str, mac: &str, vif_type: &str, lpar_uuid: &str) -> PvmEvent {
    let detail = serde_json::json!({
        "provider": "NOVA_PVM_VIF",
        "action": action,
        "mac": mac,
        "type": vif_type,
    });
    PvmEvent::new(
        EventType::CustomClientEvent,
        format!(
            "https://hmc:12443/rest/api/uom/LogicalPartition/{}/ClientNetworkAdapter/\
             6E7F0000-0000-0000-0000-000000000001",
            lpar_uuid
        ),
        Some(detail.to_string()),
    )
}

/// One VIOS with its SEA trunk, one bridge, a management partition with an
/// RMC adapter, and two client LPARs whose ports the controller owns.
pub fn sea_fixture() -> SimFixture {
    let mut trunk = cna("AE:00:00:00:00:0A", 1);
    trunk.is_trunk = true;
    SimFixture {
        host_uuid: HOST_UUID.into(),
        partitions: vec![
            vios(VIOS1, "vios1", vec![trunk]),
            mgmt(vec![cna("AE:00:00:00:00:FF", 1)]),
            lpar(LPAR1, "vm1", vec![cna(MAC1, 1)]),
            lpar(LPAR2, "vm2", vec![cna(MAC2, 1)]),
        ],
        bridges: vec![bridge(NB1, 1, vec![])],
        sriov_ports: vec![],
        ports: vec![port(MAC1, 100, "default"), port(MAC2, 200, "default")],
    }
}

/// Two labelled physical ports and one unlabelled, with a vNIC per LPAR.
pub fn sriov_fixture() -> SimFixture {
    SimFixture {
        host_uuid: HOST_UUID.into(),
        partitions: vec![
            vios(VIOS1, "vios1", vec![]),
            lpar(LPAR1, "vm1", vec![vnic(MAC1)]),
            lpar(LPAR2, "vm2", vec![vnic(MAC2)]),
        ],
        bridges: vec![],
        sriov_ports: vec![
            SriovPhysicalPort {
                loc_code: "U78CB.001.WZS0JZB-P1-C7-T1".into(),
                label: Some("prod".into()),
            },
            SriovPhysicalPort {
                loc_code: "U78CB.001.WZS0JZB-P1-C7-T2".into(),
                label: Some("prod".into()),
            },
            SriovPhysicalPort {
                loc_code: "U78CB.001.WZS0JZB-P1-C8-T1".into(),
                label: None,
            },
        ],
        ports: vec![port(MAC1, 0, "prod"), port(MAC2, 0, "default")],
    }
}

pub fn config(agent_type: VifType) -> Config {
    Config {
        host: HOST.into(),
        agent_type,
        polling_interval: 1,
        heal_and_optimize_interval: 1800,
        exception_interval: 1,
        report_interval: 0,
        pvid_update_loops: 3,
        loop_mode: LoopMode::EventDriven,
        ..Config::default()
    }
}

pub struct Harness {
    pub pvm: Arc<SimPowerVm>,
    pub neutron: Arc<SimNeutron>,
    pub core: Arc<AgentCore>,
}

pub async fn harness(fixture: SimFixture, config: Config) -> Harness {
    let neutron = Arc::new(SimNeutron::from_fixture(&fixture));
    let pvm = Arc::new(SimPowerVm::from_fixture(fixture));
    let core = AgentCore::new(Arc::new(config), pvm.clone(), neutron.clone())
        .await
        .expect("fixture has exactly one host");
    Harness {
        pvm,
        neutron,
        core: Arc::new(core),
    }
}

pub type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// The call a [`HookedPvm`] hook runs after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum After {
    ListVifs(String),
    ListVioses,
}

/// A `SimPowerVm` that runs one-shot hooks once a chosen call has returned,
/// so a test can change the host in the middle of an agent pass.
pub struct HookedPvm {
    pub sim: Arc<SimPowerVm>,
    hooks: Mutex<Vec<(After, Hook)>>,
}

impl HookedPvm {
    pub fn new(sim: Arc<SimPowerVm>) -> Self {
        Self {
            sim,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub async fn after(&self, at: After, hook: Hook) {
        self.hooks.lock().await.push((at, hook));
    }

    async fn fire(&self, at: After) {
        let due: Vec<Hook> = {
            let mut hooks = self.hooks.lock().await;
            let (due, rest): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *hooks).into_iter().partition(|(a, _)| *a == at);
            *hooks = rest;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        for hook in due {
            hook().await;
        }
    }
}

#[async_trait]
impl PowerVm for HookedPvm {
    async fn host_uuids(&self) -> Result<Vec<String>> {
        self.sim.host_uuids().await
    }

    async fn list_partitions(
        &self,
        host_uuid: &str,
        filter: PartitionFilter,
    ) -> Result<Vec<Partition>> {
        let partitions = self.sim.list_partitions(host_uuid, filter).await?;
        if filter == PartitionFilter::Vioses {
            self.fire(After::ListVioses).await;
        }
        Ok(partitions)
    }

    async fn list_vifs(&self, partition_uuid: &str, kind: VifKind) -> Result<Option<Vec<Vif>>> {
        let vifs = self.sim.list_vifs(partition_uuid, kind).await?;
        self.fire(After::ListVifs(partition_uuid.to_string())).await;
        Ok(vifs)
    }

    async fn list_bridges(&self, host_uuid: &str) -> Result<Vec<NetworkBridge>> {
        self.sim.list_bridges(host_uuid).await
    }

    async fn ensure_vlans_on_bridge(
        &self,
        bridge_uuid: &str,
        vlans: &BTreeSet<u16>,
    ) -> Result<()> {
        self.sim.ensure_vlans_on_bridge(bridge_uuid, vlans).await
    }

    async fn remove_vlan_from_bridge(&self, bridge_uuid: &str, vlan: u16) -> Result<()> {
        self.sim.remove_vlan_from_bridge(bridge_uuid, vlan).await
    }

    async fn update_adapter_pvid(&self, adapter: &Vif, vlan: u16) -> Result<()> {
        self.sim.update_adapter_pvid(adapter, vlan).await
    }

    async fn list_sriov_physical_ports(&self, host_uuid: &str) -> Result<Vec<SriovPhysicalPort>> {
        self.sim.list_sriov_physical_ports(host_uuid).await
    }

    async fn listen(&self, event_tx: mpsc::Sender<Vec<PvmEvent>>) -> Result<()> {
        self.sim.listen(event_tx).await
    }
}

/// Like [`harness`], but the agent core talks to the host through a
/// [`HookedPvm`].  `Harness::pvm` is the underlying simulator.
pub async fn hooked_harness(fixture: SimFixture, config: Config) -> (Harness, Arc<HookedPvm>) {
    let neutron = Arc::new(SimNeutron::from_fixture(&fixture));
    let pvm = Arc::new(SimPowerVm::from_fixture(fixture));
    let hooked = Arc::new(HookedPvm::new(pvm.clone()));
    let core = AgentCore::new(Arc::new(config), hooked.clone(), neutron.clone())
        .await
        .expect("fixture has exactly one host");
    let h = Harness {
        pvm,
        neutron,
        core: Arc::new(core),
    };
    (h, hooked)
}
