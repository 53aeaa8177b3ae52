use std::collections::BTreeSet;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{mpsc, Mutex};

use super::{SimFixture, SimPartition};
use crate::pvm::{
    EventType, LoadGroup, NetworkBridge, Partition, PartitionFilter, PowerVm, PvmEvent,
    SriovPhysicalPort, Vif, VifKind,
};

#[derive(Debug, Default)]
struct HostState {
    host_uuids: Vec<String>,
    partitions: Vec<SimPartition>,
    bridges: Vec<NetworkBridge>,
    sriov_ports: Vec<SriovPhysicalPort>,
    fail_ensure: bool,
    ensure_calls: Vec<(String, BTreeSet<u16>)>,
    removals: Vec<(String, u16)>,
    pvid_updates: Vec<(String, u16)>,
    vif_listings: Vec<String>,
    listeners: Vec<mpsc::Sender<Vec<PvmEvent>>>,
}

/// In-memory management API for one host.
#[derive(Debug, Default)]
pub struct SimPowerVm {
    state: Mutex<HostState>,
}

impl SimPowerVm {
    pub fn from_fixture(fixture: SimFixture) -> Self {
        Self {
            state: Mutex::new(HostState {
                host_uuids: vec![fixture.host_uuid],
                partitions: fixture.partitions,
                bridges: fixture.bridges,
                sriov_ports: fixture.sriov_ports,
                ..Default::default()
            }),
        }
    }

    pub async fn set_host_uuids(&self, uuids: Vec<String>) {
        self.state.lock().await.host_uuids = uuids;
    }

    /// Makes every following `ensure_vlans_on_bridge` call fail.
    pub async fn set_fail_ensure(&self, fail: bool) {
        self.state.lock().await.fail_ensure = fail;
    }

    pub async fn add_partition(&self, partition: SimPartition) {
        self.state.lock().await.partitions.push(partition);
    }

    pub async fn remove_partition(&self, uuid: &str) {
        self.state
            .lock()
            .await
            .partitions
            .retain(|p| p.partition.uuid != uuid);
    }

    pub async fn add_vif(&self, partition_uuid: &str, vif: Vif) -> Result<()> {
        let mut state = self.state.lock().await;
        let part = state
            .partitions
            .iter_mut()
            .find(|p| p.partition.uuid == partition_uuid)
            .ok_or_else(|| anyhow!("no partition {}", partition_uuid))?;
        part.vifs.push(vif);
        Ok(())
    }

    pub async fn set_sriov_ports(&self, ports: Vec<SriovPhysicalPort>) {
        self.state.lock().await.sriov_ports = ports;
    }

    pub async fn bridge(&self, uuid: &str) -> Option<NetworkBridge> {
        self.state
            .lock()
            .await
            .bridges
            .iter()
            .find(|nb| nb.uuid == uuid)
            .cloned()
    }

    pub async fn ensure_calls(&self) -> Vec<(String, BTreeSet<u16>)> {
        self.state.lock().await.ensure_calls.clone()
    }

    pub async fn removals(&self) -> Vec<(String, u16)> {
        self.state.lock().await.removals.clone()
    }

    pub async fn pvid_updates(&self) -> Vec<(String, u16)> {
        self.state.lock().await.pvid_updates.clone()
    }

    /// Partitions whose adapters were listed, one entry per call.
    pub async fn vif_listings(&self) -> Vec<String> {
        self.state.lock().await.vif_listings.clone()
    }

    /// Delivers a batch to every subscribed listener.  Returns how many
    /// listeners took it.
    pub async fn inject(&self, batch: Vec<PvmEvent>) -> usize {
        let listeners = self.state.lock().await.listeners.clone();
        let mut delivered = 0;
        for tx in listeners {
            if tx.send(batch.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl PowerVm for SimPowerVm {
    async fn host_uuids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.host_uuids.clone())
    }

    async fn list_partitions(
        &self,
        _host_uuid: &str,
        filter: PartitionFilter,
    ) -> Result<Vec<Partition>> {
        Ok(self
            .state
            .lock()
            .await
            .partitions
            .iter()
            .filter(|p| filter.matches(p.partition.kind))
            .map(|p| p.partition.clone())
            .collect())
    }

    async fn list_vifs(&self, partition_uuid: &str, kind: VifKind) -> Result<Option<Vec<Vif>>> {
        let mut state = self.state.lock().await;
        state.vif_listings.push(partition_uuid.to_string());
        Ok(state
            .partitions
            .iter()
            .find(|p| p.partition.uuid == partition_uuid)
            .map(|p| p.vifs.iter().filter(|v| v.kind == kind).cloned().collect()))
    }

    async fn list_bridges(&self, _host_uuid: &str) -> Result<Vec<NetworkBridge>> {
        Ok(self.state.lock().await.bridges.clone())
    }

    async fn ensure_vlans_on_bridge(
        &self,
        bridge_uuid: &str,
        vlans: &BTreeSet<u16>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .ensure_calls
            .push((bridge_uuid.to_string(), vlans.clone()));
        if state.fail_ensure {
            bail!("simulated failure adding VLANs to bridge {}", bridge_uuid);
        }

        let nb = state
            .bridges
            .iter_mut()
            .find(|nb| nb.uuid == bridge_uuid)
            .ok_or_else(|| anyhow!("no network bridge {}", bridge_uuid))?;
        let missing: Vec<u16> = vlans
            .iter()
            .copied()
            .filter(|v| !nb.supports_vlan(*v))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        debug!("Adding VLANs {:?} to bridge {}", missing, bridge_uuid);
        if nb.load_groups.len() < 2 {
            // New VLANs go on an additional trunk so the primary stays fixed.
            nb.load_groups.push(LoadGroup {
                pvid: 4094,
                tagged_vlans: Vec::new(),
            });
        }
        if let Some(lg) = nb.load_groups.last_mut() {
            lg.tagged_vlans.extend(missing);
        }
        Ok(())
    }

    async fn remove_vlan_from_bridge(&self, bridge_uuid: &str, vlan: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        state.removals.push((bridge_uuid.to_string(), vlan));
        let nb = state
            .bridges
            .iter_mut()
            .find(|nb| nb.uuid == bridge_uuid)
            .ok_or_else(|| anyhow!("no network bridge {}", bridge_uuid))?;
        if nb.primary_load_group().is_some_and(|lg| lg.vlans().any(|v| v == vlan)) {
            bail!("VLAN {} is on the primary load group of {}", vlan, bridge_uuid);
        }
        for lg in nb.load_groups.iter_mut().skip(1) {
            lg.tagged_vlans.retain(|v| *v != vlan);
        }
        Ok(())
    }

    async fn update_adapter_pvid(&self, adapter: &Vif, vlan: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        let vif = state
            .partitions
            .iter_mut()
            .flat_map(|p| p.vifs.iter_mut())
            .find(|v| v.uuid == adapter.uuid)
            .ok_or_else(|| anyhow!("no client adapter {}", adapter.uuid))?;
        vif.pvid = vlan;
        state.pvid_updates.push((adapter.mac.clone(), vlan));
        Ok(())
    }

    async fn list_sriov_physical_ports(&self, _host_uuid: &str) -> Result<Vec<SriovPhysicalPort>> {
        Ok(self.state.lock().await.sriov_ports.clone())
    }

    async fn listen(&self, event_tx: mpsc::Sender<Vec<PvmEvent>>) -> Result<()> {
        self.state.lock().await.listeners.push(event_tx.clone());
        info!("Simulated event listener subscribed");
        event_tx
            .send(vec![PvmEvent::new(EventType::NewClient, "", None)])
            .await
            .map_err(|_| anyhow!("event channel closed"))?;
        event_tx.closed().await;
        Ok(())
    }
}
