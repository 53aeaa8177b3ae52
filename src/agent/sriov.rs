//! SR-IOV backend: vNICs backed by virtual functions on labelled physical
//! ports.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::RwLock;

use super::{attempt_provision, AgentCore, NetworkAgent};
use crate::prov_req::ProvisionRequest;
use crate::pvm::{EventType, PvmEvent, VifKind};
use crate::types::Action;
use crate::utils;

pub struct SriovAgent {
    core: Arc<AgentCore>,
    /// Physical network label to physical port location codes.
    br_map: RwLock<BTreeMap<String, Vec<String>>>,
}

impl SriovAgent {
    pub async fn new(core: Arc<AgentCore>) -> Result<Self> {
        let agent = Self {
            core,
            br_map: RwLock::new(BTreeMap::new()),
        };
        agent.refresh_mappings().await?;

        let config = &agent.core.config;
        agent
            .core
            .set_configuration("default_redundancy", config.vnic_required_vfs.into())
            .await;
        agent
            .core
            .set_configuration(
                "default_capacity",
                config
                    .vnic_vf_capacity
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null),
            )
            .await;
        Ok(agent)
    }

    /// Re-reads physical port labels, which can change at any time.
    async fn refresh_mappings(&self) -> Result<()> {
        let ports = self
            .core
            .pvm
            .list_sriov_physical_ports(&self.core.host_uuid)
            .await?;
        let mapping = utils::parse_sriov_mappings(&ports);
        debug!("SR-IOV physical network mappings: {:?}", mapping);
        self.core
            .set_configuration("bridge_mappings", serde_json::json!(mapping))
            .await;
        *self.br_map.write().await = mapping;
        Ok(())
    }

    pub async fn bridge_mappings(&self) -> BTreeMap<String, Vec<String>> {
        self.br_map.read().await.clone()
    }
}

#[async_trait]
impl NetworkAgent for SriovAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn vif_kind(&self) -> VifKind {
        VifKind::Vnic
    }

    async fn heal_and_optimize(&self) -> Result<()> {
        debug!("Running heal and optimize for the SR-IOV agent");
        self.refresh_mappings().await?;
        let client_vifs = self.core.client_vifs(VifKind::Vnic).await?;
        let requests =
            ProvisionRequest::for_wrappers(&self.core, &client_vifs, Action::Plug).await?;
        self.core.set_device_count(requests.len());
        attempt_provision(self, &requests).await
    }

    async fn provision_devices(&self, requests: &[ProvisionRequest]) -> Result<()> {
        let br_map = self.br_map.read().await.clone();
        for p_req in requests {
            let physnet = p_req.physical_network().unwrap_or(utils::DEFAULT_PHYSNET);
            if !br_map.contains_key(physnet) {
                warn!(
                    "No SR-IOV physical port is labelled {} for {}; skipping.",
                    physnet, p_req
                );
                continue;
            }
            match p_req.action {
                Action::Plug => {
                    info!("Plugging {} on physical network {}", p_req, physnet);
                    self.core.update_device_up(&p_req.rpc_device).await?;
                }
                Action::Unplug => {
                    self.core.update_device_down(&p_req.rpc_device).await?;
                }
            }
        }
        Ok(())
    }

    fn is_hao_event(&self, event: &PvmEvent) -> bool {
        if event.etype != EventType::ModifyUri {
            return false;
        }
        let host_uri = format!("ManagedSystem/{}", self.core.host_uuid);
        if !event.data.trim_end_matches('/').ends_with(&host_uri) {
            return false;
        }
        event
            .detail
            .as_deref()
            .is_some_and(|detail| detail.to_ascii_uppercase().contains("SRIOV"))
    }
}
