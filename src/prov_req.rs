//! Provisioning requests and the set they are consolidated in.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info};
use serde::Deserialize;

use crate::agent::AgentCore;
use crate::neutron::DeviceDetail;
use crate::pvm::{EventType, Partition, PvmEvent, Vif};
use crate::types::{Action, VifType};
use crate::utils;

/// Give up on a port whose VIF never shows up after this long.
pub const PORT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Provider id stamped on custom client events by the compute VIF driver.
pub const EVENT_PROVIDER_NOVA_PVM_VIF: &str = "NOVA_PVM_VIF";

/// A controller port that needs to be plugged or unplugged on a partition.
///
/// Two requests are equal when they name the same MAC on the same LPAR,
/// whatever their action or payload.  Sets of requests therefore hold one
/// entry per device.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub action: Action,
    /// Controller form, `aa:bb:cc:dd:ee:ff`.
    pub mac_address: String,
    pub lpar_uuid: String,
    pub rpc_device: DeviceDetail,
    pub vif_type: Option<VifType>,
    pub created_at: Instant,
}

impl PartialEq for ProvisionRequest {
    fn eq(&self, other: &Self) -> bool {
        self.mac_address == other.mac_address && self.lpar_uuid == other.lpar_uuid
    }
}

impl Eq for ProvisionRequest {}

impl Hash for ProvisionRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mac_address.hash(state);
        self.lpar_uuid.hash(state);
    }
}

impl fmt::Display for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProvisionRequest(action={}, mac={}, lpar_uuid={})",
            self.action, self.mac_address, self.lpar_uuid
        )
    }
}

/// The JSON body of a custom client event from the compute VIF driver.
#[derive(Debug, Deserialize)]
struct VifEventDetail {
    provider: Option<String>,
    action: Option<String>,
    mac: Option<String>,
    #[serde(rename = "type")]
    vif_type: Option<String>,
}

impl ProvisionRequest {
    /// `rpc_device` should already have passed
    /// [`utils::device_detail_valid`]; prefer the factories below.
    pub fn new(
        action: Action,
        rpc_device: DeviceDetail,
        lpar_uuid: impl Into<String>,
        vif_type: Option<VifType>,
    ) -> Self {
        let mac = rpc_device
            .mac_address
            .as_deref()
            .unwrap_or(&rpc_device.device);
        Self {
            action,
            mac_address: utils::norm_mac(mac),
            lpar_uuid: lpar_uuid.into(),
            rpc_device,
            vif_type,
            created_at: Instant::now(),
        }
    }

    pub fn segmentation_id(&self) -> Option<u16> {
        self.rpc_device.segmentation_id
    }

    pub fn physical_network(&self) -> Option<&str> {
        self.rpc_device.physical_network.as_deref()
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > PORT_TIMEOUT
    }

    /// Builds one request per VIF the controller owns a port for.  VIFs
    /// unknown to the controller (management partition, RMC) are skipped.
    pub async fn for_wrappers(
        core: &AgentCore,
        lpar_vifs: &[(Partition, Vec<Vif>)],
        action: Action,
    ) -> Result<Vec<Self>> {
        let macs: Vec<String> = lpar_vifs
            .iter()
            .flat_map(|(_, vifs)| vifs.iter().map(|vif| utils::norm_mac(&vif.mac)))
            .collect();
        if macs.is_empty() {
            return Ok(Vec::new());
        }

        let device_details: HashMap<String, DeviceDetail> = core
            .get_devices_details_list(&macs)
            .await?
            .into_iter()
            .filter_map(|dev| {
                let mac = utils::norm_mac(dev.mac_address.as_deref()?);
                Some((mac, dev))
            })
            .collect();

        let mut ret = Vec::new();
        for (lpar, vifs) in lpar_vifs {
            for vif in vifs {
                let mac = utils::norm_mac(&vif.mac);
                let Some(detail) = device_details.get(&mac) else {
                    continue;
                };
                if !utils::device_detail_valid(detail, &mac) {
                    continue;
                }
                info!(
                    "Creating wrapper-based {} ProvisionRequest for {:?} VIF with MAC {} \
                     associated with LPAR {} ({}).",
                    action, vif.kind, mac, lpar.name, lpar.uuid
                );
                ret.push(Self::new(
                    action,
                    detail.clone(),
                    lpar.uuid.clone(),
                    Some(core.vif_type),
                ));
            }
        }
        Ok(ret)
    }

    /// Builds a request from a custom client event, or `None` if the event
    /// is not for this agent or the controller does not own the port.
    ///
    /// Everything that can be checked locally is checked before the
    /// controller is asked for the port.
    pub async fn for_event(core: &AgentCore, event: &PvmEvent) -> Result<Option<Self>> {
        if event.etype != EventType::CustomClientEvent {
            return Ok(None);
        }
        let Some(detail) = event.detail.as_deref() else {
            return Ok(None);
        };
        let Ok(edetail) = serde_json::from_str::<VifEventDetail>(detail) else {
            return Ok(None);
        };
        if edetail.provider.as_deref() != Some(EVENT_PROVIDER_NOVA_PVM_VIF) {
            return Ok(None);
        }
        if edetail.vif_type.as_deref() != Some(core.vif_type.as_str()) {
            debug!(
                "Ignoring event for VIF type {:?}; this agent handles {}.",
                edetail.vif_type, core.vif_type
            );
            return Ok(None);
        }
        let Some(action) = edetail.action.as_deref().and_then(|a| a.parse::<Action>().ok())
        else {
            debug!("Ignoring event due to unhandled 'action' type. {:?}", event);
            return Ok(None);
        };
        let Some(mac) = edetail.mac.as_deref() else {
            return Ok(None);
        };
        let Some(lpar_uuid) = utils::lpar_uuid_from_uri(&event.data) else {
            debug!("Ignoring event with no LPAR in its URI: {}", event.data);
            return Ok(None);
        };

        let device_detail = core.get_device_details(mac).await?;
        if !utils::device_detail_valid(&device_detail, mac) {
            return Ok(None);
        }

        info!(
            "Creating event-based {} ProvisionRequest for VIF {} with MAC {} associated \
             with LPAR {} and source {}.",
            action, event.data, mac, lpar_uuid, core.vif_type
        );
        Ok(Some(Self::new(
            action,
            device_detail,
            lpar_uuid,
            Some(core.vif_type),
        )))
    }
}

/// Requests gathered while processing one batch of events.
#[derive(Debug, Default, Clone)]
pub struct ProvisionSet {
    requests: HashSet<ProvisionRequest>,
}

impl ProvisionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `req`, replacing any queued request for the same device.
    pub fn upsert(&mut self, req: ProvisionRequest) {
        self.requests.replace(req);
    }

    /// Drops every queued plug in favour of `plugs`.  Queued unplugs stay
    /// as they are: a live listing cannot rediscover removed devices.
    pub fn replace_plugs(&mut self, plugs: impl IntoIterator<Item = ProvisionRequest>) {
        self.requests.retain(|req| req.action != Action::Plug);
        for plug in plugs {
            self.requests.insert(plug);
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProvisionRequest> {
        self.requests.iter()
    }

    pub fn into_vec(self) -> Vec<ProvisionRequest> {
        self.requests.into_iter().collect()
    }
}
