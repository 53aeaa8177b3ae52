//! Boundary to the PowerVM management API.
//!
//! Entities are resolved into plain structs by the client implementation,
//! so nothing past this module has to guess which attributes a partition or
//! adapter carries.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Lpar,
    Vios,
    /// The management partition.  It is an LPAR, but never a client VM.
    Management,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub uuid: String,
    pub name: String,
    pub kind: PartitionKind,
}

impl Partition {
    pub fn is_mgmt_partition(&self) -> bool {
        self.kind == PartitionKind::Management
    }
}

/// Which partitions a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFilter {
    /// Client LPARs, including the management partition.
    Lpars,
    Vioses,
}

impl PartitionFilter {
    pub fn matches(&self, kind: PartitionKind) -> bool {
        match self {
            PartitionFilter::Lpars => kind != PartitionKind::Vios,
            PartitionFilter::Vioses => kind == PartitionKind::Vios,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VifKind {
    /// Client network adapter, bridged through an SEA.
    Cna,
    /// SR-IOV backed virtual NIC.
    Vnic,
}

/// A virtual network interface on a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vif {
    pub uuid: String,
    /// MAC in API form (`AABBCCDDEEFF`).
    pub mac: String,
    pub pvid: u16,
    #[serde(default)]
    pub tagged_vlans: Vec<u16>,
    #[serde(default)]
    pub vswitch_id: u32,
    #[serde(default)]
    pub is_trunk: bool,
    pub kind: VifKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadGroup {
    pub pvid: u16,
    #[serde(default)]
    pub tagged_vlans: Vec<u16>,
}

impl LoadGroup {
    pub fn vlans(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.pvid).chain(self.tagged_vlans.iter().copied())
    }
}

/// A shared ethernet adapter backing a network bridge on one VIOS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedEthernetAdapter {
    pub dev_name: String,
    pub vios_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBridge {
    pub uuid: String,
    pub vswitch_id: u32,
    /// The first load group is the primary one; its VLANs are never removed.
    pub load_groups: Vec<LoadGroup>,
    #[serde(default)]
    pub seas: Vec<SharedEthernetAdapter>,
}

impl NetworkBridge {
    pub fn primary_load_group(&self) -> Option<&LoadGroup> {
        self.load_groups.first()
    }

    /// Every VLAN currently bridged.  The PVIDs of the additional load
    /// groups are arbitrary placeholders and are not included.
    pub fn list_vlans(&self) -> BTreeSet<u16> {
        let primary = self.primary_load_group().map(|lg| lg.pvid);
        primary
            .into_iter()
            .chain(
                self.load_groups
                    .iter()
                    .flat_map(|lg| lg.tagged_vlans.iter().copied()),
            )
            .collect()
    }

    pub fn supports_vlan(&self, vlan: u16) -> bool {
        self.primary_load_group().is_some_and(|lg| lg.pvid == vlan)
            || self
                .load_groups
                .iter()
                .any(|lg| lg.tagged_vlans.contains(&vlan))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SriovPhysicalPort {
    pub loc_code: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    CacheCleared,
    MissingEvents,
    NewClient,
    AddUri,
    ModifyUri,
    InvalidUri,
    HiddenUri,
    VisibleUri,
    DeleteUri,
    CustomClientEvent,
}

impl EventType {
    /// Events after which the client must assume it lost track of state and
    /// rescan everything.
    pub fn is_full_refetch(&self) -> bool {
        matches!(
            self,
            EventType::CacheCleared | EventType::MissingEvents | EventType::NewClient
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvmEvent {
    pub etype: EventType,
    /// Usually the URI of the object the event is about.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl PvmEvent {
    pub fn new(etype: EventType, data: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            etype,
            data: data.into(),
            detail,
        }
    }
}

#[async_trait]
pub trait PowerVm: Send + Sync {
    /// UUIDs of every managed system visible to the API.
    async fn host_uuids(&self) -> Result<Vec<String>>;

    async fn list_partitions(&self, host_uuid: &str, filter: PartitionFilter)
        -> Result<Vec<Partition>>;

    /// VIFs of one kind on a partition, or `None` when the partition no
    /// longer exists.
    async fn list_vifs(&self, partition_uuid: &str, kind: VifKind) -> Result<Option<Vec<Vif>>>;

    async fn list_bridges(&self, host_uuid: &str) -> Result<Vec<NetworkBridge>>;

    /// Makes sure all of `vlans` are bridged by `bridge_uuid` in one call.
    async fn ensure_vlans_on_bridge(&self, bridge_uuid: &str, vlans: &BTreeSet<u16>)
        -> Result<()>;

    async fn remove_vlan_from_bridge(&self, bridge_uuid: &str, vlan: u16) -> Result<()>;

    /// Sets the PVID of a client adapter, refreshing and retrying on a stale
    /// etag internally.
    async fn update_adapter_pvid(&self, adapter: &Vif, vlan: u16) -> Result<()>;

    async fn list_sriov_physical_ports(&self, host_uuid: &str) -> Result<Vec<SriovPhysicalPort>>;

    /// Subscribe to the API event stream.  Batches are sent to `event_tx`
    /// until the receiver goes away.
    async fn listen(&self, event_tx: mpsc::Sender<Vec<PvmEvent>>) -> Result<()>;
}
