//! Helpers for talking to the management API and matching its view of the
//! system against the controller's.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use log::{debug, warn};

use crate::error::AgentError;
use crate::neutron::DeviceDetail;
use crate::pvm::{
    NetworkBridge, Partition, PartitionFilter, PowerVm, SriovPhysicalPort, Vif, VifKind,
};

/// Label assumed for SR-IOV physical ports that carry none.
pub const DEFAULT_PHYSNET: &str = "default";

/// Converts an API MAC (`AABBCCDDEEFF`) into controller form
/// (`aa:bb:cc:dd:ee:ff`).  Already-normalized input comes back unchanged.
pub fn norm_mac(mac: &str) -> String {
    let raw: Vec<char> = mac
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    raw.chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

/// The inverse of [`norm_mac`].
pub fn sanitize_mac_for_api(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Whether the controller actually owns a port for `mac`.
pub fn device_detail_valid(detail: &DeviceDetail, mac: &str) -> bool {
    match detail.mac_address.as_deref() {
        None | Some("") => {
            debug!(
                "Ignoring device {}: the controller has no port for it.",
                mac
            );
            false
        }
        Some(found) if norm_mac(found) != norm_mac(mac) => {
            warn!(
                "Ignoring device {}: the controller returned details for {}.",
                mac, found
            );
            false
        }
        Some(_) => true,
    }
}

fn is_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Converts an OpenStack instance UUID into PowerVM form.  PowerVM reserves
/// the high bit of the first byte, so the first hex digit is masked with 7.
pub fn convert_uuid_to_pvm(uuid: &str) -> String {
    let mut chars = uuid.chars();
    match chars.next().and_then(|c| c.to_digit(16)) {
        Some(first) => format!("{:x}{}", first & 7, chars.as_str()).to_uppercase(),
        None => uuid.to_uppercase(),
    }
}

/// Pulls the owning LPAR UUID out of an event URI such as
/// `.../LogicalPartition/<lpar>/VirtualNICDedicated/<vnic>`.
///
/// Falls back to the first UUID in the path when no `LogicalPartition`
/// segment is present.
pub fn lpar_uuid_from_uri(uri: &str) -> Option<String> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    segments
        .windows(2)
        .find(|pair| pair[0] == "LogicalPartition" && is_uuid(pair[1]))
        .map(|pair| pair[1].to_string())
        .or_else(|| {
            segments
                .iter()
                .find(|s| is_uuid(s))
                .map(|s| s.to_string())
        })
}

/// Resolves the single managed system this agent runs against.
pub async fn get_host_uuid(pvm: &dyn PowerVm) -> Result<String> {
    let mut hosts = pvm.host_uuids().await.context("listing managed systems")?;
    if hosts.len() != 1 {
        return Err(AgentError::MultipleHostsFound { count: hosts.len() }.into());
    }
    Ok(hosts.remove(0))
}

/// Parses `<physnet>:<sea device>:<vios name>,...` into a map of physical
/// network to network bridge UUID.
///
/// With an empty mapping and exactly one bridge on the host, `default` is
/// mapped to that bridge.
pub async fn parse_sea_mappings(
    pvm: &dyn PowerVm,
    host_uuid: &str,
    mapping: &str,
) -> Result<BTreeMap<String, String>> {
    let bridges = pvm.list_bridges(host_uuid).await?;
    if bridges.is_empty() {
        return Err(AgentError::NoNetworkBridges.into());
    }

    if mapping.trim().is_empty() {
        return Ok(parse_empty_bridge_mapping(&bridges)?);
    }

    let vioses = pvm
        .list_partitions(host_uuid, PartitionFilter::Vioses)
        .await?;

    let mut resp = BTreeMap::new();
    for trio in mapping.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let keys: Vec<&str> = trio.split(':').map(str::trim).collect();
        let &[phys_net, dev_name, vios_name] = keys.as_slice() else {
            return Err(AgentError::InvalidBridgeMapping(trio.to_string()).into());
        };

        let not_found = || AgentError::DeviceNotFound {
            dev: dev_name.to_string(),
            vios: vios_name.to_string(),
            phys_net: phys_net.to_string(),
        };

        let vios = vioses
            .iter()
            .find(|v| v.name == vios_name)
            .ok_or_else(not_found)?;

        let bridge = bridges
            .iter()
            .find(|nb| {
                nb.seas
                    .iter()
                    .any(|sea| sea.dev_name == dev_name && sea.vios_uuid == vios.uuid)
            })
            .ok_or_else(not_found)?;

        resp.insert(phys_net.to_string(), bridge.uuid.clone());
    }
    Ok(resp)
}

fn parse_empty_bridge_mapping(
    bridges: &[NetworkBridge],
) -> Result<BTreeMap<String, String>, AgentError> {
    match bridges {
        [only] => {
            warn!(
                "The bridge_mappings for the agent was not specified. There was exactly \
                 one Network Bridge on the system. Agent is assuming the default network \
                 is backed by the single Network Bridge."
            );
            Ok(BTreeMap::from([(DEFAULT_PHYSNET.to_string(), only.uuid.clone())]))
        }
        _ => Err(AgentError::MultiBridgeNoMapping),
    }
}

/// Groups SR-IOV physical port location codes by their label.
pub fn parse_sriov_mappings(ports: &[SriovPhysicalPort]) -> BTreeMap<String, Vec<String>> {
    let mut mapping: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for port in ports {
        let label = match port.label.as_deref() {
            Some(label) if !label.is_empty() => label,
            _ => DEFAULT_PHYSNET,
        };
        mapping
            .entry(label.to_string())
            .or_default()
            .push(port.loc_code.clone());
    }
    mapping
}

pub fn find_cna_for_mac<'a>(mac: &str, adapters: &'a [Vif]) -> Option<&'a Vif> {
    let mac = sanitize_mac_for_api(mac);
    adapters
        .iter()
        .find(|vif| sanitize_mac_for_api(&vif.mac) == mac)
}

/// The network bridge (if any) serving a client adapter: same vswitch, and
/// the adapter's PVID is bridged.
pub fn find_nb_for_vif<'a>(bridges: &'a [NetworkBridge], vif: &Vif) -> Option<&'a NetworkBridge> {
    bridges
        .iter()
        .find(|nb| nb.vswitch_id == vif.vswitch_id && nb.supports_vlan(vif.pvid))
}

/// Lists the VIFs of `kind` on each partition concurrently.  Partitions that
/// disappear between the two calls are left out.
pub async fn list_vifs_by_partition(
    pvm: &dyn PowerVm,
    partitions: Vec<Partition>,
    kind: VifKind,
) -> Result<Vec<(Partition, Vec<Vif>)>> {
    let listings = try_join_all(partitions.into_iter().map(|part| async move {
        let vifs = pvm
            .list_vifs(&part.uuid, kind)
            .await
            .with_context(|| format!("listing adapters of partition {}", part.uuid))?;
        Ok::<_, anyhow::Error>(vifs.map(|vifs| (part, vifs)))
    }))
    .await?;
    Ok(listings.into_iter().flatten().collect())
}
