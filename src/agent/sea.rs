//! Shared Ethernet Adapter backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};

use super::pvid::PvidLooper;
use super::{attempt_provision, AgentCore, NetworkAgent};
use crate::prov_req::ProvisionRequest;
use crate::pvm::{NetworkBridge, Partition, PartitionFilter, Vif, VifKind};
use crate::types::Action;
use crate::utils;

/// Upper bound on bridge VLAN removals in one heal pass.  Each removal is a
/// blocking call on the bridge; anything beyond this waits for the next pass.
pub const MAX_VLAN_REMOVALS_PER_PASS: usize = 3;

pub struct SeaAgent {
    core: Arc<AgentCore>,
    /// Physical network to network bridge UUID.
    br_map: BTreeMap<String, String>,
    pvid_updater: Arc<PvidLooper>,
}

impl SeaAgent {
    pub async fn new(core: Arc<AgentCore>) -> Result<Self> {
        let br_map = utils::parse_sea_mappings(
            core.pvm.as_ref(),
            &core.host_uuid,
            &core.config.bridge_mappings,
        )
        .await?;
        core.set_configuration("bridge_mappings", serde_json::json!(br_map))
            .await;

        Ok(Self {
            pvid_updater: Arc::new(PvidLooper::new(Arc::clone(&core))),
            core,
            br_map,
        })
    }

    pub fn pvid_updater(&self) -> Arc<PvidLooper> {
        Arc::clone(&self.pvid_updater)
    }

    /// The bridge and VLAN a request lands on, if its physical network is
    /// mapped.
    fn get_nb_and_vlan(&self, p_req: &ProvisionRequest) -> Option<(String, u16)> {
        let physnet = p_req.physical_network()?;
        let nb_uuid = self.br_map.get(physnet)?;
        Some((nb_uuid.clone(), p_req.segmentation_id()?))
    }

    /// Every CNA whose VLANs have to stay bridged: the already listed
    /// client adapters plus those of the management partition and the
    /// non-trunk adapters of each VIOS.
    async fn adapters_in_use(&self, client_vifs: &[(Partition, Vec<Vif>)]) -> Result<Vec<Vif>> {
        let pvm = self.core.pvm.as_ref();
        let host = &self.core.host_uuid;

        let mgmt: Vec<Partition> = pvm
            .list_partitions(host, PartitionFilter::Lpars)
            .await?
            .into_iter()
            .filter(|p| p.is_mgmt_partition())
            .collect();
        let vioses = pvm.list_partitions(host, PartitionFilter::Vioses).await?;

        let mut adapters: Vec<Vif> = client_vifs
            .iter()
            .flat_map(|(_, vifs)| vifs.iter().cloned())
            .collect();
        adapters.extend(
            utils::list_vifs_by_partition(pvm, mgmt, VifKind::Cna)
                .await?
                .into_iter()
                .flat_map(|(_, vifs)| vifs),
        );
        adapters.extend(
            utils::list_vifs_by_partition(pvm, vioses, VifKind::Cna)
                .await?
                .into_iter()
                .flat_map(|(_, vifs)| vifs)
                .filter(|vif| !vif.is_trunk),
        );
        Ok(adapters)
    }
}

/// VLANs each bridge must keep: its primary load group, the VLANs of
/// `requests` mapped onto it, the PVIDs and tagged VLANs of `adapters` it
/// serves, and `pending`.
pub fn required_vlans(
    bridges: &[NetworkBridge],
    br_map: &BTreeMap<String, String>,
    requests: &[ProvisionRequest],
    adapters: &[Vif],
    pending: &BTreeSet<u16>,
) -> BTreeMap<String, BTreeSet<u16>> {
    let mut required = BTreeMap::new();
    for nb in bridges {
        let mut vlans: BTreeSet<u16> = pending.clone();
        if let Some(primary) = nb.primary_load_group() {
            vlans.extend(primary.vlans());
        }
        for p_req in requests {
            let mapped = p_req
                .physical_network()
                .and_then(|physnet| br_map.get(physnet));
            if mapped == Some(&nb.uuid) {
                vlans.extend(p_req.segmentation_id());
            }
        }
        required.insert(nb.uuid.clone(), vlans);
    }
    for vif in adapters {
        let Some(nb) = utils::find_nb_for_vif(bridges, vif) else {
            continue;
        };
        if let Some(vlans) = required.get_mut(&nb.uuid) {
            vlans.insert(vif.pvid);
            vlans.extend(vif.tagged_vlans.iter().copied());
        }
    }
    required
}

/// Surplus VLANs to strip this pass, at most `cap` across all bridges, and
/// how many were left for a later pass.
pub fn vlans_to_remove(
    bridges: &[NetworkBridge],
    required: &BTreeMap<String, BTreeSet<u16>>,
    cap: usize,
) -> (Vec<(String, u16)>, usize) {
    let empty = BTreeSet::new();
    let mut surplus = Vec::new();
    for nb in bridges {
        let keep = required.get(&nb.uuid).unwrap_or(&empty);
        let primary: BTreeSet<u16> = nb
            .primary_load_group()
            .map(|lg| lg.vlans().collect())
            .unwrap_or_default();
        surplus.extend(
            nb.list_vlans()
                .into_iter()
                .filter(|vlan| !keep.contains(vlan) && !primary.contains(vlan))
                .map(|vlan| (nb.uuid.clone(), vlan)),
        );
    }
    let deferred = surplus.len().saturating_sub(cap);
    surplus.truncate(cap);
    (surplus, deferred)
}

#[async_trait]
impl NetworkAgent for SeaAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn vif_kind(&self) -> VifKind {
        VifKind::Cna
    }

    async fn heal_and_optimize(&self) -> Result<()> {
        debug!("Running heal and optimize for the Shared Ethernet Adapter agent");
        // Taken before any listing: a request the looper settles mid-pass
        // is then either still pending here or already in the listing.
        let pending = self.pvid_updater.pending_vlans().await;
        let client_vifs = self.core.client_vifs(VifKind::Cna).await?;
        let requests =
            ProvisionRequest::for_wrappers(&self.core, &client_vifs, Action::Plug).await?;
        self.core.set_device_count(requests.len());

        attempt_provision(self, &requests).await?;

        if !self.core.config.automated_powervm_vlan_cleanup {
            return Ok(());
        }

        let adapters = self.adapters_in_use(&client_vifs).await?;
        let bridges = self.core.pvm.list_bridges(&self.core.host_uuid).await?;
        let required = required_vlans(&bridges, &self.br_map, &requests, &adapters, &pending);

        let (removals, deferred) =
            vlans_to_remove(&bridges, &required, MAX_VLAN_REMOVALS_PER_PASS);
        for (nb_uuid, vlan) in removals {
            warn!(
                "Cleaning up VLAN {} from the system. It is no longer in use by any \
                 adapter on network bridge {}.",
                vlan, nb_uuid
            );
            self.core.pvm.remove_vlan_from_bridge(&nb_uuid, vlan).await?;
        }
        if deferred > 0 {
            info!(
                "{} more unused VLANs will be removed in a later heal pass.",
                deferred
            );
        }
        Ok(())
    }

    async fn provision_devices(&self, requests: &[ProvisionRequest]) -> Result<()> {
        let mut nb_to_vlan: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
        let mut resolved = Vec::with_capacity(requests.len());
        for p_req in requests {
            let Some((nb_uuid, vlan)) = self.get_nb_and_vlan(p_req) else {
                warn!(
                    "Unable to determine the network bridge for {} on physical network \
                     {:?}; check bridge_mappings.",
                    p_req,
                    p_req.physical_network()
                );
                continue;
            };
            if p_req.action == Action::Plug {
                nb_to_vlan.entry(nb_uuid).or_default().insert(vlan);
            }
            resolved.push(p_req);
        }

        for (nb_uuid, vlans) in &nb_to_vlan {
            info!("Ensuring VLANs {:?} on network bridge {}", vlans, nb_uuid);
            self.core.pvm.ensure_vlans_on_bridge(nb_uuid, vlans).await?;
        }

        // Unplugs first: a failed report must not leave plugs in the looper.
        for p_req in resolved.iter().filter(|r| r.action == Action::Unplug) {
            self.core.update_device_down(&p_req.rpc_device).await?;
        }
        for p_req in resolved.into_iter().filter(|r| r.action == Action::Plug) {
            self.pvid_updater.add(p_req.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvm::LoadGroup;
    use crate::test_support::{
        self, harness, hooked_harness, port, After, LPAR1, LPAR2, MAC1, MAC2, MGMT, NB1, VIOS1,
    };
    use crate::types::VifType;

    async fn sea_harness() -> (test_support::Harness, SeaAgent) {
        let h = harness(test_support::sea_fixture(), test_support::config(VifType::Sea)).await;
        let agent = SeaAgent::new(Arc::clone(&h.core)).await.unwrap();
        (h, agent)
    }

    fn req(action: Action, mac: &str, lpar: &str, vlan: u16, physnet: &str) -> ProvisionRequest {
        ProvisionRequest::new(action, port(mac, vlan, physnet), lpar, None)
    }

    fn bridge_with_surplus(surplus: Vec<u16>) -> NetworkBridge {
        let mut nb = test_support::bridge(NB1, 1, vec![10, 11]);
        nb.load_groups.push(LoadGroup {
            pvid: 4094,
            tagged_vlans: surplus,
        });
        nb
    }

    #[tokio::test]
    async fn single_bridge_becomes_default_mapping() {
        let (h, agent) = sea_harness().await;
        assert_eq!(agent.br_map["default"], NB1);
        let state = h.core.agent_state().await;
        assert_eq!(state.configurations["bridge_mappings"]["default"], NB1);
    }

    #[tokio::test]
    async fn plugs_share_one_ensure_per_bridge() {
        let (h, agent) = sea_harness().await;
        let reqs = vec![
            req(Action::Plug, MAC1, LPAR1, 100, "default"),
            req(Action::Plug, MAC2, LPAR2, 200, "default"),
            req(Action::Plug, "fa:16:3e:00:00:03", LPAR2, 100, "default"),
        ];

        agent.provision_devices(&reqs).await.unwrap();

        assert_eq!(
            h.pvm.ensure_calls().await,
            vec![(NB1.to_string(), BTreeSet::from([100, 200]))]
        );
        assert_eq!(agent.pvid_updater.len().await, 3);
        assert!(h.neutron.devices_up().await.is_empty());
    }

    #[tokio::test]
    async fn unmapped_network_is_skipped_and_unplug_goes_down() {
        let (h, agent) = sea_harness().await;
        let reqs = vec![
            req(Action::Plug, MAC1, LPAR1, 100, "nowhere"),
            req(Action::Unplug, MAC2, LPAR2, 200, "default"),
        ];

        agent.provision_devices(&reqs).await.unwrap();

        assert!(h.pvm.ensure_calls().await.is_empty());
        assert!(agent.pvid_updater.is_empty().await);
        assert_eq!(h.neutron.devices_down().await, vec![MAC2.to_string()]);
    }

    #[tokio::test]
    async fn failed_ensure_marks_whole_batch_down() {
        let (h, agent) = sea_harness().await;
        h.pvm.set_fail_ensure(true).await;
        let reqs = vec![
            req(Action::Plug, MAC1, LPAR1, 100, "default"),
            req(Action::Plug, MAC2, LPAR2, 200, "default"),
            req(Action::Plug, "fa:16:3e:00:00:03", LPAR2, 300, "default"),
        ];

        assert!(attempt_provision(&agent, &reqs).await.is_err());

        assert_eq!(h.pvm.ensure_calls().await.len(), 1);
        assert_eq!(h.neutron.devices_down().await.len(), 3);
        assert!(h.neutron.devices_up().await.is_empty());
        assert!(agent.pvid_updater.is_empty().await);
    }

    #[test]
    fn removals_are_capped_per_pass() {
        let bridges = vec![bridge_with_surplus(vec![500, 501, 502, 503, 504])];
        let required = required_vlans(
            &bridges,
            &BTreeMap::new(),
            &[],
            &[],
            &BTreeSet::new(),
        );

        let (removals, deferred) =
            vlans_to_remove(&bridges, &required, MAX_VLAN_REMOVALS_PER_PASS);
        assert_eq!(
            removals,
            vec![
                (NB1.to_string(), 500),
                (NB1.to_string(), 501),
                (NB1.to_string(), 502)
            ]
        );
        assert_eq!(deferred, 2);
    }

    #[test]
    fn primary_load_group_is_never_removed() {
        let bridges = vec![bridge_with_surplus(vec![])];
        // Nothing is required, not even the primary VLANs.
        let required = BTreeMap::from([(NB1.to_string(), BTreeSet::new())]);
        let (removals, deferred) = vlans_to_remove(&bridges, &required, 10);
        assert!(removals.is_empty());
        assert_eq!(deferred, 0);
    }

    #[test]
    fn required_vlans_cover_requests_adapters_and_pending() {
        let bridges = vec![bridge_with_surplus(vec![100, 200, 300, 400, 500])];
        let br_map = BTreeMap::from([("default".to_string(), NB1.to_string())]);
        let reqs = vec![req(Action::Plug, MAC1, LPAR1, 100, "default")];
        let mut tagged = test_support::cna("AE:00:00:00:00:0B", 200);
        tagged.tagged_vlans = vec![300];
        let mut elsewhere = test_support::cna("AE:00:00:00:00:0C", 500);
        elsewhere.vswitch_id = 1;

        let required = required_vlans(
            &bridges,
            &br_map,
            &reqs,
            &[tagged, elsewhere],
            &BTreeSet::from([400]),
        );
        assert_eq!(
            required[NB1],
            BTreeSet::from([1, 10, 11, 100, 200, 300, 400])
        );
        let (removals, _) = vlans_to_remove(&bridges, &required, 3);
        assert_eq!(removals, vec![(NB1.to_string(), 500)]);
    }

    #[tokio::test]
    async fn heal_plugs_owned_ports_and_trims_surplus() {
        let mut fixture = test_support::sea_fixture();
        fixture.bridges = vec![bridge_with_surplus(vec![100, 600, 601, 602, 603])];
        let h = harness(fixture, test_support::config(VifType::Sea)).await;
        let agent = SeaAgent::new(Arc::clone(&h.core)).await.unwrap();

        agent.heal_and_optimize().await.unwrap();

        // Owned ports on both LPARs; the management RMC adapter is unknown.
        assert_eq!(
            h.pvm.ensure_calls().await,
            vec![(NB1.to_string(), BTreeSet::from([100, 200]))]
        );
        assert_eq!(agent.pvid_updater.len().await, 2);
        assert_eq!(
            h.pvm.removals().await,
            vec![
                (NB1.to_string(), 600),
                (NB1.to_string(), 601),
                (NB1.to_string(), 602)
            ]
        );
        let nb = h.pvm.bridge(NB1).await.unwrap();
        assert!(nb.supports_vlan(603));
        assert!(nb.supports_vlan(100) && nb.supports_vlan(200));

        agent.heal_and_optimize().await.unwrap();
        assert_eq!(h.pvm.removals().await.len(), 4);
        assert!(!h.pvm.bridge(NB1).await.unwrap().supports_vlan(603));
    }

    #[tokio::test]
    async fn cleanup_can_be_disabled() {
        let mut fixture = test_support::sea_fixture();
        fixture.bridges = vec![bridge_with_surplus(vec![600])];
        let mut config = test_support::config(VifType::Sea);
        config.automated_powervm_vlan_cleanup = false;
        let h = harness(fixture, config).await;
        let agent = SeaAgent::new(Arc::clone(&h.core)).await.unwrap();

        agent.heal_and_optimize().await.unwrap();

        assert_eq!(h.pvm.ensure_calls().await.len(), 1);
        assert!(h.pvm.removals().await.is_empty());
    }

    #[test]
    fn adapter_on_unbridged_pvid_keeps_nothing() {
        let bridges = vec![bridge_with_surplus(vec![600])];
        let mut internal = test_support::cna("AE:00:00:00:00:0D", 300);
        internal.tagged_vlans = vec![600];

        let required = required_vlans(
            &bridges,
            &BTreeMap::new(),
            &[],
            &[internal],
            &BTreeSet::new(),
        );
        assert_eq!(required[NB1], BTreeSet::from([1, 10, 11]));
    }

    #[tokio::test]
    async fn vlan_of_plug_settled_mid_heal_is_kept() {
        let late_mac = "fa:16:3e:00:00:07";
        let mut fixture = test_support::sea_fixture();
        fixture.bridges = vec![bridge_with_surplus(vec![700])];
        fixture.ports.push(port(late_mac, 700, "default"));
        let (h, hooked) = hooked_harness(fixture, test_support::config(VifType::Sea)).await;
        let agent = SeaAgent::new(Arc::clone(&h.core)).await.unwrap();
        let looper = agent.pvid_updater();
        looper
            .add(req(Action::Plug, late_mac, LPAR1, 700, "default"))
            .await;

        // The adapter appears and the looper settles its plug after the
        // client adapters were listed.
        let sim = Arc::clone(&h.pvm);
        let ticking = Arc::clone(&looper);
        hooked
            .after(
                After::ListVioses,
                Box::new(move || {
                    Box::pin(async move {
                        sim.add_vif(LPAR1, test_support::cna(late_mac, 1))
                            .await
                            .unwrap();
                        ticking.update().await.unwrap();
                    })
                }),
            )
            .await;

        agent.heal_and_optimize().await.unwrap();

        assert!(h.neutron.devices_up().await.iter().any(|d| d == late_mac));
        assert!(!h.pvm.removals().await.contains(&(NB1.to_string(), 700)));
        assert!(h.pvm.bridge(NB1).await.unwrap().supports_vlan(700));
    }

    #[tokio::test]
    async fn heal_lists_each_partition_once() {
        let (h, agent) = sea_harness().await;

        agent.heal_and_optimize().await.unwrap();

        let mut listed = h.pvm.vif_listings().await;
        listed.sort();
        let mut expected: Vec<String> = [VIOS1, MGMT, LPAR1, LPAR2]
            .iter()
            .map(|uuid| uuid.to_string())
            .collect();
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn failed_unplug_report_leaves_no_plug_queued() {
        let (h, agent) = sea_harness().await;
        h.neutron.set_fail_down(true).await;
        let reqs = vec![
            req(Action::Plug, MAC1, LPAR1, 100, "default"),
            req(Action::Unplug, MAC2, LPAR2, 200, "default"),
        ];

        assert!(attempt_provision(&agent, &reqs).await.is_err());

        assert!(agent.pvid_updater.is_empty().await);
        assert!(h.neutron.devices_up().await.is_empty());
    }
}
