//! Async VLAN assignment for client adapters behind an SEA.
//!
//! A plug is only complete once the client adapter carries the port's VLAN
//! as its PVID.  The adapter is often created after the port is plugged, so
//! requests sit here and are retried every tick until the adapter shows up
//! or the attempt ceiling is hit.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use super::AgentCore;
use crate::prov_req::ProvisionRequest;
use crate::pvm::{PartitionFilter, VifKind};
use crate::utils;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct UpdateVlanRequest {
    pub p_req: ProvisionRequest,
    pub attempt_count: u32,
}

impl UpdateVlanRequest {
    pub fn new(p_req: ProvisionRequest) -> Self {
        Self {
            p_req,
            attempt_count: 0,
        }
    }
}

/// What one tick did with a request.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Applied,
    Failed,
    Expired,
    /// Not ready yet; does not count as an attempt.
    Waiting,
    /// The adapter was not there; counts as an attempt.
    Missed,
}

pub struct PvidLooper {
    core: Arc<AgentCore>,
    requests: Mutex<Vec<UpdateVlanRequest>>,
}

impl PvidLooper {
    pub fn new(core: Arc<AgentCore>) -> Self {
        Self {
            core,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues `p_req` unless a request for the same device is already queued.
    pub async fn add(&self, p_req: ProvisionRequest) -> bool {
        let mut requests = self.requests.lock().await;
        if requests.iter().any(|r| r.p_req == p_req) {
            debug!("{} is already waiting for its VLAN", p_req);
            return false;
        }
        requests.push(UpdateVlanRequest::new(p_req));
        true
    }

    /// VLANs of every queued request.
    pub async fn pending_vlans(&self) -> BTreeSet<u16> {
        self.requests
            .lock()
            .await
            .iter()
            .filter_map(|r| r.p_req.segmentation_id())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.lock().await.is_empty()
    }

    /// One tick over a snapshot of the queue.
    pub async fn update(&self) -> Result<()> {
        let snapshot = self.requests.lock().await.clone();
        if snapshot.is_empty() {
            return Ok(());
        }

        let lpar_uuids: HashSet<String> = self
            .core
            .pvm
            .list_partitions(&self.core.host_uuid, PartitionFilter::Lpars)
            .await?
            .into_iter()
            .map(|p| p.uuid)
            .collect();

        for req in snapshot {
            let outcome = match self.update_one(&lpar_uuids, &req).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        "Unexpected error updating the PVID for {}; will retry. {:?}",
                        req.p_req, e
                    );
                    Outcome::Waiting
                }
            };
            self.settle(&req.p_req, outcome).await;
        }
        Ok(())
    }

    async fn update_one(
        &self,
        lpar_uuids: &HashSet<String>,
        req: &UpdateVlanRequest,
    ) -> Result<Outcome> {
        let p_req = &req.p_req;
        if !lpar_uuids.contains(&p_req.lpar_uuid) {
            if p_req.is_expired() {
                warn!(
                    "LPAR {} for {} never appeared; dropping the VLAN update.",
                    p_req.lpar_uuid, p_req
                );
                return Ok(Outcome::Expired);
            }
            return Ok(Outcome::Waiting);
        }

        let Some(vlan) = p_req.segmentation_id() else {
            warn!("{} has no segmentation id; nothing to assign.", p_req);
            return Ok(Outcome::Expired);
        };

        let adapters = self
            .core
            .pvm
            .list_vifs(&p_req.lpar_uuid, VifKind::Cna)
            .await?;
        let Some(adapters) = adapters else {
            return Ok(Outcome::Waiting);
        };

        if let Some(cna) = utils::find_cna_for_mac(&p_req.mac_address, &adapters) {
            if cna.pvid != vlan {
                info!(
                    "Setting PVID {} on client adapter {} (was {}).",
                    vlan, p_req.mac_address, cna.pvid
                );
                self.core.pvm.update_adapter_pvid(cna, vlan).await?;
            }
            self.core.update_device_up(&p_req.rpc_device).await?;
            return Ok(Outcome::Applied);
        }

        let attempts = req.attempt_count + 1;
        if attempts >= self.core.config.pvid_update_loops {
            error!(
                "Unable to find client adapter for {} after {} attempts. Requested \
                 PVID {}. Adapters on the LPAR: [{}]",
                p_req,
                attempts,
                vlan,
                adapters
                    .iter()
                    .map(|a| format!("{} (pvid {})", a.mac, a.pvid))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.core.update_device_down(&p_req.rpc_device).await?;
            return Ok(Outcome::Failed);
        }
        Ok(Outcome::Missed)
    }

    /// Writes the tick result back into the live queue.
    async fn settle(&self, p_req: &ProvisionRequest, outcome: Outcome) {
        let mut requests = self.requests.lock().await;
        let Some(pos) = requests.iter().position(|r| r.p_req == *p_req) else {
            return;
        };
        match outcome {
            Outcome::Waiting => {}
            Outcome::Missed => requests[pos].attempt_count += 1,
            Outcome::Applied | Outcome::Failed | Outcome::Expired => {
                requests.remove(pos);
            }
        }
    }

    pub async fn looping_call(self: Arc<Self>) {
        loop {
            if let Err(e) = self.update().await {
                error!("PVID update loop failed: {:?}", e);
            }
            tokio::time::sleep(TICK).await;
        }
    }
}
