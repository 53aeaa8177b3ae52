//! Consolidation of hypervisor event batches into provisioning requests.

use anyhow::Result;
use log::{debug, info};

use super::{attempt_provision, NetworkAgent};
use crate::prov_req::{ProvisionRequest, ProvisionSet};
use crate::pvm::PvmEvent;
use crate::types::Action;

/// Outcome of consolidating one batch.
#[derive(Debug, Default)]
pub struct Consolidated {
    pub requests: ProvisionSet,
    /// Whether a heal-and-optimize pass should run before provisioning.
    pub heal: bool,
}

#[derive(Debug)]
pub struct VifEventHandler {
    first_batch: bool,
}

impl Default for VifEventHandler {
    fn default() -> Self {
        Self { first_batch: true }
    }
}

impl VifEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `events` into one request set, in delivery order.
    pub async fn consolidate(
        &mut self,
        agent: &dyn NetworkAgent,
        events: &[PvmEvent],
    ) -> Result<Consolidated> {
        let core = agent.core();
        let skip_refetch = std::mem::replace(&mut self.first_batch, false);
        let mut out = Consolidated::default();

        for event in events {
            if event.etype.is_full_refetch() {
                if skip_refetch {
                    debug!(
                        "Skipping {:?} on the first batch; the startup heal covers it.",
                        event.etype
                    );
                } else {
                    // Listed afresh each time: adapters created since an
                    // earlier refetch in this batch must not be dropped.
                    info!("Full refetch requested by {:?}; listing every VIF.", event.etype);
                    let lpar_vifs = core.client_vifs(agent.vif_kind()).await?;
                    let plugs =
                        ProvisionRequest::for_wrappers(core, &lpar_vifs, Action::Plug).await?;
                    out.requests.replace_plugs(plugs);
                }
            } else if let Some(p_req) = ProvisionRequest::for_event(core, event).await? {
                out.requests.upsert(p_req);
            }

            if agent.is_hao_event(event) {
                out.heal = true;
            }
        }
        Ok(out)
    }

    /// Consolidates `events`, heals once if any of them asked for it, then
    /// provisions the result.  Provisioning runs even for an empty set.
    pub async fn process(&mut self, agent: &dyn NetworkAgent, events: &[PvmEvent]) -> Result<()> {
        let Consolidated { requests, heal } = self.consolidate(agent, events).await?;
        if heal {
            info!("Event batch requires a heal and optimize pass.");
            agent.heal_and_optimize().await?;
        }
        let requests = requests.into_vec();
        attempt_provision(agent, &requests).await
    }
}
