//! The main reconciliation loop.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use super::event::VifEventHandler;
use super::{attempt_provision, NetworkAgent};
use crate::pvm::PvmEvent;
use crate::types::LoopMode;

pub struct Reconciler {
    agent: Arc<dyn NetworkAgent>,
    /// Event batches from the listener.  `None` in polling mode, or once the
    /// listener has gone away.
    events: Option<mpsc::Receiver<Vec<PvmEvent>>>,
    handler: VifEventHandler,
    last_heal: Option<Instant>,
    consecutive_failures: u32,
}

impl Reconciler {
    pub fn new(agent: Arc<dyn NetworkAgent>, events: mpsc::Receiver<Vec<PvmEvent>>) -> Self {
        let events = (agent.core().config.loop_mode == LoopMode::EventDriven).then_some(events);
        Self {
            agent,
            events,
            handler: VifEventHandler::new(),
            last_heal: None,
            consecutive_failures: 0,
        }
    }

    /// Runs until `max_consecutive_failures` iterations in a row fail, or
    /// forever when no limit is configured.
    pub async fn run(mut self) -> Result<()> {
        let config = Arc::clone(&self.agent.core().config);
        info!("Reconciliation loop started in {:?} mode", config.loop_mode);
        loop {
            match self.iteration().await {
                Ok(()) => self.consecutive_failures = 0,
                Err(e) => {
                    self.consecutive_failures += 1;
                    error!("{:?}", e);
                    if let Some(max) = config.max_consecutive_failures {
                        if self.consecutive_failures >= max {
                            error!(
                                "{} consecutive failures; the agent is giving up.",
                                self.consecutive_failures
                            );
                            return Err(e);
                        }
                    }
                    warn!("Error has been encountered and logged. The agent will retry again.");
                    tokio::time::sleep(config.exception_interval()).await;
                }
            }
        }
    }

    async fn iteration(&mut self) -> Result<()> {
        self.heal_if_due().await?;
        self.drain_events().await?;
        self.provision_updated_ports().await
    }

    async fn heal_if_due(&mut self) -> Result<()> {
        let interval = self.agent.core().config.heal_and_optimize_interval();
        let due = self.last_heal.map_or(true, |at| at.elapsed() >= interval);
        if due {
            self.agent.heal_and_optimize().await?;
            self.last_heal = Some(Instant::now());
        }
        Ok(())
    }

    /// Waits up to one polling interval for an event batch and processes it.
    async fn drain_events(&mut self) -> Result<()> {
        let polling = self.agent.core().config.polling_interval();
        let next = match self.events.as_mut() {
            Some(rx) => tokio::select! {
                batch = rx.recv() => Some(batch),
                _ = tokio::time::sleep(polling) => None,
            },
            None => {
                tokio::time::sleep(polling).await;
                None
            }
        };

        match next {
            Some(Some(batch)) => {
                debug!("Processing a batch of {} events", batch.len());
                self.handler.process(self.agent.as_ref(), &batch).await?;
            }
            Some(None) => {
                warn!("The event listener has stopped; continuing with polling only.");
                self.events = None;
            }
            None => {}
        }
        Ok(())
    }

    async fn provision_updated_ports(&self) -> Result<()> {
        let requests = self.agent.core().build_prov_requests_from_neutron().await?;
        if requests.is_empty() {
            return Ok(());
        }
        info!("Provisioning {} ports updated by Neutron", requests.len());
        attempt_provision(self.agent.as_ref(), &requests).await
    }
}
