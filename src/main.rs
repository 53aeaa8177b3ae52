//! PowerVM network agent entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use pvm_net_agent::agent;
use pvm_net_agent::config::Config;
use pvm_net_agent::error::AgentError;
use pvm_net_agent::sim::{SimFixture, SimNeutron, SimPowerVm};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Arc::new(Config::load()?);
    info!("Starting PowerVM {} agent with config: {:?}", cfg.agent_type, cfg);

    // Only the simulated backends ship with the agent.
    let fixture_path = cfg.sim_fixture.clone().ok_or(AgentError::NoBackend)?;
    let fixture = SimFixture::load(&fixture_path)?;
    let neutron = Arc::new(SimNeutron::from_fixture(&fixture));
    let pvm = Arc::new(SimPowerVm::from_fixture(fixture));

    let mut running = agent::start(Arc::clone(&cfg), pvm, neutron.clone()).await?;
    neutron.register_callbacks(running.callbacks.clone()).await;

    let loop_result = tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            None
        }
        res = &mut running.main_loop => Some(res),
    };

    running.abort();

    match loop_result {
        Some(Ok(Err(e))) => return Err(e),
        Some(Err(e)) => error!("Reconciliation loop panicked: {}", e),
        Some(Ok(Ok(()))) | None => {}
    }
    info!("Shutdown complete.");
    Ok(())
}
