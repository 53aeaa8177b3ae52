//! Reconciliation core for the PowerVM Neutron L2 agents.
//!
//! The agent keeps the VLANs bridged on a PowerVM host in line with the
//! ports Neutron expects there, for Shared Ethernet Adapter (SEA) and
//! SR-IOV backed networking.

pub mod agent;
pub mod config;
pub mod error;
pub mod neutron;
pub mod prov_req;
pub mod pvm;
pub mod queue;
pub mod sim;
pub mod types;
pub mod utils;

#[cfg(test)]
mod test_support;
