//! Control plane for RPaaS proxy instances.
//!
//! The [`manager::InstanceManager`] mediates every change to an `RpaasInstance` and the
//! objects derived from it. All cluster access goes through [`gateway::Gateway`].

pub mod config;
pub mod crd;
pub mod error;
pub mod external_crd;
pub mod gateway;
pub mod labels;
pub mod manager;
pub mod tls;
pub mod validation;
