//! Resources owned by other controllers, read but never written by the manager

pub mod cert_manager;
pub mod metrics;
