//! Service layer

pub mod agent;
pub mod desired_config;
pub mod reconcile;
pub mod workspace;
