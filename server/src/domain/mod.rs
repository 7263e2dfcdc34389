//! Domain layer

pub mod agent;
pub mod devfile;
pub mod reconcile;
pub mod schedule;
pub mod state;
pub mod workspace;
