//! Infrastructure layer

pub mod agent_repository;
pub mod clock;
pub mod devfile_source;
pub mod sqlite;
pub mod workspace_repository;
