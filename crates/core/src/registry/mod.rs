//! Configuration registry: owns the running pipeline engines of a database.
//!
//! The registry turns the database record into a running set:
//! - **Validation**: invalid configurations raise alerts and are skipped
//! - **Ownership**: only tasks this node owns get an engine
//! - **Notifications**: storage changes are fanned out to every engine

mod manager;
mod types;
mod validate;

pub use manager::PipelineRegistry;
pub use types::{RegistryContext, RegistryError};
pub use validate::{Accepted, ConfigurationValidator};
