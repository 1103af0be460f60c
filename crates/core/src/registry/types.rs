//! Types for the configuration registry.

use std::sync::Arc;

use thiserror::Error;

use crate::cluster::OwnershipOracle;
use crate::destination::DestinationFactory;
use crate::engine::{EngineContext, EngineError};
use crate::storage::ChangeNotifications;

/// Errors returned by registry operations.
///
/// Invalid configurations are not errors: they are reported as alerts and
/// left out of the running set.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Some engines could not be started. The others are running.
    #[error("failed to start {} engine(s): {}", .0.len(), describe(.0))]
    Start(Vec<(String, EngineError)>),

    /// Some engines failed to stop cleanly. All of them were still stopped.
    #[error("failed to dispose {} engine(s): {}", .0.len(), describe(.0))]
    Dispose(Vec<(String, EngineError)>),

    /// No such configuration or transformation in the record.
    #[error("ETL task not found: {0}")]
    NotFound(String),

    /// The configuration does not pass validation.
    #[error("invalid ETL configuration '{name}': {}", .errors.join("; "))]
    InvalidConfiguration { name: String, errors: Vec<String> },
}

fn describe(failures: &[(String, EngineError)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("{}: {}", name, e))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collaborators the registry needs on top of what every engine gets.
#[derive(Clone)]
pub struct RegistryContext {
    pub engine: EngineContext,
    pub ownership: Arc<dyn OwnershipOracle>,
    pub destinations: Arc<dyn DestinationFactory>,
    /// Storage change stream. Without it engines only wake after their own
    /// batches and fallback intervals.
    pub notifications: Option<Arc<dyn ChangeNotifications>>,
}

impl RegistryContext {
    pub fn new(
        engine: EngineContext,
        ownership: Arc<dyn OwnershipOracle>,
        destinations: Arc<dyn DestinationFactory>,
    ) -> Self {
        Self {
            engine,
            ownership,
            destinations,
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn ChangeNotifications>) -> Self {
        self.notifications = Some(notifications);
        self
    }
}
