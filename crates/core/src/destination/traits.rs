use std::sync::Arc;

use async_trait::async_trait;

use crate::task::{DestinationKind, ResolvedConfiguration};
use crate::transform::TransformedItem;

use super::LoadError;

/// Writes transformed batches to an external system.
///
/// Writers must tolerate re-delivery of a batch that was attempted but never
/// checkpointed.
#[async_trait]
pub trait Destination: Send + Sync {
    fn kind(&self) -> DestinationKind;

    /// Whether counter groups can be delivered at all.
    fn supports_counters(&self) -> bool {
        self.kind() == DestinationKind::Peer
    }

    /// Whether attachment deletions must be extracted for all-collections tasks.
    fn cares_about_attachments(&self) -> bool {
        false
    }

    /// Deliver the whole batch, returning how many items were written.
    async fn load(&self, items: &[TransformedItem]) -> Result<usize, LoadError>;
}

/// Builds the writer for a resolved configuration.
pub trait DestinationFactory: Send + Sync {
    fn create(&self, configuration: &ResolvedConfiguration) -> Arc<dyn Destination>;
}
