use std::sync::Arc;

use tokio::sync::mpsc;

use super::{AlertEnvelope, AlertHandle, NotificationCenter};

/// Background task that forwards alerts to the notification center.
pub struct AlertWriter {
    rx: mpsc::Receiver<AlertEnvelope>,
    center: Arc<dyn NotificationCenter>,
}

impl AlertWriter {
    pub fn new(rx: mpsc::Receiver<AlertEnvelope>, center: Arc<dyn NotificationCenter>) -> Self {
        Self { rx, center }
    }

    /// Run until every handle is dropped.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        tracing::info!("Alert writer started");

        while let Some(envelope) = self.rx.recv().await {
            match envelope {
                AlertEnvelope::Raise(alert) => {
                    tracing::debug!(alert = %alert.id, "Raising alert");
                    self.center.add(alert);
                }
                AlertEnvelope::Dismiss(id) => {
                    tracing::debug!(alert = %id, "Dismissing alert");
                    self.center.dismiss(&id);
                }
            }
        }

        tracing::info!("Alert writer shutting down");
    }
}

/// Create a complete alert system
///
/// Returns:
/// - `AlertHandle` - for raising alerts (clone this to share across engines)
/// - `AlertWriter` - spawn this as a background task with `tokio::spawn(writer.run())`
pub fn create_alert_system(
    center: Arc<dyn NotificationCenter>,
    buffer_size: usize,
) -> (AlertHandle, AlertWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = AlertHandle::new(tx);
    let writer = AlertWriter::new(rx, center);
    (handle, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertType, Severity};
    use crate::testing::MockNotificationCenter;

    #[tokio::test]
    async fn test_writer_forwards_to_center() {
        let center = Arc::new(MockNotificationCenter::new());
        let (handle, writer) = create_alert_system(center.clone(), 8);

        handle.raise(Alert::new(
            AlertType::EtlLoadError,
            Severity::Error,
            "orders-etl/orders",
            "Load error",
            "unreachable",
        ));
        handle.dismiss("EtlLoadError/orders-etl/orders");
        drop(handle);

        writer.run().await;

        assert_eq!(center.raised().len(), 1);
        assert_eq!(center.dismissed(), vec!["EtlLoadError/orders-etl/orders".to_string()]);
        assert!(center.active().is_empty());
    }
}
