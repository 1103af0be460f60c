use tokio::sync::mpsc;

use super::{Alert, AlertEnvelope};

/// Handle for raising and dismissing alerts.
///
/// Cheaply cloneable and usable from any thread. Delivery never blocks the
/// caller: if the channel is full or closed the alert is logged and dropped.
#[derive(Clone)]
pub struct AlertHandle {
    tx: mpsc::Sender<AlertEnvelope>,
}

impl AlertHandle {
    pub fn new(tx: mpsc::Sender<AlertEnvelope>) -> Self {
        Self { tx }
    }

    /// Returns true if the alert was queued.
    pub fn raise(&self, alert: Alert) -> bool {
        let id = alert.id.clone();
        match self.tx.try_send(AlertEnvelope::Raise(alert)) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(alert = %id, "Failed to raise alert: {}", e);
                false
            }
        }
    }

    pub fn dismiss(&self, alert_id: impl Into<String>) -> bool {
        match self.tx.try_send(AlertEnvelope::Dismiss(alert_id.into())) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to dismiss alert: {}", e);
                false
            }
        }
    }
}
