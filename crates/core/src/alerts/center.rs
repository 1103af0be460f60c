use super::Alert;

/// Persistent, operator-facing alert store.
pub trait NotificationCenter: Send + Sync {
    /// Add or replace the alert with the same id.
    fn add(&self, alert: Alert);

    fn dismiss(&self, alert_id: &str);
}
