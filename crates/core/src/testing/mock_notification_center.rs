//! Mock notification center for testing.

use std::sync::Mutex;

use crate::alerts::{Alert, AlertEnvelope, AlertType, NotificationCenter};
use crate::sync::lock;

/// Mock implementation of [`NotificationCenter`].
///
/// Keeps every raise and dismissal, in order, for assertions.
#[derive(Debug, Default)]
pub struct MockNotificationCenter {
    events: Mutex<Vec<AlertEnvelope>>,
}

impl MockNotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every alert ever raised, in order.
    pub fn raised(&self) -> Vec<Alert> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                AlertEnvelope::Raise(alert) => Some(alert.clone()),
                AlertEnvelope::Dismiss(_) => None,
            })
            .collect()
    }

    pub fn raised_of(&self, alert_type: AlertType) -> Vec<Alert> {
        self.raised()
            .into_iter()
            .filter(|a| a.alert_type == alert_type)
            .collect()
    }

    pub fn dismissed(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                AlertEnvelope::Dismiss(id) => Some(id.clone()),
                AlertEnvelope::Raise(_) => None,
            })
            .collect()
    }

    /// Alerts raised and not dismissed since, latest per id.
    pub fn active(&self) -> Vec<Alert> {
        let mut active: Vec<Alert> = Vec::new();
        for event in lock(&self.events).iter() {
            match event {
                AlertEnvelope::Raise(alert) => {
                    active.retain(|a| a.id != alert.id);
                    active.push(alert.clone());
                }
                AlertEnvelope::Dismiss(id) => active.retain(|a| &a.id != id),
            }
        }
        active
    }
}

impl NotificationCenter for MockNotificationCenter {
    fn add(&self, alert: Alert) {
        lock(&self.events).push(AlertEnvelope::Raise(alert));
    }

    fn dismiss(&self, alert_id: &str) {
        lock(&self.events).push(AlertEnvelope::Dismiss(alert_id.to_string()));
    }
}
