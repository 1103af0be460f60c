//! Operator alerts, delivered fire-and-forget to the notification center.

mod center;
mod handle;
mod types;
mod writer;

pub use center::NotificationCenter;
pub use handle::AlertHandle;
pub use types::{Alert, AlertEnvelope, AlertType, Severity};
pub use writer::{create_alert_system, AlertWriter};
