use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    EtlConfigurationError,
    EtlWarning,
    EtlScriptError,
    EtlTransformationError,
    EtlLoadError,
    CpuCreditsExhausted,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::EtlConfigurationError => "EtlConfigurationError",
            AlertType::EtlWarning => "EtlWarning",
            AlertType::EtlScriptError => "EtlScriptError",
            AlertType::EtlTransformationError => "EtlTransformationError",
            AlertType::EtlLoadError => "EtlLoadError",
            AlertType::CpuCreditsExhausted => "CpuCreditsExhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Derived from type and key, so re-raising replaces the previous alert.
    pub id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    /// What the alert is about, e.g. `orders-etl/orders`.
    pub key: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        key: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let key = key.into();
        Self {
            id: Self::id_for(alert_type, &key),
            alert_type,
            severity,
            key,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn id_for(alert_type: AlertType, key: &str) -> String {
        format!("{}/{}", alert_type.as_str(), key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertEnvelope {
    Raise(Alert),
    Dismiss(String),
}
