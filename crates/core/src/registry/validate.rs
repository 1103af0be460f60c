//! Validation of ETL configurations against the database record.

use std::collections::HashSet;

use crate::task::{DatabaseRecord, DestinationKind, EtlConfiguration, ResolvedConfiguration};

/// A configuration that may run, with any warnings to surface.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub resolved: ResolvedConfiguration,
    pub warnings: Vec<String>,
}

/// Tracks names already accepted in one pass over the record.
///
/// Names are unique per destination kind, ignoring case.
#[derive(Debug, Default)]
pub struct ConfigurationValidator {
    accepted: HashSet<(DestinationKind, String)>,
}

impl ConfigurationValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one configuration. On success its name is reserved for the
    /// rest of the pass.
    pub fn validate(
        &mut self,
        record: &DatabaseRecord,
        configuration: &EtlConfiguration,
    ) -> Result<Accepted, Vec<String>> {
        let mut errors = configuration.validate().err().unwrap_or_default();
        let mut warnings = Vec::new();

        let key = (configuration.kind, configuration.name.to_lowercase());
        if self.accepted.contains(&key) {
            errors.push(format!(
                "{} ETL configuration name '{}' is already in use",
                configuration.kind, configuration.name
            ));
        }

        let connection = match record.connection_string(&configuration.connection_string_name) {
            Some(connection) => Some(connection.clone()),
            None => {
                errors.push(format!(
                    "Connection string '{}' was not found",
                    configuration.connection_string_name
                ));
                None
            }
        };

        if let Some(connection) = &connection {
            if connection.kind != configuration.kind {
                errors.push(format!(
                    "Connection string '{}' is a {} connection string, expected {}",
                    connection.name, connection.kind, configuration.kind
                ));
            }

            if record.encrypted && !connection.encrypted {
                let message = format!(
                    "Database '{}' is encrypted but connection string '{}' does not use an encrypted channel",
                    record.database_name, connection.name
                );
                if configuration.allow_etl_on_non_encrypted_channel {
                    warnings.push(format!("{}; proceeding because it was explicitly allowed", message));
                } else {
                    errors.push(message);
                }
            }
        }

        match connection {
            Some(connection) if errors.is_empty() => {
                self.accepted.insert(key);
                Ok(Accepted {
                    resolved: ResolvedConfiguration {
                        configuration: configuration.clone(),
                        connection,
                    },
                    warnings,
                })
            }
            _ => Err(errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ConnectionString, Transformation};

    fn record() -> DatabaseRecord {
        DatabaseRecord::new("shop")
            .with_connection_string(ConnectionString::new(
                "warehouse",
                DestinationKind::Relational,
                "postgres://warehouse",
            ))
            .with_connection_string(ConnectionString::new(
                "replica",
                DestinationKind::Peer,
                "https://replica:8080",
            ))
    }

    fn config(name: &str, kind: DestinationKind, connection: &str) -> EtlConfiguration {
        EtlConfiguration::new(name, kind, connection)
            .with_transformation(Transformation::new("orders", "load(this)").with_collections(["Orders"]))
    }

    #[test]
    fn test_valid_configuration_is_resolved() {
        let mut validator = ConfigurationValidator::new();
        let accepted = validator
            .validate(&record(), &config("orders-etl", DestinationKind::Relational, "warehouse"))
            .unwrap();
        assert_eq!(accepted.resolved.connection.url, "postgres://warehouse");
        assert!(accepted.warnings.is_empty());
    }

    #[test]
    fn test_unresolved_connection_string() {
        let mut validator = ConfigurationValidator::new();
        let errors = validator
            .validate(&record(), &config("orders-etl", DestinationKind::Relational, "missing"))
            .unwrap_err();
        assert!(errors[0].contains("'missing' was not found"));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut validator = ConfigurationValidator::new();
        let errors = validator
            .validate(&record(), &config("orders-etl", DestinationKind::Relational, "replica"))
            .unwrap_err();
        assert!(errors[0].contains("expected relational"));
    }

    #[test]
    fn test_duplicate_names_ignore_case_within_a_kind() {
        let mut validator = ConfigurationValidator::new();
        let record = record();
        assert!(validator
            .validate(&record, &config("orders-etl", DestinationKind::Relational, "warehouse"))
            .is_ok());
        let errors = validator
            .validate(&record, &config("ORDERS-ETL", DestinationKind::Relational, "warehouse"))
            .unwrap_err();
        assert!(errors[0].contains("already in use"));

        // Another destination kind has its own namespace.
        assert!(validator
            .validate(&record, &config("orders-etl", DestinationKind::Peer, "replica"))
            .is_ok());
    }

    #[test]
    fn test_rejected_configuration_does_not_reserve_its_name() {
        let mut validator = ConfigurationValidator::new();
        let record = record();
        assert!(validator
            .validate(&record, &config("orders-etl", DestinationKind::Relational, "missing"))
            .is_err());
        assert!(validator
            .validate(&record, &config("orders-etl", DestinationKind::Relational, "warehouse"))
            .is_ok());
    }

    #[test]
    fn test_unencrypted_channel_on_encrypted_database() {
        let record = record().with_encrypted(true);

        let mut validator = ConfigurationValidator::new();
        let errors = validator
            .validate(&record, &config("orders-etl", DestinationKind::Relational, "warehouse"))
            .unwrap_err();
        assert!(errors[0].contains("does not use an encrypted channel"));

        let mut validator = ConfigurationValidator::new();
        let accepted = validator
            .validate(
                &record,
                &config("orders-etl", DestinationKind::Relational, "warehouse")
                    .with_non_encrypted_channel_allowed(true),
            )
            .unwrap();
        assert_eq!(accepted.warnings.len(), 1);

        // An encrypted channel needs no override.
        let mut validator = ConfigurationValidator::new();
        assert!(validator
            .validate(&record, &config("replica-etl", DestinationKind::Peer, "replica"))
            .is_ok());
    }

    #[test]
    fn test_structural_errors_are_reported_together() {
        let mut validator = ConfigurationValidator::new();
        let configuration = EtlConfiguration::new("", DestinationKind::Relational, "missing");
        let errors = validator.validate(&record(), &configuration).unwrap_err();
        assert!(errors.len() >= 3);
    }
}
