use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Node tag and database name are not empty
/// - Explicit extraction limits are not 0
/// - Fallback floor is set and the ceiling is not below it
/// - Stats history and script cache hold at least one entry
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.node.tag.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "node.tag cannot be empty".to_string(),
        ));
    }

    if config.node.database.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "node.database cannot be empty".to_string(),
        ));
    }

    let etl = &config.etl;
    let limits = [
        (
            "etl.max_number_of_extracted_documents",
            etl.max_number_of_extracted_documents,
        ),
        (
            "etl.max_number_of_extracted_counter_groups",
            etl.max_number_of_extracted_counter_groups,
        ),
        (
            "etl.max_number_of_extracted_items",
            etl.max_number_of_extracted_items,
        ),
        ("etl.max_batch_size", etl.max_batch_size),
    ];
    for (name, value) in limits {
        if value == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "{} cannot be 0",
                name
            )));
        }
    }

    if etl.min_fallback_time_ms == 0 {
        return Err(ConfigError::ValidationError(
            "etl.min_fallback_time_ms cannot be 0".to_string(),
        ));
    }

    if etl.max_fallback_time() < etl.min_fallback_time() {
        return Err(ConfigError::ValidationError(format!(
            "etl.max_fallback_time_secs cannot be below etl.min_fallback_time_ms ({} ms)",
            etl.min_fallback_time_ms
        )));
    }

    if etl.stats_history_size == 0 {
        return Err(ConfigError::ValidationError(
            "etl.stats_history_size cannot be 0".to_string(),
        ));
    }

    if etl.script_cache_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "etl.script_cache_capacity cannot be 0".to_string(),
        ));
    }

    Ok(())
}
