use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, validate::validate_config, ConfigError};

/// Prefix of environment overrides. Nested keys are separated by `__`,
/// e.g. `CHANGEFEED_ETL__MAX_BATCH_SIZE=512`.
pub const ENV_PREFIX: &str = "CHANGEFEED_";

/// Load and validate the node configuration, with environment overrides on
/// top of the file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    validate_config(&config)?;
    Ok(config)
}

/// Parse a TOML document without environment overrides or validation.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    use crate::config::LogFormat;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn test_parse_fills_etl_defaults() {
        let toml = r#"
[node]
tag = "B"
database = "orders"

[etl]
max_number_of_extracted_documents = 1024
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.node.tag, "B");
        assert_eq!(config.node.database, "orders");
        assert_eq!(config.etl.max_number_of_extracted_documents, Some(1024));
        assert_eq!(config.etl.max_fallback_time_secs, 900);
    }

    #[test]
    fn test_node_section_is_required() {
        let result = load_config_from_str("[etl]\nmax_batch_size = 10\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config(Path::new("/nonexistent/changefeed.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[node]
tag = "C"
database = "sales"

[logging]
level = "debug"
format = "json"
"#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.node.tag, "C");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_loaded_file_is_validated() {
        let file = write_config(
            r#"
[node]
tag = "C"
database = "sales"

[etl]
max_batch_size = 0
"#,
        );

        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
