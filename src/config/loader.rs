//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::RelayConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::load_balancer::RegistryError;
use crate::net::tls::TlsError;
use crate::resilience::retries::UnknownFailureKind;

/// Error type for configuration loading and runtime construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
    #[error("upstream setup failed: {0}")]
    Upstream(#[from] RegistryError),
    #[error("route \"{route}\": {source}")]
    Tls {
        route: String,
        #[source]
        source: TlsError,
    },
    #[error("route \"{route}\": {source}")]
    FailureKind {
        route: String,
        #[source]
        source: UnknownFailureKind,
    },
    #[error("route \"{route}\" references unknown upstream \"{upstream}\"")]
    UnknownUpstream { route: String, upstream: String },
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<RelayConfig, ConfigError> {
    let config: RelayConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[upstreams]]
            name = "app"
            servers = [{{ address = "127.0.0.1:9001" }}]

            [[routes]]
            name = "all"
            upstream = "app"
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.routes[0].upstream, "app");
    }

    #[test]
    fn validation_errors_are_collected() {
        let err = parse_config(
            r#"
            [[routes]]
            name = "a"
            upstream = "missing"
            [routes.proxy]
            buffer_size = 0
            "#,
        )
        .unwrap_err();

        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        assert!(matches!(parse_config("[[routes]"), Err(ConfigError::Parse(_))));
    }
}
