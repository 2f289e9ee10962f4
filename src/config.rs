//! Configuration types for Mitmock

use serde::{Deserialize, Serialize};

use crate::{MitmError, Result};

/// Operating mode of an interception session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Record mode: forward traffic to the real network and capture it
    Record,
    /// Mock mode: answer traffic from declared request descriptions
    Mock,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }

    /// Check if mode is Mock
    #[must_use]
    pub fn is_mock(&self) -> bool {
        matches!(self, Mode::Mock)
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Source injection settings
    #[serde(default)]
    pub injection: InjectionConfig,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum intercepted request body size in bytes
    pub max_request_size: usize,
    /// Maximum upstream or streamed mock response body size in bytes
    pub max_response_size: usize,
    /// Size of the in-memory pipe backing each hijacked connection
    pub connection_buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            connection_buffer_size: 64 * 1024,    // 64 KB
        }
    }
}

/// Source injection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Indentation width used when it cannot be detected from the source
    pub indent_width: usize,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self { indent_width: 4 }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MitmError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| MitmError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_request_size", self.limits.max_request_size),
            ("max_response_size", self.limits.max_response_size),
            ("connection_buffer_size", self.limits.connection_buffer_size),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(MitmError::ConfigError(format!("{name} must be > 0")));
            }
        }

        if !(1..=16).contains(&self.injection.indent_width) {
            return Err(MitmError::ConfigError(format!(
                "indent_width must be between 1 and 16, got {}",
                self.injection.indent_width
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parse() {
        let config_toml = r"
            [limits]
            max_request_size = 1024
            max_response_size = 2048
            connection_buffer_size = 512

            [injection]
            indent_width = 2
        ";

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.limits.max_request_size, 1024);
        assert_eq!(config.limits.connection_buffer_size, 512);
        assert_eq!(config.injection.indent_width, 2);
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.limits.max_request_size, 16 * 1024 * 1024);
        assert_eq!(config.injection.indent_width, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[injection]\nindent_width = 8\n").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.injection.indent_width, 8);
    }

    #[test]
    fn test_invalid_config_zero_limit() {
        let mut config = Config::default();
        config.limits.max_response_size = 0;
        assert!(matches!(config.validate(), Err(MitmError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_config_indent() {
        let mut config = Config::default();
        config.injection.indent_width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_predicates() {
        assert!(Mode::Record.is_record());
        assert!(Mode::Mock.is_mock());
        assert!(!Mode::Mock.is_record());
    }
}
