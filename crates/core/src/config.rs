//! Configuration management for the kill-switch control plane.
//!
//! Configuration is read from TOML. Every section has serde defaults so a
//! partial file is valid; [`Config::validate`] rejects values that would
//! weaken the fail-closed posture (zero thresholds, command TTLs measured in
//! hours, empty suspicion windows).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on any command TTL: commands live for minutes, not hours.
pub const MAX_COMMAND_TTL_CEILING_SECS: u64 = 900;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub failsafe: FailsafeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity and storage of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub platform_id: String,
    #[serde(default)]
    pub fleet_id: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// JSON file holding the provisioned group verification key
    #[serde(default = "default_group_key_path")]
    pub group_key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_proposal_ttl")]
    pub proposal_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    #[serde(default = "default_command_ttl")]
    pub default_command_ttl_secs: u64,
    #[serde(default = "default_max_command_ttl")]
    pub max_command_ttl_secs: u64,
    #[serde(default = "default_key_epoch")]
    pub key_epoch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Action types this platform will execute, e.g. `["ENGAGE", "SHUTDOWN_UNIT"]`
    #[serde(default = "default_accepted_actions")]
    pub accepted_actions: Vec<String>,
    #[serde(default = "default_max_command_ttl")]
    pub max_command_ttl_secs: u64,
    #[serde(default = "default_clock_skew")]
    pub max_clock_skew_secs: u64,
    #[serde(default = "default_rate_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_max")]
    pub rate_limit_max_commands: usize,
    #[serde(default = "default_max_nonces")]
    pub max_nonces_per_platform: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailsafeConfig {
    #[serde(default = "default_suspicion_threshold")]
    pub suspicion_threshold: usize,
    #[serde(default = "default_suspicion_window")]
    pub suspicion_window_secs: u64,
    /// Hex-encoded Ed25519 key of the out-of-band reset authority
    #[serde(default)]
    pub reset_authority_key: Option<String>,
    /// Hex-encoded Ed25519 key of the watch officer allowed to lift HOLD_FIRE
    #[serde(default)]
    pub resume_authority_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_group_key_path() -> PathBuf {
    PathBuf::from("./group-key.json")
}

fn default_threshold() -> usize {
    3
}

fn default_proposal_ttl() -> u64 {
    120
}

fn default_command_ttl() -> u64 {
    120
}

fn default_max_command_ttl() -> u64 {
    300
}

fn default_key_epoch() -> u64 {
    1
}

fn default_accepted_actions() -> Vec<String> {
    vec![
        "ENGAGE".to_string(),
        "SHUTDOWN_UNIT".to_string(),
        "SHUTDOWN_FLEET".to_string(),
    ]
}

fn default_clock_skew() -> u64 {
    5
}

fn default_rate_window() -> u64 {
    6
}

fn default_rate_max() -> usize {
    8
}

fn default_max_nonces() -> usize {
    100_000
}

fn default_suspicion_threshold() -> usize {
    3
}

fn default_suspicion_window() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            platform_id: "platform-001".to_string(),
            fleet_id: None,
            data_dir: default_data_dir(),
            group_key_path: default_group_key_path(),
        }
    }
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            proposal_ttl_secs: default_proposal_ttl(),
        }
    }
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            default_command_ttl_secs: default_command_ttl(),
            max_command_ttl_secs: default_max_command_ttl(),
            key_epoch: default_key_epoch(),
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            accepted_actions: default_accepted_actions(),
            max_command_ttl_secs: default_max_command_ttl(),
            max_clock_skew_secs: default_clock_skew(),
            rate_limit_window_secs: default_rate_window(),
            rate_limit_max_commands: default_rate_max(),
            max_nonces_per_platform: default_max_nonces(),
        }
    }
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: default_suspicion_threshold(),
            suspicion_window_secs: default_suspicion_window(),
            reset_authority_key: None,
            resume_authority_key: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl QuorumConfig {
    pub fn proposal_ttl(&self) -> Duration {
        Duration::from_secs(self.proposal_ttl_secs)
    }
}

impl IssuerConfig {
    pub fn default_command_ttl(&self) -> Duration {
        Duration::from_secs(self.default_command_ttl_secs)
    }

    pub fn max_command_ttl(&self) -> Duration {
        Duration::from_secs(self.max_command_ttl_secs)
    }
}

impl FailsafeConfig {
    pub fn suspicion_window(&self) -> Duration {
        Duration::from_secs(self.suspicion_window_secs)
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject configurations that would weaken fail-closed behavior.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.platform_id.trim().is_empty() {
            return Err(invalid("node.platform_id must not be empty"));
        }
        if self.quorum.threshold == 0 {
            return Err(invalid("quorum.threshold must be at least 1"));
        }
        if self.quorum.proposal_ttl_secs == 0 {
            return Err(invalid("quorum.proposal_ttl_secs must be positive"));
        }

        validate_ttl("issuer.max_command_ttl_secs", self.issuer.max_command_ttl_secs)?;
        validate_ttl(
            "issuer.default_command_ttl_secs",
            self.issuer.default_command_ttl_secs,
        )?;
        if self.issuer.default_command_ttl_secs > self.issuer.max_command_ttl_secs {
            return Err(invalid(format!(
                "issuer.default_command_ttl_secs ({}) exceeds issuer.max_command_ttl_secs ({})",
                self.issuer.default_command_ttl_secs, self.issuer.max_command_ttl_secs
            )));
        }
        validate_ttl(
            "verifier.max_command_ttl_secs",
            self.verifier.max_command_ttl_secs,
        )?;

        if self.verifier.accepted_actions.is_empty() {
            return Err(invalid("verifier.accepted_actions must not be empty"));
        }
        if self.verifier.rate_limit_window_secs == 0 || self.verifier.rate_limit_max_commands == 0 {
            return Err(invalid("verifier rate limit window and max must be positive"));
        }
        if self.verifier.max_nonces_per_platform == 0 {
            return Err(invalid("verifier.max_nonces_per_platform must be positive"));
        }

        if self.failsafe.suspicion_threshold == 0 {
            return Err(invalid("failsafe.suspicion_threshold must be at least 1"));
        }
        if self.failsafe.suspicion_window_secs == 0 {
            return Err(invalid("failsafe.suspicion_window_secs must be positive"));
        }
        validate_key_hex(
            "failsafe.reset_authority_key",
            self.failsafe.reset_authority_key.as_deref(),
        )?;
        validate_key_hex(
            "failsafe.resume_authority_key",
            self.failsafe.resume_authority_key.as_deref(),
        )?;

        Ok(())
    }
}

fn validate_key_hex(field: &str, key: Option<&str>) -> Result<(), ConfigError> {
    let Some(key) = key else {
        return Ok(());
    };
    let decoded = hex::decode(key).map_err(|e| invalid(format!("{}: {}", field, e)))?;
    if decoded.len() != 32 {
        return Err(invalid(format!(
            "{} must be 32 bytes, got {}",
            field,
            decoded.len()
        )));
    }
    Ok(())
}

fn validate_ttl(field: &str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 || secs > MAX_COMMAND_TTL_CEILING_SECS {
        return Err(invalid(format!(
            "{} must be within 1..={} seconds, got {}",
            field, MAX_COMMAND_TTL_CEILING_SECS, secs
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.quorum.threshold, 3);
        assert_eq!(config.failsafe.suspicion_threshold, 3);
        assert_eq!(config.failsafe.suspicion_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [node]
            platform_id = "unit-07"
            fleet_id = "fleet-alpha"

            [quorum]
            threshold = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.node.platform_id, "unit-07");
        assert_eq!(config.node.fleet_id.as_deref(), Some("fleet-alpha"));
        assert_eq!(config.quorum.threshold, 2);
        assert_eq!(config.quorum.proposal_ttl_secs, 120);
        assert_eq!(config.verifier.accepted_actions.len(), 3);
    }

    #[test]
    fn test_hour_long_ttl_rejected() {
        let result = Config::from_toml_str(
            r#"
            [issuer]
            max_command_ttl_secs = 3600
            "#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_default_ttl_above_max_rejected() {
        let mut config = Config::default_config();
        config.issuer.default_command_ttl_secs = 600;
        config.issuer.max_command_ttl_secs = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = Config::default_config();
        config.quorum.threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_reset_key_rejected() {
        let mut config = Config::default_config();
        config.failsafe.reset_authority_key = Some("abcd".to_string());
        assert!(config.validate().is_err());

        config.failsafe.reset_authority_key = Some(hex::encode([7u8; 32]));
        assert!(config.validate().is_ok());

        config.failsafe.resume_authority_key = Some("zz".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = Config::from_toml_str("[quorum\nthreshold = ");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
