//! Configuration for the vitalgate service.

use crate::trends::ThresholdConfig;
use crate::types::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port to bind the ingestion gateway to (0 for random)
    pub port: u16,

    /// Secret the vault key is derived from
    pub vault_secret: String,

    /// Historical window for baseline computation (days)
    pub baseline_window_days: i64,

    /// Recent window compared against the baseline (days)
    pub current_window_days: i64,

    /// Per-metric fetch timeout during pull syncs (seconds)
    pub fetch_timeout_secs: u64,

    /// Provider credentials and webhook secrets
    pub providers: ProvidersConfig,

    /// System-default alert thresholds (per-patient overrides live in the
    /// trend engine)
    pub thresholds: ThresholdConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8099,
            vault_secret: "change-me".to_string(),
            baseline_window_days: 14,
            current_window_days: 2,
            fetch_timeout_secs: 30,
            providers: ProvidersConfig::default(),
            thresholds: ThresholdConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
            let config: Config =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(&config_path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vitalgate")
            .join("config.json")
    }
}

/// OAuth client settings for one pull provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OauthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// API base override, mainly for tests. `None` uses the provider's real
    /// endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

/// Provider credentials: shared webhook secrets for push providers, OAuth
/// clients for pull providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// HMAC secret per push provider; webhooks from providers without a
    /// configured secret are rejected.
    #[serde(default)]
    pub webhook_secrets: HashMap<ProviderKind, String>,
    #[serde(default)]
    pub fitbit: OauthClientConfig,
    #[serde(default)]
    pub garmin: OauthClientConfig,
    #[serde(default)]
    pub google_fit: OauthClientConfig,
    #[serde(default)]
    pub withings: OauthClientConfig,
}

impl ProvidersConfig {
    pub fn webhook_secret(&self, provider: ProviderKind) -> Option<&str> {
        self.webhook_secrets.get(&provider).map(String::as_str)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.baseline_window_days, 14);
        assert_eq!(config.current_window_days, 2);
        assert!(config.providers.webhook_secrets.is_empty());
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = Config::default();
        config
            .providers
            .webhook_secrets
            .insert(ProviderKind::Samsung, "s3cret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.providers.webhook_secret(ProviderKind::Samsung),
            Some("s3cret")
        );
    }
}
