/// Node configuration, persisted by the firmware as a JSON blob
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::health::MAX_CONNECT_RETRIES;
use crate::protocol::DEFAULT_PORT;
use crate::server::DEFAULT_MAX_SESSIONS;

/// Token accepted by `AUTH` when none is configured.
pub const DEFAULT_AUTH_TOKEN: &str = "hunter2";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("WiFi SSID cannot be empty")]
    EmptySsid,
    #[error("WiFi SSID must be 32 characters or less")]
    SsidTooLong,
    #[error("WiFi SSID cannot contain control characters")]
    SsidControlChars,
    #[error("auth token cannot be empty")]
    EmptyAuthToken,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("malformed config: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub max_connect_retries: u32,

    // Command server
    pub auth_token: String,
    pub port: u16,
    pub max_sessions: usize,

    // OTA
    pub ota_stall_timeout_secs: u32,

    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            max_connect_retries: MAX_CONNECT_RETRIES,
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
            port: DEFAULT_PORT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            ota_stall_timeout_secs: 8,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(bytes).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        serde_json::to_vec(self).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    pub fn ota_stall_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.ota_stall_timeout_secs))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ssid(&self.wifi_ssid)?;
        if self.auth_token.is_empty() {
            return Err(ConfigError::EmptyAuthToken);
        }
        if self.port == 0 {
            return Err(ConfigError::Zero("port"));
        }
        if self.max_connect_retries == 0 {
            return Err(ConfigError::Zero("max_connect_retries"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Zero("max_sessions"));
        }
        if self.ota_stall_timeout_secs == 0 {
            return Err(ConfigError::Zero("ota_stall_timeout_secs"));
        }
        Ok(())
    }
}

pub fn validate_ssid(ssid: &str) -> Result<(), ConfigError> {
    if ssid.is_empty() {
        return Err(ConfigError::EmptySsid);
    }
    if ssid.len() > 32 {
        return Err(ConfigError::SsidTooLong);
    }
    if ssid.chars().any(|c| c.is_control()) {
        return Err(ConfigError::SsidControlChars);
    }
    Ok(())
}
