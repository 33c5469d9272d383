//! Client configuration.
//!
//! All policy values (retry counts, backoff steps, identify cooldown, outbound
//! message budget) live here as defaults that callers can override, either in
//! code or by deserializing a config file with serde.

use crate::auth::Token;
use crate::error::{ConnectorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://chat.example.com/api/v10/";
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.chat.example.com";
pub const DEFAULT_API_VERSION: u8 = 10;
const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Raw token string, `Bot `/`Bearer ` prefix optional.
    pub token: String,
    pub rest: RestConfig,
    pub gateway: GatewayConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            rest: RestConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// Reads `CHAT_TOKEN` (required), `CHAT_API_URL` and `CHAT_GATEWAY_URL`
    /// (optional) from the environment.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("CHAT_TOKEN").map_err(|_| {
            ConnectorError::AuthenticationError("CHAT_TOKEN environment variable not set".to_string())
        })?;
        let mut config = Self::new(token);
        if let Ok(api_url) = std::env::var("CHAT_API_URL") {
            config.rest.api_url = api_url;
        }
        if let Ok(gateway_url) = std::env::var("CHAT_GATEWAY_URL") {
            config.gateway.url = gateway_url;
        }
        Ok(config)
    }

    pub fn token(&self) -> Result<Token> {
        Token::parse(&self.token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Additional attempts after a 5xx response.
    pub max_server_retries: u32,
    /// Linear backoff step between 5xx retries; attempt `n` waits `n * step`.
    pub server_retry_backoff_ms: u64,
    /// Retry once more when an attempt times out.
    pub retry_on_timeout: bool,
    /// Fallback wait when a 429 carries no retry-after information.
    pub default_retry_after_ms: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: format!(
                "ChatConnector (https://github.com/chat-connector-rs, {})",
                env!("CARGO_PKG_VERSION")
            ),
            timeout_secs: DEFAULT_TIMEOUT_SECONDS,
            max_server_retries: 3,
            server_retry_backoff_ms: 50,
            retry_on_timeout: true,
            default_retry_after_ms: 1000,
        }
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn server_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.server_retry_backoff_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_millis(self.default_retry_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub api_version: u8,
    /// Request `compress=zlib-stream` binary frames.
    pub compress: bool,
    pub intents: u64,
    /// `[shard_id, shard_count]`; `None` for an unsharded connection.
    pub shard: Option<[u32; 2]>,
    pub large_threshold: u32,
    /// Initial presence sent with identify.
    pub presence: Option<Value>,
    pub properties: IdentifyProperties,
    pub reconnect: ReconnectConfig,
    pub outbound: OutboundConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            api_version: DEFAULT_API_VERSION,
            compress: true,
            intents: 0,
            shard: None,
            large_threshold: 250,
            presence: None,
            properties: IdentifyProperties::default(),
            reconnect: ReconnectConfig::default(),
            outbound: OutboundConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn shard_id(&self) -> u32 {
        self.shard.map(|[id, _]| id).unwrap_or(0)
    }

    /// Short tag used to prefix log lines for this connection.
    pub fn shard_tag(&self) -> String {
        match self.shard {
            Some([id, total]) => format!("Shard {}/{}", id, total),
            None => "Gateway".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Minimum spacing between two identify attempts in this process.
    pub identify_delay_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            identify_delay_ms: 5_000,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 900_000,
        }
    }
}

impl ReconnectConfig {
    pub fn identify_delay(&self) -> Duration {
        Duration::from_millis(self.identify_delay_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Messages allowed per rolling window, priority traffic included.
    pub messages_per_window: u32,
    pub window_secs: u64,
    /// Slots that only heartbeats, identify/resume and close frames may use.
    pub reserved_priority: u32,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            messages_per_window: 120,
            window_secs: 60,
            reserved_priority: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_policy() {
        let config = ClientConfig::default();
        assert_eq!(config.rest.max_server_retries, 3);
        assert_eq!(config.rest.server_retry_backoff(), Duration::from_millis(50));
        assert_eq!(config.gateway.reconnect.identify_delay(), Duration::from_secs(5));
        assert_eq!(config.gateway.outbound.messages_per_window, 120);
        assert_eq!(config.gateway.shard_tag(), "Gateway");
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"token": "abc", "gateway": {"shard": [1, 4], "compress": false}}"#,
        )
        .expect("Failed to parse config");
        assert_eq!(config.token, "abc");
        assert_eq!(config.gateway.shard_id(), 1);
        assert_eq!(config.gateway.shard_tag(), "Shard 1/4");
        assert!(!config.gateway.compress);
        assert_eq!(config.rest.timeout(), Duration::from_secs(10));
    }
}
