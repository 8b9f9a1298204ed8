//! Configuration management
//!
//! `Config::load` layers an optional TOML file under `VOICECORE_*`
//! environment variables (`VOICECORE_ACCOUNT__USERNAME=100`).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::infrastructure::protocols::sip::{Credentials, LocalAccount, TransactionContext};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub media: MediaConfig,
    pub transactions: TransactionConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    /// Falls back to the realm of each challenge
    pub realm: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub expiry_secs: u32,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub rtp_port_min: u16,
    pub rtp_port_max: u16,
    /// Offered payload types, in preference order
    pub codecs: Vec<u8>,
    pub frame_interval_ms: u64,
    pub keepalive_interval_secs: u64,
    pub receive_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub retry_after_default_secs: u64,
    pub refresh_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            realm: None,
            server_host: "localhost".to_string(),
            server_port: 5060,
            local_ip: "127.0.0.1".to_string(),
            local_port: 5062,
            expiry_secs: 3600,
            user_agent: format!("voicecore/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rtp_port_min: 10000,
            rtp_port_max: 20000,
            codecs: vec![0, 8],
            frame_interval_ms: 19,
            keepalive_interval_secs: 10,
            receive_timeout_ms: 200,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retry_after_default_secs: 5,
            refresh_margin_secs: 5,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (if it exists) overridden by `VOICECORE_*` variables
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("VOICECORE").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Fail early on values the engine cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.account.username.is_empty() {
            return Err("account.username is required".to_string());
        }
        if self.account.local_ip.parse::<IpAddr>().is_err() {
            return Err(format!("account.local_ip is not an IP: {}", self.account.local_ip));
        }
        if self.media.rtp_port_min > self.media.rtp_port_max {
            return Err("media.rtp_port_min is above media.rtp_port_max".to_string());
        }
        if self.media.rtp_port_min == self.media.rtp_port_max && self.media.rtp_port_min % 2 == 1 {
            return Err("media RTP port range holds no even port".to_string());
        }
        if self.media.codecs.is_empty() {
            return Err("media.codecs is empty".to_string());
        }
        Ok(())
    }
}

impl AccountConfig {
    pub fn local_account(&self) -> LocalAccount {
        LocalAccount {
            username: self.username.clone(),
            server_host: self.server_host.clone(),
            server_port: self.server_port,
            local_ip: self.local_ip.clone(),
            local_port: self.local_port,
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            realm: self.realm.clone(),
        }
    }
}

impl MediaConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

impl TransactionConfig {
    /// Apply the timing knobs to a transaction context
    pub fn apply(&self, ctx: &mut TransactionContext) {
        ctx.retry_after_default = Duration::from_secs(self.retry_after_default_secs);
        ctx.refresh_margin = Duration::from_secs(self.refresh_margin_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.account.expiry_secs, 3600);
        assert_eq!(config.media.codecs, vec![0, 8]);
        assert_eq!(config.media.frame_interval(), Duration::from_millis(19));
        assert_eq!(config.transactions.retry_after_default_secs, 5);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [account]
            username = "100"
            password = "secret"
            server_host = "pbx.example.com"

            [media]
            codecs = [8]
            "#,
        )
        .unwrap();

        assert_eq!(config.account.username, "100");
        assert_eq!(config.account.server_port, 5060);
        assert_eq!(config.media.codecs, vec![8]);
        assert_eq!(config.media.keepalive_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.account.username = "100".into();
        config.account.local_ip = "not-an-ip".into();
        assert!(config.validate().is_err());

        config.account.local_ip = "10.0.0.2".into();
        config.media.rtp_port_min = 30000;
        assert!(config.validate().is_err());

        config.media.rtp_port_min = 20001;
        config.media.rtp_port_max = 20001;
        assert!(config.validate().is_err());

        config.media.rtp_port_max = 20002;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/voicecore").unwrap();
        assert_eq!(config.account.server_port, 5060);
    }
}
