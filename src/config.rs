#![allow(dead_code)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::proxy::{ServiceOptions, TargetOptions};

pub const KB: u64 = 1 << 10;
pub const MB: u64 = KB << 10;
pub const GB: u64 = MB << 10;

pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/up";
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub const MAX_IDLE_CONNS_PER_HOST: usize = 100;
pub const PROXY_BUFFER_SIZE: usize = 32 * KB as usize;

pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_REQUEST_MEMORY_BUFFER_SIZE: u64 = MB;
pub const DEFAULT_MAX_REQUEST_BODY_SIZE: u64 = GB;
pub const DEFAULT_MAX_RESPONSE_MEMORY_BUFFER_SIZE: u64 = MB;
pub const DEFAULT_MAX_RESPONSE_BODY_SIZE: u64 = GB;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub buffering: BufferingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_drain_timeout", with = "duration_serde")]
    pub drain_timeout: Duration,
}

/// One virtual host handled by the proxy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEntry {
    pub name: String,
    pub host: String,
    pub target: String,
    #[serde(default)]
    pub options: ServiceOptions,
    #[serde(default)]
    pub target_options: TargetOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferingConfig {
    pub max_response_memory_buffer_size: u64,
    pub max_response_body_size: u64,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_response_memory_buffer_size: DEFAULT_MAX_RESPONSE_MEMORY_BUFFER_SIZE,
            max_response_body_size: DEFAULT_MAX_RESPONSE_BODY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    DEFAULT_DRAIN_TIMEOUT
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.services.is_empty() {
            anyhow::bail!("At least one service must be configured");
        }

        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("Service name cannot be empty");
            }
            if service.host.is_empty() {
                anyhow::bail!("Service '{}' must have a host", service.name);
            }
            if !service.target.contains(':') {
                anyhow::bail!(
                    "Service '{}' target must be a host:port address",
                    service.name
                );
            }
            if service.target_options.health_check.interval.is_zero() {
                anyhow::bail!(
                    "Service '{}' health check interval cannot be zero",
                    service.name
                );
            }
            if !service.options.tls_hostname.is_empty() && service.options.acme_cache_path.is_empty()
            {
                anyhow::bail!(
                    "Service '{}' requires an ACME cache path when TLS is enabled",
                    service.name
                );
            }
        }

        if self.buffering.max_response_memory_buffer_size > self.buffering.max_response_body_size {
            anyhow::bail!("Response memory buffer cannot exceed the response body limit");
        }

        Ok(())
    }
}

pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if s.ends_with("ms") {
            let num: u64 = s.trim_end_matches("ms").parse()?;
            Ok(Duration::from_millis(num))
        } else if s.ends_with('s') {
            let num: u64 = s.trim_end_matches('s').parse()?;
            Ok(Duration::from_secs(num))
        } else if s.ends_with('m') {
            let num: u64 = s.trim_end_matches('m').parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if s.ends_with('h') {
            let num: u64 = s.trim_end_matches('h').parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            let num: u64 = s.parse()?;
            Ok(Duration::from_secs(num))
        }
    }

}
