use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{
    duration_serde, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_HEALTH_CHECK_PATH,
    DEFAULT_HEALTH_CHECK_TIMEOUT,
};

/// User agent sent with health check probes. Downstream proxies use the
/// prefix to recognise probe traffic while paused.
pub const HEALTH_CHECK_USER_AGENT: &str = "mproxy-health-check/1.0";
pub const HEALTH_CHECK_USER_AGENT_PREFIX: &str = "mproxy-health-check";

static HEALTH_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(HEALTH_CHECK_USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to create HTTP client for health checks")
});

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_HEALTH_CHECK_PATH.to_string(),
            interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
        }
    }
}

/// Outcome of a single probe against an upstream endpoint
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub response_time: Duration,
}

/// Probe `GET http://{address}{path}` once, bounded by the configured
/// timeout. Status codes in 200..=399 count as healthy; transport errors
/// and timeouts are unhealthy.
pub async fn check_endpoint(address: &str, config: &HealthCheckConfig) -> ProbeResult {
    let start = Instant::now();
    let url = format!("http://{}{}", address, config.path);

    match HEALTH_CLIENT
        .get(&url)
        .timeout(config.timeout)
        .send()
        .await
    {
        Ok(response) => {
            let status = response.status().as_u16();
            let healthy = (200..400).contains(&status);
            ProbeResult {
                healthy,
                status: Some(status),
                error: (!healthy).then(|| format!("HTTP {}", status)),
                response_time: start.elapsed(),
            }
        }
        Err(e) => ProbeResult {
            healthy: false,
            status: None,
            error: Some(e.to_string()),
            response_time: start.elapsed(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    async fn spawn_upstream(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_healthy_endpoint() {
        let addr = spawn_upstream(Router::new().route("/up", get(|| async { "OK" }))).await;

        let result = check_endpoint(&addr.to_string(), &HealthCheckConfig::default()).await;
        assert!(result.healthy);
        assert_eq!(result.status, Some(200));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_error_status_is_unhealthy() {
        let addr = spawn_upstream(Router::new().route(
            "/up",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;

        let result = check_endpoint(&addr.to_string(), &HealthCheckConfig::default()).await;
        assert!(!result.healthy);
        assert_eq!(result.status, Some(500));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = check_endpoint(&addr.to_string(), &HealthCheckConfig::default()).await;
        assert!(!result.healthy);
        assert_eq!(result.status, None);
        assert!(result.error.is_some());
    }
}
