#![allow(dead_code)]

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::middleware::context::RequestContext;
use crate::proxy::pause::{PauseControl, PauseState, WaitAction};
use crate::proxy::target::{InflightGuard, Target, TargetOptions};
use crate::ssl::CertManager;

/// Marker extension inserted by the TLS listener for connections that
/// arrived over HTTPS.
#[derive(Debug, Clone, Copy)]
pub struct TlsConnection;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceOptions {
    pub tls_hostname: String,
    pub acme_directory: String,
    pub acme_cache_path: String,
    pub log_headers: Vec<String>,
}

impl ServiceOptions {
    pub fn require_tls(&self) -> bool {
        !self.tls_hostname.is_empty()
    }
}

/// The proxy's view of one virtual host: at most one active target at a
/// time, a pause barrier in front of it, and an optional certificate
/// manager for TLS hosts.
pub struct Service {
    name: String,
    host: String,
    options: RwLock<ServiceOptions>,
    active: RwLock<Option<Arc<Target>>>,
    pause_control: PauseControl,
    cert_manager: RwLock<Option<CertManager>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Service {
    pub fn new(name: impl Into<String>, host: impl Into<String>, options: ServiceOptions) -> Self {
        let cert_manager = CertManager::new(&options);
        Self {
            name: name.into(),
            host: host.into(),
            options: RwLock::new(options),
            active: RwLock::new(None),
            pause_control: PauseControl::new(),
            cert_manager: RwLock::new(cert_manager),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn options(&self) -> ServiceOptions {
        read(&self.options).clone()
    }

    pub fn update_options(&self, options: ServiceOptions) {
        *write(&self.cert_manager) = CertManager::new(&options);
        *write(&self.options) = options;
    }

    pub fn cert_manager(&self) -> Option<CertManager> {
        read(&self.cert_manager).clone()
    }

    pub fn active_target(&self) -> Option<Arc<Target>> {
        read(&self.active).clone()
    }

    /// Claim the active target for one request. The read lock is held only
    /// long enough to take the claim, never across the upstream round-trip.
    pub fn claim_target(&self, req: &Request) -> Result<(Arc<Target>, InflightGuard)> {
        let active = read(&self.active);
        let target = active.as_ref().ok_or(ProxyError::TargetUnavailable)?;
        let guard = target.start_request(req)?;
        Ok((target.clone(), guard))
    }

    /// Promote a new target. The previous one, if any, stops health checking
    /// and drains in the background while its in-flight requests finish.
    pub fn set_active_target(&self, target: Arc<Target>, drain_timeout: Duration) {
        let mut active = write(&self.active);
        if let Some(old) = active.replace(target) {
            old.stop_health_checks();
            tokio::spawn(async move {
                old.drain(drain_timeout).await;
            });
        }
    }

    pub async fn serve(&self, req: Request) -> Response {
        let options = self.options();

        if let Some(context) = RequestContext::of(&req) {
            context.set_service(&self.name);
            context.set_log_headers(&options.log_headers);
        }

        if options.require_tls() && req.extensions().get::<TlsConnection>().is_none() {
            return self.redirect_to_https(&req);
        }

        if let Some(response) = self.health_check_response_while_paused(&req) {
            return response;
        }

        if let Some(response) = self.wait_for_pause(req.uri().path().to_string()).await {
            return response;
        }

        let (target, guard) = match self.claim_target(&req) {
            Ok(claimed) => claimed,
            Err(e) => return e.into_response(),
        };

        match target.send_request(req, guard).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    pub async fn stop(&self, drain_timeout: Duration) -> Result<()> {
        self.pause_control.stop()?;
        info!(service = %self.name, "Service stopped");

        if let Some(target) = self.active_target() {
            target.drain(drain_timeout).await;
            info!(service = %self.name, "Service drained");
        }
        Ok(())
    }

    /// Hold new traffic at the barrier and let in-flight requests finish.
    /// The active target stays claimable so traffic flows again on resume.
    pub async fn pause(&self, drain_timeout: Duration, pause_timeout: Duration) -> Result<()> {
        self.pause_control.pause(pause_timeout)?;
        info!(service = %self.name, "Service paused");

        if let Some(target) = self.active_target() {
            target.wait_for_inflight(drain_timeout).await;
            info!(service = %self.name, "Service drained");
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.pause_control.resume()?;
        info!(service = %self.name, "Service resumed");
        Ok(())
    }

    // Private

    fn health_check_response_while_paused(&self, req: &Request) -> Option<Response> {
        if self.pause_control.state() != PauseState::Running {
            // When paused or stopped, return success for any health check
            // requests from downstream services. Otherwise they might
            // consider us unhealthy while in that state, and remove us from
            // their pool.
            if let Some(target) = self.active_target() {
                if target.is_health_check_request(req) {
                    return Some(StatusCode::OK.into_response());
                }
            }
        }
        None
    }

    async fn wait_for_pause(&self, path: String) -> Option<Response> {
        match self.pause_control.wait().await {
            WaitAction::Proceed => None,
            WaitAction::Unavailable => Some(StatusCode::SERVICE_UNAVAILABLE.into_response()),
            WaitAction::TimedOut => {
                warn!(service = %self.name, path = %path, "Rejecting request due to expired pause");
                Some(StatusCode::GATEWAY_TIMEOUT.into_response())
            }
        }
    }

    fn redirect_to_https(&self, req: &Request) -> Response {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| req.uri().host())
            .unwrap_or(&self.host);
        let request_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("https://{}{}", strip_port(host), request_uri);

        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::CONNECTION, "close")
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

pub(crate) fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 hosts keep their brackets, only the port is dropped.
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((bare, _)) => bare,
        None => host,
    }
}

#[derive(Deserialize, Serialize)]
struct MarshalledService {
    name: String,
    host: String,
    active_target: String,
    options: ServiceOptions,
    target_options: TargetOptions,
}

impl Serialize for Service {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let (active_target, target_options) = match self.active_target() {
            Some(target) => (target.address().to_string(), target.options().clone()),
            None => (String::new(), TargetOptions::default()),
        };

        MarshalledService {
            name: self.name.clone(),
            host: self.host.clone(),
            active_target,
            options: self.options(),
            target_options,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Service {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let ms = MarshalledService::deserialize(deserializer)?;

        let target =
            Target::restore(ms.active_target, ms.target_options).map_err(serde::de::Error::custom)?;

        let service = Service::new(ms.name, ms.host, ms.options);
        *write(&service.active) = Some(target);

        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckConfig;
    use crate::proxy::target::TargetState;
    use axum::Router;
    use http_body_util::BodyExt;

    async fn spawn_upstream(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn quiet_options() -> TargetOptions {
        TargetOptions {
            health_check: HealthCheckConfig {
                path: "/up".to_string(),
                interval: Duration::from_secs(3600),
                timeout: Duration::from_secs(1),
            },
            ..Default::default()
        }
    }

    fn get_request(path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header("Host", "app.example.com")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    async fn service_with_upstream(body: &'static str) -> Arc<Service> {
        let addr = spawn_upstream(Router::new().fallback(move || async move { body })).await;
        let service = Arc::new(Service::new(
            "myapp",
            "app.example.com",
            ServiceOptions::default(),
        ));
        let target = Target::restore(addr.to_string(), quiet_options()).unwrap();
        service.set_active_target(target, Duration::from_secs(1));
        service
    }

    #[tokio::test]
    async fn test_serve_without_target_is_unavailable() {
        let service = Service::new("myapp", "app.example.com", ServiceOptions::default());
        let resp = service.serve(get_request("/")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_serve_proxies_to_active_target() {
        let service = service_with_upstream("hello from upstream").await;
        let resp = service.serve(get_request("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "hello from upstream");
    }

    #[tokio::test]
    async fn test_serve_fills_context_slots() {
        let service = service_with_upstream("ok").await;
        let target_address = service.active_target().unwrap().address().to_string();

        let context = Arc::new(RequestContext::default());
        let mut req = get_request("/");
        req.extensions_mut().insert(context.clone());

        service.serve(req).await;

        assert_eq!(context.service().as_deref(), Some("myapp"));
        assert_eq!(context.target().as_deref(), Some(target_address.as_str()));
    }

    #[tokio::test]
    async fn test_plain_request_to_tls_service_is_redirected() {
        let service = Service::new(
            "myapp",
            "app.example.com",
            ServiceOptions {
                tls_hostname: "app.example.com".to_string(),
                ..Default::default()
            },
        );

        let req = Request::builder()
            .uri("/somepath?q=ok")
            .header("Host", "app.example.com:8080")
            .body(Body::empty())
            .unwrap();

        let resp = service.serve(req).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://app.example.com/somepath?q=ok"
        );
        assert_eq!(resp.headers().get(header::CONNECTION).unwrap(), "close");
    }

    #[tokio::test]
    async fn test_tls_connection_passes_the_gate() {
        let service = Service::new(
            "myapp",
            "app.example.com",
            ServiceOptions {
                tls_hostname: "app.example.com".to_string(),
                ..Default::default()
            },
        );

        let mut req = get_request("/");
        req.extensions_mut().insert(TlsConnection);

        // No target yet, so the request makes it past the gate and 503s.
        let resp = service.serve(req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_paused_service_answers_downstream_health_checks() {
        let service = Arc::new(Service::new(
            "myapp",
            "app.example.com",
            ServiceOptions::default(),
        ));
        let target = Target::restore("upstream:3000", quiet_options()).unwrap();
        service.set_active_target(target, Duration::from_secs(1));

        service
            .pause(Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();

        let probe = Request::builder()
            .uri("/up")
            .header("User-Agent", "mproxy-health-check/1.0")
            .body(Body::empty())
            .unwrap();

        // The upstream address is unreachable; a 200 proves nothing was
        // proxied.
        let resp = service.serve(probe).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_paused_request_proceeds_after_resume() {
        let service = service_with_upstream("resumed").await;
        service
            .pause(Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap();

        let serving = {
            let service = service.clone();
            tokio::spawn(async move { service.serve(get_request("/")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!serving.is_finished());

        service.resume().await.unwrap();
        let resp = serving.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "resumed");
    }

    #[tokio::test]
    async fn test_paused_request_times_out_without_resume() {
        let service = service_with_upstream("too late").await;
        service
            .pause(Duration::from_millis(50), Duration::from_millis(100))
            .await
            .unwrap();

        let resp = service.serve(get_request("/")).await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_stopped_service_is_unavailable() {
        let service = service_with_upstream("stopped").await;
        service.stop(Duration::from_millis(50)).await.unwrap();

        let resp = service.serve(get_request("/")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_pause_while_paused_is_rejected() {
        let service = service_with_upstream("paused").await;
        service
            .pause(Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap();

        let err = service
            .pause(Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PauseBadState { .. }));
    }

    #[tokio::test]
    async fn test_swap_retires_the_old_target() {
        let first = spawn_upstream(Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            "one"
        }))
        .await;
        let second = spawn_upstream(Router::new().fallback(|| async { "two" })).await;

        let service = Arc::new(Service::new(
            "myapp",
            "app.example.com",
            ServiceOptions::default(),
        ));
        let old = Target::restore(first.to_string(), quiet_options()).unwrap();
        service.set_active_target(old.clone(), Duration::from_secs(1));

        // A request in flight on the old target when the swap happens.
        let inflight = {
            let service = service.clone();
            tokio::spawn(async move { service.serve(get_request("/")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let new = Target::restore(second.to_string(), quiet_options()).unwrap();
        service.set_active_target(new.clone(), Duration::from_secs(1));

        // The in-flight request still completes against the old target.
        let resp = inflight.await.unwrap();
        assert_eq!(body_string(resp).await, "one");

        // New requests are served by the new target.
        let resp = service.serve(get_request("/")).await;
        assert_eq!(body_string(resp).await, "two");

        // The old target finishes draining once its counter reaches zero.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(old.state(), TargetState::Draining);
        assert_eq!(old.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_service_round_trips_through_json() {
        let service = Service::new(
            "myapp",
            "app.example.com",
            ServiceOptions {
                tls_hostname: "app.example.com".to_string(),
                acme_cache_path: "/tmp/acme".to_string(),
                log_headers: vec!["X-Version".to_string()],
                ..Default::default()
            },
        );
        let target = Target::restore("upstream:3000", quiet_options()).unwrap();
        service.set_active_target(target, Duration::from_secs(1));

        let json = serde_json::to_string(&service).unwrap();
        let restored: Service = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.name(), "myapp");
        assert_eq!(restored.host(), "app.example.com");
        assert_eq!(restored.options(), service.options());

        let target = restored.active_target().unwrap();
        assert_eq!(target.address(), "upstream:3000");
        assert_eq!(target.state(), TargetState::Healthy);
        assert_eq!(restored.pause_control.state(), PauseState::Running);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("app.example.com"), "app.example.com");
        assert_eq!(strip_port("app.example.com:8080"), "app.example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
