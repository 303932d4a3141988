#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, Extensions, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{Buffer, BufferedContents};
use crate::config::{
    duration_serde, DEFAULT_DEPLOY_TIMEOUT, DEFAULT_MAX_REQUEST_BODY_SIZE,
    DEFAULT_MAX_REQUEST_MEMORY_BUFFER_SIZE, DEFAULT_MAX_RESPONSE_BODY_SIZE,
    DEFAULT_MAX_RESPONSE_MEMORY_BUFFER_SIZE, DEFAULT_TARGET_TIMEOUT, MAX_IDLE_CONNS_PER_HOST,
    PROXY_BUFFER_SIZE,
};
use crate::error::{ProxyError, Result};
use crate::health::{self, HealthCheckConfig, HEALTH_CHECK_USER_AGENT_PREFIX};
use crate::middleware::context::RequestContext;
use crate::middleware::response_buffer::ResponseBufferConfig;

static PROXY_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_HOST)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to create HTTP client for proxying")
});

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetOptions {
    pub health_check: HealthCheckConfig,
    #[serde(with = "duration_serde")]
    pub deploy_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub target_timeout: Duration,
    pub max_request_memory_buffer_size: u64,
    pub max_request_body_size: u64,
    pub max_response_memory_buffer_size: u64,
    pub max_response_body_size: u64,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            health_check: HealthCheckConfig::default(),
            deploy_timeout: DEFAULT_DEPLOY_TIMEOUT,
            target_timeout: DEFAULT_TARGET_TIMEOUT,
            max_request_memory_buffer_size: DEFAULT_MAX_REQUEST_MEMORY_BUFFER_SIZE,
            max_request_body_size: DEFAULT_MAX_REQUEST_BODY_SIZE,
            max_response_memory_buffer_size: DEFAULT_MAX_RESPONSE_MEMORY_BUFFER_SIZE,
            max_response_body_size: DEFAULT_MAX_RESPONSE_BODY_SIZE,
        }
    }
}

/// Target lifecycle: Adding until the first passing health check, Healthy
/// while serving, Draining once it is being retired. Never revived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Adding,
    Healthy,
    Draining,
}

/// One upstream address plus the machinery to proxy to it: an in-flight
/// request counter, a health check loop owned for the Adding and Healthy
/// states, and drain support.
pub struct Target {
    address: String,
    options: TargetOptions,
    state: watch::Sender<TargetState>,
    inflight: AtomicU64,
    drained: Notify,
    cancel: CancellationToken,
    health_check_task: Mutex<Option<JoinHandle<()>>>,
}

/// Claim on a target for the duration of one request. Dropping the guard
/// releases the claim and signals the drained condition when the last
/// in-flight request completes.
pub struct InflightGuard {
    target: Arc<Target>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.target.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.target.drained.notify_waiters();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Target {
    pub fn new(address: impl Into<String>, options: TargetOptions) -> Result<Arc<Self>> {
        Self::with_state(address, options, TargetState::Adding)
    }

    /// Rebuild a previously saved target. It was healthy when it was saved,
    /// so it starts out Healthy; health checks resume immediately.
    pub fn restore(address: impl Into<String>, options: TargetOptions) -> Result<Arc<Self>> {
        Self::with_state(address, options, TargetState::Healthy)
    }

    fn with_state(
        address: impl Into<String>,
        options: TargetOptions,
        initial: TargetState,
    ) -> Result<Arc<Self>> {
        let address = address.into();
        parse_address(&address)?;

        let (state, _) = watch::channel(initial);
        let target = Arc::new(Self {
            address,
            options,
            state,
            inflight: AtomicU64::new(0),
            drained: Notify::new(),
            cancel: CancellationToken::new(),
            health_check_task: Mutex::new(None),
        });

        target.begin_health_checks();
        Ok(target)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &TargetOptions {
        &self.options
    }

    pub fn state(&self) -> TargetState {
        *self.state.borrow()
    }

    pub fn inflight_count(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Claim the target for one request. Draining targets refuse new claims.
    /// Records the target address in the request context for the access log.
    pub fn start_request(self: &Arc<Self>, req: &Request) -> Result<InflightGuard> {
        if *self.state.borrow() == TargetState::Draining {
            return Err(ProxyError::TargetUnavailable);
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);

        if let Some(context) = RequestContext::of(req) {
            context.set_target(&self.address);
        }

        Ok(InflightGuard {
            target: self.clone(),
        })
    }

    /// Proxy one claimed request to the upstream. The guard rides along with
    /// the response body so the claim is held until the body is consumed.
    pub async fn send_request(&self, req: Request, guard: InflightGuard) -> Result<Response> {
        let (mut parts, body) = req.into_parts();
        let on_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();
        let upgrade = is_upgrade_request(&parts.headers);

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", self.address, path_and_query);

        let mut headers = parts.headers.clone();
        strip_hop_by_hop_headers(&mut headers, upgrade);
        append_forwarded_for(&mut headers, &parts.extensions);

        let body = self.spool_request_body(body).await?;

        let mut request = PROXY_CLIENT
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body);
        if !upgrade {
            request = request.timeout(self.options.target_timeout);
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(ProxyError::Upstream("request cancelled while draining".to_string()));
            }
            result = request.send() => {
                result.map_err(|e| ProxyError::Upstream(e.to_string()))?
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return Ok(self.bridge_upgrade(response, on_upgrade, guard));
        }

        let mut response_headers = response.headers().clone();
        strip_hop_by_hop_headers(&mut response_headers, false);

        // The response buffer middleware picks these limits up from the
        // response extensions, so each target's own sizes apply.
        let mut builder = Response::builder()
            .status(response.status())
            .extension(ResponseBufferConfig {
                max_memory_bytes: self.options.max_response_memory_buffer_size,
                max_bytes: self.options.max_response_body_size,
            });
        if let Some(target_headers) = builder.headers_mut() {
            *target_headers = response_headers;
        }

        let stream = GuardedStream {
            inner: response.bytes_stream().boxed(),
            cancelled: self.cancel.clone().cancelled_owned().boxed(),
            aborted: false,
            _guard: guard,
        };

        builder
            .body(Body::from_stream(stream))
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }

    /// True for probes sent by a downstream proxy's health checker. These are
    /// answered directly while the service is paused or stopped.
    pub fn is_health_check_request(&self, req: &Request) -> bool {
        if req.method() != axum::http::Method::GET
            || req.uri().path() != self.options.health_check.path
        {
            return false;
        }

        req.headers()
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(|ua| ua.starts_with(HEALTH_CHECK_USER_AGENT_PREFIX))
            .unwrap_or(false)
    }

    /// Block until the target's first passing health check, bounded by the
    /// deploy timeout. Used before promoting a new deployment.
    pub async fn wait_until_healthy(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let result = match tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == TargetState::Healthy),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ProxyError::TargetUnavailable),
            Err(_) => Err(ProxyError::TargetTimedOut),
        };
        result
    }

    pub fn stop_health_checks(&self) {
        if let Some(handle) = lock(&self.health_check_task).take() {
            handle.abort();
        }
    }

    /// Retire the target: refuse new claims, stop health checks, and wait for
    /// in-flight requests to finish. Requests still pending at the timeout
    /// are cancelled. Idempotent.
    pub async fn drain(&self, timeout: Duration) {
        self.stop_health_checks();
        self.state.send_if_modified(|state| {
            if *state == TargetState::Draining {
                false
            } else {
                *state = TargetState::Draining;
                true
            }
        });

        if self.wait_for_inflight(timeout).await {
            debug!(address = %self.address, "Target drained");
        } else {
            warn!(address = %self.address, "Drain timed out, cancelling remaining requests");
            self.cancel.cancel();
        }
    }

    /// Wait until no requests are in flight, bounded by the timeout. Returns
    /// false when the timeout expired with requests still pending.
    pub async fn wait_for_inflight(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Enable the waiter before reading the counter; the last guard
            // can drop in between, and notify_waiters only wakes waiters
            // that are already registered.
            let mut drained = std::pin::pin!(self.drained.notified());
            drained.as_mut().enable();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if timeout_at(deadline, drained).await.is_err() {
                return self.inflight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    // Private

    fn begin_health_checks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let config = self.options.health_check.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(target) = weak.upgrade() else { return };
                target.run_health_check(&config).await;
            }
        });

        *lock(&self.health_check_task) = Some(handle);
    }

    async fn run_health_check(&self, config: &HealthCheckConfig) {
        let result = health::check_endpoint(&self.address, config).await;

        if result.healthy {
            let became_healthy = self.state.send_if_modified(|state| {
                if *state == TargetState::Adding {
                    *state = TargetState::Healthy;
                    true
                } else {
                    false
                }
            });

            if became_healthy {
                info!(address = %self.address, "Target became healthy");
            } else {
                debug!(
                    address = %self.address,
                    response_time_ms = result.response_time.as_millis() as u64,
                    "Health check passed"
                );
            }
        } else {
            warn!(
                address = %self.address,
                error = result.error.as_deref().unwrap_or_default(),
                "Health check failed"
            );
        }
    }

    async fn spool_request_body(&self, body: Body) -> Result<reqwest::Body> {
        let mut buffer = Buffer::new(
            self.options.max_request_memory_buffer_size,
            self.options.max_request_body_size,
        );

        let mut frames = body.into_data_stream();
        while let Some(frame) = frames.next().await {
            let chunk = frame.map_err(|e| ProxyError::Io(std::io::Error::other(e)))?;
            buffer.write(&chunk).await.map_err(|e| match e {
                ProxyError::MaximumSizeExceeded => ProxyError::RequestTooLarge,
                other => other,
            })?;
        }

        match buffer.into_contents().await? {
            BufferedContents::Memory(bytes) => Ok(reqwest::Body::from(bytes)),
            BufferedContents::Spilled(file) => Ok(reqwest::Body::wrap_stream(
                ReaderStream::with_capacity(file, PROXY_BUFFER_SIZE),
            )),
        }
    }

    fn bridge_upgrade(
        &self,
        response: reqwest::Response,
        on_upgrade: Option<hyper::upgrade::OnUpgrade>,
        guard: InflightGuard,
    ) -> Response {
        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        if let Some(target_headers) = builder.headers_mut() {
            *target_headers = response.headers().clone();
        }

        if let Some(on_upgrade) = on_upgrade {
            let address = self.address.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let _guard = guard;
                match (on_upgrade.await, response.upgrade().await) {
                    (Ok(client), Ok(mut upstream)) => {
                        let mut client = TokioIo::new(client);
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(address = %address, "Upgraded connection cancelled while draining");
                            }
                            result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
                                if let Err(e) = result {
                                    debug!(address = %address, error = %e, "Upgraded connection closed");
                                }
                            }
                        }
                    }
                    (Err(e), _) => {
                        warn!(address = %address, error = %e, "Client upgrade failed");
                    }
                    (_, Err(e)) => {
                        warn!(address = %address, error = %e, "Upstream upgrade failed");
                    }
                }
            });
        }

        builder
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.health_check_task).take() {
            handle.abort();
        }
    }
}

// Ties the in-flight claim to the response body and aborts the stream when
// the target's drain deadline cancels remaining requests.
struct GuardedStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    cancelled: BoxFuture<'static, ()>,
    aborted: bool,
    _guard: InflightGuard,
}

impl Stream for GuardedStream {
    type Item = std::result::Result<Bytes, ProxyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.aborted {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.aborted = true;
            return Poll::Ready(Some(Err(ProxyError::Upstream(
                "request cancelled while draining".to_string(),
            ))));
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(result)) => {
                Poll::Ready(Some(result.map_err(|e| ProxyError::Upstream(e.to_string()))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn parse_address(address: &str) -> Result<()> {
    let valid = address
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(ProxyError::InvalidAddress(address.to_string()))
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_lowercase().contains("upgrade"))
        .unwrap_or(false)
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap, preserve_upgrade: bool) {
    for name in HOP_BY_HOP_HEADERS {
        if preserve_upgrade && (name == "connection" || name == "upgrade") {
            continue;
        }
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, extensions: &Extensions) {
    let Some(ConnectInfo(peer)) = extensions.get::<ConnectInfo<SocketAddr>>() else {
        return;
    };

    let peer_ip = peer.ip().to_string();
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, peer_ip),
        _ => peer_ip,
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}
