use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use super::context::RequestContext;
use super::response_buffer::ResponseLength;

/// Writes one JSON record per request to a configurable sink. Production
/// wiring points this at stdout; tests inject an in-memory buffer.
#[derive(Clone)]
pub struct AccessLogger {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl AccessLogger {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn to_stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn log(&self, record: &Value) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize access log record: {}", e);
                return;
            }
        };

        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(sink, "{}", line) {
            error!("Failed to write access log record: {}", e);
        }
        let _ = sink.flush();
    }
}

/// Emit a single structured record for every request that passes through.
/// Inner components contribute the `service` and `target` fields, plus any
/// extra request headers to echo, through the request context slots.
pub async fn logging_middleware(
    State(logger): State<AccessLogger>,
    mut req: Request,
    next: Next,
) -> Response {
    let context = Arc::new(RequestContext::default());
    req.extensions_mut().insert(context.clone());

    let headers = req.headers().clone();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let host = header_str(&headers, header::HOST.as_str())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default();
    let request_id = header_str(&headers, "x-request-id")
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let remote_addr = forwarded_for(&headers)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_default();
    let user_agent = header_str(&headers, header::USER_AGENT.as_str())
        .unwrap_or_default()
        .to_string();
    let req_content_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_string();
    let req_content_length = content_length(&headers);

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let resp_content_type = header_str(response.headers(), header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_string();
    let resp_content_length = response
        .extensions()
        .get::<ResponseLength>()
        .map(|len| len.0)
        .or_else(|| {
            use http_body::Body as _;
            response.body().size_hint().exact()
        })
        .unwrap_or_else(|| content_length(response.headers()));

    let mut record = json!({
        "msg": "Request",
        "level": "INFO",
        "time": Utc::now().to_rfc3339(),
        "request_id": request_id,
        "host": host,
        "path": path,
        "method": method,
        "status": status,
        "remote_addr": remote_addr,
        "user_agent": user_agent,
        "req_content_length": req_content_length,
        "req_content_type": req_content_type,
        "resp_content_length": resp_content_length,
        "resp_content_type": resp_content_type,
        "query": query,
        "service": context.service().unwrap_or_default(),
        "target": context.target().unwrap_or_default(),
    });

    if let Some(fields) = record.as_object_mut() {
        for name in context.log_headers() {
            let field = format!("header_{}", name.to_lowercase().replace('-', "_"));
            let value = header_str(&headers, &name).unwrap_or_default().to_string();
            fields.insert(field, Value::String(value));
        }
    }

    logger.log(&record);

    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> u64 {
    header_str(headers, header::CONTENT_LENGTH.as_str())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, "x-forwarded-for")?;
    let first = value.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_string())
}
