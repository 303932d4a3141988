use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tracing::{error, info};

use crate::buffer::{Buffer, BufferedContents};
use crate::config::{
    DEFAULT_MAX_RESPONSE_BODY_SIZE, DEFAULT_MAX_RESPONSE_MEMORY_BUFFER_SIZE, PROXY_BUFFER_SIZE,
};

/// Size limits for buffered responses
#[derive(Debug, Clone, Copy)]
pub struct ResponseBufferConfig {
    pub max_memory_bytes: u64,
    pub max_bytes: u64,
}

impl Default for ResponseBufferConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_RESPONSE_MEMORY_BUFFER_SIZE,
            max_bytes: DEFAULT_MAX_RESPONSE_BODY_SIZE,
        }
    }
}

/// Exact size of a buffered response body, recorded in the response
/// extensions for the logging middleware.
#[derive(Debug, Clone, Copy)]
pub struct ResponseLength(pub u64);

/// Collect the downstream response into a bounded buffer before anything is
/// sent to the client. Oversized responses become a 500; upgrade responses
/// pass through untouched so the connection can be handed over. A target
/// can override the server-wide limits by attaching its own
/// `ResponseBufferConfig` to the response extensions.
pub async fn response_buffer_middleware(
    State(config): State<ResponseBufferConfig>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    // The upgrade machinery owns the connection once the 101 goes out, so
    // there is nothing for us to buffer.
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return response;
    }

    let config = response
        .extensions()
        .get::<ResponseBufferConfig>()
        .copied()
        .unwrap_or(config);

    let (mut parts, body) = response.into_parts();
    let mut buffer = Buffer::new(config.max_memory_bytes, config.max_bytes);
    let mut frames = body.into_data_stream();

    while let Some(frame) = frames.next().await {
        let chunk = match frame {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(path = %path, error = %e, "Error reading response body");
                return internal_server_error();
            }
        };

        if buffer.write(&chunk).await.is_err() {
            break;
        }
    }

    if buffer.overflowed() {
        info!(path = %path, "Response exceeded max response limit");
        return internal_server_error();
    }

    let length = buffer.len();
    let body = match buffer.into_contents().await {
        Ok(BufferedContents::Memory(bytes)) => Body::from(bytes),
        Ok(BufferedContents::Spilled(file)) => Body::from_stream(
            tokio_util::io::ReaderStream::with_capacity(file, PROXY_BUFFER_SIZE),
        ),
        Err(e) => {
            error!(path = %path, error = %e, "Error replaying buffered response");
            return internal_server_error();
        }
    };

    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    parts.extensions.insert(ResponseLength(length));

    Response::from_parts(parts, body)
}

fn internal_server_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware::from_fn_with_state, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(config: ResponseBufferConfig, handler_body: Vec<u8>) -> Router {
        Router::new()
            .fallback(move || {
                let body = handler_body.clone();
                async move {
                    (
                        StatusCode::CREATED,
                        [(header::CONTENT_TYPE, "text/html")],
                        body,
                    )
                }
            })
            .layer(from_fn_with_state(config, response_buffer_middleware))
    }

    #[tokio::test]
    async fn test_small_response_is_replayed() {
        let config = ResponseBufferConfig {
            max_memory_bytes: 512,
            max_bytes: 1024,
        };

        let resp = app(config, b"hello".to_vec())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(resp.extensions().get::<ResponseLength>().unwrap().0, 5);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_spilled_response_is_replayed_in_order() {
        let config = ResponseBufferConfig {
            max_memory_bytes: 16,
            max_bytes: 1024,
        };
        let payload: Vec<u8> = (0..200u32).map(|n| n as u8).collect();

        let resp = app(config, payload.clone())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_500() {
        let config = ResponseBufferConfig {
            max_memory_bytes: 512,
            max_bytes: 1024,
        };

        let resp = app(config, vec![b'x'; 2000])
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_limits_attached_to_the_response_win() {
        // Server-wide limits are generous; the handler attaches its own
        // small ones, so the 64 byte body overflows.
        let app = Router::new()
            .fallback(|| async {
                Response::builder()
                    .extension(ResponseBufferConfig {
                        max_memory_bytes: 8,
                        max_bytes: 16,
                    })
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap()
            })
            .layer(from_fn_with_state(
                ResponseBufferConfig::default(),
                response_buffer_middleware,
            ));

        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_switching_protocols_passes_through() {
        let app = Router::new()
            .fallback(|| async {
                Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(header::UPGRADE, "websocket")
                    .body(Body::empty())
                    .unwrap()
            })
            .layer(from_fn_with_state(
                ResponseBufferConfig::default(),
                response_buffer_middleware,
            ));

        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(resp.extensions().get::<ResponseLength>().is_none());
    }
}
