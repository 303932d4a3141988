use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    Router,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod buffer;
mod config;
mod error;
mod health;
mod middleware;
mod proxy;
mod ssl;

use config::Config;
use middleware::{
    logging_middleware, response_buffer_middleware, AccessLogger, ResponseBufferConfig,
};
use proxy::service::strip_port;
use proxy::{Service, Target};

#[derive(Parser, Debug)]
#[command(name = "mproxy")]
#[command(about = "A zero-downtime reverse proxy with health-checked target swapping")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,

    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
struct AppState {
    services: Arc<Vec<Arc<Service>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config).await?;

    let default_level = if args.debug {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mproxy");

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let mut services = Vec::new();
    for entry in &config.services {
        let service = Arc::new(Service::new(
            entry.name.clone(),
            entry.host.clone(),
            entry.options.clone(),
        ));

        if let Some(cert_manager) = service.cert_manager() {
            cert_manager.ensure_cache_dir().await.with_context(|| {
                format!(
                    "Failed to create certificate cache for service '{}'",
                    entry.name
                )
            })?;
        }

        let target = Target::new(entry.target.clone(), entry.target_options.clone())?;

        info!(service = %entry.name, upstream = %entry.target, "Waiting for target to become healthy");
        target
            .wait_until_healthy(target.options().deploy_timeout)
            .await
            .with_context(|| format!("Target for service '{}' is not healthy", entry.name))?;

        service.set_active_target(target, config.server.drain_timeout);
        info!(service = %entry.name, "Service is live");
        services.push(service);
    }

    let state = AppState {
        services: Arc::new(services),
    };

    let buffer_config = ResponseBufferConfig {
        max_memory_bytes: config.buffering.max_response_memory_buffer_size,
        max_bytes: config.buffering.max_response_body_size,
    };
    let logger = AccessLogger::to_stdout();

    let app = Router::new()
        .fallback(handle_request)
        .with_state(state.clone())
        .layer(from_fn_with_state(buffer_config, response_buffer_middleware))
        .layer(from_fn_with_state(logger, logging_middleware));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("mproxy listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    for service in state.services.iter() {
        if let Err(e) = service.stop(config.server.drain_timeout).await {
            error!(service = %service.name(), error = %e, "Error stopping service");
        }
    }

    info!("mproxy shutdown complete");
    Ok(())
}

async fn handle_request(State(state): State<AppState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();
    let host = strip_port(host);

    match state
        .services
        .iter()
        .find(|service| service.host().eq_ignore_ascii_case(host))
    {
        Some(service) => service.serve(req).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
