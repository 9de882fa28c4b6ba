use std::env;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{info, warn};
use user_service::config::load_provider_config;
use user_service::quota::QuotaScan;
use user_service::AppState;

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
                .body(axum::body::Body::from("metrics unavailable"))
                .expect("failed to build metrics response")
        }
    }
}

async fn quota_scans(State(state): State<AppState>) -> Json<Vec<QuotaScan>> {
    Json(state.scans.list_scans())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config_dir = env::var("SFTPD_CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
    let config = load_provider_config()?;
    info!(
        driver = config.driver.as_str(),
        config_dir = %config_dir,
        "initializing user store"
    );
    let state = AppState::initialize(config, Path::new(&config_dir))
        .await
        .context("Failed to initialize the user store")?;

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/quota-scans", get(quota_scans))
        .with_state(state.clone());

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));

    info!(%addr, "starting user-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state
        .close()
        .await
        .context("Failed to close the user store")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
