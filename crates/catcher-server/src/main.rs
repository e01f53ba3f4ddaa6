use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use catcher_server::routes;
use catcher_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("catcher=info".parse()?))
        .with_target(false)
        .init();

    let admin_token = std::env::var("CATCHER_ADMIN_TOKEN").ok();
    if admin_token.is_none() {
        tracing::warn!("CATCHER_ADMIN_TOKEN not set; the kill switch is read-only");
    }
    let port: u16 = std::env::var("CATCHER_SERVER_PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .context("CATCHER_SERVER_PORT must be a port number")?;
    let addr = format!("0.0.0.0:{port}");

    let state = Arc::new(AppState::new(admin_token));

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting signal service on {addr}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
}
