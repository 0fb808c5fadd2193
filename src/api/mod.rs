pub mod routes;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::store::SubmissionHub;
use anyhow::{Context, Result};
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub async fn run_server(
    config: Arc<Config>,
    catalog: Arc<Catalog>,
    hub: Arc<SubmissionHub>,
) -> Result<()> {
    let port = config.api_port;
    let state = routes::ApiState {
        config,
        catalog,
        hub,
    };
    let app: Router = routes::router(state);

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API server: {addr}"))?;

    info!(address = %addr, "checkboard API server started");

    axum::serve(listener, app)
        .await
        .context("API server failed")?;

    Ok(())
}
