use std::net::SocketAddr;

use anyhow::{Context, Result};
use roster_service::config::Config;
use roster_service::metric;

use crate::endpoints;
use crate::service::RequestService;

/// Starts the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("roster-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .context("invalid bind address")?;
    let service = web_pool
        .block_on(RequestService::create(config))
        .context("failed to create HTTP service state")?;

    tracing::info!(
        policy = ?service.config().reads.policy,
        "Starting HTTP server on {}",
        socket
    );
    let server =
        axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
