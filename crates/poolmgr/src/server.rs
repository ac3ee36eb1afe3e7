use std::net::SocketAddr;

use anyhow::{Context, Result};
use poolmgr_service::config::Config;
use poolmgr_service::metric;
use poolmgr_service::services::PoolManager;

use crate::endpoints;
use crate::service::RequestService;

/// Starts the pool manager and its HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("poolmgr-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .context("invalid bind address")?;

    runtime.block_on(async {
        let manager = PoolManager::new(&config).context("failed to create the pool manager")?;
        let service = RequestService::new(manager, &config);

        tracing::info!("Starting HTTP server on {}", socket);
        axum_server::bind(socket)
            .serve(endpoints::create_app(service).into_make_service())
            .await
            .context("HTTP server failed")
    })?;

    tracing::info!("System shutdown complete");
    Ok(())
}
