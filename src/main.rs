use std::sync::Arc;

use caspar_launcher::config::GlobalConfig;
use caspar_launcher::ipc::{bridge::RequestBridge, IPCServer};
use caspar_launcher::path_detector::ProcessLocator;
use caspar_launcher::process_monitor::SystemProcessTable;
use caspar_launcher::supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("CasparCG launcher starting");

    let cfg = GlobalConfig::load()?;

    let locator = ProcessLocator::new(
        &cfg.server.executable,
        Arc::new(SystemProcessTable),
        cfg.enumeration_timeout(),
    );
    let supervisor = Arc::new(Supervisor::new(locator, cfg.supervisor_settings()));
    let bridge = Arc::new(RequestBridge::new(supervisor.clone()));
    let ipc_server = IPCServer::new(bridge, &cfg.ipc_listen);

    // Graceful shutdown: Ctrl+C 시 관리 중인 서버까지 정리
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received, cleaning up...");
            supervisor.shutdown().await;
            shutdown.cancel();
        });
    }

    if let Err(e) = ipc_server.start(shutdown.clone()).await {
        tracing::error!("IPC server error: {}", e);
        supervisor.shutdown().await;
        return Err(e);
    }

    tracing::info!("CasparCG launcher shutting down");
    Ok(())
}
