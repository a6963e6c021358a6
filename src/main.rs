// Worker watchdog host
//
// Supervises one game-server worker described by a JSON config file:
//     worker-watchdog <config.json>
// The bridge server listens on the configured loopback port until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use worker_watchdog::{
    ArtifactCleanup, ArtifactMetadata, ArtifactSlotManager, BridgeDispatcher, BridgeServer,
    CompiledArtifact, DirectoryCleanup, JsonFileReattachStore, NoopCleanup, NullCollaborator,
    ProcessSessionController, TcpWorkerClient, TokioJobManager, Watchdog, WatchdogConfig,
    WatchdogServices,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .context("usage: worker-watchdog <config.json>")?;
    let config = Arc::new(
        WatchdogConfig::from_file(&path)
            .await
            .with_context(|| format!("loading {path}"))?,
    );
    log::info!(
        "Worker watchdog {} for instance {}",
        worker_watchdog::VERSION,
        config.instance_name
    );

    let cancel = CancellationToken::new();

    // Retired artifact directories are only removed when they were handed to us
    let cleanup: Arc<dyn ArtifactCleanup> = if config.artifact_directory.is_some() {
        Arc::new(DirectoryCleanup)
    } else {
        Arc::new(NoopCleanup)
    };
    let slots = ArtifactSlotManager::with_cleanup(cleanup);
    if let Some(directory) = &config.artifact_directory {
        slots.stage(CompiledArtifact::new(
            directory,
            config.artifact_entry.clone(),
            ArtifactMetadata::default(),
        ));
        slots.promote_staged();
    }

    let dispatcher = BridgeDispatcher::new();
    let client = Arc::new(TcpWorkerClient);
    let store = Arc::new(JsonFileReattachStore::new(&config.reattach_file));
    let controller = Arc::new(ProcessSessionController::new(
        Arc::clone(&config),
        dispatcher.clone(),
        client.clone(),
        store.clone(),
    ));
    let jobs = Arc::new(TokioJobManager::new(cancel.child_token()));

    let watchdog = Watchdog::new(
        Arc::clone(&config),
        WatchdogServices {
            controller,
            worker_client: client,
            reattach_store: store,
            slots,
            events: Arc::new(NullCollaborator),
            chat: Arc::new(NullCollaborator),
            jobs: jobs.clone(),
        },
    );

    let listener = BridgeServer::bind(config.bridge_port)
        .await
        .with_context(|| format!("binding bridge port {}", config.bridge_port))?;
    let server = BridgeServer::new(dispatcher, config.max_bridge_payload);
    let server_task = tokio::spawn(server.serve(listener, cancel.child_token()));

    watchdog.launch(&cancel).await.context("launching worker")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    log::info!("Shutting down");

    jobs.cancel_all();
    if let Err(e) = watchdog.terminate(true, &CancellationToken::new()).await {
        log::error!("Termination failed: {}", e);
    }
    cancel.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Bridge server stopped with error: {}", e),
        Err(e) => log::warn!("Bridge server task failed: {}", e),
    }
    Ok(())
}
