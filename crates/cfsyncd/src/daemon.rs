//! Daemon lifecycle: placeholder layer, sync root registration, workers,
//! metrics endpoint, systemd notify, signal-driven shutdown

use anyhow::{Context, Result};
use cfsync_cloudfilter::{CloudFilter, LocalCloudFilter};
use cfsync_core::config::expand_tilde;
use cfsync_core::{
    CfsyncConfig, SyncProviderContext, SyncRootConfig, SyncRootRegistration, SyncSettings,
};
use cfsync_remote::{check_health, RemoteBackend, RemoteRead};
use cfsync_sync::{SyncMetrics, SyncProviderPool};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::metrics::HealthState;

pub async fn run(config: CfsyncConfig) -> Result<()> {
    info!("daemon starting");

    // ── Placeholder layer ────────────────────────────────────────────────
    let state_dir = expand_tilde(&config.daemon.state_dir);
    tokio::fs::create_dir_all(&state_dir)
        .await
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;
    let filter = LocalCloudFilter::open(&state_dir.join("placeholders.json"))
        .context("opening placeholder store")?;
    let shared: Arc<dyn CloudFilter> = Arc::new(filter.clone());

    let mut registry = Registry::default();
    let metrics = SyncMetrics::new(&mut registry);
    let pool = SyncProviderPool::new(shared.clone(), config.sync.clone(), metrics);

    // ── Sync roots ───────────────────────────────────────────────────────
    let mut remotes: Vec<(String, Arc<dyn RemoteRead>)> = Vec::new();
    for root in &config.roots {
        let mut root = root.clone();
        root.local_path = expand_tilde(&root.local_path);
        match start_root(shared.as_ref(), &pool, &config.sync, &root).await {
            Ok((id, read)) => remotes.push((id, read)),
            Err(e) => warn!(account = %root.account, "sync root not started: {e:#}"),
        }
    }
    if remotes.is_empty() {
        warn!("no sync roots running (add [[roots]] to the config)");
    }

    // Start Prometheus metrics endpoint
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            remotes: Arc::new(remotes),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    notify_ready();

    wait_for_shutdown().await?;
    info!(roots = pool.ids().len(), "shutting down sync roots");
    pool.stop_all().await;
    filter.flush().context("flushing placeholder store")?;
    info!("daemon stopped");
    Ok(())
}

/// Register one root with the placeholder layer and start its worker.
async fn start_root(
    filter: &dyn CloudFilter,
    pool: &SyncProviderPool,
    settings: &SyncSettings,
    root: &SyncRootConfig,
) -> Result<(String, Arc<dyn RemoteRead>)> {
    let registration = SyncRootRegistration::from_config(root)?;
    filter
        .register_sync_root(&registration)
        .await
        .with_context(|| format!("registering {}", root.local_path.display()))?;

    let backend = RemoteBackend::from_config(&root.remote, settings)
        .with_context(|| format!("building {} remote", root.remote.kind))?;
    match check_health(backend.read.as_ref()).await {
        Ok(()) => info!(root = %registration.id, kind = %backend.kind, "remote: connected"),
        // The remote watcher keeps retrying with backoff
        Err(e) => warn!(root = %registration.id, "remote: {e:#}"),
    }

    let read = backend.read.clone();
    let provider = pool.start(SyncProviderContext::from_config(root), backend);
    info!(
        root = %registration.id,
        name = %registration.display_name,
        path = %root.local_path.display(),
        policy = ?root.population_policy,
        "sync root started"
    );
    Ok((provider.context().id.to_string(), read))
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
