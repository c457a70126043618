//! Daemon wiring: one cache, one worker, one reconciler, one expose
//! manager, one IPC server, and an orderly shutdown connecting them.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use localizer_core::{AliasMode, HostsFile, IpAllocator};
use localizer_k8s::expose::ExposeManager;
use localizer_k8s::tunnel::PodTunnelFactory;
use localizer_k8s::worker::{CacheEndpoints, Worker};
use localizer_k8s::{make_client, Cache, Reconciler, ReconcilerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::server::{IpcServer, ServerContext};

/// How long the initial cache sync may take before startup is aborted.
const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

const HOSTS_PATH: &str = "/etc/hosts";
const HOSTS_BLOCK: &str = "localizer";

pub struct Options {
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub cluster_domain: String,
    pub ip_cidr: Ipv4Net,
    pub skip_namespaces: Vec<String>,
}

pub async fn run(opts: Options) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("must be run as root/Administrator");
    }

    // Refuse to start next to a live daemon before touching anything else.
    IpcServer::ensure_sole_instance(Path::new(localizer_api::SOCKET_PATH)).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let client = make_client(opts.context.clone()).await?;

    let cache = Cache::new();
    cache.spawn_watchers(client.clone(), opts.namespace.as_deref(), &shutdown);
    tracing::info!("waiting for caches to sync ...");
    tokio::time::timeout(SYNC_TIMEOUT, cache.wait_ready())
        .await
        .context("timed out waiting for caches to sync")??;
    tracing::info!("caches synced");

    let hosts = Arc::new(HostsFile::new(HOSTS_PATH, HOSTS_BLOCK));
    hosts
        .load()
        .await
        .context("failed to open up hosts file for r/w")?;

    let alias_mode = if std::env::var_os("DISABLE_LOOPBACK_ALIAS").is_some() {
        AliasMode::Disabled
    } else {
        AliasMode::Auto
    };
    let ips = Arc::new(IpAllocator::new(opts.ip_cidr, alias_mode));
    let localhost = Ipv4Addr::new(127, 0, 0, 1);
    if ips.contains(localhost) {
        // Keep localhost itself out of circulation.
        ips.acquire_specific(localhost)
            .context("failed to reserve 127.0.0.1")?;
    }

    let worker = Worker::spawn(
        hosts,
        ips,
        Arc::new(CacheEndpoints(cache.clone())),
        Arc::new(PodTunnelFactory::new(client.clone())),
        shutdown.clone(),
    );

    let expose = Arc::new(ExposeManager::new(
        client.clone(),
        cache.clone(),
        shutdown.clone(),
    ));
    if let Err(err) = expose.sweep_abandoned(opts.namespace.as_deref()).await {
        tracing::warn!(error = %err, "failed to sweep abandoned sidecar pods");
    }

    let mut config = ReconcilerConfig {
        cluster_domain: opts.cluster_domain.clone(),
        ..ReconcilerConfig::default()
    };
    config
        .skip_namespaces
        .extend(opts.skip_namespaces.iter().cloned());
    tokio::spawn(Reconciler::new(cache.clone(), config).run(worker.clone(), shutdown.clone()));

    let (drained_tx, drained_rx) = watch::channel(false);
    let server = IpcServer::new(
        localizer_api::SOCKET_PATH,
        ServerContext {
            worker: worker.clone(),
            expose: expose.clone(),
            shutdown: shutdown.clone(),
            drained: drained_rx,
        },
    );
    let server_task = tokio::spawn(server.run());

    shutdown.cancelled().await;
    tracing::info!("shutting down");

    // Exposures first: they restore controller scale. Then the worker,
    // which tears every forward (hosts entries, aliases, addresses) down.
    expose.shutdown().await;
    worker.wait_done().await;
    let _ = drained_tx.send(true);

    match server_task.await {
        Ok(result) => result?,
        Err(err) => tracing::warn!(error = %err, "ipc server task failed"),
    }

    tracing::info!("shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("signal received, shutting down");
        shutdown.cancel();
    });
    Ok(())
}
