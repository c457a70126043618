//! The IPC server: a UNIX socket speaking the localizer wire protocol.
//!
//! Each connection carries exactly one request. Unary calls answer and
//! close; expose calls stream console lines until the tunnel is up (or
//! failed) and terminate with `Ok`/`Error`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use localizer_api::{codec::Connection, Client, ConsoleLevel, Request, Response, ServiceStatus};
use localizer_core::ServiceId;
use localizer_k8s::expose::{ConsoleSink, ExposeManager, LogLevel};
use localizer_k8s::worker::WorkerHandle;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ServerContext {
    pub worker: WorkerHandle,
    pub expose: Arc<ExposeManager>,
    /// The daemon's root token; `Kill` cancels it.
    pub shutdown: CancellationToken,
    /// Flips to true once the worker has finished draining, which is when
    /// `Kill` may answer.
    pub drained: watch::Receiver<bool>,
}

pub struct IpcServer {
    path: PathBuf,
    ctx: ServerContext,
}

impl IpcServer {
    pub fn new(path: impl AsRef<Path>, ctx: ServerContext) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ctx,
        }
    }

    /// Fails when a live daemon answers on the socket; removes the socket
    /// file when nothing does.
    pub async fn ensure_sole_instance(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        if Client::new(path).ping().await.is_ok() {
            bail!("localizer instance is already running");
        }

        std::fs::remove_file(path)
            .context("failed to clean up socket from old localizer instance")
    }

    pub async fn run(self) -> Result<()> {
        Self::ensure_sole_instance(&self.path).await?;

        let listener = UnixListener::bind(&self.path)
            .with_context(|| format!("failed to listen on {}", self.path.display()))?;
        // The daemon runs as root; the socket stays open to every user.
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o777))
            .context("failed to set socket permissions")?;
        tracing::info!("ipc server listening on '{}'", self.path.display());

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        connections.spawn(handle_connection(stream, self.ctx.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept ipc connection");
                    }
                },
            }
        }

        // In-flight requests (including the Kill that triggered shutdown)
        // get to finish before the socket disappears.
        while connections.join_next().await.is_some() {}
        let _ = std::fs::remove_file(&self.path);
        tracing::info!("ipc server stopped");
        Ok(())
    }
}

async fn handle_connection(stream: UnixStream, ctx: ServerContext) {
    let mut conn = Connection::new(stream);
    let request = match conn.recv::<Request>().await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(err) => {
            tracing::debug!(error = %err, "failed to read ipc request");
            return;
        }
    };

    let result = match request {
        Request::Ping => conn.send(&Response::Pong).await,
        Request::Stable => {
            conn.send(&Response::Stable {
                stable: ctx.worker.is_stable(),
            })
            .await
        }
        Request::List => {
            let services = list_services(&ctx.worker);
            conn.send(&Response::List { services }).await
        }
        Request::Kill => handle_kill(&mut conn, &ctx).await,
        Request::ExposeService {
            namespace,
            service,
            port_map,
        } => {
            handle_expose(
                &mut conn,
                &ctx,
                ServiceId::new(namespace, service),
                port_map,
            )
            .await
        }
        Request::StopExpose { namespace, service } => {
            handle_stop_expose(&mut conn, &ctx, ServiceId::new(namespace, service)).await
        }
    };

    if let Err(err) = result {
        tracing::debug!(error = %err, "failed to answer ipc request");
    }
}

fn list_services(worker: &WorkerHandle) -> Vec<ServiceStatus> {
    worker
        .snapshot()
        .into_iter()
        .map(|state| ServiceStatus {
            namespace: state.service.namespace.clone(),
            name: state.service.name.clone(),
            status: state.status.to_string(),
            status_reason: state.reason.clone(),
            endpoint: state
                .endpoint
                .as_ref()
                .map(|pod| pod.name.clone())
                .unwrap_or_default(),
            ip: state.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            ports: state.ports.iter().map(|pair| pair.to_string()).collect(),
        })
        .collect()
}

/// Shuts the daemon down and answers only after cleanup has actually run:
/// exposures restored, forwards drained, hosts file clean.
async fn handle_kill(
    conn: &mut Connection<UnixStream>,
    ctx: &ServerContext,
) -> std::io::Result<()> {
    tracing::info!("shutdown requested over ipc");
    ctx.shutdown.cancel();

    let mut drained = ctx.drained.clone();
    let _ = drained.wait_for(|drained| *drained).await;
    conn.send(&Response::Ok).await
}

async fn handle_expose(
    conn: &mut Connection<UnixStream>,
    ctx: &ServerContext,
    service: ServiceId,
    port_map: Vec<String>,
) -> std::io::Result<()> {
    let (tx, mut lines) = mpsc::channel(64);
    let sink = ConsoleSink::new(tx);

    let expose = ctx.expose.expose(service, &port_map, sink);
    tokio::pin!(expose);

    let mut lines_open = true;
    loop {
        tokio::select! {
            result = &mut expose => {
                // Flush lines that raced the completion.
                while let Ok((level, message)) = lines.try_recv() {
                    conn.send(&console(level, message)).await?;
                }
                return match result {
                    Ok(()) => conn.send(&Response::Ok).await,
                    Err(err) => {
                        conn.send(&Response::Error {
                            message: format!("{err:#}"),
                        })
                        .await
                    }
                };
            }
            line = lines.recv(), if lines_open => {
                match line {
                    Some((level, message)) => conn.send(&console(level, message)).await?,
                    None => lines_open = false,
                }
            }
        }
    }
}

async fn handle_stop_expose(
    conn: &mut Connection<UnixStream>,
    ctx: &ServerContext,
    service: ServiceId,
) -> std::io::Result<()> {
    match ctx.expose.stop(&service).await {
        Ok(()) => {
            conn.send(&console(
                LogLevel::Info,
                format!("stopped exposing '{service}', scale restored"),
            ))
            .await?;
            conn.send(&Response::Ok).await
        }
        Err(err) => {
            conn.send(&Response::Error {
                message: format!("{err:#}"),
            })
            .await
        }
    }
}

fn console(level: LogLevel, message: String) -> Response {
    let level = match level {
        LogLevel::Info => ConsoleLevel::Info,
        LogLevel::Warn => ConsoleLevel::Warn,
        LogLevel::Error => ConsoleLevel::Error,
    };
    Response::Console { level, message }
}
