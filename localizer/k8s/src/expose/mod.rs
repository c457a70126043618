//! The expose orchestrator.
//!
//! One exposure replaces a service's backing pods with an SSH-server sidecar
//! the developer controls:
//!
//! ```text
//!   capture controllers -> scale to 0 -> create sidecar -> wait ready
//!     -> port-forward to the sidecar's SSH port -> reverse tunnel -> running
//! ```
//!
//! Any failure past scale-down tears the attempt back to the sidecar step
//! and retries after a short backoff. Cancellation skips straight to the
//! exit path: delete the sidecar, restore the captured scale. Scale is
//! restored exactly once, at exposure termination, and never with the
//! cancelled context.

pub mod sidecar;
pub mod ssh;

use std::collections::BTreeMap;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{anyhow, bail, Context as _, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use localizer_core::ports::parse_port_map;
use localizer_core::{PortPair, ServiceId};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::resolver::{self, ResolvedServicePort};
use crate::tunnel::accept_loop;
use sidecar::{ScaledController, SSH_PASSWORD, SSH_PORT, SSH_USER};
use ssh::ReverseTunnelClient;

/// Pause between attempts after a tunnel failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);
/// How often the sidecar pod is polled from the cache.
const POD_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Fans progress lines out to the daemon log and, when a CLI is attached,
/// to its console stream. Dropping the receiving side just mutes the
/// console copy.
#[derive(Clone)]
pub struct ConsoleSink {
    tx: Option<mpsc::Sender<(LogLevel, String)>>,
}

impl ConsoleSink {
    pub fn new(tx: mpsc::Sender<(LogLevel, String)>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that only reaches the daemon log.
    pub fn silent() -> Self {
        Self { tx: None }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.emit(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.emit(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.emit(LogLevel::Error, message);
    }

    fn emit(&self, level: LogLevel, message: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send((level, message));
        }
    }
}

/// The distinguished ways a running exposure can fail. Each tears down the
/// current attempt; none of them touch the captured scale.
#[derive(Debug, thiserror::Error)]
enum ExposeFailure {
    #[error("sidecar pod was destroyed")]
    PodDestroyed,

    #[error("port-forward transport died: {0}")]
    Transport(String),

    #[error("ssh transport died: {0}")]
    Ssh(String),
}

struct ActiveExposure {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns every live exposure, keyed by service.
pub struct ExposeManager {
    client: Client,
    cache: Cache,
    shutdown: CancellationToken,
    active: Mutex<AHashMap<String, ActiveExposure>>,
}

impl ExposeManager {
    pub fn new(client: Client, cache: Cache, shutdown: CancellationToken) -> Self {
        Self {
            client,
            cache,
            shutdown,
            active: Mutex::new(AHashMap::new()),
        }
    }

    /// Starts exposing `service`, streaming progress into `sink`. Returns
    /// once the reverse tunnel is up; the exposure itself keeps running (and
    /// self-heals) until [`ExposeManager::stop`] or daemon shutdown.
    pub async fn expose(
        &self,
        service: ServiceId,
        port_map: &[String],
        sink: ConsoleSink,
    ) -> Result<()> {
        let key = service.key();

        let svc = self
            .cache
            .services
            .get(&key)
            .ok_or_else(|| anyhow!("failed to find service '{key}'"))?;
        let selector = svc
            .spec
            .as_ref()
            .and_then(|s| s.selector.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("service '{key}' has no selector, cannot expose it"))?;

        let mut ports = resolver::resolve_service_ports(&self.cache, &svc);
        if ports.is_empty() {
            bail!("service '{key}' has no TCP ports");
        }
        let overrides = parse_port_map(port_map)?;
        resolver::apply_port_map(&mut ports, &overrides);

        let controllers = sidecar::capture_controllers(&self.cache, &svc);

        let cancel = self.shutdown.child_token();
        let (started_tx, started_rx) = oneshot::channel();
        let exposure = Exposure {
            client: self.client.clone(),
            cache: self.cache.clone(),
            service: service.clone(),
            selector,
            ports,
            controllers,
            sink,
            cancel: cancel.clone(),
        };

        {
            let mut active = self.active.lock();
            if active.contains_key(&key) {
                bail!("service '{key}' is already exposed");
            }
            let task = tokio::spawn(exposure.run(started_tx));
            active.insert(key.clone(), ActiveExposure { cancel, task });
        }

        match started_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => {
                self.remove(&key).await;
                Err(anyhow!(message))
            }
            Err(_) => {
                self.remove(&key).await;
                Err(anyhow!("exposure for '{key}' ended before the tunnel came up"))
            }
        }
    }

    /// Cancels the exposure for `service` and waits for its scale restore.
    pub async fn stop(&self, service: &ServiceId) -> Result<()> {
        let key = service.key();
        let Some(entry) = self.active.lock().remove(&key) else {
            bail!("service '{key}' isn't exposed");
        };

        entry.cancel.cancel();
        let _ = entry.task.await;
        Ok(())
    }

    /// Cancels every exposure and waits for all of them to restore scale.
    pub async fn shutdown(&self) {
        let entries: Vec<ActiveExposure> = {
            let mut active = self.active.lock();
            active.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            let _ = entry.task.await;
        }
    }

    /// Cleans up sidecars left behind by a previous daemon.
    pub async fn sweep_abandoned(&self, namespace: Option<&str>) -> Result<()> {
        sidecar::sweep_abandoned(&self.client, namespace).await
    }

    async fn remove(&self, key: &str) {
        let entry = self.active.lock().remove(key);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let _ = entry.task.await;
        }
    }
}

/// One exposure's worth of state, owned by its task.
struct Exposure {
    client: Client,
    cache: Cache,
    service: ServiceId,
    selector: BTreeMap<String, String>,
    ports: Vec<ResolvedServicePort>,
    controllers: Vec<ScaledController>,
    sink: ConsoleSink,
    cancel: CancellationToken,
}

impl Exposure {
    async fn run(self, started: oneshot::Sender<Result<(), String>>) {
        for controller in &self.controllers {
            self.sink.info(format!(
                "scaling {} from {} -> 0",
                controller.key(),
                controller.replicas
            ));
            if let Err(err) = sidecar::scale(&self.client, controller, 0).await {
                let message = format!("failed to scale down {}: {err:#}", controller.key());
                self.sink.error(message.clone());
                let _ = started.send(Err(message));
                self.restore_scale().await;
                return;
            }
        }

        // Resolve the caller's wait the moment the tunnel first comes up.
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let sink = self.sink.clone();
        let service = self.service.clone();
        tokio::spawn(async move {
            if ready_rx.wait_for(|ready| *ready).await.is_ok() {
                sink.info(format!("service '{service}' is now exposed"));
                let _ = started.send(Ok(()));
            }
        });

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.attempt(&ready_tx).await {
                Ok(()) => break,
                Err(failure) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.sink.warn(format!(
                        "exposure attempt failed: {failure}; retrying in {}s",
                        RETRY_BACKOFF.as_secs()
                    ));
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
            }
        }

        self.restore_scale().await;
    }

    /// One sidecar's lifetime: create, drive the tunnel, tear down. Returns
    /// Ok only on cancellation.
    async fn attempt(&self, ready: &watch::Sender<bool>) -> Result<(), ExposeFailure> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.service.namespace);

        let spec = sidecar::sidecar_pod(
            &self.service,
            &self.selector,
            &self.ports,
            &self.controllers,
        )
        .map_err(|err| ExposeFailure::Transport(format!("{err:#}")))?;
        let pod = pods
            .create(&PostParams::default(), &spec)
            .await
            .map_err(|err| ExposeFailure::Transport(format!("failed to create sidecar pod: {err}")))?;
        let pod_name = pod.name_any();
        self.sink.info(format!("created sidecar pod {pod_name}"));

        let attempt_cancel = self.cancel.child_token();
        let result = self.drive(&pod_name, ready, &attempt_cancel).await;
        attempt_cancel.cancel();

        tracing::debug!(pod = %pod_name, "cleaning up sidecar pod");
        if let Err(err) = pods.delete(&pod_name, &DeleteParams::default()).await {
            tracing::warn!(pod = %pod_name, error = %err, "failed to delete sidecar pod");
        }

        result
    }

    async fn drive(
        &self,
        pod_name: &str,
        ready: &watch::Sender<bool>,
        cancel: &CancellationToken,
    ) -> Result<(), ExposeFailure> {
        self.sink.info("waiting for sidecar pod to be ready ...");
        self.wait_pod_ready(pod_name, cancel).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.sink.info("sidecar is ready, creating port-forward");
        let (local_port, mut transport_died) = self
            .forward_ssh_port(pod_name, cancel)
            .await
            .map_err(|err| ExposeFailure::Transport(format!("{err:#}")))?;

        let mut tunnel = ReverseTunnelClient::new("127.0.0.1", local_port, SSH_USER, SSH_PASSWORD);
        for port in &self.ports {
            tunnel.forward(PortPair {
                local: port.local,
                remote: port.target_port,
            });
        }

        self.sink.info("starting reverse tunnel");
        let tunnel_run = tunnel.run(&self.service, cancel, ready.clone());
        tokio::pin!(tunnel_run);

        let pod_key = format!("{}/{}", self.service.namespace, pod_name);
        let mut pod_poll = tokio::time::interval(POD_POLL);
        loop {
            tokio::select! {
                result = &mut tunnel_run => {
                    return result.map_err(|err| ExposeFailure::Ssh(format!("{err:#}")));
                }
                died = transport_died.recv() => {
                    let reason = died.unwrap_or_else(|| "port-forward closed".to_string());
                    return Err(ExposeFailure::Transport(reason));
                }
                _ = pod_poll.tick() => {
                    if self.cache.pods.get(&pod_key).is_none() {
                        return Err(ExposeFailure::PodDestroyed);
                    }
                }
            }
        }
    }

    /// Polls the cache until the sidecar reports ready. A pod that was seen
    /// and then vanished counts as destroyed.
    async fn wait_pod_ready(
        &self,
        pod_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ExposeFailure> {
        let pod_key = format!("{}/{}", self.service.namespace, pod_name);
        let mut ticker = tokio::time::interval(POD_POLL);
        let mut seen = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match self.cache.pods.get(&pod_key) {
                        Some(pod) => {
                            seen = true;
                            if pod_is_ready(&pod) {
                                return Ok(());
                            }
                        }
                        None if seen => return Err(ExposeFailure::PodDestroyed),
                        None => {}
                    }
                }
            }
        }
    }

    /// Binds an ephemeral local port whose connections are forwarded to the
    /// sidecar's SSH port. Returns the port and a channel that reports
    /// transport death.
    async fn forward_ssh_port(
        &self,
        pod_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(u16, mpsc::Receiver<String>)> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.service.namespace);

        // Fail the attempt now if the subresource is unreachable.
        let probe = api
            .portforward(pod_name, &[SSH_PORT])
            .await
            .context("failed to open port-forward to the sidecar")?;
        drop(probe);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("failed to bind a local port for the ssh transport")?;
        let local_port = listener
            .local_addr()
            .context("failed to read the bound address")?
            .port();

        let (died_tx, died_rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(
            listener,
            api,
            pod_name.to_string(),
            SSH_PORT,
            cancel.clone(),
            died_tx,
        ));

        Ok((local_port, died_rx))
    }

    /// Restores every captured controller to its observed replica count.
    /// Runs unconditionally on exposure termination, after cancellation.
    async fn restore_scale(&self) {
        for controller in &self.controllers {
            self.sink.info(format!(
                "scaling {} from 0 -> {}",
                controller.key(),
                controller.replicas
            ));
            if let Err(err) =
                sidecar::scale(&self.client, controller, controller.replicas).await
            {
                self.sink.warn(format!(
                    "failed to scale {} back up: {err:#}",
                    controller.key()
                ));
            }
        }
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|cond| cond.type_ == "Ready" && cond.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    #[test]
    fn pod_readiness_requires_a_true_ready_condition() {
        let mut pod = Pod::default();
        assert!(!pod_is_ready(&pod));

        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        });
        assert!(!pod_is_ready(&pod));

        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..PodCondition::default()
        }]);
        assert!(pod_is_ready(&pod));
    }

    #[tokio::test]
    async fn console_sink_fans_out_when_attached() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = ConsoleSink::new(tx);
        sink.info("starting");
        sink.warn("careful");

        assert_eq!(rx.recv().await.unwrap(), (LogLevel::Info, "starting".to_string()));
        assert_eq!(rx.recv().await.unwrap(), (LogLevel::Warn, "careful".to_string()));

        // A silent sink only reaches the daemon log.
        ConsoleSink::silent().error("nobody listening");
    }
}
