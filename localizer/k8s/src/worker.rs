//! The port-forward worker.
//!
//! The worker is the sole mutator of the live port-forward set. It drains one
//! FIFO request channel and handles every request to completion before the
//! next; that serialization is what keeps IP, alias, and hosts-file mutations
//! from racing. Everything else (the reconciler, per-forward supervisors, the
//! IPC facade) talks to it through [`WorkerHandle`].

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use localizer_core::hostsfile::HostsError;
use localizer_core::ipalloc::AllocError;
use localizer_core::{HostsFile, IpAllocator, PodId, PortPair, ServiceId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::resolver::first_pod_endpoint;

/// Status reason used when a service has no Pod endpoints yet.
pub const NO_ENDPOINTS_REASON: &str = "No endpoints were found.";

/// How long the worker must sit idle before reporting itself stable.
const STABILITY_WINDOW: Duration = Duration::from_secs(2);

/// Per-delete budget used while draining on shutdown, so cleanup still runs
/// to completion after the root context is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
    Running,
    Recreating,
    Waiting,
}

impl std::fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForwardStatus::Running => "running",
            ForwardStatus::Recreating => "recreating",
            ForwardStatus::Waiting => "waiting",
        };
        f.write_str(s)
    }
}

/// A request to create (or recreate) a port-forward for one service.
#[derive(Debug, Clone)]
pub struct CreateForward {
    pub service: ServiceId,
    /// `local:remote` pairs bound on the allocated address.
    pub ports: Vec<PortPair>,
    /// DNS names mapped to the allocated address.
    pub hostnames: Vec<String>,
    /// The pod to tunnel to; when unset the worker picks the first Pod-kind
    /// endpoint itself.
    pub endpoint: Option<PodId>,
    pub recreate: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteForward {
    pub service: ServiceId,
    /// Set on the shutdown path; demotes the "stopped" log to debug.
    pub shutdown: bool,
}

#[derive(Debug, Clone)]
pub enum ForwardRequest {
    Create(CreateForward),
    Delete(DeleteForward),
}

/// A snapshot of one connection, as exposed to `List`.
#[derive(Debug, Clone)]
pub struct ForwardState {
    pub service: ServiceId,
    pub endpoint: Option<PodId>,
    pub status: ForwardStatus,
    pub reason: String,
    pub ip: Option<Ipv4Addr>,
    pub hostnames: Vec<String>,
    pub ports: Vec<PortPair>,
}

/// A live forwarding task: cancel to stop it, and a one-shot that fires with
/// an error description if the tunnel dies on its own.
pub struct ActiveTunnel {
    pub cancel: CancellationToken,
    pub died: oneshot::Receiver<String>,
}

/// Opens tunnels. The production implementation speaks the Kubernetes
/// port-forward subresource; tests substitute their own.
#[async_trait]
pub trait TunnelFactory: Send + Sync + 'static {
    async fn open(
        &self,
        pod: &PodId,
        bind_ip: Ipv4Addr,
        ports: &[PortPair],
    ) -> anyhow::Result<ActiveTunnel>;
}

/// Picks the pod backing a service, if any.
pub trait EndpointPicker: Send + Sync + 'static {
    fn first_pod(&self, service: &ServiceId) -> Option<PodId>;
}

/// The production picker: first Pod-kind address on the cached endpoints.
pub struct CacheEndpoints(pub Cache);

impl EndpointPicker for CacheEndpoints {
    fn first_pod(&self, service: &ServiceId) -> Option<PodId> {
        self.0
            .endpoints
            .get(&service.key())
            .and_then(|ep| first_pod_endpoint(&ep))
    }
}

/// Tracks when the worker last did real work. `Stable` reports true once the
/// initial reconcile drain has gone quiet.
#[derive(Clone)]
pub struct Stability {
    last_touch: Arc<Mutex<tokio::time::Instant>>,
}

impl Stability {
    pub fn new() -> Self {
        Self {
            last_touch: Arc::new(Mutex::new(tokio::time::Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last_touch.lock() = tokio::time::Instant::now();
    }

    pub fn is_stable(&self) -> bool {
        self.last_touch.lock().elapsed() >= STABILITY_WINDOW
    }
}

impl Default for Stability {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("a port-forward already exists for service {0}")]
    AlreadyExists(ServiceId),

    #[error("no port-forward exists for service {0}")]
    NotFound(ServiceId),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Hosts(#[from] HostsError),

    #[error("failed to create tunnel: {0:#}")]
    Tunnel(anyhow::Error),

    #[error("cleanup completed with errors: {0}")]
    PartialCleanup(String),
}

/// The caller-facing half of the worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<ForwardRequest>,
    view: Arc<RwLock<AHashMap<String, ForwardState>>>,
    stability: Stability,
    done: watch::Receiver<bool>,
}

impl WorkerHandle {
    /// Enqueues a request. Requests for one service are processed in order.
    pub async fn request(&self, request: ForwardRequest) {
        if self.tx.send(request).await.is_err() {
            tracing::debug!("port-forward worker is gone, dropping request");
        }
    }

    /// Non-blocking enqueue; hands the request back when the queue is full
    /// or the worker is gone.
    pub fn try_request(&self, request: ForwardRequest) -> Result<(), ForwardRequest> {
        self.tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(request)
            | mpsc::error::TrySendError::Closed(request) => request,
        })
    }

    /// A possibly stale snapshot of the connection set.
    pub fn snapshot(&self) -> Vec<ForwardState> {
        self.view.read().values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<ForwardState> {
        self.view.read().get(key).cloned()
    }

    pub fn is_stable(&self) -> bool {
        self.stability.is_stable()
    }

    /// Completes once the worker has drained every connection on shutdown.
    pub async fn wait_done(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|drained| *drained).await;
    }
}

struct Connection {
    state: ForwardState,
    tunnel: Option<CancellationToken>,
}

/// The actor. Owns the connection map; nothing else mutates it.
pub struct Worker {
    hosts: Arc<HostsFile>,
    ips: Arc<IpAllocator>,
    picker: Arc<dyn EndpointPicker>,
    tunnels: Arc<dyn TunnelFactory>,
    shutdown: CancellationToken,

    tx: mpsc::Sender<ForwardRequest>,
    connections: AHashMap<String, Connection>,
    view: Arc<RwLock<AHashMap<String, ForwardState>>>,
    stability: Stability,
    done: watch::Sender<bool>,
}

impl Worker {
    /// Spawns the worker task and returns its handle.
    pub fn spawn(
        hosts: Arc<HostsFile>,
        ips: Arc<IpAllocator>,
        picker: Arc<dyn EndpointPicker>,
        tunnels: Arc<dyn TunnelFactory>,
        shutdown: CancellationToken,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(1024);
        let (done_tx, done_rx) = watch::channel(false);
        let view = Arc::new(RwLock::new(AHashMap::new()));
        let stability = Stability::new();

        let worker = Worker {
            hosts,
            ips,
            picker,
            tunnels,
            shutdown,
            tx: tx.clone(),
            connections: AHashMap::new(),
            view: view.clone(),
            stability: stability.clone(),
            done: done_tx,
        };
        tokio::spawn(worker.run(rx));

        WorkerHandle {
            tx,
            view,
            stability,
            done: done_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ForwardRequest>) {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let (service, result) = match request {
                ForwardRequest::Create(req) => {
                    let service = req.service.clone();
                    (service, self.handle_create(req).await)
                }
                ForwardRequest::Delete(req) => {
                    let service = req.service.clone();
                    (service, self.handle_delete(req).await)
                }
            };

            match result {
                Ok(()) => {}
                Err(err @ (WorkerError::AlreadyExists(_) | WorkerError::NotFound(_))) => {
                    tracing::debug!(service = %service, "{err}");
                }
                Err(err) => {
                    tracing::warn!(service = %service, error = %err, "port-forward request failed");
                }
            }
        }

        self.drain().await;
        let _ = self.done.send(true);
    }

    async fn drain(&mut self) {
        let keys: Vec<String> = self.connections.keys().cloned().collect();
        for key in keys {
            let Some(service) = self
                .connections
                .get(&key)
                .map(|conn| conn.state.service.clone())
            else {
                continue;
            };

            let delete = self.handle_delete(DeleteForward {
                service: service.clone(),
                shutdown: true,
            });
            match tokio::time::timeout(DRAIN_TIMEOUT, delete).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(service = %service, error = %err, "failed to clean up port-forward");
                }
                Err(_) => {
                    tracing::warn!(service = %service, "timed out cleaning up port-forward");
                }
            }
        }
    }

    async fn handle_create(&mut self, req: CreateForward) -> Result<(), WorkerError> {
        let key = req.service.key();

        if self.connections.contains_key(&key) && !req.recreate {
            return Err(WorkerError::AlreadyExists(req.service));
        }

        if req.recreate {
            if let Some(mut conn) = self.connections.remove(&key) {
                let reason = req.reason.clone().unwrap_or_default();
                tracing::info!(service = %req.service, %reason, "recreating port-forward");

                conn.state.status = ForwardStatus::Recreating;
                conn.state.reason = reason;
                self.publish(&conn.state);

                if let Err(err) = self.release_resources(&mut conn).await {
                    tracing::warn!(
                        service = %req.service,
                        error = %err,
                        "failed to clean up previous port-forward"
                    );
                }
            }
        }

        self.stability.touch();

        let endpoint = match req
            .endpoint
            .clone()
            .or_else(|| self.picker.first_pod(&req.service))
        {
            Some(endpoint) => endpoint,
            None => {
                tracing::warn!(
                    service = %req.service,
                    "skipping tunnel creation, service has no endpoints"
                );
                let state = ForwardState {
                    service: req.service.clone(),
                    endpoint: None,
                    status: ForwardStatus::Waiting,
                    reason: NO_ENDPOINTS_REASON.to_string(),
                    ip: None,
                    hostnames: req.hostnames.clone(),
                    ports: req.ports.clone(),
                };
                self.publish(&state);
                self.connections.insert(
                    key,
                    Connection {
                        state,
                        tunnel: None,
                    },
                );
                return Ok(());
            }
        };

        let ip = self.ips.acquire().await?;
        match self.establish(&req, endpoint, ip).await {
            Ok(conn) => {
                tracing::info!(
                    service = %req.service,
                    endpoint = %conn.state.endpoint.as_ref().map(|e| e.key()).unwrap_or_default(),
                    %ip,
                    "created port-forward"
                );
                self.publish(&conn.state);
                self.connections.insert(key, conn);
                Ok(())
            }
            Err(err) => {
                // Unwind whatever was acquired; nothing may leak out of a
                // failed create.
                self.hosts.remove_address(IpAddr::V4(ip));
                if let Err(err) = self.hosts.save().await {
                    tracing::warn!(error = %err, "failed to remove hosts entries for failed tunnel");
                }
                if let Err(err) = self.ips.release(ip).await {
                    tracing::warn!(error = %err, "failed to release address for failed tunnel");
                }
                self.view.write().remove(&key);
                Err(err)
            }
        }
    }

    /// Everything after address allocation: hosts entries, the tunnel itself,
    /// and the supervisor that requests a recreate when the tunnel dies.
    async fn establish(
        &self,
        req: &CreateForward,
        endpoint: PodId,
        ip: Ipv4Addr,
    ) -> Result<Connection, WorkerError> {
        self.hosts.add_hosts(IpAddr::V4(ip), &req.hostnames)?;
        self.hosts.save().await?;

        tracing::debug!(service = %req.service, endpoint = %endpoint, "creating tunnel");
        let tunnel = self
            .tunnels
            .open(&endpoint, ip, &req.ports)
            .await
            .map_err(WorkerError::Tunnel)?;

        // The supervisor never recreates in-line; it enqueues a request and
        // lets the worker loop pick it up.
        let requests = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let service = req.service.clone();
        let hostnames = req.hostnames.clone();
        let ports = req.ports.clone();
        let died = tunnel.died;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                reason = died => {
                    if let Ok(reason) = reason {
                        let _ = requests
                            .send(ForwardRequest::Create(CreateForward {
                                service,
                                ports,
                                hostnames,
                                endpoint: None,
                                recreate: true,
                                reason: Some(reason),
                            }))
                            .await;
                    }
                }
            }
        });

        Ok(Connection {
            state: ForwardState {
                service: req.service.clone(),
                endpoint: Some(endpoint),
                status: ForwardStatus::Running,
                reason: String::new(),
                ip: Some(ip),
                hostnames: req.hostnames.clone(),
                ports: req.ports.clone(),
            },
            tunnel: Some(tunnel.cancel),
        })
    }

    async fn handle_delete(&mut self, req: DeleteForward) -> Result<(), WorkerError> {
        let key = req.service.key();
        let Some(mut conn) = self.connections.remove(&key) else {
            return Err(WorkerError::NotFound(req.service));
        };

        self.stability.touch();
        let result = self.release_resources(&mut conn).await;
        self.view.write().remove(&key);

        if req.shutdown {
            tracing::debug!(service = %req.service, "stopped port-forward");
        } else {
            tracing::info!(service = %req.service, "stopped port-forward");
        }

        result
    }

    /// Stops the tunnel and returns the connection's host-side resources.
    /// Every step is attempted; errors are collected and joined.
    async fn release_resources(&self, conn: &mut Connection) -> Result<(), WorkerError> {
        if let Some(tunnel) = conn.tunnel.take() {
            tunnel.cancel();
        }

        let mut errors: Vec<String> = Vec::new();
        if let Some(ip) = conn.state.ip.take() {
            self.hosts.remove_address(IpAddr::V4(ip));
            if let Err(err) = self.hosts.save().await {
                errors.push(format!("failed to save hosts file: {err}"));
            }
            if let Err(err) = self.ips.release(ip).await {
                errors.push(format!("failed to release address: {err}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WorkerError::PartialCleanup(errors.join("; ")))
        }
    }

    fn publish(&self, state: &ForwardState) {
        self.view
            .write()
            .insert(state.service.key(), state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localizer_core::AliasMode;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubTunnels {
        fail: AtomicBool,
        opened: Mutex<Vec<(PodId, Ipv4Addr, Vec<PortPair>)>>,
        died_txs: Mutex<Vec<oneshot::Sender<String>>>,
    }

    impl StubTunnels {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                opened: Mutex::new(Vec::new()),
                died_txs: Mutex::new(Vec::new()),
            })
        }

        fn open_count(&self) -> usize {
            self.opened.lock().len()
        }

        fn kill_latest(&self, reason: &str) {
            let tx = self.died_txs.lock().pop().unwrap();
            let _ = tx.send(reason.to_string());
        }
    }

    #[async_trait]
    impl TunnelFactory for StubTunnels {
        async fn open(
            &self,
            pod: &PodId,
            bind_ip: Ipv4Addr,
            ports: &[PortPair],
        ) -> anyhow::Result<ActiveTunnel> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("portforward dial failed");
            }
            self.opened
                .lock()
                .push((pod.clone(), bind_ip, ports.to_vec()));
            let (tx, rx) = oneshot::channel();
            self.died_txs.lock().push(tx);
            Ok(ActiveTunnel {
                cancel: CancellationToken::new(),
                died: rx,
            })
        }
    }

    struct StubPicker(Mutex<Option<PodId>>);

    impl EndpointPicker for StubPicker {
        fn first_pod(&self, _service: &ServiceId) -> Option<PodId> {
            self.0.lock().clone()
        }
    }

    struct Harness {
        handle: WorkerHandle,
        tunnels: Arc<StubTunnels>,
        picker: Arc<StubPicker>,
        hosts: Arc<HostsFile>,
        ips: Arc<IpAllocator>,
        _dir: tempfile::TempDir,
        shutdown: CancellationToken,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, "127.0.0.1 localhost\n").await.unwrap();

        let hosts = Arc::new(HostsFile::new(&path, "localizer"));
        hosts.load().await.unwrap();
        let ips = Arc::new(IpAllocator::new(
            "127.0.0.0/24".parse().unwrap(),
            AliasMode::Disabled,
        ));
        let tunnels = StubTunnels::new();
        let picker = Arc::new(StubPicker(Mutex::new(Some(PodId::new("demo", "api-0")))));
        let shutdown = CancellationToken::new();

        let handle = Worker::spawn(
            hosts.clone(),
            ips.clone(),
            picker.clone(),
            tunnels.clone(),
            shutdown.clone(),
        );

        Harness {
            handle,
            tunnels,
            picker,
            hosts,
            ips,
            _dir: dir,
            shutdown,
        }
    }

    fn create_req(recreate: bool) -> ForwardRequest {
        ForwardRequest::Create(CreateForward {
            service: ServiceId::new("demo", "api"),
            ports: vec![PortPair::new(80, 8080)],
            hostnames: vec!["api".to_string(), "api.demo".to_string()],
            endpoint: None,
            recreate,
            reason: recreate.then(|| "test".to_string()),
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    fn hosts_is_empty(hosts: &HostsFile) -> bool {
        // The harness only ever allocates out of the first few addresses.
        (1..=16u8).all(|octet| {
            let ip: IpAddr = format!("127.0.0.{octet}").parse().unwrap();
            hosts.hostnames(ip).is_none()
        })
    }

    #[tokio::test]
    async fn one_forward_per_service_key() {
        let h = harness().await;
        h.handle.request(create_req(false)).await;
        h.handle.request(create_req(false)).await;

        wait_until(|| h.handle.get("demo/api").is_some()).await;
        // The duplicate is swallowed without opening a second tunnel.
        wait_until(|| h.tunnels.open_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.tunnels.open_count(), 1);
        assert_eq!(h.handle.snapshot().len(), 1);

        let state = h.handle.get("demo/api").unwrap();
        assert_eq!(state.status, ForwardStatus::Running);
        assert_eq!(state.endpoint, Some(PodId::new("demo", "api-0")));
        let ip = state.ip.expect("running forward holds an address");
        assert_eq!(
            h.hosts.hostnames(IpAddr::V4(ip)).unwrap(),
            vec!["api".to_string(), "api.demo".to_string()]
        );
    }

    #[tokio::test]
    async fn waits_when_no_endpoints_exist() {
        let h = harness().await;
        *h.picker.0.lock() = None;

        h.handle.request(create_req(false)).await;
        wait_until(|| h.handle.get("demo/api").is_some()).await;

        let state = h.handle.get("demo/api").unwrap();
        assert_eq!(state.status, ForwardStatus::Waiting);
        assert_eq!(state.reason, NO_ENDPOINTS_REASON);
        assert_eq!(state.ip, None);
        assert_eq!(state.endpoint, None);
        assert!(hosts_is_empty(&h.hosts));
        assert_eq!(h.tunnels.open_count(), 0);
    }

    #[tokio::test]
    async fn failed_dial_leaks_no_resources() {
        let h = harness().await;
        h.tunnels.fail.store(true, Ordering::SeqCst);

        h.handle.request(create_req(false)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.handle.get("demo/api").is_none());
        assert!(hosts_is_empty(&h.hosts));

        // The address allocated for the failed create was released: a fresh
        // acquire hands back the first address again.
        let ip = h.ips.acquire().await.unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn tunnel_death_triggers_exactly_one_recreate() {
        let h = harness().await;
        h.handle.request(create_req(false)).await;
        wait_until(|| h.tunnels.open_count() == 1).await;
        let first = h.handle.get("demo/api").unwrap();

        h.tunnels.kill_latest("lost connection to pod");
        wait_until(|| h.tunnels.open_count() == 2).await;
        wait_until(|| {
            h.handle
                .get("demo/api")
                .is_some_and(|s| s.status == ForwardStatus::Running)
        })
        .await;

        let second = h.handle.get("demo/api").unwrap();
        assert_eq!(h.handle.snapshot().len(), 1);
        // The released address is recycled, so the recreated forward keeps
        // its IP and hostnames.
        assert_eq!(second.ip, first.ip);
        assert_eq!(second.hostnames, first.hostnames);
    }

    #[tokio::test]
    async fn delete_returns_every_resource() {
        let h = harness().await;
        h.handle.request(create_req(false)).await;
        wait_until(|| h.handle.get("demo/api").is_some()).await;

        h.handle
            .request(ForwardRequest::Delete(DeleteForward {
                service: ServiceId::new("demo", "api"),
                shutdown: false,
            }))
            .await;
        wait_until(|| h.handle.get("demo/api").is_none()).await;
        assert!(hosts_is_empty(&h.hosts));
    }

    #[tokio::test]
    async fn shutdown_drains_all_connections() {
        let h = harness().await;
        h.handle.request(create_req(false)).await;
        wait_until(|| h.handle.get("demo/api").is_some()).await;

        h.shutdown.cancel();
        h.handle.wait_done().await;
        assert!(h.handle.snapshot().is_empty());
        assert!(hosts_is_empty(&h.hosts));
    }

    #[tokio::test(start_paused = true)]
    async fn stability_tracks_recent_work() {
        let stability = Stability::new();
        stability.touch();
        assert!(!stability.is_stable());

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(stability.is_stable());

        stability.touch();
        assert!(!stability.is_stable());
    }
}
