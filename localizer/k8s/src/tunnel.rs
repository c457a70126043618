//! The concrete tunnel transport: local TCP listeners proxied to a pod's
//! `portforward` subresource.
//!
//! Each accepted connection gets its own port-forward stream. An upgrade is
//! performed once at open time so a dead target surfaces as a create-time
//! error rather than a silently broken listener; later failures are reported
//! on the tunnel's death channel, which the worker's supervisor turns into a
//! recreate request.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use localizer_core::{PodId, PortPair};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::worker::{ActiveTunnel, TunnelFactory};

pub struct PodTunnelFactory {
    client: Client,
}

impl PodTunnelFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TunnelFactory for PodTunnelFactory {
    async fn open(
        &self,
        pod: &PodId,
        bind_ip: Ipv4Addr,
        ports: &[PortPair],
    ) -> anyhow::Result<ActiveTunnel> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);

        // Verify the target is reachable before claiming the forward is up.
        if let Some(first) = ports.first() {
            let probe = api.portforward(&pod.name, &[first.remote]).await?;
            drop(probe);
        }

        let cancel = CancellationToken::new();
        let (died_tx, died_rx) = oneshot::channel();
        let (failure_tx, mut failure_rx) = mpsc::channel::<String>(1);

        for pair in ports {
            let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(bind_ip), pair.local))
                .await
                .map_err(|err| {
                    anyhow::anyhow!("failed to bind {bind_ip}:{}: {err}", pair.local)
                })?;

            tokio::spawn(accept_loop(
                listener,
                api.clone(),
                pod.name.clone(),
                pair.remote,
                cancel.clone(),
                failure_tx.clone(),
            ));
        }
        drop(failure_tx);

        // Collapse per-connection failures into a single death notification.
        let watchdog_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watchdog_cancel.cancelled() => {}
                failure = failure_rx.recv() => {
                    if let Some(reason) = failure {
                        watchdog_cancel.cancel();
                        let _ = died_tx.send(reason);
                    }
                }
            }
        });

        Ok(ActiveTunnel {
            cancel,
            died: died_rx,
        })
    }
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    api: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    cancel: CancellationToken,
    failure: mpsc::Sender<String>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let (conn, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                let _ = failure.try_send(format!("listener failed: {err}"));
                return;
            }
        };

        tracing::trace!(%peer, remote_port, "accepted connection");
        tokio::spawn(proxy_connection(
            conn,
            api.clone(),
            pod_name.clone(),
            remote_port,
            cancel.clone(),
            failure.clone(),
        ));
    }
}

async fn proxy_connection(
    mut conn: TcpStream,
    api: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    cancel: CancellationToken,
    failure: mpsc::Sender<String>,
) {
    let mut forwarder = match api.portforward(&pod_name, &[remote_port]).await {
        Ok(forwarder) => forwarder,
        Err(err) => {
            let _ = failure.try_send(format!("portforward to pod '{pod_name}' failed: {err}"));
            return;
        }
    };

    let Some(mut upstream) = forwarder.take_stream(remote_port) else {
        let _ = failure.try_send(format!(
            "portforward to pod '{pod_name}' returned no stream for port {remote_port}"
        ));
        return;
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut conn, &mut upstream) => {
            if let Err(err) = result {
                tracing::debug!(pod = %pod_name, remote_port, error = %err, "proxied connection ended");
            }
        }
    }
}
