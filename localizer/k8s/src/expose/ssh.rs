//! The reverse SSH tunnel that carries cluster traffic back to the
//! developer's machine.
//!
//! The client dials the sidecar's SSH server through a local port-forward,
//! asks it to listen on every exposed port, and proxies each forwarded
//! connection to the matching local port. Keepalives every two seconds let a
//! dead transport surface quickly instead of hanging until TCP gives up.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use localizer_core::{PortPair, ServiceId};
use russh::client::{self, Msg};
use russh::{Channel, Disconnect};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the session is checked for silent death.
const LIVENESS_POLL: Duration = Duration::from_secs(1);

pub struct ReverseTunnelClient {
    host: String,
    port: u16,
    user: String,
    password: String,
    /// remote listener port -> local destination port
    ports: AHashMap<u32, u16>,
}

struct ForwardHandler {
    ports: AHashMap<u32, u16>,
}

#[async_trait]
impl client::Handler for ForwardHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The sidecar is created fresh for every exposure; there is no
        // stable host key to verify against.
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(
            connected_address,
            connected_port,
            originator_address,
            originator_port,
            "forwarded connection from the cluster"
        );

        let Some(local_port) = self.ports.get(&connected_port).copied() else {
            tracing::debug!(connected_port, "no local mapping for forwarded port");
            let _ = channel.close().await;
            return Ok(());
        };

        tokio::spawn(async move {
            match TcpStream::connect(("127.0.0.1", local_port)).await {
                Ok(mut local) => {
                    let mut remote = channel.into_stream();
                    if let Err(err) = tokio::io::copy_bidirectional(&mut remote, &mut local).await
                    {
                        tracing::debug!(local_port, error = %err, "tunneled connection ended");
                    }
                }
                Err(err) => {
                    tracing::error!(
                        local_port,
                        error = %err,
                        "failed to dial local service (is anything listening on 127.0.0.1:{local_port}?)"
                    );
                    let _ = channel.close().await;
                }
            }
        });

        Ok(())
    }
}

impl ReverseTunnelClient {
    pub fn new(host: impl Into<String>, port: u16, user: &str, password: &str) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            ports: AHashMap::new(),
        }
    }

    /// Adds a `local:remote` pair: the sidecar listens on `remote`, traffic
    /// lands on `127.0.0.1:local`.
    pub fn forward(&mut self, pair: PortPair) {
        self.ports.insert(u32::from(pair.remote), pair.local);
    }

    /// Runs the tunnel until it dies (error) or `cancel` fires (ok). `ready`
    /// flips to true once every remote listener is registered.
    pub async fn run(
        &self,
        service: &ServiceId,
        cancel: &CancellationToken,
        ready: watch::Sender<bool>,
    ) -> Result<()> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..client::Config::default()
        });
        let handler = ForwardHandler {
            ports: self.ports.clone(),
        };

        let mut session = tokio::time::timeout(
            DIAL_TIMEOUT,
            client::connect(config, (self.host.as_str(), self.port), handler),
        )
        .await
        .context("timed out dialing the ssh server")?
        .context("failed to dial the ssh server")?;

        let authenticated = session
            .authenticate_password(self.user.as_str(), self.password.as_str())
            .await
            .context("ssh authentication failed")?;
        if !authenticated {
            bail!("ssh server rejected the tunnel credentials");
        }

        for (remote, local) in &self.ports {
            session
                .tcpip_forward("0.0.0.0", *remote)
                .await
                .with_context(|| format!("failed to request remote listener on port {remote}"))?;
            tracing::info!(
                "created tunnel from remote {service}:{remote} to 127.0.0.1:{local}"
            );
        }
        ready.send_replace(true);

        let mut liveness = tokio::time::interval(LIVENESS_POLL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = session
                        .disconnect(Disconnect::ByApplication, "shutting down", "en")
                        .await;
                    return Ok(());
                }
                _ = liveness.tick() => {
                    if session.is_closed() {
                        bail!("ssh transport closed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_maps_remote_listeners_to_local_ports() {
        let mut tunnel = ReverseTunnelClient::new("127.0.0.1", 2222, "u", "p");
        tunnel.forward(PortPair::new(8080, 80));
        tunnel.forward(PortPair::new(9090, 9090));

        assert_eq!(tunnel.ports.get(&80), Some(&8080));
        assert_eq!(tunnel.ports.get(&9090), Some(&9090));
    }
}
