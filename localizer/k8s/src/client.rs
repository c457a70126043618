//! Kubernetes client construction.

use anyhow::{Context, Result};
use kube::config::{Config, KubeConfigOptions};
use kube::Client;

/// Builds a client from the in-cluster environment when present, otherwise
/// from the user's kubeconfig (`KUBECONFIG` is honored), optionally pinned to
/// a named context.
pub async fn make_client(context: Option<String>) -> Result<Client> {
    let config = match Config::incluster() {
        Ok(config) => config,
        Err(_) => {
            let options = KubeConfigOptions {
                context,
                ..KubeConfigOptions::default()
            };
            Config::from_kubeconfig(&options)
                .await
                .context("failed to load kubernetes client configuration")?
        }
    };

    Client::try_from(config).context("failed to create kubernetes client")
}
