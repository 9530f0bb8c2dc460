//! Clients for tenant virtual clusters, built from the kubeconfig the k3k
//! operator leaves in the tenant namespace.

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::*;

pub const KUBECONFIG_KEY: &str = "kubeconfig.yaml";
const CLIENT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum VirtualClientError {
    #[error("Failed to get kubeconfig Secret {0}: {1}")]
    GetSecretFailed(String, #[source] kube::Error),
    #[error("kubeconfig Secret {0} not found")]
    SecretNotFound(String),
    #[error("kubeconfig Secret {0} has no kubeconfig.yaml")]
    MissingKubeconfig(String),
    #[error("Invalid kubeconfig: {0}")]
    InvalidKubeconfig(#[source] KubeconfigError),
    #[error("Failed to build client: {0}")]
    ClientFailed(#[source] kube::Error),
}

pub fn kubeconfig_secret_name(k3k_name: &str) -> String {
    format!("k3k-{}-kubeconfig", k3k_name)
}

pub fn kubeconfig_from_secret(secret: &Secret) -> Result<Kubeconfig, VirtualClientError> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_KEY))
        .filter(|v| !v.0.is_empty())
        .ok_or(VirtualClientError::MissingKubeconfig(name))?;
    Kubeconfig::from_yaml(&String::from_utf8_lossy(&raw.0)).map_err(VirtualClientError::InvalidKubeconfig)
}

/// Per-cluster client cache. Entries live for an hour so rotated
/// credentials are eventually picked up.
pub struct VirtualClients {
    host: Client,
    cache: Mutex<HashMap<String, (Client, Instant)>>,
}

impl VirtualClients {
    pub fn new(host: Client) -> Self {
        VirtualClients {
            host,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Client {
        &self.host
    }

    pub async fn client(&self, k3k_name: &str, k3k_namespace: &str) -> Result<Client, VirtualClientError> {
        let key = format!("{}-{}", k3k_name, k3k_namespace);
        let mut cache = self.cache.lock().await;
        if let Some((client, built)) = cache.get(&key) {
            if built.elapsed() < CLIENT_TTL {
                return Ok(client.clone());
            }
        }
        let client = self.build(k3k_name, k3k_namespace).await?;
        cache.insert(key, (client.clone(), Instant::now()));
        Ok(client)
    }

    /// Drops the cached client, e.g. once the cluster is torn down.
    pub async fn forget(&self, k3k_name: &str, k3k_namespace: &str) {
        self.cache.lock().await.remove(&format!("{}-{}", k3k_name, k3k_namespace));
    }

    async fn build(&self, k3k_name: &str, k3k_namespace: &str) -> Result<Client, VirtualClientError> {
        let secret_name = kubeconfig_secret_name(k3k_name);
        let secret = Api::<Secret>::namespaced(self.host.clone(), k3k_namespace)
            .get_opt(&secret_name)
            .await
            .map_err(|e| VirtualClientError::GetSecretFailed(secret_name.clone(), e))?
            .ok_or_else(|| VirtualClientError::SecretNotFound(secret_name.clone()))?;
        let kubeconfig = kubeconfig_from_secret(&secret)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(VirtualClientError::InvalidKubeconfig)?;
        debug!(cluster = %k3k_name, url = %config.cluster_url, "built virtual cluster client");
        Client::try_from(config).map_err(VirtualClientError::ClientFailed)
    }
}
