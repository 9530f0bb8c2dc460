//! Mirroring of objects between a tenant's virtual cluster and the host.
//!
//! Every sync is addressed by a `SyncRequest` alone and re-reads the live
//! objects on both sides, so a request can be replayed any number of times.

pub mod configmap;
pub mod http;
pub mod ingress;
pub mod mcpbridge;
pub mod secret;
pub mod translate;

use crate::labels::CLUSTER_MODE_VIRTUAL;
use crate::virtual_client::{VirtualClientError, VirtualClients};
use kube::api::Resource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::*;
use translate::Translator;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to read {0} {1}: {2}")]
    ReadFailed(&'static str, String, #[source] kube::Error),
    #[error("Failed to write {0} {1}: {2}")]
    WriteFailed(&'static str, String, #[source] kube::Error),
    #[error("Failed to delete {0} {1}: {2}")]
    DeleteFailed(&'static str, String, #[source] kube::Error),
    #[error(transparent)]
    VirtualClient(#[from] VirtualClientError),
    #[error("Unknown sync kind: {0}")]
    UnknownKind(String),
    #[error("Missing setting: {0}")]
    MissingSetting(&'static str),
    #[error("Sync request failed: {0}")]
    RequestFailed(#[source] reqwest::Error),
    #[error("Sync request rejected with status {0}: {1}")]
    Rejected(u16, String),
    #[error("Secret mirroring panicked: {0}")]
    Panicked(String),
}

/// The whole payload of a sync call. Field names are the form keys the
/// agent posts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub virtual_name: String,
    pub virtual_namespace: String,
    pub k3k_name: String,
    pub k3k_namespace: String,
    #[serde(default)]
    pub k3k_mode: String,
}

impl SyncRequest {
    pub fn translator(&self) -> Translator {
        Translator::new(&self.k3k_name, &self.k3k_namespace)
    }

    pub fn is_virtual(&self) -> bool {
        self.k3k_mode == CLUSTER_MODE_VIRTUAL
    }

    pub fn host_name(&self) -> String {
        self.translator().translate_name(&self.virtual_namespace, &self.virtual_name)
    }

    /// Same as `<k3kNamespace>-service-w7`, the host Service fronting a
    /// virtual cluster's own ingress controller.
    pub fn virtual_ingress_service_name(&self) -> String {
        format!("{}-service-w7", self.k3k_namespace)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncKind {
    Ingress,
    ConfigMap,
    Secret,
    McpBridge,
}

impl SyncKind {
    /// Route segment under `/k8s/k3k/`.
    pub fn path(&self) -> &'static str {
        match self {
            SyncKind::Ingress => "sync-ingress",
            SyncKind::ConfigMap => "sync-configmap",
            SyncKind::Secret => "sync-secret",
            SyncKind::McpBridge => "sync-mcpbridge",
        }
    }
}

impl FromStr for SyncKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ingress" => Ok(SyncKind::Ingress),
            "configmap" => Ok(SyncKind::ConfigMap),
            "secret" => Ok(SyncKind::Secret),
            "mcpbridge" => Ok(SyncKind::McpBridge),
            _ => Err(SyncError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Host-side mirrors are fully owned by the bridge, so an update is the
/// desired object carrying the live resource version.
pub(crate) fn adopt_version<K: Resource>(mut desired: K, live: K) -> K {
    desired.meta_mut().resource_version = live.meta().resource_version.clone();
    desired
}

pub struct SyncBridge {
    clients: Arc<VirtualClients>,
}

impl SyncBridge {
    pub fn new(clients: Arc<VirtualClients>) -> Self {
        SyncBridge { clients }
    }

    pub fn clients(&self) -> &Arc<VirtualClients> {
        &self.clients
    }

    pub async fn sync(&self, kind: SyncKind, req: &SyncRequest) -> Result<(), SyncError> {
        info!(
            kind = %kind,
            name = %req.virtual_name,
            namespace = %req.virtual_namespace,
            cluster = %req.k3k_name,
            "sync start"
        );
        let child = self.clients.client(&req.k3k_name, &req.k3k_namespace).await?;
        let host = self.clients.host();
        match kind {
            SyncKind::Ingress => ingress::sync_ingress(&child, host, req).await,
            SyncKind::ConfigMap => configmap::sync_configmap(&child, host, req).await,
            SyncKind::Secret => secret::sync_secret(&child, host, req).await,
            SyncKind::McpBridge => mcpbridge::sync_mcpbridge(&child, host, req).await,
        }
    }
}
