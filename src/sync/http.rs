//! The sync endpoint served by the host process and the agent-side caller
//! that triggers it from inside a virtual cluster.

use super::secret::{is_issued_certificate, is_tls};
use super::{SyncBridge, SyncError, SyncKind, SyncRequest};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Form, Router};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::*;

pub const SYNC_PORT: u16 = 8000;
pub const SYNC_PREFIX: &str = "/k8s/k3k";
const SYNC_ATTEMPTS: u32 = 3;

pub fn router(bridge: Arc<SyncBridge>) -> Router {
    Router::new()
        .route(&route(SyncKind::Ingress), post(sync_ingress_handler))
        .route(&route(SyncKind::ConfigMap), post(sync_configmap_handler))
        .route(&route(SyncKind::Secret), post(sync_secret_handler))
        .route(&route(SyncKind::McpBridge), post(sync_mcpbridge_handler))
        .with_state(bridge)
}

fn route(kind: SyncKind) -> String {
    format!("{}/{}", SYNC_PREFIX, kind.path())
}

async fn handle(bridge: &SyncBridge, kind: SyncKind, req: SyncRequest) -> (StatusCode, String) {
    match bridge.sync(kind, &req).await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            error!(kind = %kind, name = %req.virtual_name, error = %e, "sync failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn sync_ingress_handler(
    State(bridge): State<Arc<SyncBridge>>,
    Form(req): Form<SyncRequest>,
) -> (StatusCode, String) {
    handle(&bridge, SyncKind::Ingress, req).await
}

async fn sync_configmap_handler(
    State(bridge): State<Arc<SyncBridge>>,
    Form(req): Form<SyncRequest>,
) -> (StatusCode, String) {
    handle(&bridge, SyncKind::ConfigMap, req).await
}

async fn sync_secret_handler(
    State(bridge): State<Arc<SyncBridge>>,
    Form(req): Form<SyncRequest>,
) -> (StatusCode, String) {
    handle(&bridge, SyncKind::Secret, req).await
}

async fn sync_mcpbridge_handler(
    State(bridge): State<Arc<SyncBridge>>,
    Form(req): Form<SyncRequest>,
) -> (StatusCode, String) {
    handle(&bridge, SyncKind::McpBridge, req).await
}

/// Runs inside a virtual cluster and asks the host pod to mirror one
/// object.
pub struct SyncClient {
    http: reqwest::Client,
    root_pod_ip: String,
    k3k_name: String,
    k3k_namespace: String,
    k3k_mode: String,
}

impl SyncClient {
    pub fn new(root_pod_ip: &str, k3k_name: &str, k3k_namespace: &str, k3k_mode: &str) -> Result<Self, SyncError> {
        if root_pod_ip.is_empty() {
            return Err(SyncError::MissingSetting("ROOT_POD_IP"));
        }
        if k3k_name.is_empty() || k3k_namespace.is_empty() {
            return Err(SyncError::MissingSetting("K3K_NAME/K3K_NAMESPACE"));
        }
        Ok(SyncClient {
            http: reqwest::Client::new(),
            root_pod_ip: root_pod_ip.to_string(),
            k3k_name: k3k_name.to_string(),
            k3k_namespace: k3k_namespace.to_string(),
            k3k_mode: k3k_mode.to_string(),
        })
    }

    pub fn url(&self, kind: SyncKind) -> String {
        format!("http://{}:{}{}", self.root_pod_ip, SYNC_PORT, route(kind))
    }

    pub fn request(&self, name: &str, namespace: &str) -> SyncRequest {
        SyncRequest {
            virtual_name: name.to_string(),
            virtual_namespace: namespace.to_string(),
            k3k_name: self.k3k_name.clone(),
            k3k_namespace: self.k3k_namespace.clone(),
            k3k_mode: self.k3k_mode.clone(),
        }
    }

    /// Posts the request, retrying transport failures. A non-200 answer
    /// is returned as is.
    pub async fn trigger(&self, kind: SyncKind, name: &str, namespace: &str) -> Result<(), SyncError> {
        let url = self.url(kind);
        let form = self.request(name, namespace);
        info!(url = %url, name = %name, namespace = %namespace, "sync start");
        let mut attempt = 0;
        let resp = loop {
            attempt += 1;
            match self.http.post(&url).form(&form).send().await {
                Ok(resp) => break resp,
                Err(e) if attempt < SYNC_ATTEMPTS => {
                    warn!(url = %url, attempt, error = %e, "sync request failed, retrying");
                    sleep(Duration::from_secs(u64::from(attempt))).await;
                }
                Err(e) => return Err(SyncError::RequestFailed(e)),
            }
        };
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            error!(url = %url, status = %status, body = %body, "sync rejected");
            return Err(SyncError::Rejected(status.as_u16(), body));
        }
        Ok(())
    }

    /// Secrets leave the virtual cluster only when they are TLS and were
    /// not themselves mirrored in from the host.
    pub async fn trigger_secret(&self, secret: &Secret) -> Result<bool, SyncError> {
        if !should_forward_secret(secret) {
            return Ok(false);
        }
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        self.trigger(SyncKind::Secret, name, namespace).await?;
        Ok(true)
    }

    /// Forwards one virtual-cluster object. Secrets are read through
    /// `client` and filtered by `trigger_secret`; other kinds go by name.
    /// Returns whether a request was sent.
    pub async fn trigger_object(&self, kind: SyncKind, name: &str, namespace: &str, client: Client) -> Result<bool, SyncError> {
        if kind != SyncKind::Secret {
            self.trigger(kind, name, namespace).await?;
            return Ok(true);
        }
        let secret = Api::<Secret>::namespaced(client, namespace)
            .get_opt(name)
            .await
            .map_err(|e| SyncError::ReadFailed("Secret", name.to_string(), e))?;
        match secret {
            Some(secret) => self.trigger_secret(&secret).await,
            None => {
                debug!(name = %name, namespace = %namespace, "secret is gone, nothing to sync");
                Ok(false)
            }
        }
    }
}

pub fn should_forward_secret(secret: &Secret) -> bool {
    is_tls(secret) && !is_issued_certificate(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::CERT_MANAGER_COMMON_NAME;
    use crate::sync::secret::TLS_SECRET_TYPE;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn client() -> SyncClient {
        SyncClient::new("10.42.0.7", "alice", "k3k-alice", "virtual").unwrap()
    }

    #[test]
    fn posts_to_the_root_pod() {
        let c = client();
        assert_eq!(c.url(SyncKind::Ingress), "http://10.42.0.7:8000/k8s/k3k/sync-ingress");
        assert_eq!(c.url(SyncKind::McpBridge), "http://10.42.0.7:8000/k8s/k3k/sync-mcpbridge");
        let req = c.request("web", "shop");
        assert_eq!(req.k3k_name, "alice");
        assert_eq!(req.k3k_mode, "virtual");
        assert_eq!(req.virtual_namespace, "shop");
    }

    #[test]
    fn settings_are_required() {
        assert!(matches!(
            SyncClient::new("", "alice", "k3k-alice", "virtual"),
            Err(SyncError::MissingSetting("ROOT_POD_IP"))
        ));
        assert!(SyncClient::new("10.0.0.1", "", "k3k-alice", "virtual").is_err());
    }

    #[test]
    fn mirrored_certificates_are_not_sent_back() {
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some("shop-tls".into()),
                ..ObjectMeta::default()
            },
            type_: Some(TLS_SECRET_TYPE.into()),
            ..Secret::default()
        };
        assert!(should_forward_secret(&secret));
        secret.metadata.annotations = Some(BTreeMap::from([(
            CERT_MANAGER_COMMON_NAME.to_string(),
            "shop.example.com".to_string(),
        )]));
        assert!(!should_forward_secret(&secret));
        secret.type_ = Some("Opaque".into());
        secret.metadata.annotations = None;
        assert!(!should_forward_secret(&secret));
    }

    #[tokio::test]
    async fn filtered_secrets_send_nothing() {
        // nothing listens on the root pod address, so a request would fail
        let c = client();
        let opaque = Secret {
            metadata: ObjectMeta {
                name: Some("db-password".into()),
                namespace: Some("shop".into()),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".into()),
            ..Secret::default()
        };
        assert!(!c.trigger_secret(&opaque).await.unwrap());

        let issued = Secret {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    CERT_MANAGER_COMMON_NAME.to_string(),
                    "shop.example.com".to_string(),
                )])),
                ..opaque.metadata.clone()
            },
            type_: Some(TLS_SECRET_TYPE.into()),
            ..Secret::default()
        };
        assert!(!c.trigger_secret(&issued).await.unwrap());
    }
}
