//! TLS secret mirroring in both directions. Outbound copies keep their
//! names so certificate requests in the host cluster match the secrets the
//! virtual side expects; inbound copies are limited to certificates the
//! host issued, which keeps a mirrored secret from bouncing back.

use super::translate::{clear_server_fields, Translator};
use super::{adopt_version, SyncError, SyncRequest};
use crate::common::{create_or_replace, delete_if_exists};
use crate::labels::{CERT_MANAGER_COMMON_NAME, SYNCED, TRANSLATED_NAME};
use crate::virtual_client::VirtualClients;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const CHILD_NAMESPACE: &str = "default";
const TENANT_NAMESPACE_PREFIX: &str = "k3k-";

pub fn is_tls(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(TLS_SECRET_TYPE)
}

pub fn is_issued_certificate(secret: &Secret) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(CERT_MANAGER_COMMON_NAME))
        .unwrap_or(false)
}

/// Host copy of a virtual TLS secret, or None for any other secret type.
pub fn make_host_secret(source: &Secret, req: &SyncRequest) -> Option<Secret> {
    if !is_tls(source) {
        return None;
    }
    let mut secret = source.clone();
    clear_server_fields(&mut secret.metadata);
    secret.metadata.namespace = Some(req.k3k_namespace.clone());
    secret
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(SYNCED.to_string(), "true".to_string());
    Some(secret)
}

pub async fn sync_secret(child: &Client, host: &Client, req: &SyncRequest) -> Result<(), SyncError> {
    let host_api = Api::<Secret>::namespaced(host.clone(), &req.k3k_namespace);
    let source = Api::<Secret>::namespaced(child.clone(), &req.virtual_namespace)
        .get_opt(&req.virtual_name)
        .await
        .map_err(|e| SyncError::ReadFailed("Secret", req.virtual_name.clone(), e))?;
    let source = match source {
        Some(source) => source,
        None => {
            delete_if_exists(&host_api, &req.virtual_name)
                .await
                .map_err(|e| SyncError::DeleteFailed("Secret", req.virtual_name.clone(), e))?;
            return Ok(());
        }
    };
    let desired = match make_host_secret(&source, req) {
        Some(desired) => desired,
        None => {
            debug!(secret = %req.virtual_name, "skipping non-TLS secret");
            return Ok(());
        }
    };
    create_or_replace(&host_api, desired, adopt_version)
        .await
        .map_err(|e| SyncError::WriteFailed("Secret", req.virtual_name.clone(), e))?;
    Ok(())
}

/// The virtual cluster a host secret belongs to, taken from its
/// `k3k-<name>` namespace.
pub fn owning_cluster(secret: &Secret) -> Option<(String, String)> {
    let namespace = secret.metadata.namespace.as_deref()?;
    let name = namespace.strip_prefix(TENANT_NAMESPACE_PREFIX).filter(|n| !n.is_empty())?;
    Some((name.to_string(), namespace.to_string()))
}

/// Child copy of a certificate issued in the host cluster, or None when
/// the secret is not a certificate or lives outside a tenant namespace.
pub fn make_child_secret(source: &Secret) -> Option<Secret> {
    if !is_issued_certificate(source) {
        return None;
    }
    let (k3k_name, k3k_namespace) = owning_cluster(source)?;
    let mut secret = source.clone();
    let has_origin = source
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(TRANSLATED_NAME))
        .unwrap_or(false);
    if has_origin {
        Translator::new(&k3k_name, &k3k_namespace).translate_from(&mut secret.metadata);
    }
    clear_server_fields(&mut secret.metadata);
    secret.metadata.namespace = Some(CHILD_NAMESPACE.to_string());
    Some(secret)
}

pub struct HostSecretData {
    pub clients: Arc<VirtualClients>,
}

/// Watch handler for host secrets.
pub async fn reconcile_host_secret(secret: Arc<Secret>, ctx: Arc<HostSecretData>) -> Result<Action, SyncError> {
    let desired = match make_child_secret(&secret) {
        Some(desired) => desired,
        None => return Ok(Action::await_change()),
    };
    let (k3k_name, k3k_namespace) = match owning_cluster(&secret) {
        Some(owner) => owner,
        None => return Ok(Action::await_change()),
    };
    let child = ctx.clients.client(&k3k_name, &k3k_namespace).await?;
    let name = desired.metadata.name.clone().unwrap_or_default();
    info!(secret = %name, cluster = %k3k_name, "mirroring certificate into virtual cluster");
    let api = Api::<Secret>::namespaced(child, CHILD_NAMESPACE);
    create_or_replace(&api, desired, |desired, live| Secret {
        metadata: kube::api::ObjectMeta {
            annotations: desired.metadata.annotations,
            labels: desired.metadata.labels,
            ..live.metadata
        },
        data: desired.data,
        ..live
    })
    .await
    .map_err(|e| SyncError::WriteFailed("Secret", name, e))?;
    Ok(Action::await_change())
}

pub fn host_secret_error_policy(_secret: Arc<Secret>, error: &SyncError, _ctx: Arc<HostSecretData>) -> Action {
    warn!("Secret mirroring failed: {}", error);
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::TRANSLATED_NAMESPACE;
    use crate::sync::tests::request;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    fn secret(namespace: &str, type_: &str, annotations: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("shop-tls".into()),
                namespace: Some(namespace.into()),
                resource_version: Some("3".into()),
                annotations: Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..ObjectMeta::default()
            },
            type_: Some(type_.into()),
            data: Some(BTreeMap::from([("tls.crt".to_string(), ByteString(b"cert".to_vec()))])),
            ..Secret::default()
        }
    }

    #[test]
    fn only_tls_secrets_go_to_the_host() {
        let req = request("virtual");
        assert!(make_host_secret(&secret("shop", "Opaque", &[]), &req).is_none());
        let host = make_host_secret(&secret("shop", TLS_SECRET_TYPE, &[]), &req).unwrap();
        assert_eq!(host.metadata.name.as_deref(), Some("shop-tls"));
        assert_eq!(host.metadata.namespace.as_deref(), Some("k3k-alice"));
        assert_eq!(host.metadata.resource_version, None);
        assert_eq!(host.metadata.labels.unwrap()[SYNCED], "true");
        assert_eq!(host.data.unwrap()["tls.crt"].0, b"cert".to_vec());
    }

    #[test]
    fn issued_certificates_go_back_to_the_child() {
        let issued = secret("k3k-alice", TLS_SECRET_TYPE, &[(CERT_MANAGER_COMMON_NAME, "shop.example.com")]);
        let child = make_child_secret(&issued).unwrap();
        assert_eq!(child.metadata.namespace.as_deref(), Some(CHILD_NAMESPACE));
        assert_eq!(child.metadata.name.as_deref(), Some("shop-tls"));
        assert_eq!(owning_cluster(&issued), Some(("alice".to_string(), "k3k-alice".to_string())));

        // not issued, or not in a tenant namespace
        assert!(make_child_secret(&secret("k3k-alice", TLS_SECRET_TYPE, &[])).is_none());
        let foreign = secret("kube-system", TLS_SECRET_TYPE, &[(CERT_MANAGER_COMMON_NAME, "x")]);
        assert!(make_child_secret(&foreign).is_none());
        assert!(make_child_secret(&secret("k3k-", TLS_SECRET_TYPE, &[(CERT_MANAGER_COMMON_NAME, "x")])).is_none());
    }

    #[test]
    fn translated_certificates_get_their_virtual_name_back() {
        let tr = Translator::new("alice", "k3k-alice");
        let mut issued = secret(
            "k3k-alice",
            TLS_SECRET_TYPE,
            &[
                (CERT_MANAGER_COMMON_NAME, "shop.example.com"),
                (TRANSLATED_NAME, "shop-tls"),
                (TRANSLATED_NAMESPACE, "shop"),
            ],
        );
        issued.metadata.name = Some(tr.translate_name("shop", "shop-tls"));
        let child = make_child_secret(&issued).unwrap();
        assert_eq!(child.metadata.name.as_deref(), Some("shop-tls"));
        assert_eq!(child.metadata.namespace.as_deref(), Some(CHILD_NAMESPACE));
        let annotations = child.metadata.annotations.unwrap();
        assert!(!annotations.contains_key(TRANSLATED_NAME));
        assert!(annotations.contains_key(CERT_MANAGER_COMMON_NAME));
    }
}
