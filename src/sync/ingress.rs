use super::{adopt_version, SyncError, SyncRequest};
use crate::common::{create_if_absent, create_or_replace, delete_if_exists};
use crate::labels::{INGRESS_CLASS, TRANSLATED_NAME, TRANSLATED_NAMESPACE};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend, ServiceBackendPort};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta};
use kube::Client;
use std::collections::BTreeMap;
use tracing::*;

pub const HOST_INGRESS_CLASS: &str = "higress";
const VIRTUAL_INGRESS_PORT: i32 = 80;

/// Annotations a virtual-mode mirror keeps. Everything else belongs to the
/// virtual cluster's own ingress controller.
const VIRTUAL_MODE_ANNOTATIONS: [&str; 7] = [
    INGRESS_CLASS,
    "higress.io/resource-definer",
    "higress.io/ssl-redirect",
    "w7.cc/ssl-redirect",
    "w7.cc/filecache",
    TRANSLATED_NAME,
    TRANSLATED_NAMESPACE,
];

/// Host copy of a virtual ingress. Virtual-mode clusters run their own
/// ingress controller, so every path goes to the Service in front of it;
/// shared-mode paths follow the translated backend Services.
pub fn make_host_ingress(source: &Ingress, req: &SyncRequest) -> Ingress {
    let tr = req.translator();
    let mut ingress = source.clone();
    ingress.status = None;
    tr.translate_to(&mut ingress.metadata);

    let annotations = ingress.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(INGRESS_CLASS.to_string(), HOST_INGRESS_CLASS.to_string());
    if req.is_virtual() {
        annotations.retain(|k, _| VIRTUAL_MODE_ANNOTATIONS.contains(&k.as_str()));
    }

    let paths = ingress
        .spec
        .iter_mut()
        .flat_map(|spec| spec.rules.iter_mut().flatten())
        .filter_map(|rule| rule.http.as_mut())
        .flat_map(|http| http.paths.iter_mut());
    for path in paths {
        if req.is_virtual() {
            path.backend.resource = None;
            path.backend.service = Some(IngressServiceBackend {
                name: req.virtual_ingress_service_name(),
                port: Some(ServiceBackendPort {
                    number: Some(VIRTUAL_INGRESS_PORT),
                    name: None,
                }),
            });
        } else if let Some(service) = path.backend.service.as_mut() {
            service.name = tr.translate_name(&req.virtual_namespace, &service.name);
        }
    }
    ingress
}

/// TLS secrets the ingress refers to. Their names are left untranslated so
/// certificate requests and issued secrets keep matching.
pub fn tls_secret_names(ingress: &Ingress) -> Vec<String> {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.tls.iter().flatten())
        .filter_map(|tls| tls.secret_name.clone())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Empty TLS secret that certificate issuance fills in later.
pub fn make_tls_placeholder(name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            ("tls.key".to_string(), ByteString(Vec::new())),
            ("tls.crt".to_string(), ByteString(Vec::new())),
        ])),
        ..Secret::default()
    }
}

pub async fn sync_ingress(child: &Client, host: &Client, req: &SyncRequest) -> Result<(), SyncError> {
    let host_api = Api::<Ingress>::namespaced(host.clone(), &req.k3k_namespace);
    let host_name = req.host_name();
    let source = Api::<Ingress>::namespaced(child.clone(), &req.virtual_namespace)
        .get_opt(&req.virtual_name)
        .await
        .map_err(|e| SyncError::ReadFailed("Ingress", req.virtual_name.clone(), e))?;
    let source = match source {
        Some(source) => source,
        None => {
            delete_if_exists(&host_api, &host_name)
                .await
                .map_err(|e| SyncError::DeleteFailed("Ingress", host_name.clone(), e))?;
            return Ok(());
        }
    };

    let child_secrets = Api::<Secret>::namespaced(child.clone(), &req.virtual_namespace);
    for secret_name in tls_secret_names(&source) {
        let placeholder = make_tls_placeholder(&secret_name, &req.virtual_namespace);
        if let Err(e) = create_if_absent(&child_secrets, &placeholder).await {
            // issuance retries on the next sync
            warn!(secret = %secret_name, error = %e, "failed to create TLS placeholder");
        }
    }

    let desired = make_host_ingress(&source, req);
    create_or_replace(&host_api, desired, adopt_version)
        .await
        .map_err(|e| SyncError::WriteFailed("Ingress", host_name, e))?;
    Ok(())
}
