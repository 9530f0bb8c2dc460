use crate::error::{Error, Result};
use crate::quantity::{self, bytes_quantity};
use crate::tenant::TenantRecord;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::*;

/// New storage request for the server volume, or None when the current
/// one already covers `wanted_bytes`. Volumes never shrink.
pub fn grown_request(current: Option<&Quantity>, wanted_bytes: i64) -> Option<Quantity> {
    let current = current.and_then(|q| quantity::parse_value(&q.0).ok()).unwrap_or(0);
    (current < wanted_bytes).then(|| bytes_quantity(wanted_bytes))
}

/// Grows the virtual cluster's server volume to the tenant's system
/// storage size. Returns whether the claim was updated.
pub async fn reconcile_storage(tenant: &TenantRecord, client: &Client) -> Result<bool> {
    let api = Api::<PersistentVolumeClaim>::namespaced(client.clone(), &tenant.k3k_namespace());
    let name = tenant.server_pvc_name();
    let mut pvc = match api.get_opt(&name).await.map_err(|e| Error::GetFailed("PersistentVolumeClaim", e))? {
        Some(pvc) => pvc,
        None => {
            debug!(tenant = %tenant.name, pvc = %name, "server volume not created yet");
            return Ok(false);
        }
    };
    let requests = pvc
        .spec
        .get_or_insert_with(Default::default)
        .resources
        .get_or_insert_with(Default::default)
        .requests
        .get_or_insert_with(Default::default);
    let grown = match grown_request(requests.get("storage"), tenant.sys_storage_bytes()) {
        Some(grown) => grown,
        None => return Ok(false),
    };
    info!(tenant = %tenant.name, pvc = %name, size = %grown.0, "Update PersistentVolumeClaim");
    requests.insert("storage".to_string(), grown);
    api.replace(&name, &PostParams::default(), &pvc)
        .await
        .map_err(Error::ReconcilePvcFailed)?;
    Ok(true)
}
