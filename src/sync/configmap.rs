use super::{adopt_version, SyncError, SyncRequest};
use crate::common::{create_or_replace, delete_if_exists};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;

pub fn make_host_configmap(source: &ConfigMap, req: &SyncRequest) -> ConfigMap {
    let mut cm = ConfigMap {
        metadata: source.metadata.clone(),
        data: source.data.clone(),
        binary_data: source.binary_data.clone(),
        immutable: source.immutable,
    };
    req.translator().translate_to(&mut cm.metadata);
    cm
}

pub async fn sync_configmap(child: &Client, host: &Client, req: &SyncRequest) -> Result<(), SyncError> {
    let host_api = Api::<ConfigMap>::namespaced(host.clone(), &req.k3k_namespace);
    let host_name = req.host_name();
    let source = Api::<ConfigMap>::namespaced(child.clone(), &req.virtual_namespace)
        .get_opt(&req.virtual_name)
        .await
        .map_err(|e| SyncError::ReadFailed("ConfigMap", req.virtual_name.clone(), e))?;
    match source {
        None => {
            delete_if_exists(&host_api, &host_name)
                .await
                .map_err(|e| SyncError::DeleteFailed("ConfigMap", host_name, e))?;
        }
        Some(source) => {
            create_or_replace(&host_api, make_host_configmap(&source, req), adopt_version)
                .await
                .map_err(|e| SyncError::WriteFailed("ConfigMap", host_name, e))?;
        }
    }
    Ok(())
}
