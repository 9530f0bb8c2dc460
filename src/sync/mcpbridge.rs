use super::{adopt_version, SyncError, SyncRequest};
use crate::common::{create_or_replace, delete_if_exists};
use crate::crds::{McpBridge, McpBridgeSpec};
use kube::api::Api;
use kube::Client;

pub fn make_host_mcpbridge(source: &McpBridge, req: &SyncRequest) -> McpBridge {
    let mut bridge = McpBridge {
        metadata: source.metadata.clone(),
        spec: McpBridgeSpec {
            registries: source.spec.registries.clone(),
        },
    };
    req.translator().translate_to(&mut bridge.metadata);
    bridge
}

pub async fn sync_mcpbridge(child: &Client, host: &Client, req: &SyncRequest) -> Result<(), SyncError> {
    let host_api = Api::<McpBridge>::namespaced(host.clone(), &req.k3k_namespace);
    let host_name = req.host_name();
    let source = Api::<McpBridge>::namespaced(child.clone(), &req.virtual_namespace)
        .get_opt(&req.virtual_name)
        .await
        .map_err(|e| SyncError::ReadFailed("McpBridge", req.virtual_name.clone(), e))?;
    match source {
        None => {
            delete_if_exists(&host_api, &host_name)
                .await
                .map_err(|e| SyncError::DeleteFailed("McpBridge", host_name, e))?;
        }
        Some(source) => {
            create_or_replace(&host_api, make_host_mcpbridge(&source, req), adopt_version)
                .await
                .map_err(|e| SyncError::WriteFailed("McpBridge", host_name, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::request;
    use serde_json::json;

    #[test]
    fn registries_are_copied_under_the_translated_name() {
        let mut source = McpBridge::new(
            "default",
            McpBridgeSpec {
                registries: vec![json!({"name": "nacos", "type": "nacos2", "domain": "nacos.shop", "port": 8848})],
            },
        );
        source.metadata.namespace = Some("higress-system".into());
        let req = request("shared");
        let host = make_host_mcpbridge(&source, &req);
        assert_eq!(
            host.metadata.name,
            Some(req.translator().translate_name("higress-system", "default"))
        );
        assert_eq!(host.metadata.namespace.as_deref(), Some("k3k-alice"));
        assert_eq!(host.spec.registries, source.spec.registries);
    }
}
