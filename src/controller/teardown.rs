use crate::common::delete_if_exists;
use crate::crds::Cluster;
use crate::error::{Error, Result};
use crate::labels::TENANT_NAMESPACE;
use crate::quota::delete_quota;
use crate::tenant::TenantRecord;
use crate::virtual_client::VirtualClients;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Secret, Service};
use kube::api::Api;
use tracing::*;

const AGENT_NAMESPACE: &str = "default";

pub fn config_secret_name(tenant: &TenantRecord) -> String {
    format!("{}.w7-config", tenant.name)
}

/// What one teardown pass observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Teardown {
    pub agent_gone: bool,
    pub cluster_gone: bool,
}

impl Teardown {
    /// The tenant can start over once the agent and the cluster object
    /// both answered not-found.
    pub fn is_complete(&self) -> bool {
        self.agent_gone && self.cluster_gone
    }
}

/// Agent objects inside the virtual cluster. A cluster whose kubeconfig is
/// already gone has no agent left to remove.
async fn delete_agent(tenant: &TenantRecord, clients: &VirtualClients) -> Result<bool> {
    let child = match clients.client(tenant.k3k_name(), &tenant.k3k_namespace()).await {
        Ok(child) => child,
        Err(e) => {
            debug!(tenant = %tenant.name, "virtual cluster unreachable, skipping agent: {}", e);
            return Ok(true);
        }
    };
    let ds_gone = delete_if_exists(&Api::<DaemonSet>::namespaced(child.clone(), AGENT_NAMESPACE), &tenant.agent_name())
        .await
        .map_err(|e| Error::DeleteFailed("DaemonSet", e))?;
    let svc_gone = delete_if_exists(&Api::<Service>::namespaced(child, AGENT_NAMESPACE), &tenant.agent_name())
        .await
        .map_err(|e| Error::DeleteFailed("Service", e))?;
    Ok(ds_gone && svc_gone)
}

/// Removes everything a tenant owns, in dependency order: agent workload,
/// agent service, cluster object, quota objects, server volume, config
/// secret, namespace. Not-found counts as done at every step.
pub async fn delete_associated_resources(tenant: &TenantRecord, clients: &VirtualClients) -> Result<Teardown> {
    let host = clients.host().clone();
    let ns = tenant.k3k_namespace();

    let agent_gone = delete_agent(tenant, clients).await?;

    let cluster_gone = delete_if_exists(&Api::<Cluster>::namespaced(host.clone(), &ns), tenant.k3k_name())
        .await
        .map_err(|e| Error::DeleteFailed("Cluster", e))?;

    delete_quota(tenant, host.clone()).await?;

    delete_if_exists(
        &Api::<PersistentVolumeClaim>::namespaced(host.clone(), &ns),
        &tenant.server_pvc_name(),
    )
    .await
    .map_err(|e| Error::DeleteFailed("PersistentVolumeClaim", e))?;

    delete_if_exists(
        &Api::<Secret>::namespaced(host.clone(), TENANT_NAMESPACE),
        &config_secret_name(tenant),
    )
    .await
    .map_err(|e| Error::DeleteFailed("Secret", e))?;

    if let Err(e) = delete_if_exists(&Api::<Namespace>::all(host), &ns).await {
        warn!(tenant = %tenant.name, namespace = %ns, "failed to delete namespace: {}", e);
    }

    clients.forget(tenant.k3k_name(), &ns).await;
    Ok(Teardown { agent_gone, cluster_gone })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::tests::tenant_sa;

    #[test]
    fn complete_only_when_everything_is_gone() {
        assert!(Teardown { agent_gone: true, cluster_gone: true }.is_complete());
        assert!(!Teardown { agent_gone: true, cluster_gone: false }.is_complete());
        assert!(!Teardown { agent_gone: false, cluster_gone: true }.is_complete());
        assert!(!Teardown::default().is_complete());
    }

    #[test]
    fn config_secret_follows_the_tenant() {
        let t = TenantRecord::from_service_account(&tenant_sa("alice", &[], &[]));
        assert_eq!(config_secret_name(&t), "alice.w7-config");
    }
}
