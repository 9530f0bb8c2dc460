//! Process-local copy of the lock-version markers. Tokens carry the
//! markers that were current when they were issued; a mismatch means the
//! tenant has to log in again.

use crate::crds::VirtualClusterPolicy;
use crate::error::{Error, Result};
use crate::labels::{LOCK_VERSION, TENANT_NAMESPACE};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::*;

pub const DEFAULT_VERSION: &str = "1";

#[derive(Debug, Default)]
pub struct VersionCache {
    tenants: RwLock<HashMap<String, String>>,
    policies: RwLock<HashMap<String, String>>,
}

fn version_of<K: Resource>(obj: &K) -> (String, String) {
    let meta = obj.meta();
    let version = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(LOCK_VERSION))
        .cloned()
        .unwrap_or_default();
    (meta.name.clone().unwrap_or_default(), version)
}

fn normalize(version: &str) -> String {
    if version.is_empty() {
        DEFAULT_VERSION.to_string()
    } else {
        version.to_string()
    }
}

impl VersionCache {
    pub fn new() -> Self {
        VersionCache::default()
    }

    /// Seeds the cache from every tenant account and every policy.
    pub async fn load_all(&self, client: &Client) -> Result<()> {
        let sas = Api::<ServiceAccount>::namespaced(client.clone(), TENANT_NAMESPACE)
            .list(&ListParams::default())
            .await
            .map_err(Error::ListFailed)?;
        for sa in &sas.items {
            let (name, version) = version_of(sa);
            self.set_tenant(&name, &version);
        }
        let policies = Api::<VirtualClusterPolicy>::all(client.clone())
            .list(&ListParams::default())
            .await
            .map_err(Error::ListFailed)?;
        for policy in &policies.items {
            let (name, version) = version_of(policy);
            self.set_policy(&name, &version);
        }
        info!(
            tenants = sas.items.len(),
            policies = policies.items.len(),
            "version cache loaded"
        );
        Ok(())
    }

    pub fn tenant(&self, name: &str) -> String {
        self.tenants
            .read()
            .ok()
            .and_then(|m| m.get(name).cloned())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string())
    }

    pub fn policy(&self, name: &str) -> String {
        self.policies
            .read()
            .ok()
            .and_then(|m| m.get(name).cloned())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string())
    }

    pub fn set_tenant(&self, name: &str, version: &str) {
        if let Ok(mut m) = self.tenants.write() {
            m.insert(name.to_string(), normalize(version));
        }
    }

    pub fn set_policy(&self, name: &str, version: &str) {
        if let Ok(mut m) = self.policies.write() {
            m.insert(name.to_string(), normalize(version));
        }
    }

    pub fn delete_tenant(&self, name: &str) {
        if let Ok(mut m) = self.tenants.write() {
            m.remove(name);
        }
    }

    pub fn delete_policy(&self, name: &str) {
        if let Ok(mut m) = self.policies.write() {
            m.remove(name);
        }
    }

    /// Whether a token issued with these markers is stale.
    pub fn needs_reauth(&self, tenant: &str, tenant_version: &str, policy: &str, policy_version: &str) -> bool {
        if normalize(tenant_version) != self.tenant(tenant) {
            return true;
        }
        !policy.is_empty() && normalize(policy_version) != self.policy(policy)
    }
}

/// Keeps the policy markers current between restarts.
pub async fn reconcile_policy(policy: Arc<VirtualClusterPolicy>, cache: Arc<VersionCache>) -> Result<Action> {
    let (name, version) = version_of(policy.as_ref());
    if name.is_empty() {
        return Err(Error::MissingObjectKey(".metadata.name"));
    }
    if policy.meta().deletion_timestamp.is_some() {
        cache.delete_policy(&name);
    } else if cache.policy(&name) != normalize(&version) {
        debug!(policy = %name, version = %version, "policy version changed");
        cache.set_policy(&name, &version);
    }
    Ok(Action::await_change())
}

pub fn policy_error_policy(_policy: Arc<VirtualClusterPolicy>, error: &Error, _cache: Arc<VersionCache>) -> Action {
    warn!("Policy reconcile failed: {}", error);
    Action::requeue(std::time::Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_empty_versions_read_as_one() {
        let cache = VersionCache::new();
        assert_eq!(cache.tenant("alice"), "1");
        cache.set_tenant("alice", "");
        assert_eq!(cache.tenant("alice"), "1");
        cache.set_tenant("alice", "4");
        assert_eq!(cache.tenant("alice"), "4");
        cache.delete_tenant("alice");
        assert_eq!(cache.tenant("alice"), "1");
    }

    #[test]
    fn bumped_markers_force_reauth() {
        let cache = VersionCache::new();
        assert!(!cache.needs_reauth("alice", "", "basic", "1"));
        cache.set_tenant("alice", "2");
        assert!(cache.needs_reauth("alice", "1", "basic", "1"));
        assert!(!cache.needs_reauth("alice", "2", "basic", "1"));
        cache.set_policy("basic", "3");
        assert!(cache.needs_reauth("alice", "2", "basic", "1"));
        assert!(!cache.needs_reauth("alice", "2", "", ""));
        cache.delete_policy("basic");
        assert!(!cache.needs_reauth("alice", "2", "basic", "1"));
    }

    #[tokio::test]
    async fn policy_events_refresh_the_marker() {
        use crate::crds::VirtualClusterPolicySpec;
        let cache = Arc::new(VersionCache::new());
        let mut policy = VirtualClusterPolicy::new("basic", VirtualClusterPolicySpec::default());
        policy.metadata.annotations = Some([(LOCK_VERSION.to_string(), "5".to_string())].into());
        reconcile_policy(Arc::new(policy), cache.clone()).await.unwrap();
        assert_eq!(cache.policy("basic"), "5");
    }
}
