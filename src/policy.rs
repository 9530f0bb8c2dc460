//! Tenant registration from a VirtualClusterPolicy, and re-pricing from a
//! cost ConfigMap.

use crate::crds::VirtualClusterPolicy;
use crate::error::{Error, PreconditionError, Result};
use crate::labels::*;
use crate::store::{update_tenant, TenantStore};
use crate::tenant::cost::Cost;
use crate::tenant::TenantRecord;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use kube::api::{Api, ObjectMeta};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::*;

const COST_QUOTA_KEY: &str = "quota";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn policy(&self, name: &str) -> Result<Option<VirtualClusterPolicy>>;
    /// Cost ConfigMaps live next to the tenant accounts.
    async fn cost_config(&self, name: &str) -> Result<Option<ConfigMap>>;
}

pub struct KubePolicySource {
    client: Client,
}

impl KubePolicySource {
    pub fn new(client: Client) -> Self {
        KubePolicySource { client }
    }
}

#[async_trait]
impl PolicySource for KubePolicySource {
    async fn policy(&self, name: &str) -> Result<Option<VirtualClusterPolicy>> {
        Api::<VirtualClusterPolicy>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(|e| Error::GetFailed("VirtualClusterPolicy", e))
    }

    async fn cost_config(&self, name: &str) -> Result<Option<ConfigMap>> {
        Api::<ConfigMap>::namespaced(self.client.clone(), TENANT_NAMESPACE)
            .get_opt(name)
            .await
            .map_err(|e| Error::GetFailed("ConfigMap", e))
    }
}

/// The account a new tenant starts with: policy annotations plus the
/// policy reference, its title and its cluster mode. `quota` overrides
/// the policy's own quota template.
pub fn register_manifest(
    policy: &VirtualClusterPolicy,
    tenant_name: &str,
    console_id: &str,
    quota: Option<String>,
    extra_annotations: &BTreeMap<String, String>,
) -> ServiceAccount {
    let policy_name = policy.metadata.name.clone().unwrap_or_default();
    let policy_labels = policy.metadata.labels.clone().unwrap_or_default();
    let mut labels = BTreeMap::from([
        (CLUSTER_STATUS.to_string(), "new".to_string()),
        (USER_MODE.to_string(), USER_MODE_CLUSTER.to_string()),
        (CLUSTER_POLICY.to_string(), policy_name.clone()),
        (
            DEMO_USER.to_string(),
            policy_labels.get(DEMO_USER).cloned().unwrap_or_default(),
        ),
    ]);
    if !console_id.is_empty() && console_id != "0" {
        labels.insert(CONSOLE_ID.to_string(), console_id.to_string());
    }

    let mut annotations = policy.metadata.annotations.clone().unwrap_or_default();
    let title = annotations.get(POLICY_TITLE).cloned().unwrap_or_default();
    annotations.insert(CLUSTER_POLICY.to_string(), policy_name);
    annotations.insert(CLUSTER_POLICY_TITLE.to_string(), title);
    annotations.insert(CLUSTER_MODE.to_string(), policy.spec.allowed_mode.clone());
    if let Some(quota) = quota {
        annotations.insert(QUOTA_LIMIT.to_string(), quota);
    }
    annotations.extend(extra_annotations.iter().map(|(k, v)| (k.clone(), v.clone())));

    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(tenant_name.to_string()),
            namespace: Some(TENANT_NAMESPACE.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    }
}

/// Applies a cost ConfigMap: its prices always, its quota unless the
/// tenant's quota is already fixed.
pub fn replace_cost(tenant: &mut TenantRecord, config: &ConfigMap) -> Result<()> {
    let data = config.data.clone().unwrap_or_default();
    let cost = Cost::from_config_data(&data).map_err(Error::InvalidCost)?;
    if let Some(quota) = data.get(COST_QUOTA_KEY).filter(|q| !q.is_empty()) {
        if let Err(e) = tenant.inherit_quota(quota) {
            warn!(tenant = %tenant.name, error = %e, "ignoring invalid quota in cost config");
        }
    }
    tenant.inherit_cost(cost);
    Ok(())
}

#[derive(Clone)]
pub struct Registrar {
    policies: Arc<dyn PolicySource>,
    store: Arc<dyn TenantStore>,
}

impl Registrar {
    pub fn new(policies: Arc<dyn PolicySource>, store: Arc<dyn TenantStore>) -> Self {
        Registrar { policies, store }
    }

    /// Creates a tenant under `policy_name`. With `check_allow` the policy
    /// must be open for self-registration.
    pub async fn register(
        &self,
        policy_name: &str,
        tenant_name: &str,
        console_id: &str,
        extra_annotations: &BTreeMap<String, String>,
        check_allow: bool,
    ) -> Result<TenantRecord> {
        let policy = self
            .policies
            .policy(policy_name)
            .await?
            .ok_or_else(|| PreconditionError::PolicyNotFound(policy_name.to_string()))?;
        let allowed = policy
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(POLICY_ALLOW_REGISTER))
            .map(|v| v == "true")
            .unwrap_or(false);
        if check_allow && !allowed {
            return Err(PreconditionError::RegisterNotAllowed.into());
        }

        let cost_name = policy.metadata.annotations.as_ref().and_then(|a| a.get(COST_NAME)).cloned();
        let mut quota = None;
        if let Some(cost_name) = cost_name {
            match self.policies.cost_config(&cost_name).await {
                Ok(Some(cm)) => {
                    quota = cm.data.as_ref().and_then(|d| d.get(COST_QUOTA_KEY)).cloned();
                }
                Ok(None) => warn!(cost = %cost_name, "cost config not found"),
                Err(e) => warn!(cost = %cost_name, error = %e, "failed to read cost config"),
            }
        }

        let sa = register_manifest(&policy, tenant_name, console_id, quota, extra_annotations);
        let created = self.store.create(&sa).await?;
        info!(tenant = %tenant_name, policy = %policy_name, "tenant registered");
        Ok(TenantRecord::from_service_account(&created))
    }

    /// Re-reads the tenant's cost ConfigMap and applies it.
    pub async fn refresh_cost(&self, tenant_name: &str, cost_name: &str) -> Result<TenantRecord> {
        let config = self
            .policies
            .cost_config(cost_name)
            .await?
            .ok_or_else(|| Error::Precondition(PreconditionError::NoCost))?;
        update_tenant(self.store.as_ref(), tenant_name, |t| replace_cost(t, &config)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::VirtualClusterPolicySpec;
    use crate::store::tests::MemoryStore;
    use crate::tenant::tests::{tenant_sa, QUOTA};
    use crate::tenant::ClusterStatus;

    fn policy(allow: bool, cost_name: Option<&str>) -> VirtualClusterPolicy {
        let mut policy = VirtualClusterPolicy::new(
            "basic",
            VirtualClusterPolicySpec {
                allowed_mode: CLUSTER_MODE_VIRTUAL.into(),
                ..Default::default()
            },
        );
        policy.metadata.labels = Some(BTreeMap::from([
            (POLICY_ALLOW_REGISTER.to_string(), allow.to_string()),
            (DEMO_USER.to_string(), "false".to_string()),
        ]));
        let mut annotations = BTreeMap::from([
            (POLICY_TITLE.to_string(), "Basic".to_string()),
            (QUOTA_LIMIT.to_string(), r#"{"hard":{"cpu":1}}"#.to_string()),
        ]);
        if let Some(name) = cost_name {
            annotations.insert(COST_NAME.to_string(), name.to_string());
        }
        policy.metadata.annotations = Some(annotations);
        policy
    }

    fn cost_config() -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([
                ("cpu".to_string(), "10".to_string()),
                ("memory".to_string(), "5".to_string()),
                (COST_QUOTA_KEY.to_string(), QUOTA.to_string()),
            ])),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn manifest_inherits_the_policy() {
        let extra = BTreeMap::from([("password".to_string(), "hash".to_string())]);
        let sa = register_manifest(&policy(true, None), "bob", "42", None, &extra);
        let labels = sa.metadata.labels.unwrap();
        assert_eq!(labels[CLUSTER_STATUS], "new");
        assert_eq!(labels[USER_MODE], USER_MODE_CLUSTER);
        assert_eq!(labels[CLUSTER_POLICY], "basic");
        assert_eq!(labels[CONSOLE_ID], "42");
        let annotations = sa.metadata.annotations.unwrap();
        assert_eq!(annotations[CLUSTER_POLICY_TITLE], "Basic");
        assert_eq!(annotations[CLUSTER_MODE], CLUSTER_MODE_VIRTUAL);
        assert_eq!(annotations[QUOTA_LIMIT], r#"{"hard":{"cpu":1}}"#);
        assert_eq!(annotations["password"], "hash");

        let sa = register_manifest(&policy(true, None), "bob", "0", Some(QUOTA.into()), &BTreeMap::new());
        assert!(!sa.metadata.labels.unwrap().contains_key(CONSOLE_ID));
        assert_eq!(sa.metadata.annotations.unwrap()[QUOTA_LIMIT], QUOTA);
    }

    #[tokio::test]
    async fn registration_takes_quota_from_the_cost_config() {
        let mut policies = MockPolicySource::new();
        policies.expect_policy().returning(|_| Ok(Some(policy(true, Some("basic-cost")))));
        policies
            .expect_cost_config()
            .withf(|name| name == "basic-cost")
            .returning(|_| Ok(Some(cost_config())));
        let store = Arc::new(MemoryStore::default());
        let registrar = Registrar::new(Arc::new(policies), store.clone());

        let tenant = registrar.register("basic", "bob", "", &BTreeMap::new(), true).await.unwrap();
        assert!(tenant.is_cluster_user());
        assert_eq!(tenant.storage_class(), "disk1");
        assert_eq!(store.tenant("bob").cluster_status, ClusterStatus::New);

        let err = registrar.register("basic", "bob", "", &BTreeMap::new(), true).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(PreconditionError::TenantExists(_))));
    }

    #[tokio::test]
    async fn closed_policies_refuse_self_registration() {
        let mut policies = MockPolicySource::new();
        policies.expect_policy().returning(|_| Ok(Some(policy(false, None))));
        policies.expect_cost_config().never();
        let store = Arc::new(MemoryStore::default());
        let registrar = Registrar::new(Arc::new(policies), store.clone());

        let err = registrar.register("basic", "bob", "", &BTreeMap::new(), true).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(PreconditionError::RegisterNotAllowed)));
        // console registration skips the check
        assert!(registrar.register("basic", "bob", "7", &BTreeMap::new(), false).await.is_ok());
    }

    #[tokio::test]
    async fn missing_policy_is_a_precondition() {
        let mut policies = MockPolicySource::new();
        policies.expect_policy().returning(|_| Ok(None));
        let registrar = Registrar::new(Arc::new(policies), Arc::new(MemoryStore::default()));
        let err = registrar.register("gone", "bob", "", &BTreeMap::new(), false).await.unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn replace_cost_respects_the_quota_lock() {
        let store = Arc::new(MemoryStore::with(vec![
            tenant_sa("alice", &[(USER_MODE, USER_MODE_CLUSTER)], &[]),
            tenant_sa(
                "carol",
                &[(USER_MODE, USER_MODE_CLUSTER)],
                &[(QUOTA_LIMIT, r#"{"hard":{"cpu":1}}"#), (QUOTA_LIMIT_LOCK, "true")],
            ),
        ]));
        let mut policies = MockPolicySource::new();
        policies.expect_cost_config().returning(|_| Ok(Some(cost_config())));
        let registrar = Registrar::new(Arc::new(policies), store.clone());

        let alice = registrar.refresh_cost("alice", "basic-cost").await.unwrap();
        assert_eq!(alice.cost().unwrap().cpu, 10.0);
        assert_eq!(alice.storage_class(), "disk1");
        assert!(store.object("alice").metadata.annotations.unwrap().contains_key(COST));

        let carol = registrar.refresh_cost("carol", "basic-cost").await.unwrap();
        assert_eq!(carol.cost().unwrap().memory, 5.0);
        assert_eq!(carol.storage_class(), "");
    }
}
