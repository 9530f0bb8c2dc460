//! Hard quota and container defaults in the tenant namespace, derived from
//! the tenant's quota annotation.

use crate::common::{create_or_replace, delete_if_exists};
use crate::error::{Error, Result};
use crate::tenant::limit_range_quota::{
    LimitRangeQuota, HARD_BANDWIDTH, HARD_CPU, HARD_DATA_STORAGE, HARD_MEMORY, HARD_SYS_STORAGE,
};
use crate::tenant::TenantRecord;
use k8s_openapi::api::core::v1::{LimitRange, LimitRangeItem, LimitRangeSpec, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ObjectMeta};
use kube::Client;
use std::collections::BTreeMap;
use tracing::*;

fn is_zero_quantity(v: &str) -> bool {
    crate::quantity::parse_milli(v).map(|m| m == 0).unwrap_or(true)
}

/// Renames cpu and memory into pinned request and limit keys. Bandwidth and
/// the volume sizes are enforced elsewhere; virtual clusters get no cpu or
/// memory keys so their system pods are never starved. Any other key
/// (`pods`, `count/*`) passes through unchanged.
pub fn hard_list(quota: &LimitRangeQuota, shared: bool) -> BTreeMap<String, Quantity> {
    let mut hard = BTreeMap::new();
    for (k, v) in quota.hard_map() {
        if k == HARD_BANDWIDTH || k == HARD_SYS_STORAGE || k == HARD_DATA_STORAGE || is_zero_quantity(&v) {
            continue;
        }
        let is_compute = k == HARD_CPU || k == HARD_MEMORY || k == "requests.cpu" || k == "requests.memory";
        if !shared && is_compute {
            continue;
        }
        if k == HARD_CPU || k == HARD_MEMORY {
            hard.insert(format!("requests.{}", k), Quantity(v.clone()));
            hard.insert(format!("limits.{}", k), Quantity(v));
        } else {
            hard.insert(k, Quantity(v));
        }
    }
    hard
}

pub fn make_resource_quota(tenant: &TenantRecord) -> Option<ResourceQuota> {
    let quota = tenant.quota()?;
    let hard = hard_list(quota, tenant.is_shared());
    if hard.is_empty() {
        return None;
    }
    Some(ResourceQuota {
        metadata: ObjectMeta {
            name: Some(tenant.name.clone()),
            namespace: Some(tenant.k3k_namespace()),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Default container limits, only for shared clusters with a non-zero limit.
pub fn make_limit_range(tenant: &TenantRecord) -> Option<LimitRange> {
    let quota = tenant.quota()?;
    if !tenant.is_shared() || !quota.has_container_limit() {
        return None;
    }
    let limit: BTreeMap<String, Quantity> = quota
        .limit_map()
        .into_iter()
        .map(|(k, v)| (k, Quantity(v)))
        .collect();
    Some(LimitRange {
        metadata: ObjectMeta {
            name: Some(tenant.name.clone()),
            namespace: Some(tenant.k3k_namespace()),
            ..Default::default()
        },
        spec: Some(LimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                default: Some(limit.clone()),
                default_request: Some(limit),
                ..Default::default()
            }],
        }),
    })
}

/// Creates or updates both objects, deleting whichever the quota no longer
/// calls for.
pub async fn reconcile_quota(tenant: &TenantRecord, client: Client) -> Result<()> {
    let ns = tenant.k3k_namespace();
    let lr_api = Api::<LimitRange>::namespaced(client.clone(), &ns);
    match make_limit_range(tenant) {
        Some(lr) => {
            create_or_replace(&lr_api, lr, |desired, live| LimitRange { spec: desired.spec, ..live })
                .await
                .map_err(Error::ReconcileLimitRangeFailed)?;
        }
        None => {
            delete_if_exists(&lr_api, &tenant.name)
                .await
                .map_err(|e| Error::DeleteFailed("LimitRange", e))?;
        }
    }

    let rq_api = Api::<ResourceQuota>::namespaced(client, &ns);
    match make_resource_quota(tenant) {
        Some(rq) => {
            create_or_replace(&rq_api, rq, |desired, live| ResourceQuota { spec: desired.spec, ..live })
                .await
                .map_err(Error::ReconcileResourceQuotaFailed)?;
        }
        None => {
            info!(tenant = %tenant.name, "no hard quota, removing ResourceQuota");
            delete_if_exists(&rq_api, &tenant.name)
                .await
                .map_err(|e| Error::DeleteFailed("ResourceQuota", e))?;
        }
    }
    Ok(())
}

/// Removes both objects. Returns true when neither existed.
pub async fn delete_quota(tenant: &TenantRecord, client: Client) -> Result<bool> {
    let ns = tenant.k3k_namespace();
    let lr_gone = delete_if_exists(&Api::<LimitRange>::namespaced(client.clone(), &ns), &tenant.name)
        .await
        .map_err(|e| Error::DeleteFailed("LimitRange", e))?;
    let rq_gone = delete_if_exists(&Api::<ResourceQuota>::namespaced(client, &ns), &tenant.name)
        .await
        .map_err(|e| Error::DeleteFailed("ResourceQuota", e))?;
    Ok(lr_gone && rq_gone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::*;
    use crate::tenant::tests::tenant_sa;

    fn tenant(mode: &str, quota: &str) -> TenantRecord {
        TenantRecord::from_service_account(&tenant_sa(
            "alice",
            &[(USER_MODE, USER_MODE_CLUSTER)],
            &[(CLUSTER_MODE, mode), (QUOTA_LIMIT, quota)],
        ))
    }

    #[test]
    fn shared_quota_pins_requests_and_limits() {
        let t = tenant(
            CLUSTER_MODE_SHARED,
            r#"{"hard":{"cpu":2,"memory":4,"requests.storage":10,"bandwidth":100,"sys.storage":5},"limit":{"cpu":"500m","memory":"512Mi"}}"#,
        );
        let rq = make_resource_quota(&t).unwrap();
        assert_eq!(rq.metadata.namespace.as_deref(), Some("k3k-alice"));
        let hard = rq.spec.unwrap().hard.unwrap();
        let keys: Vec<&str> = hard.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["limits.cpu", "limits.memory", "requests.cpu", "requests.memory", "requests.storage"]);
        assert_eq!(hard["limits.memory"], Quantity("4Gi".into()));

        let lr = make_limit_range(&t).unwrap();
        let item = &lr.spec.unwrap().limits[0];
        assert_eq!(item.type_, "Container");
        assert_eq!(item.default, item.default_request);
        assert_eq!(item.default.as_ref().unwrap()["cpu"], Quantity("500m".into()));
    }

    #[test]
    fn object_count_keys_pass_through() {
        let quota = r#"{"hard":{"cpu":"2","memory":"4Gi","requests.storage":"10Gi","pods":"20","services":"5","count/secrets":0}}"#;
        let hard = make_resource_quota(&tenant(CLUSTER_MODE_SHARED, quota)).unwrap().spec.unwrap().hard.unwrap();
        assert_eq!(hard["pods"], Quantity("20".into()));
        assert_eq!(hard["services"], Quantity("5".into()));
        assert!(!hard.contains_key("count/secrets"));
        assert!(hard.contains_key("limits.cpu"));

        let t = tenant(CLUSTER_MODE_VIRTUAL, r#"{"hard":{"cpu":2,"requests.cpu":"1","pods":"20"}}"#);
        let hard = make_resource_quota(&t).unwrap().spec.unwrap().hard.unwrap();
        assert_eq!(hard.keys().map(String::as_str).collect::<Vec<_>>(), vec!["pods"]);
    }

    #[test]
    fn virtual_quota_omits_compute_and_limits() {
        let t = tenant(
            CLUSTER_MODE_VIRTUAL,
            r#"{"hard":{"cpu":2,"memory":4,"requests.storage":10},"limit":{"cpu":1}}"#,
        );
        let hard = make_resource_quota(&t).unwrap().spec.unwrap().hard.unwrap();
        assert_eq!(hard.len(), 1);
        assert!(hard.contains_key("requests.storage"));
        assert!(make_limit_range(&t).is_none());
    }

    #[test]
    fn all_zero_quota_means_delete() {
        let t = tenant(CLUSTER_MODE_SHARED, r#"{"hard":{"cpu":0,"memory":0,"requests.storage":0,"bandwidth":100},"limit":{"cpu":0}}"#);
        assert!(make_resource_quota(&t).is_none());
        assert!(make_limit_range(&t).is_none());
        let none = TenantRecord::from_service_account(&tenant_sa("bob", &[], &[]));
        assert!(make_resource_quota(&none).is_none());
    }
}
