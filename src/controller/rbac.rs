use crate::common::create_or_replace;
use crate::error::{Error, Result};
use crate::tenant::TenantRecord;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::{Api, ObjectMeta};
use kube::Client;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const READ_VERBS: [&str; 3] = ["get", "list", "watch"];

fn rule(group: &str, resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: READ_VERBS.iter().map(|v| v.to_string()).collect(),
        ..PolicyRule::default()
    }
}

fn tenant_subject(tenant: &TenantRecord) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: tenant.name.clone(),
        namespace: Some(tenant.namespace.clone()),
        ..Subject::default()
    }
}

pub fn metrics_role_name(tenant: &TenantRecord) -> String {
    format!("metrics-{}", tenant.name)
}

/// Read access to pods, logs, quota objects and Jobs in `namespace`.
pub fn role_build(tenant: &TenantRecord, namespace: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(tenant.name.clone()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        rules: Some(vec![
            rule(
                "",
                &[
                    "pods",
                    "pods/log",
                    "limitranges",
                    "resourcequotas",
                    "resourcequotas/status",
                    "limitranges/status",
                ],
            ),
            rule("batch", &["jobs"]),
            rule("metrics.k8s.io", &["pods"]),
        ]),
    }
}

pub fn role_binding_build(tenant: &TenantRecord, namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(tenant.name.clone()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: tenant.name.clone(),
        },
        subjects: Some(vec![tenant_subject(tenant)]),
    }
}

pub fn metrics_cluster_role_build(tenant: &TenantRecord) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(metrics_role_name(tenant)),
            ..ObjectMeta::default()
        },
        rules: Some(vec![rule("metrics.k8s.io", &["nodes"]), rule("", &["services/proxy"])]),
        ..ClusterRole::default()
    }
}

pub fn metrics_cluster_role_binding_build(tenant: &TenantRecord) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(metrics_role_name(tenant)),
            ..ObjectMeta::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: metrics_role_name(tenant),
        },
        subjects: Some(vec![tenant_subject(tenant)]),
    }
}

/// Binds a normal (non-cluster) user to the platform's own ClusterRole.
pub fn normal_user_binding_build(tenant: &TenantRecord, cluster_role: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("w7panel-rb-{}-{}", cluster_role, tenant.name)),
            ..ObjectMeta::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![tenant_subject(tenant)]),
    }
}

async fn reconcile_role_pair(tenant: &TenantRecord, namespace: &str, client: &Client) -> Result<()> {
    let role_api = Api::<Role>::namespaced(client.clone(), namespace);
    create_or_replace(&role_api, role_build(tenant, namespace), |desired, live| Role {
        rules: desired.rules,
        ..live
    })
    .await
    .map_err(Error::ReconcileRoleFailed)?;

    let rb_api = Api::<RoleBinding>::namespaced(client.clone(), namespace);
    create_or_replace(&rb_api, role_binding_build(tenant, namespace), |desired, live| RoleBinding {
        subjects: desired.subjects,
        ..live
    })
    .await
    .map_err(Error::ReconcileRoleBindingFailed)?;
    Ok(())
}

/// Role pairs in the account's namespace and in the tenant namespace, plus
/// cluster-wide read access to node metrics.
pub async fn reconcile_roles(tenant: &TenantRecord, client: &Client) -> Result<()> {
    reconcile_role_pair(tenant, &tenant.namespace, client).await?;
    reconcile_role_pair(tenant, &tenant.k3k_namespace(), client).await?;

    let cr_api = Api::<ClusterRole>::all(client.clone());
    create_or_replace(&cr_api, metrics_cluster_role_build(tenant), |desired, live| ClusterRole {
        rules: desired.rules,
        ..live
    })
    .await
    .map_err(Error::ReconcileClusterRoleFailed)?;

    let crb_api = Api::<ClusterRoleBinding>::all(client.clone());
    create_or_replace(&crb_api, metrics_cluster_role_binding_build(tenant), |desired, live| {
        ClusterRoleBinding {
            subjects: desired.subjects,
            ..live
        }
    })
    .await
    .map_err(Error::ReconcileClusterRoleBindingFailed)?;
    Ok(())
}

pub async fn reconcile_normal_user(tenant: &TenantRecord, cluster_role: &str, client: &Client) -> Result<()> {
    let api = Api::<ClusterRoleBinding>::all(client.clone());
    create_or_replace(&api, normal_user_binding_build(tenant, cluster_role), |desired, live| {
        ClusterRoleBinding {
            subjects: desired.subjects,
            ..live
        }
    })
    .await
    .map_err(Error::ReconcileClusterRoleBindingFailed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::*;
    use crate::tenant::tests::tenant_sa;

    fn tenant() -> TenantRecord {
        TenantRecord::from_service_account(&tenant_sa("alice", &[(USER_MODE, USER_MODE_CLUSTER)], &[]))
    }

    #[test]
    fn roles_are_read_only() {
        let role = role_build(&tenant(), "k3k-alice");
        assert_eq!(role.metadata.namespace.as_deref(), Some("k3k-alice"));
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 3);
        for rule in &rules {
            assert_eq!(rule.verbs, vec!["get", "list", "watch"]);
        }
        assert_eq!(rules[1].api_groups, Some(vec!["batch".to_string()]));
    }

    #[test]
    fn bindings_point_at_the_tenant_account() {
        let t = tenant();
        let rb = role_binding_build(&t, "k3k-alice");
        assert_eq!(rb.role_ref.kind, "Role");
        let subject = &rb.subjects.unwrap()[0];
        assert_eq!(subject.name, "alice");
        assert_eq!(subject.namespace.as_deref(), Some("default"));

        let crb = metrics_cluster_role_binding_build(&t);
        assert_eq!(crb.metadata.name.as_deref(), Some("metrics-alice"));
        assert_eq!(crb.role_ref.name, "metrics-alice");

        let normal = normal_user_binding_build(&t, "w7panel");
        assert_eq!(normal.metadata.name.as_deref(), Some("w7panel-rb-w7panel-alice"));
        assert_eq!(normal.role_ref.kind, "ClusterRole");
        assert_eq!(normal.role_ref.name, "w7panel");
    }
}
