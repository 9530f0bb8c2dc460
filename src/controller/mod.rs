//! The tenant reconciler: one pass per ServiceAccount event, walking the
//! cluster-status cycle and keeping the tenant's host and virtual-cluster
//! objects in line with it.

pub mod agent;
pub mod rbac;
pub mod storage;
pub mod teardown;

use crate::config::PlatformSettings;
use crate::error::{Error, Result};
use crate::job_bridge::submit_job;
use crate::labels::*;
use crate::overselling::{admit_pending_grant, KubeInventory, OversellingLedger};
use crate::quota::{delete_quota, reconcile_quota};
use crate::store::{update_tenant, TenantStore};
use crate::tenant::time::TimeBound;
use crate::tenant::{ClusterStatus, JobStatus, TenantRecord};
use crate::version_cache::VersionCache;
use crate::virtual_client::VirtualClients;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

const FINALIZER_REQUEUE: Duration = Duration::from_secs(10);
const AGENT_REQUEUE: Duration = Duration::from_secs(30);
const RECYCLE_REQUEUE: Duration = Duration::from_secs(30);
const EXPIRY_REQUEUE: Duration = Duration::from_secs(30 * 60);

pub struct Data {
    pub client: Client,
    pub clients: Arc<VirtualClients>,
    pub store: Arc<dyn TenantStore>,
    pub ledger: OversellingLedger<KubeInventory>,
    pub versions: Arc<VersionCache>,
    pub settings: PlatformSettings,
}

/// Moves the tenant along the expiry part of the cycle. Each call takes at
/// most one step. Returns whether the record changed.
pub fn advance_phase(tenant: &mut TenantRecord, now: DateTime<Utc>) -> bool {
    let before = (tenant.cluster_status, tenant.is_paused(), tenant.time_state().pending_recycle_time);
    match tenant.cluster_status {
        ClusterStatus::Ready if tenant.is_expired(now) => {
            tenant.cluster_status = tenant.cluster_status.next();
            tenant.set_pending_recycle_time(now);
            tenant.pause();
        }
        ClusterStatus::Creating | ClusterStatus::Ready => {
            if tenant.is_paused() {
                tenant.unpause();
            }
            tenant.clear_pending_recycle_time();
        }
        ClusterStatus::Wait => {
            tenant.set_pending_recycle_time(now);
            if !tenant.is_paused() {
                tenant.pause();
            }
            if tenant.is_pending_recycle_expired(now) {
                tenant.cluster_status = tenant.cluster_status.next();
            }
        }
        ClusterStatus::New | ClusterStatus::Recycle => {}
    }
    before != (tenant.cluster_status, tenant.is_paused(), tenant.time_state().pending_recycle_time)
}

/// Requeue after a clean pass: tenants with an expiry are revisited so the
/// deadline is noticed without any other event.
pub fn settled_action(tenant: &TenantRecord) -> Action {
    if tenant.has_expire_time() {
        Action::requeue(EXPIRY_REQUEUE)
    } else {
        Action::await_change()
    }
}

fn has_finalizer(sa: &ServiceAccount) -> bool {
    sa.metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|f| f == TENANT_FINALIZER))
        .unwrap_or(false)
}

fn with_finalizer(mut sa: ServiceAccount) -> ServiceAccount {
    sa.metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(TENANT_FINALIZER.to_string());
    sa
}

fn without_finalizer(mut sa: ServiceAccount) -> ServiceAccount {
    if let Some(finalizers) = sa.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != TENANT_FINALIZER);
    }
    sa
}

pub fn namespace_build(tenant: &TenantRecord) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(tenant.k3k_namespace()),
            labels: Some(BTreeMap::from([(
                NAMESPACE_POLICY_NAME.to_string(),
                tenant.policy().to_string(),
            )])),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

async fn reconcile_namespace(tenant: &TenantRecord, client: &Client) -> Result<()> {
    let api = Api::<Namespace>::all(client.clone());
    crate::common::create_or_replace(&api, namespace_build(tenant), |desired, mut live| {
        let labels = live.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.extend(desired.metadata.labels.unwrap_or_default());
        live
    })
    .await
    .map_err(Error::ReconcileNamespaceFailed)?;
    Ok(())
}

/// Tears the tenant down and releases the ServiceAccount.
async fn handle_deletion(sa: ServiceAccount, tenant: &TenantRecord, ctx: &Data) -> Result<Action> {
    let api = Api::<ServiceAccount>::namespaced(ctx.client.clone(), TENANT_NAMESPACE);
    ctx.versions.delete_tenant(&tenant.name);
    if !has_finalizer(&sa) {
        return Ok(Action::await_change());
    }
    if tenant.is_cluster_user() {
        teardown::delete_associated_resources(tenant, &ctx.clients).await?;
    }
    info!("Remove finalizer from ServiceAccount: {}", tenant.name);
    api.replace(&tenant.name, &PostParams::default(), &without_finalizer(sa))
        .await
        .map_err(Error::UpdateTenantFailed)?;
    Ok(Action::await_change())
}

/// Submits the provisioning Job once admission and the preconditions allow
/// it. Precondition failures wait for the tenant to change.
async fn provision(tenant: &TenantRecord, ctx: &Data) -> Result<()> {
    if !matches!(tenant.cluster_status, ClusterStatus::New | ClusterStatus::Creating)
        || tenant.job.status != JobStatus::Unknown
    {
        return Ok(());
    }
    let now = Utc::now();
    let tenant = match admit_pending_grant(&ctx.ledger, ctx.store.as_ref(), &tenant.name, now).await {
        Ok(tenant) => tenant,
        Err(e) if e.is_precondition() => {
            info!(tenant = %tenant.name, "not provisioning: {}", e);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if let Err(e) = tenant.init_cluster_error(now) {
        info!(tenant = %tenant.name, "not provisioning: {}", e);
        return Ok(());
    }
    let job = submit_job(&ctx.client, ctx.store.as_ref(), &tenant, &ctx.settings).await?;
    info!(tenant = %tenant.name, job = %job, "provisioning job submitted");
    Ok(())
}

pub async fn reconcile_tenant(sa: Arc<ServiceAccount>, ctx: Arc<Data>) -> Result<Action> {
    let name = sa.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let api = Api::<ServiceAccount>::namespaced(ctx.client.clone(), TENANT_NAMESPACE);

    let sa = match api.get_opt(&name).await.map_err(Error::GetTenantFailed)? {
        Some(sa) => sa,
        None => return Ok(Action::await_change()),
    };
    let mut tenant = TenantRecord::from_service_account(&sa);

    if sa.metadata.deletion_timestamp.is_some() {
        return handle_deletion(sa, &tenant, &ctx).await;
    }
    if !tenant.is_cluster_user() && !tenant.is_normal_user() {
        return Ok(Action::await_change());
    }
    if !has_finalizer(&sa) {
        info!("Add finalizer to ServiceAccount: {}", name);
        api.replace(&name, &PostParams::default(), &with_finalizer(sa))
            .await
            .map_err(Error::UpdateTenantFailed)?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }
    ctx.versions.set_tenant(&name, tenant.lock_version());

    if tenant.is_normal_user() {
        rbac::reconcile_normal_user(&tenant, &ctx.settings.service_account_name, &ctx.client).await?;
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    if advance_phase(&mut tenant, now) {
        info!(tenant = %name, status = tenant.cluster_status.as_str(), paused = tenant.is_paused(), "tenant phase changed");
        tenant = update_tenant(ctx.store.as_ref(), &name, |t| {
            advance_phase(t, now);
            Ok(())
        })
        .await?;
    }

    if tenant.cluster_status == ClusterStatus::Recycle {
        let teardown = teardown::delete_associated_resources(&tenant, &ctx.clients).await?;
        if !teardown.is_complete() {
            debug!(tenant = %name, "recycling in progress: {:?}", teardown);
            return Ok(Action::requeue(RECYCLE_REQUEUE));
        }
        update_tenant(ctx.store.as_ref(), &name, |t| {
            if t.cluster_status == ClusterStatus::Recycle {
                t.renew();
            }
            Ok(())
        })
        .await?;
        info!(tenant = %name, "tenant recycled");
        return Ok(Action::await_change());
    }

    reconcile_namespace(&tenant, &ctx.client).await?;
    rbac::reconcile_roles(&tenant, &ctx.client).await?;

    if !tenant.is_cluster_ready() {
        // quota objects would starve the bootstrap job
        delete_quota(&tenant, ctx.client.clone()).await?;
        provision(&tenant, &ctx).await?;
        return Ok(settled_action(&tenant));
    }

    reconcile_quota(&tenant, ctx.client.clone()).await?;
    if let Err(e) = storage::reconcile_storage(&tenant, &ctx.client).await {
        warn!(tenant = %name, "failed to grow server volume: {}", e);
    }
    if let Err(e) = agent::reconcile_agent(&tenant, &ctx.clients, &ctx.settings).await {
        warn!(tenant = %name, "failed to reconcile agent: {}", e);
        return Ok(Action::requeue(AGENT_REQUEUE));
    }
    Ok(settled_action(&tenant))
}

pub fn error_policy(_sa: Arc<ServiceAccount>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::tests::{tenant_sa, QUOTA};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn tenant(status: &str, expire: Option<DateTime<Utc>>) -> TenantRecord {
        let expire = expire.map(|t| crate::tenant::time::format_time(&t)).unwrap_or_default();
        TenantRecord::from_service_account(&tenant_sa(
            "alice",
            &[(USER_MODE, USER_MODE_CLUSTER), (CLUSTER_STATUS, status)],
            &[(QUOTA_LIMIT, QUOTA), (EXPIRE_TIME, expire.as_str()), (CLUSTER_POLICY, "basic")],
        ))
    }

    #[test]
    fn ready_tenant_in_good_standing_is_unpaused() {
        let mut t = tenant("ready", Some(now() + ChronoDuration::days(3)));
        t.pause();
        assert!(advance_phase(&mut t, now()));
        assert_eq!(t.cluster_status, ClusterStatus::Ready);
        assert!(!t.is_paused());
        assert!(!advance_phase(&mut t, now()));
    }

    #[test]
    fn expiry_moves_ready_to_wait() {
        let expire = now() - ChronoDuration::hours(1);
        let mut t = tenant("ready", Some(expire));
        assert!(advance_phase(&mut t, now()));
        assert_eq!(t.cluster_status, ClusterStatus::Wait);
        assert!(t.is_paused());
        assert_eq!(t.time_state().pending_recycle_time, Some(expire + ChronoDuration::hours(72)));

        // still inside the recycle window
        assert!(!advance_phase(&mut t, now()));
        assert_eq!(t.cluster_status, ClusterStatus::Wait);
    }

    #[test]
    fn wait_moves_to_recycle_after_the_window() {
        let expire = now() - ChronoDuration::hours(1);
        let mut t = tenant("ready", Some(expire));
        advance_phase(&mut t, now());
        let later = expire + ChronoDuration::hours(73);
        assert!(advance_phase(&mut t, later));
        assert_eq!(t.cluster_status, ClusterStatus::Recycle);
        // recycling is finished by teardown, not by time
        assert!(!advance_phase(&mut t, later + ChronoDuration::days(30)));
        assert_eq!(t.cluster_status, ClusterStatus::Recycle);
    }

    #[test]
    fn phases_are_never_skipped() {
        let expire = now() - ChronoDuration::days(30);
        let mut t = tenant("creating", Some(expire));
        advance_phase(&mut t, now());
        assert_eq!(t.cluster_status, ClusterStatus::Creating);

        let mut t = tenant("ready", Some(expire));
        advance_phase(&mut t, now());
        assert_eq!(t.cluster_status, ClusterStatus::Wait);
        advance_phase(&mut t, now());
        assert_eq!(t.cluster_status, ClusterStatus::Recycle);

        let mut t = tenant("new", Some(expire));
        assert!(!advance_phase(&mut t, now()));
        assert_eq!(t.cluster_status, ClusterStatus::New);
    }

    #[test]
    fn recycled_tenant_starts_over() {
        let mut t = tenant("recycle", Some(now() - ChronoDuration::days(5)));
        t.running("k3k-create-x");
        t.cluster_status = ClusterStatus::Recycle;
        t.renew();
        assert_eq!(t.cluster_status, ClusterStatus::New);
        assert_eq!(t.job.status, JobStatus::Unknown);
        assert!(!t.has_expire_time());
        assert_eq!(t.time_state().pending_recycle_time, None);
    }

    #[test]
    fn expiring_tenants_are_revisited() {
        assert_eq!(
            settled_action(&tenant("ready", Some(now()))),
            Action::requeue(EXPIRY_REQUEUE)
        );
        assert_eq!(settled_action(&tenant("ready", None)), Action::await_change());
    }

    #[test]
    fn finalizer_is_added_once_and_removed_cleanly() {
        let sa = tenant_sa("alice", &[], &[]);
        assert!(!has_finalizer(&sa));
        let sa = with_finalizer(sa);
        assert!(has_finalizer(&sa));
        let sa = without_finalizer(sa);
        assert!(!has_finalizer(&sa));
        assert_eq!(sa.metadata.finalizers, Some(vec![]));
    }

    #[test]
    fn namespace_carries_the_policy() {
        let ns = namespace_build(&tenant("new", None));
        assert_eq!(ns.metadata.name.as_deref(), Some("k3k-alice"));
        assert_eq!(ns.metadata.labels.unwrap()[NAMESPACE_POLICY_NAME], "basic");
    }
}
