//! Typed view over a tenant ServiceAccount. Everything the platform knows
//! about a tenant lives in the account's labels and annotations; the record
//! parses them once and writes back only the keys it owns.

pub mod cost;
pub mod limit_range_quota;
pub mod order_state;
pub mod over_mode;
pub mod return_order;
pub mod time;

use crate::error::{Error, PreconditionError, Result};
use crate::labels::*;
use crate::quantity::{self, GI};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ServiceAccount;
use std::collections::BTreeMap;
use tracing::*;

use cost::Cost;
use limit_range_quota::LimitRangeQuota;
use order_state::{Orderable, OrderState, OrderStatus, OrderSlot};
use over_mode::{OverMode, Overselling, OversellingState};
use return_order::ReturnOrderLock;
use time::{format_time, parse_time, TimeBound, TimeState};

const DEFAULT_STORAGE_BYTES: i64 = 5 * GI;
const DEFAULT_VERSION: &str = "1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserMode {
    Cluster,
    Normal,
    Founder,
}

impl UserMode {
    pub fn parse(s: &str) -> Option<UserMode> {
        match s {
            USER_MODE_CLUSTER => Some(UserMode::Cluster),
            USER_MODE_NORMAL => Some(UserMode::Normal),
            USER_MODE_FOUNDER => Some(UserMode::Founder),
            _ => None,
        }
    }
}

/// Lifecycle phase. Moves only along new, creating, ready, wait, recycle
/// and back to new.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterStatus {
    #[default]
    New,
    Creating,
    Ready,
    Wait,
    Recycle,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::New => "new",
            ClusterStatus::Creating => "creating",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Wait => "wait",
            ClusterStatus::Recycle => "recycle",
        }
    }

    pub fn parse(s: &str) -> Option<ClusterStatus> {
        match s {
            "new" => Some(ClusterStatus::New),
            "creating" => Some(ClusterStatus::Creating),
            "ready" => Some(ClusterStatus::Ready),
            "wait" => Some(ClusterStatus::Wait),
            "recycle" => Some(ClusterStatus::Recycle),
            _ => None,
        }
    }

    /// The single legal successor of this phase.
    pub fn next(&self) -> ClusterStatus {
        match self {
            ClusterStatus::New => ClusterStatus::Creating,
            ClusterStatus::Creating => ClusterStatus::Ready,
            ClusterStatus::Ready => ClusterStatus::Wait,
            ClusterStatus::Wait => ClusterStatus::Recycle,
            ClusterStatus::Recycle => ClusterStatus::New,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobStatus {
    #[default]
    Unknown,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unknown => "unknow",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> JobStatus {
        match s {
            "running" => JobStatus::Running,
            "complete" => JobStatus::Complete,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Unknown,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobState {
    pub name: String,
    pub status: JobStatus,
}

#[derive(Clone, Debug, Default)]
pub struct TenantRecord {
    pub name: String,
    pub namespace: String,
    pub user_mode: Option<UserMode>,
    pub cluster_status: ClusterStatus,
    cluster_mode: Option<String>,
    policy: Option<String>,
    k3k_name: Option<String>,
    k3k_namespace: Option<String>,
    pub job: JobState,
    quota: Option<LimitRangeQuota>,
    quota_dirty: bool,
    quota_locked: bool,
    cost: Option<Cost>,
    cost_dirty: bool,
    pub orders: OrderState,
    pub overselling: OversellingState,
    pub time: TimeState,
    return_lock: Option<String>,
    paused: Option<bool>,
    pub login_time: Option<DateTime<Utc>>,
    role: Option<String>,
    pub console_id: String,
    lock_version: Option<String>,
    policy_version: Option<String>,
    pub maintenance: bool,
}

fn non_empty(map: &BTreeMap<String, String>, key: &str) -> Option<String> {
    map.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_slot(labels: &BTreeMap<String, String>, sn: &str, status: &str) -> OrderSlot {
    OrderSlot {
        sn: labels.get(sn).cloned().unwrap_or_default(),
        status: labels.get(status).and_then(|s| OrderStatus::parse(s)),
    }
}

fn write_slot(labels: &mut BTreeMap<String, String>, slot: &OrderSlot, sn: &str, status: &str) {
    set_or_remove(labels, sn, (!slot.sn.is_empty()).then(|| slot.sn.clone()));
    set_or_remove(labels, status, slot.status.map(|s| s.as_str().to_string()));
}

fn set_or_remove(map: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    match value {
        Some(v) => {
            map.insert(key.to_string(), v);
        }
        None => {
            map.remove(key);
        }
    }
}

/// Writes `value` unless the key is absent and `value` is the default it
/// would read back as.
fn put_unless_default(map: &mut BTreeMap<String, String>, key: &str, value: &str, default: &str) {
    if map.contains_key(key) || value != default {
        map.insert(key.to_string(), value.to_string());
    }
}

impl TenantRecord {
    pub fn from_service_account(sa: &ServiceAccount) -> TenantRecord {
        let empty = BTreeMap::new();
        let labels = sa.metadata.labels.as_ref().unwrap_or(&empty);
        let annotations = sa.metadata.annotations.as_ref().unwrap_or(&empty);
        let name = sa.metadata.name.clone().unwrap_or_default();

        let quota = annotations.get(QUOTA_LIMIT).filter(|q| !q.is_empty()).and_then(|raw| {
            LimitRangeQuota::parse(raw)
                .map_err(|e| warn!(tenant = %name, error = %e, "ignoring invalid quota annotation"))
                .ok()
        });
        let cost = annotations.get(COST).filter(|c| !c.is_empty()).and_then(|raw| {
            Cost::parse(raw)
                .map_err(|e| warn!(tenant = %name, error = %e, "ignoring invalid cost annotation"))
                .ok()
        });

        TenantRecord {
            namespace: sa.metadata.namespace.clone().unwrap_or_else(|| TENANT_NAMESPACE.to_string()),
            user_mode: labels.get(USER_MODE).and_then(|m| UserMode::parse(m)),
            cluster_status: labels
                .get(CLUSTER_STATUS)
                .and_then(|s| ClusterStatus::parse(s))
                .unwrap_or_default(),
            cluster_mode: annotations.get(CLUSTER_MODE).cloned(),
            policy: annotations.get(CLUSTER_POLICY).cloned(),
            k3k_name: labels.get(K3K_NAME).cloned(),
            k3k_namespace: labels.get(K3K_NAMESPACE).cloned(),
            job: JobState {
                name: annotations.get(JOB_NAME).cloned().unwrap_or_default(),
                status: annotations.get(JOB_STATUS).map(|s| JobStatus::parse(s)).unwrap_or_default(),
            },
            quota,
            quota_dirty: false,
            quota_locked: annotations.get(QUOTA_LIMIT_LOCK).map(|v| v == "true").unwrap_or(false),
            cost,
            cost_dirty: false,
            orders: OrderState {
                base: parse_slot(labels, BASE_ORDER_SN, BASE_ORDER_STATUS),
                renew: parse_slot(labels, RENEW_ORDER_SN, RENEW_ORDER_STATUS),
                expand: parse_slot(labels, EXPAND_ORDER_SN, EXPAND_ORDER_STATUS),
                base_pass: labels.get(BASE_ORDER_PASS).cloned(),
            },
            overselling: OversellingState {
                mode: labels.get(OVER_MODE).and_then(|m| OverMode::parse(m)),
                over_resource: annotations.get(OVER_RESOURCE).map(|r| crate::resource::Resource::from_json_lenient(r)),
                over_base_resource: annotations
                    .get(OVER_BASE_RESOURCE)
                    .map(|r| crate::resource::Resource::from_json_lenient(r)),
            },
            time: TimeState {
                expire_time: annotations.get(EXPIRE_TIME).and_then(|t| parse_time(t)),
                pending_recycle_time: annotations.get(PENDING_RECYCLE_TIME).and_then(|t| parse_time(t)),
            },
            return_lock: non_empty(annotations, RETURN_ORDER_INFO),
            paused: annotations.get(PAUSE).map(|p| p == "true"),
            login_time: annotations.get(LOGIN_TIME).and_then(|t| parse_time(t)),
            role: annotations.get(ROLE).cloned(),
            console_id: labels.get(CONSOLE_ID).cloned().unwrap_or_default(),
            lock_version: annotations.get(LOCK_VERSION).cloned(),
            policy_version: annotations.get(POLICY_VERSION).cloned(),
            maintenance: labels.get(MAINTENANCE).map(|v| v == "true").unwrap_or(false),
            name,
        }
    }

    /// Writes the record's owned keys onto `sa`, leaving every other label
    /// and annotation as it was.
    pub fn apply_to(&self, sa: &mut ServiceAccount) {
        let labels = sa.metadata.labels.get_or_insert_with(BTreeMap::new);
        put_unless_default(labels, CLUSTER_STATUS, self.cluster_status.as_str(), ClusterStatus::New.as_str());
        write_slot(labels, &self.orders.base, BASE_ORDER_SN, BASE_ORDER_STATUS);
        write_slot(labels, &self.orders.renew, RENEW_ORDER_SN, RENEW_ORDER_STATUS);
        write_slot(labels, &self.orders.expand, EXPAND_ORDER_SN, EXPAND_ORDER_STATUS);
        set_or_remove(labels, OVER_MODE, self.overselling.mode.map(|m| m.as_str().to_string()));

        let annotations = sa.metadata.annotations.get_or_insert_with(BTreeMap::new);
        put_unless_default(annotations, JOB_NAME, &self.job.name, "");
        put_unless_default(annotations, JOB_STATUS, self.job.status.as_str(), JobStatus::Unknown.as_str());
        if self.quota_dirty {
            if let Some(quota) = &self.quota {
                annotations.insert(QUOTA_LIMIT.to_string(), quota.to_json());
                annotations.insert(QUOTA_LIMIT_NAME.to_string(), String::new());
            }
        }
        if self.quota_locked {
            annotations.insert(QUOTA_LIMIT_LOCK.to_string(), "true".to_string());
        }
        if self.cost_dirty {
            match self.cost.as_ref().map(Cost::to_json) {
                Some(Ok(json)) => {
                    annotations.insert(COST.to_string(), json);
                }
                Some(Err(e)) => warn!(tenant = %self.name, error = %e, "failed to serialize cost"),
                None => {
                    annotations.remove(COST);
                }
            }
        }
        set_or_remove(annotations, OVER_RESOURCE, self.overselling.over_resource.map(|r| r.to_json()));
        set_or_remove(
            annotations,
            OVER_BASE_RESOURCE,
            self.overselling.over_base_resource.map(|r| r.to_json()),
        );
        set_or_remove(annotations, RETURN_ORDER_INFO, self.return_lock.clone());
        set_or_remove(annotations, EXPIRE_TIME, self.time.expire_time.as_ref().map(format_time));
        set_or_remove(
            annotations,
            PENDING_RECYCLE_TIME,
            self.time.pending_recycle_time.as_ref().map(format_time),
        );
        if let Some(paused) = self.paused {
            annotations.insert(PAUSE.to_string(), paused.to_string());
        }
        if let Some(t) = &self.login_time {
            annotations.insert(LOGIN_TIME.to_string(), format_time(t));
        }
    }

    pub fn is_cluster_user(&self) -> bool {
        self.user_mode == Some(UserMode::Cluster)
    }

    pub fn is_normal_user(&self) -> bool {
        self.user_mode == Some(UserMode::Normal)
    }

    /// The provisioning Job finished.
    pub fn is_cluster_ready(&self) -> bool {
        self.job.status == JobStatus::Complete
    }

    pub fn k3k_name(&self) -> &str {
        self.k3k_name.as_deref().unwrap_or(&self.name)
    }

    pub fn k3k_namespace(&self) -> String {
        self.k3k_namespace.clone().unwrap_or_else(|| format!("k3k-{}", self.name))
    }

    pub fn cluster_mode(&self) -> &str {
        self.cluster_mode.as_deref().unwrap_or("unknown")
    }

    pub fn is_virtual(&self) -> bool {
        self.cluster_mode() == CLUSTER_MODE_VIRTUAL
    }

    pub fn is_shared(&self) -> bool {
        self.cluster_mode() == CLUSTER_MODE_SHARED
    }

    pub fn policy(&self) -> &str {
        self.policy.as_deref().unwrap_or_default()
    }

    pub fn agent_name(&self) -> String {
        format!("w7panel-k3k-agent-{}", self.k3k_name())
    }

    pub fn virtual_ingress_service_name(&self) -> String {
        format!("{}-service-w7", self.k3k_namespace())
    }

    pub fn api_server_host(&self) -> String {
        let ns = self.k3k_namespace();
        format!("{}-service.{}", ns, ns)
    }

    pub fn server_pvc_name(&self) -> String {
        format!("varlibrancherk3s-{}-server-0", self.k3k_namespace())
    }

    pub fn kubeconfig_secret_name(&self) -> String {
        crate::virtual_client::kubeconfig_secret_name(self.k3k_name())
    }

    pub fn storage_class(&self) -> &str {
        self.quota.as_ref().map(|q| q.storage_class.as_str()).unwrap_or_default()
    }

    pub fn storage_request_bytes(&self) -> i64 {
        self.quota.as_ref().map(|q| q.hard.storage_bytes).unwrap_or(DEFAULT_STORAGE_BYTES)
    }

    /// Server volume size: the whole storage ceiling for virtual clusters,
    /// a fixed 5Gi for shared ones.
    pub fn sys_storage_bytes(&self) -> i64 {
        if self.is_virtual() {
            self.storage_request_bytes()
        } else {
            DEFAULT_STORAGE_BYTES
        }
    }

    pub fn data_storage_bytes(&self) -> i64 {
        let total = self.storage_request_bytes();
        if total > DEFAULT_STORAGE_BYTES {
            total - DEFAULT_STORAGE_BYTES
        } else {
            DEFAULT_STORAGE_BYTES
        }
    }

    pub fn sys_storage_size(&self) -> String {
        quantity::format_bytes(self.sys_storage_bytes())
    }

    pub fn data_storage_size(&self) -> String {
        quantity::format_bytes(self.data_storage_bytes())
    }

    pub fn role(&self) -> &str {
        if let Some(role) = &self.role {
            return role;
        }
        match self.user_mode {
            Some(UserMode::Founder) => USER_MODE_FOUNDER,
            _ => USER_MODE_NORMAL,
        }
    }

    pub fn lock_version(&self) -> &str {
        self.lock_version.as_deref().unwrap_or(DEFAULT_VERSION)
    }

    pub fn policy_version(&self) -> &str {
        self.policy_version.as_deref().unwrap_or(DEFAULT_VERSION)
    }

    /// Audience list baked into the tenant's tokens; a change in any entry
    /// invalidates issued tokens.
    pub fn token_aud(&self) -> Vec<String> {
        let mut aud = vec![self.name.clone(), self.role().to_string(), self.console_id.clone()];
        if self.is_cluster_user() {
            aud.extend([
                self.k3k_name().to_string(),
                self.k3k_namespace(),
                self.api_server_host(),
                self.cluster_mode().to_string(),
                self.policy().to_string(),
                self.lock_version().to_string(),
                self.policy_version().to_string(),
            ]);
        }
        aud.extend([
            "https://kubernetes.default.svc.cluster.local".to_string(),
            "k3s".to_string(),
        ]);
        aud
    }

    pub fn quota(&self) -> Option<&LimitRangeQuota> {
        self.quota.as_ref()
    }

    pub fn cost(&self) -> Option<&Cost> {
        self.cost.as_ref()
    }

    pub fn is_quota_locked(&self) -> bool {
        self.quota_locked
    }

    pub fn is_paused(&self) -> bool {
        self.paused == Some(true)
    }

    pub fn pause(&mut self) {
        self.paused = Some(true);
    }

    pub fn unpause(&mut self) {
        self.paused = Some(false);
    }

    /// Records a submitted provisioning Job.
    pub fn running(&mut self, job_name: &str) {
        self.job = JobState { name: job_name.to_string(), status: JobStatus::Running };
        self.cluster_status = ClusterStatus::Creating;
    }

    /// Resets a recycled tenant so it can buy and provision again.
    pub fn renew(&mut self) {
        self.job = JobState::default();
        self.clear_pending_recycle_time();
        self.time.expire_time = None;
        self.orders.base.clear();
        self.cluster_status = ClusterStatus::New;
    }

    pub fn set_login_time(&mut self, now: DateTime<Utc>) {
        self.login_time = Some(now);
    }

    /// Replaces the quota with a policy template unless the cluster is
    /// already up or a paid order pinned the quota. Returns whether it did.
    pub fn inherit_quota(&mut self, template: &str) -> std::result::Result<bool, limit_range_quota::QuotaParseError> {
        if self.is_cluster_ready() || self.cluster_status == ClusterStatus::Ready || self.quota_locked {
            return Ok(false);
        }
        self.quota = Some(LimitRangeQuota::parse(template)?);
        self.quota_dirty = true;
        Ok(true)
    }

    pub fn inherit_cost(&mut self, cost: Cost) {
        self.cost = Some(cost);
        self.cost_dirty = true;
    }

    /// Why a cluster cannot be provisioned right now, if anything.
    pub fn init_cluster_error(&self, now: DateTime<Utc>) -> std::result::Result<(), PreconditionError> {
        if !self.is_cluster_user() {
            return Err(PreconditionError::NotClusterTenant);
        }
        if self.need_create_order() {
            return Err(PreconditionError::BaseOrderRequired);
        }
        if self.is_expired(now) {
            return Err(PreconditionError::Expired);
        }
        if self.storage_class().is_empty() {
            return Err(PreconditionError::NoStorageClass);
        }
        if self.namespace.is_empty() {
            return Err(PreconditionError::NoNamespace);
        }
        if self.need_over_selling_check() {
            return Err(PreconditionError::ResourceNotEnough);
        }
        Ok(())
    }

    pub fn has_return_lock(&self) -> bool {
        self.return_lock.is_some()
    }

    pub fn return_lock(&self) -> Result<Option<ReturnOrderLock>> {
        self.return_lock
            .as_deref()
            .map(ReturnOrderLock::parse)
            .transpose()
            .map_err(Error::InvalidReturnLock)
    }

    /// First phase of a refund: snapshot the state to roll back to.
    pub fn lock_return_order(&mut self, order: &crate::order::billing::BillingOrder, now: DateTime<Utc>) -> Result<()> {
        let hard = match &self.quota {
            Some(quota) => quota.hard_buy_resource(),
            None => return Ok(()),
        };
        let lock = ReturnOrderLock::for_order(order, hard, self.expire_time(), now);
        self.return_lock = Some(lock.to_json().map_err(|e| Error::SerializeFailed("return order lock", e))?);
        Ok(())
    }

    /// Second phase of a refund: apply the snapshot and drop the lock.
    /// Pending grants are folded first so they cannot resurface later.
    pub fn apply_return_order(&mut self) -> Result<bool> {
        let lock = match self.return_lock()? {
            Some(lock) => lock,
            None => return Ok(false),
        };
        self.set_over_mode(true);
        self.hard_quota_mut().reset_hard(&lock.resource());
        if let Some(t) = lock.expire_time() {
            self.time.expire_time = Some(t);
        }
        self.return_lock = None;
        Ok(true)
    }
}

impl TimeBound for TenantRecord {
    fn time_state(&self) -> &TimeState {
        &self.time
    }

    fn time_state_mut(&mut self) -> &mut TimeState {
        &mut self.time
    }
}

impl Overselling for TenantRecord {
    fn overselling_state(&self) -> &OversellingState {
        &self.overselling
    }

    fn overselling_state_mut(&mut self) -> &mut OversellingState {
        &mut self.overselling
    }

    fn is_expand(&self) -> bool {
        self.orders.expand.is_paid()
    }

    fn hard_quota_mut(&mut self) -> &mut LimitRangeQuota {
        self.quota_dirty = true;
        self.quota.get_or_insert_with(LimitRangeQuota::default)
    }
}

impl Orderable for TenantRecord {
    fn order_state(&self) -> &OrderState {
        &self.orders
    }

    fn order_state_mut(&mut self) -> &mut OrderState {
        &mut self.orders
    }

    fn has_cost(&self) -> bool {
        self.cost.is_some()
    }

    fn lock_quota(&mut self) {
        self.quota_locked = true;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::order::billing::BillingOrder;
    use crate::resource::{BuyResource, Resource};
    use chrono::{Duration, TimeZone};
    use kube::api::ObjectMeta;

    pub(crate) fn tenant_sa(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(TENANT_NAMESPACE.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                annotations: Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) const QUOTA: &str =
        r#"{"storageclass":"disk1","hard":{"cpu":2,"memory":4,"requests.storage":10,"bandwidth":100},"unit":"month","quantity":1}"#;
    pub(crate) const COST_JSON: &str = r#"{"cpu":10,"memory":5,"storage":1,"bandwidth":0.1,"packageConfig":[]}"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn paid(mode: &str, sn: &str, hour: &str, rs: BuyResource) -> BillingOrder {
        BillingOrder {
            order_sn: sn.into(),
            order_status: "paid".into(),
            buy_mode: mode.into(),
            hour: hour.into(),
            cpu: rs.cpu,
            memory: rs.memory,
            storage: rs.storage,
            bandwidth: rs.bandwidth,
            ..Default::default()
        }
    }

    fn cluster_tenant(extra_labels: &[(&str, &str)]) -> TenantRecord {
        let mut labels = vec![(USER_MODE, USER_MODE_CLUSTER)];
        labels.extend_from_slice(extra_labels);
        TenantRecord::from_service_account(&tenant_sa(
            "alice",
            &labels,
            &[(QUOTA_LIMIT, QUOTA), (COST, COST_JSON), (CLUSTER_MODE, CLUSTER_MODE_VIRTUAL)],
        ))
    }

    #[test]
    fn derived_names_follow_the_tenant() {
        let t = cluster_tenant(&[]);
        assert_eq!(t.k3k_name(), "alice");
        assert_eq!(t.k3k_namespace(), "k3k-alice");
        assert_eq!(t.agent_name(), "w7panel-k3k-agent-alice");
        assert_eq!(t.virtual_ingress_service_name(), "k3k-alice-service-w7");
        assert_eq!(t.api_server_host(), "k3k-alice-service.k3k-alice");
        assert_eq!(t.server_pvc_name(), "varlibrancherk3s-k3k-alice-server-0");
        assert_eq!(t.role(), "normal");
        assert_eq!(t.cluster_status, ClusterStatus::New);
    }

    #[test]
    fn storage_sizes_split_off_five_gi() {
        let t = cluster_tenant(&[]);
        assert_eq!(t.sys_storage_size(), "10Gi");
        assert_eq!(t.data_storage_size(), "5Gi");
        let shared = TenantRecord::from_service_account(&tenant_sa(
            "bob",
            &[],
            &[(QUOTA_LIMIT, r#"{"hard":{"requests.storage":"20Gi"}}"#), (CLUSTER_MODE, CLUSTER_MODE_SHARED)],
        ));
        assert_eq!(shared.sys_storage_size(), "5Gi");
        assert_eq!(shared.data_storage_size(), "15Gi");
    }

    #[test]
    fn apply_preserves_foreign_keys() {
        let mut sa = tenant_sa("alice", &[(USER_MODE, "cluster"), ("team", "blue")], &[("password", "x"), (QUOTA_LIMIT, QUOTA)]);
        let mut t = TenantRecord::from_service_account(&sa);
        t.running("k3k-create-abc");
        t.apply_to(&mut sa);
        let labels = sa.metadata.labels.as_ref().unwrap();
        let annotations = sa.metadata.annotations.as_ref().unwrap();
        assert_eq!(labels["team"], "blue");
        assert_eq!(labels[CLUSTER_STATUS], "creating");
        assert_eq!(annotations["password"], "x");
        assert_eq!(annotations[QUOTA_LIMIT], QUOTA);
        assert_eq!(annotations[JOB_STATUS], "running");
        assert!(!annotations.contains_key(QUOTA_LIMIT_NAME));
    }

    #[test]
    fn base_payment_is_applied_once() {
        let mut t = cluster_tenant(&[]);
        t.set_order(order_state::BuyMode::Base, "B1");
        assert!(t.need_create_order());
        let order = paid("base", "B1", "720.00", BuyResource::new(4, 8, 20, 100));
        assert!(t.set_order_status(&order, now()));
        let expiry = t.expire_time();
        assert_eq!(expiry, Some(now() + Duration::hours(720)));
        assert!(t.is_over_selling_wait());
        assert!(t.is_quota_locked());
        assert!(!t.need_create_order());
        assert!(!t.set_order_status(&order, now() + Duration::hours(1)));
        assert_eq!(t.expire_time(), expiry);
        assert_eq!(t.can_create_base_order_error(), Err(PreconditionError::AlreadyPaid));
    }

    #[test]
    fn unpaid_or_foreign_orders_are_ignored() {
        let mut t = cluster_tenant(&[]);
        t.set_order(order_state::BuyMode::Renew, "R1");
        let mut order = paid("renew", "R1", "24", BuyResource::default());
        order.order_status = "wait".into();
        assert!(!t.set_order_status(&order, now()));
        let other = paid("renew", "R2", "24", BuyResource::default());
        assert!(!t.set_order_status(&other, now()));
        assert_eq!(t.expire_time(), None);
    }

    #[test]
    fn base_grant_folds_into_hard_quota() {
        let mut t = cluster_tenant(&[]);
        t.set_order(order_state::BuyMode::Base, "B1");
        t.set_order_status(&paid("base", "B1", "720", BuyResource::new(4, 8, 20, 100)), now());
        assert!(t.need_over_selling_check());
        assert_eq!(t.over_resource(), BuyResource::new(4, 8, 20, 100).to_resource());
        t.set_over_mode(true);
        assert!(t.is_over_selling_success());
        assert_eq!(t.quota().unwrap().hard_buy_resource(), BuyResource::new(4, 8, 20, 100));

        let mut sa = tenant_sa("alice", &[], &[(QUOTA_LIMIT, QUOTA), (QUOTA_LIMIT_NAME, "tpl")]);
        t.apply_to(&mut sa);
        let annotations = sa.metadata.annotations.unwrap();
        assert_eq!(annotations[QUOTA_LIMIT_NAME], "");
        assert_eq!(annotations[QUOTA_LIMIT_LOCK], "true");
        assert_eq!(sa.metadata.labels.unwrap()[OVER_MODE], "success");
    }

    #[test]
    fn expand_grant_is_added_exactly_once() {
        let mut t = cluster_tenant(&[(OVER_MODE, "success")]);
        t.time.expire_time = Some(now() + Duration::hours(100));
        assert_eq!(t.can_expand_error(now()), Ok(()));
        t.set_order(order_state::BuyMode::Expand, "E1");
        t.set_order_status(&paid("expand", "E1", "100", BuyResource::new(1, 1, 0, 0)), now());
        assert!(t.is_expand());
        assert!(!t.need_over_selling_check());
        assert!(t.can_over_selling_check());
        t.set_over_mode(true);
        t.set_over_mode(true);
        assert_eq!(t.quota().unwrap().hard_buy_resource(), BuyResource::new(3, 5, 10, 100));
        assert_eq!(t.overselling.over_resource, None);
    }

    #[test]
    fn failed_admission_marks_no_resource() {
        let mut t = cluster_tenant(&[(OVER_MODE, "wait")]);
        t.set_over_mode(false);
        assert!(t.is_over_selling_no_resource());
        assert!(t.need_over_selling_check());
        assert_eq!(t.init_cluster_error(now()), Err(PreconditionError::BaseOrderRequired));
    }

    #[test]
    fn purchase_preconditions() {
        let no_cost = TenantRecord::from_service_account(&tenant_sa("c", &[(USER_MODE, "cluster")], &[]));
        assert_eq!(no_cost.can_renew_error(), Err(PreconditionError::NoCost));
        assert_eq!(no_cost.can_create_base_order_error(), Err(PreconditionError::NoCost));
        assert!(!no_cost.need_create_order());

        let t = cluster_tenant(&[]);
        assert_eq!(t.can_renew_error(), Err(PreconditionError::NotPurchased));
        assert!(!t.need_renew(now()));
        assert_eq!(t.can_expand_error(now()), Err(PreconditionError::OversellingPending));

        let lapsed = {
            let mut t = cluster_tenant(&[(OVER_MODE, "success")]);
            t.time.expire_time = Some(now() - Duration::hours(1));
            t
        };
        assert_eq!(lapsed.can_expand_error(now()), Err(PreconditionError::Expired));

        let pass = cluster_tenant(&[(BASE_ORDER_PASS, "true")]);
        assert!(!pass.need_create_order());
        let forced = cluster_tenant(&[(BASE_ORDER_PASS, "false"), (BASE_ORDER_STATUS, "paid")]);
        assert!(forced.need_create_order());
        assert_eq!(forced.can_create_base_order_error(), Ok(()));
    }

    #[test]
    fn return_lock_rolls_back_and_clears() {
        let mut t = cluster_tenant(&[(OVER_MODE, "success")]);
        t.time.expire_time = Some(now() + Duration::hours(500));
        t.lock_return_order(&paid("expand", "E1", "0", BuyResource::new(1, 2, 0, 0)), now()).unwrap();
        assert!(t.has_return_lock());
        assert!(t.apply_return_order().unwrap());
        assert_eq!(t.quota().unwrap().hard_buy_resource(), BuyResource::new(1, 2, 10, 100));
        assert_eq!(t.expire_time(), Some(now() + Duration::hours(500)));
        assert!(!t.has_return_lock());
        assert!(!t.apply_return_order().unwrap());
    }

    #[test]
    fn invalid_return_lock_surfaces() {
        let t = TenantRecord::from_service_account(&tenant_sa("a", &[], &[(RETURN_ORDER_INFO, "{oops")]));
        assert!(matches!(t.return_lock(), Err(Error::InvalidReturnLock(_))));
    }

    #[test]
    fn renew_resets_for_a_new_purchase() {
        let mut t = cluster_tenant(&[(BASE_ORDER_SN, "B1"), (BASE_ORDER_STATUS, "paid"), (CLUSTER_STATUS, "recycle")]);
        t.time.expire_time = Some(now());
        t.set_pending_recycle_time(now());
        t.renew();
        assert_eq!(t.cluster_status, ClusterStatus::New);
        assert_eq!(t.job.status, JobStatus::Unknown);
        assert!(t.expire_time().is_none());
        assert!(t.time.pending_recycle_time.is_none());
        assert!(t.need_create_order());

        let mut sa = tenant_sa("alice", &[(BASE_ORDER_SN, "B1"), (BASE_ORDER_STATUS, "paid")], &[(EXPIRE_TIME, "2024-06-01 00:00:00")]);
        t.apply_to(&mut sa);
        assert!(!sa.metadata.labels.as_ref().unwrap().contains_key(BASE_ORDER_SN));
        assert!(!sa.metadata.annotations.as_ref().unwrap().contains_key(EXPIRE_TIME));
    }

    #[test]
    fn inherit_quota_respects_lock() {
        let mut t = cluster_tenant(&[]);
        assert!(t.inherit_quota(r#"{"hard":{"cpu":8}}"#).unwrap());
        assert_eq!(t.quota().unwrap().hard.cpu_millis, 8000);
        t.lock_quota();
        assert!(!t.inherit_quota(r#"{"hard":{"cpu":16}}"#).unwrap());
        assert_eq!(t.quota().unwrap().hard, Resource { cpu_millis: 8000, ..Default::default() });
    }

    #[test]
    fn token_audience_carries_version_markers() {
        let t = TenantRecord::from_service_account(&tenant_sa(
            "alice",
            &[(USER_MODE, "cluster"), (CONSOLE_ID, "42")],
            &[(LOCK_VERSION, "3"), (CLUSTER_POLICY, "gold")],
        ));
        let aud = t.token_aud();
        assert_eq!(aud[2], "42");
        assert!(aud.contains(&"3".to_string()));
        assert!(aud.contains(&"gold".to_string()));
        assert_eq!(aud.last().map(String::as_str), Some("k3s"));
    }
}
