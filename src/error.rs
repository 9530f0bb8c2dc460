use thiserror::Error;

/// Failures surfaced to whoever asked for an order, a grant or a
/// registration. These are never retried automatically.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("no cost package configured for this tenant, cannot purchase")]
    NoCost,
    #[error("no resource quota configured for this tenant, cannot price orders")]
    NoQuota,
    #[error("base resources already purchased, cannot purchase again")]
    AlreadyPaid,
    #[error("base resources not purchased yet, nothing to renew")]
    NotPurchased,
    #[error("base resources not purchased yet, cannot expand")]
    ExpandWithoutPurchase,
    #[error("base resources expired, cannot expand")]
    Expired,
    #[error("overselling check has not passed, cannot expand")]
    OversellingPending,
    #[error("purchase duration must not be empty")]
    EmptyDuration,
    #[error("requested resources are below the current minimum")]
    BelowMinimum,
    #[error("requested resources are below the current purchase")]
    BelowCurrent,
    #[error("at least one resource must be purchased")]
    NothingToBuy,
    #[error("requested resources are invalid")]
    InvalidResource,
    #[error("resource not enough")]
    ResourceNotEnough,
    #[error("failed to lock coupon code")]
    CouponLock,
    #[error("failed to consume coupon code")]
    CouponConsume,
    #[error("registration is not allowed for this policy")]
    RegisterNotAllowed,
    #[error("policy {0} not found")]
    PolicyNotFound(String),
    #[error("tenant {0} already exists")]
    TenantExists(String),
    #[error("tenant is not a cluster tenant")]
    NotClusterTenant,
    #[error("storage class is not configured")]
    NoStorageClass,
    #[error("tenant namespace is not configured")]
    NoNamespace,
    #[error("base order must be paid first")]
    BaseOrderRequired,
    #[error("{0}")]
    Billing(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get ServiceAccount: {0}")]
    GetTenantFailed(#[source] kube::Error),
    #[error("Failed to update ServiceAccount: {0}")]
    UpdateTenantFailed(#[source] kube::Error),
    #[error("Failed to list objects: {0}")]
    ListFailed(#[source] kube::Error),
    #[error("ServiceAccount {0} changed concurrently")]
    Conflict(String),
    #[error("ServiceAccount {0} not found")]
    TenantNotFound(String),
    #[error("Failed to reconcile Namespace: {0}")]
    ReconcileNamespaceFailed(#[source] kube::Error),
    #[error("Failed to reconcile Role: {0}")]
    ReconcileRoleFailed(#[source] kube::Error),
    #[error("Failed to reconcile RoleBinding: {0}")]
    ReconcileRoleBindingFailed(#[source] kube::Error),
    #[error("Failed to reconcile ClusterRole: {0}")]
    ReconcileClusterRoleFailed(#[source] kube::Error),
    #[error("Failed to reconcile ClusterRoleBinding: {0}")]
    ReconcileClusterRoleBindingFailed(#[source] kube::Error),
    #[error("Failed to reconcile LimitRange: {0}")]
    ReconcileLimitRangeFailed(#[source] kube::Error),
    #[error("Failed to reconcile ResourceQuota: {0}")]
    ReconcileResourceQuotaFailed(#[source] kube::Error),
    #[error("Failed to reconcile PersistentVolumeClaim: {0}")]
    ReconcilePvcFailed(#[source] kube::Error),
    #[error("Failed to reconcile Service: {0}")]
    ReconcileServiceFailed(#[source] kube::Error),
    #[error("Failed to reconcile DaemonSet: {0}")]
    ReconcileDaemonSetFailed(#[source] kube::Error),
    #[error("Failed to create Job: {0}")]
    CreateJobFailed(#[source] kube::Error),
    #[error("Failed to delete {0}: {1}")]
    DeleteFailed(&'static str, #[source] kube::Error),
    #[error("Failed to read cluster capacity: {0}")]
    CapacityFailed(#[source] kube::Error),
    #[error("Failed to build virtual cluster client: {0}")]
    VirtualClient(#[from] crate::virtual_client::VirtualClientError),
    #[error("Billing request failed: {0}")]
    Billing(#[from] crate::order::billing::BillingError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("Sync failed: {0}")]
    Sync(#[from] crate::sync::SyncError),
    #[error("Failed to read {0}: {1}")]
    GetFailed(&'static str, #[source] kube::Error),
    #[error("Invalid cost configuration: {0}")]
    InvalidCost(#[source] serde_json::Error),
    #[error("Invalid quota: {0}")]
    InvalidQuota(#[from] crate::tenant::limit_range_quota::QuotaParseError),
    #[error("Invalid return order lock: {0}")]
    InvalidReturnLock(#[source] serde_json::Error),
    #[error("Failed to serialize {0}: {1}")]
    SerializeFailed(&'static str, #[source] serde_json::Error),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Reconcile panicked: {0}")]
    ReconcilePanicked(String),
}

impl Error {
    /// Precondition failures are user errors, everything else is transient.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// True when the API server answered with the given reason.
pub fn has_reason(e: &kube::Error, reason: &str) -> bool {
    matches!(e, kube_client::Error::Api(kube_core::ErrorResponse { reason: r, .. }) if r == reason)
}

pub fn is_not_found(e: &kube::Error) -> bool {
    has_reason(e, "NotFound")
}

pub fn is_already_exists(e: &kube::Error) -> bool {
    has_reason(e, "AlreadyExists")
}

pub fn is_conflict(e: &kube::Error) -> bool {
    has_reason(e, "Conflict")
}
