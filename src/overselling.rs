//! Cluster-wide admission of resource grants against oversold capacity.

use crate::error::{Error, PreconditionError, Result};
use crate::labels::*;
use crate::quantity;
use crate::resource::Resource;
use crate::store::{load_tenant, update_tenant, TenantStore};
use crate::tenant::over_mode::Overselling;
use crate::tenant::TenantRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Node, ServiceAccount};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::*;

pub const CONFIG_NAMESPACE: &str = "kube-system";
pub const CONFIG_NAME: &str = "k3k.overselling.config";
const LONGHORN_NAMESPACE: &str = "longhorn-system";

/// Oversell percentages per dimension plus the flat bandwidth pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OversellingConfig {
    pub cpu: i64,
    pub memory: i64,
    pub storage: i64,
    pub bandwidth: i64,
    /// Absolute bandwidth in megabits the percentage applies to.
    pub bandwidth_num: i64,
}

impl Default for OversellingConfig {
    fn default() -> Self {
        OversellingConfig {
            cpu: 100,
            memory: 100,
            storage: 100,
            bandwidth: 1000,
            bandwidth_num: 100,
        }
    }
}

impl OversellingConfig {
    /// Any missing or malformed key falls back to the whole default config.
    pub fn from_config_map_data(data: &BTreeMap<String, String>) -> OversellingConfig {
        let read = |key: &str| data.get(key).and_then(|v| v.trim().parse::<i64>().ok());
        match (read("cpu"), read("memory"), read("storage"), read("bandwidth"), read("bandwidthNum")) {
            (Some(cpu), Some(memory), Some(storage), Some(bandwidth), Some(bandwidth_num)) => OversellingConfig {
                cpu,
                memory,
                storage,
                bandwidth,
                bandwidth_num,
            },
            _ => {
                warn!("invalid overselling config, using defaults");
                OversellingConfig::default()
            }
        }
    }

    /// Scales raw capacity by the configured percentages. A percentage of
    /// zero or less leaves the dimension unscaled.
    pub fn apply(&self, capacity: &Resource) -> Resource {
        let scale = |v: i64, pct: i64| if pct > 0 { (v as i128 * pct as i128 / 100) as i64 } else { v };
        Resource {
            cpu_millis: scale(capacity.cpu_millis, self.cpu),
            memory_bytes: scale(capacity.memory_bytes, self.memory),
            storage_bytes: scale(capacity.storage_bytes, self.storage),
            bandwidth: self.bandwidth_num * self.bandwidth / 100,
        }
    }
}

/// Read side of the host cluster the ledger needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// Summed node allocatable cpu and memory.
    async fn allocatable(&self) -> Result<Resource>;
    /// Summed `(maximum, scheduled)` bytes over all storage backend disks.
    async fn storage(&self) -> Result<(i64, i64)>;
    async fn overselling_config(&self) -> OversellingConfig;
    /// Cluster tenants whose cluster is up.
    async fn ready_tenants(&self) -> Result<Vec<TenantRecord>>;
}

pub struct KubeInventory {
    client: Client,
}

impl KubeInventory {
    pub fn new(client: Client) -> Self {
        KubeInventory { client }
    }
}

fn disk_sums(nodes: &[DynamicObject]) -> (i64, i64) {
    let mut maximum = 0;
    let mut scheduled = 0;
    for node in nodes {
        let disks = node.data.pointer("/status/diskStatus").and_then(Value::as_object);
        for disk in disks.into_iter().flat_map(|d| d.values()) {
            maximum += disk.get("storageMaximum").and_then(Value::as_i64).unwrap_or(0);
            scheduled += disk.get("storageScheduled").and_then(Value::as_i64).unwrap_or(0);
        }
    }
    (maximum, scheduled)
}

#[async_trait]
impl ClusterInventory for KubeInventory {
    async fn allocatable(&self) -> Result<Resource> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(Error::CapacityFailed)?;
        let mut total = Resource::default();
        for node in nodes.items {
            let allocatable = node.status.and_then(|s| s.allocatable).unwrap_or_default();
            let read = |key: &str| allocatable.get(key).map(|q| q.0.clone()).unwrap_or_default();
            total.cpu_millis += quantity::parse_cpu_millis(&read("cpu")).unwrap_or(0);
            total.memory_bytes += quantity::parse_value(&read("memory")).unwrap_or(0);
        }
        Ok(total)
    }

    async fn storage(&self) -> Result<(i64, i64)> {
        let gvk = GroupVersionKind::gvk("longhorn.io", "v1beta2", "Node");
        let api_resource = ApiResource::from_gvk(&gvk);
        let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), LONGHORN_NAMESPACE, &api_resource);
        let nodes = api.list(&ListParams::default()).await.map_err(Error::CapacityFailed)?;
        Ok(disk_sums(&nodes.items))
    }

    async fn overselling_config(&self) -> OversellingConfig {
        let api = Api::<ConfigMap>::namespaced(self.client.clone(), CONFIG_NAMESPACE);
        match api.get_opt(CONFIG_NAME).await {
            Ok(Some(cm)) => OversellingConfig::from_config_map_data(&cm.data.unwrap_or_default()),
            Ok(None) => OversellingConfig::default(),
            Err(e) => {
                warn!("Failed to read overselling config: {}", e);
                OversellingConfig::default()
            }
        }
    }

    async fn ready_tenants(&self) -> Result<Vec<TenantRecord>> {
        let selector = format!(
            "{}={},{}={}",
            USER_MODE,
            USER_MODE_CLUSTER,
            CLUSTER_STATUS,
            crate::tenant::ClusterStatus::Ready.as_str()
        );
        let sas = Api::<ServiceAccount>::namespaced(self.client.clone(), TENANT_NAMESPACE)
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::ListFailed)?;
        Ok(sas.items.iter().map(TenantRecord::from_service_account).collect())
    }
}

/// What a ready tenant holds against capacity: its hard quota.
pub fn hard_quota_usage(tenant: &TenantRecord) -> Resource {
    tenant.quota().map(|q| q.hard).unwrap_or_default()
}

/// Recomputed on every call; nothing is cached between checks.
pub struct OversellingLedger<I> {
    inventory: I,
}

impl<I: ClusterInventory> OversellingLedger<I> {
    pub fn new(inventory: I) -> Self {
        OversellingLedger { inventory }
    }

    /// Capacity after applying the oversell percentages.
    pub async fn overselling(&self) -> Result<Resource> {
        let mut capacity = self.inventory.allocatable().await?;
        let (maximum, _) = self.inventory.storage().await?;
        capacity.storage_bytes = maximum;
        let config = self.inventory.overselling_config().await;
        Ok(config.apply(&capacity))
    }

    /// Summed usage of every ready cluster tenant. Storage comes from what
    /// the storage backend has actually scheduled.
    pub async fn used<F>(&self, usage: F) -> Result<Resource>
    where
        F: Fn(&TenantRecord) -> Resource + Send + Sync,
    {
        let mut used = Resource::default();
        for tenant in self.inventory.ready_tenants().await? {
            let r = usage(&tenant);
            used.cpu_millis += r.cpu_millis;
            used.memory_bytes += r.memory_bytes;
        }
        let (_, scheduled) = self.inventory.storage().await?;
        used.storage_bytes = scheduled;
        Ok(used)
    }

    /// Admits `delta` only if oversold capacity stays strictly above usage
    /// plus `delta` on cpu, memory and storage.
    pub async fn can_grant<F>(&self, delta: &Resource, usage: F) -> Result<()>
    where
        F: Fn(&TenantRecord) -> Resource + Send + Sync,
    {
        let capacity = self.overselling().await?;
        let wanted = self.used(usage).await?.add(delta);
        if capacity.exceeds(&wanted) {
            debug!("overselling admitted: capacity {} wanted {}", capacity, wanted);
            Ok(())
        } else {
            info!("overselling denied: capacity {} wanted {}", capacity, wanted);
            Err(PreconditionError::ResourceNotEnough.into())
        }
    }
}

/// Login-time admission of a tenant's pending grant. When a check is due
/// and capacity allows it, the grant is folded into the hard quota and the
/// login stamped; otherwise the tenant is marked `no-resource`.
pub async fn admit_pending_grant<I, S>(
    ledger: &OversellingLedger<I>,
    store: &S,
    name: &str,
    now: DateTime<Utc>,
) -> Result<TenantRecord>
where
    I: ClusterInventory,
    S: TenantStore + ?Sized,
{
    let tenant = load_tenant(store, name).await?;
    if !tenant.can_over_selling_check() {
        return Ok(tenant);
    }
    let grant = tenant.over_resource();
    match ledger.can_grant(&grant, hard_quota_usage).await {
        Ok(()) => {
            info!(tenant = %name, "admitted pending grant {}", grant);
            update_tenant(store, name, |t| {
                t.set_login_time(now);
                t.set_over_mode(true);
                Ok(())
            })
            .await
        }
        Err(e) if e.is_precondition() => {
            warn!(tenant = %name, "pending grant {} does not fit", grant);
            update_tenant(store, name, |t| {
                if t.can_over_selling_check() {
                    t.set_over_mode(false);
                }
                Ok(())
            })
            .await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::GI;
    use crate::store::tests::MemoryStore;
    use crate::tenant::over_mode::OverMode;
    use crate::tenant::tests::tenant_sa;
    use chrono::TimeZone;

    fn inventory(cpu_cores: i64, config: OversellingConfig, tenants: Vec<TenantRecord>) -> MockClusterInventory {
        let mut inv = MockClusterInventory::new();
        inv.expect_allocatable().returning(move || {
            Ok(Resource {
                cpu_millis: cpu_cores * 1000,
                memory_bytes: 100 * GI,
                ..Default::default()
            })
        });
        inv.expect_storage().returning(|| Ok((100 * GI, 10 * GI)));
        inv.expect_overselling_config().returning(move || config.clone());
        inv.expect_ready_tenants().returning(move || Ok(tenants.clone()));
        inv
    }

    fn ready_tenant(name: &str, cpu: i64) -> TenantRecord {
        let quota = format!(r#"{{"hard":{{"cpu":{},"memory":1,"requests.storage":1}}}}"#, cpu);
        TenantRecord::from_service_account(&tenant_sa(
            name,
            &[(USER_MODE, USER_MODE_CLUSTER), (CLUSTER_STATUS, "ready")],
            &[(QUOTA_LIMIT, &quota)],
        ))
    }

    fn cpu(cores: i64) -> Resource {
        Resource { cpu_millis: cores * 1000, ..Default::default() }
    }

    #[test]
    fn config_falls_back_as_a_whole() {
        let data = BTreeMap::from([
            ("cpu".to_string(), "150".to_string()),
            ("memory".to_string(), "x".to_string()),
        ]);
        assert_eq!(OversellingConfig::from_config_map_data(&data), OversellingConfig::default());

        let data: BTreeMap<String, String> = [("cpu", "150"), ("memory", "200"), ("storage", "100"), ("bandwidth", "50"), ("bandwidthNum", "1000")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = OversellingConfig::from_config_map_data(&data);
        let scaled = config.apply(&Resource { cpu_millis: 10_000, memory_bytes: 10, storage_bytes: 7, bandwidth: 0 });
        assert_eq!(scaled.cpu_millis, 15_000);
        assert_eq!(scaled.memory_bytes, 20);
        assert_eq!(scaled.storage_bytes, 7);
        assert_eq!(scaled.bandwidth, 500);
    }

    #[test]
    fn sums_longhorn_disks() {
        let node = |max: i64, sched: i64| {
            let mut obj = DynamicObject::new("n", &ApiResource::from_gvk(&GroupVersionKind::gvk("longhorn.io", "v1beta2", "Node")));
            obj.data = serde_json::json!({"status": {"diskStatus": {
                "a": {"storageMaximum": max, "storageScheduled": sched},
                "b": {"storageMaximum": 1, "storageScheduled": 0},
            }}});
            obj
        };
        assert_eq!(disk_sums(&[node(10, 4), node(20, 6)]), (32, 10));
        assert_eq!(disk_sums(&[]), (0, 0));
    }

    #[tokio::test]
    async fn oversold_capacity_admits_within_bound() {
        let config = OversellingConfig { cpu: 150, ..Default::default() };
        let tenants = vec![ready_tenant("a", 100), ready_tenant("b", 40)];
        let ledger = OversellingLedger::new(inventory(100, config, tenants));
        assert_eq!(ledger.overselling().await.unwrap().cpu_millis, 150_000);
        assert_eq!(ledger.used(hard_quota_usage).await.unwrap().cpu_millis, 140_000);
        ledger.can_grant(&cpu(5), hard_quota_usage).await.unwrap();
    }

    #[tokio::test]
    async fn reaching_capacity_exactly_is_denied() {
        let config = OversellingConfig { cpu: 150, ..Default::default() };
        let ledger = OversellingLedger::new(inventory(100, config, vec![ready_tenant("a", 140)]));
        let err = ledger.can_grant(&cpu(10), hard_quota_usage).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(PreconditionError::ResourceNotEnough)));
    }

    #[tokio::test]
    async fn storage_counts_scheduled_not_quota() {
        let ledger = OversellingLedger::new(inventory(100, OversellingConfig::default(), vec![]));
        let storage = Resource { storage_bytes: 90 * GI, ..Default::default() };
        assert!(ledger.can_grant(&storage, hard_quota_usage).await.is_err());
        let storage = Resource { storage_bytes: 89 * GI, ..Default::default() };
        ledger.can_grant(&storage, hard_quota_usage).await.unwrap();
    }

    fn waiting_tenant() -> k8s_openapi::api::core::v1::ServiceAccount {
        tenant_sa(
            "carol",
            &[(USER_MODE, USER_MODE_CLUSTER), (OVER_MODE, "wait"), (BASE_ORDER_SN, "SN"), (BASE_ORDER_STATUS, "paid")],
            &[
                (QUOTA_LIMIT, r#"{"hard":{"cpu":1,"memory":1,"requests.storage":1}}"#),
                (OVER_BASE_RESOURCE, r#"{"cpu":"8","memory":"16Gi","storage":"20Gi","bandwidth":"10M"}"#),
            ],
        )
    }

    #[tokio::test]
    async fn admission_folds_the_base_grant() {
        let store = MemoryStore::with(vec![waiting_tenant()]);
        let ledger = OversellingLedger::new(inventory(100, OversellingConfig::default(), vec![]));
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let tenant = admit_pending_grant(&ledger, &store, "carol", now).await.unwrap();
        assert_eq!(tenant.overselling.mode, Some(OverMode::Success));
        let stored = store.tenant("carol");
        assert_eq!(stored.quota().unwrap().hard.cpu_millis, 8000);
        assert_eq!(stored.login_time, Some(now));
    }

    #[tokio::test]
    async fn admission_failure_marks_no_resource() {
        let store = MemoryStore::with(vec![waiting_tenant()]);
        let ledger = OversellingLedger::new(inventory(4, OversellingConfig::default(), vec![]));
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let err = admit_pending_grant(&ledger, &store, "carol", now).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(PreconditionError::ResourceNotEnough)));
        let stored = store.tenant("carol");
        assert_eq!(stored.overselling.mode, Some(OverMode::NoResource));
        assert_eq!(stored.quota().unwrap().hard.cpu_millis, 1000);
    }
}
