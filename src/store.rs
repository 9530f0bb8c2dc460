//! Optimistic read-modify-write access to tenant ServiceAccounts.

use crate::error::{is_already_exists, is_conflict, is_not_found, Error, PreconditionError, Result};
use crate::labels::*;
use crate::tenant::TenantRecord;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::*;

const UPDATE_ATTEMPTS: usize = 5;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ServiceAccount>>;
    /// Creates a tenant; an existing one is a `TenantExists` precondition.
    async fn create(&self, sa: &ServiceAccount) -> Result<ServiceAccount>;
    /// Writes `sa` guarded by its resource version; a stale version is
    /// `Error::Conflict`.
    async fn replace(&self, sa: &ServiceAccount) -> Result<ServiceAccount>;
    async fn list(&self, label_selector: &str) -> Result<Vec<ServiceAccount>>;
}

pub struct KubeTenantStore {
    api: Api<ServiceAccount>,
}

impl KubeTenantStore {
    pub fn new(client: Client) -> Self {
        KubeTenantStore {
            api: Api::namespaced(client, TENANT_NAMESPACE),
        }
    }
}

#[async_trait]
impl TenantStore for KubeTenantStore {
    async fn get(&self, name: &str) -> Result<Option<ServiceAccount>> {
        self.api.get_opt(name).await.map_err(Error::GetTenantFailed)
    }

    async fn create(&self, sa: &ServiceAccount) -> Result<ServiceAccount> {
        let name = sa.metadata.name.clone().unwrap_or_default();
        match self.api.create(&PostParams::default(), sa).await {
            Ok(created) => {
                info!("Create ServiceAccount: {}", name);
                Ok(created)
            }
            Err(e) if is_already_exists(&e) => Err(PreconditionError::TenantExists(name).into()),
            Err(e) => Err(Error::UpdateTenantFailed(e)),
        }
    }

    async fn replace(&self, sa: &ServiceAccount) -> Result<ServiceAccount> {
        let name = sa.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        match self.api.replace(&name, &PostParams::default(), sa).await {
            Ok(updated) => Ok(updated),
            Err(e) if is_conflict(&e) => Err(Error::Conflict(name)),
            Err(e) if is_not_found(&e) => Err(Error::TenantNotFound(name)),
            Err(e) => Err(Error::UpdateTenantFailed(e)),
        }
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<ServiceAccount>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api.list(&lp).await.map_err(Error::ListFailed)?.items)
    }
}

pub async fn load_tenant<S: TenantStore + ?Sized>(store: &S, name: &str) -> Result<TenantRecord> {
    match store.get(name).await? {
        Some(sa) => Ok(TenantRecord::from_service_account(&sa)),
        None => Err(Error::TenantNotFound(name.to_string())),
    }
}

/// Fetches the tenant, applies `mutate` and writes it back, replaying the
/// mutation on a fresh copy whenever the write loses a race. `mutate` must
/// therefore be safe to run more than once.
pub async fn update_tenant<S, F>(store: &S, name: &str, mut mutate: F) -> Result<TenantRecord>
where
    S: TenantStore + ?Sized,
    F: FnMut(&mut TenantRecord) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut sa = store
            .get(name)
            .await?
            .ok_or_else(|| Error::TenantNotFound(name.to_string()))?;
        let mut tenant = TenantRecord::from_service_account(&sa);
        mutate(&mut tenant)?;
        tenant.apply_to(&mut sa);
        match store.replace(&sa).await {
            Ok(_) => return Ok(tenant),
            Err(Error::Conflict(_)) if attempt < UPDATE_ATTEMPTS => {
                debug!(tenant = %name, attempt, "tenant changed concurrently, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
