// Nightly clippy (0.1.64) considers Drop a side effect, see https://github.com/rust-lang/rust-clippy/issues/9608
#![allow(clippy::unnecessary_lazy_evaluations)]

pub mod common;
pub mod config;
pub mod controller;
pub mod crds;
pub mod error;
pub mod job_bridge;
pub mod labels;
pub mod order;
pub mod overselling;
pub mod policy;
pub mod quantity;
pub mod quota;
pub mod resource;
pub mod store;
pub mod sync;
pub mod tenant;
pub mod version_cache;
pub mod virtual_client;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self as kube_controller, Action, Controller},
        reflector::ObjectRef,
    },
    Client, CustomResourceExt, Resource,
};
use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::Arc;
use tracing::*;

use crate::common::catch_panic;
use crate::config::{BillingSettings, Cli, Command, RunArgs};
use crate::controller::{error_policy, reconcile_tenant, Data};
use crate::crds::{Cluster, McpBridge, VirtualClusterPolicy};
use crate::error::Error;
use crate::job_bridge::{job_error_policy, reconcile_job, JobData};
use crate::labels::{JOB_MARKER, TENANT_NAMESPACE};
use crate::order::billing::HttpBilling;
use crate::order::lifecycle::OrderLifecycle;
use crate::overselling::{KubeInventory, OversellingLedger};
use crate::policy::{KubePolicySource, Registrar};
use crate::store::{KubeTenantStore, TenantStore};
use crate::sync::http::{router, SyncClient};
use crate::sync::secret::{host_secret_error_policy, reconcile_host_secret, HostSecretData, TLS_SECRET_TYPE};
use crate::sync::{SyncBridge, SyncError};
use crate::version_cache::{policy_error_policy, reconcile_policy, VersionCache};
use crate::virtual_client::VirtualClients;

pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), kube_controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: std::error::Error + 'static,
    QueueErr: std::error::Error + 'static,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "Failed to reconcile object",
            );
        }
    }
}

fn order_lifecycle(billing: &BillingSettings, store: Arc<dyn TenantStore>) -> OrderLifecycle {
    let api = HttpBilling::new(&billing.api_url, &billing.token, &billing.cluster_id, &billing.app_id);
    OrderLifecycle::new(Arc::new(api), store)
}

async fn run(args: RunArgs) -> Result<()> {
    info!("running k3k-tenant-controller");
    let client = Client::try_default().await?;
    let store: Arc<dyn TenantStore> = Arc::new(KubeTenantStore::new(client.clone()));
    let clients = Arc::new(VirtualClients::new(client.clone()));

    let versions = Arc::new(VersionCache::new());
    versions.load_all(&client).await?;

    if args.billing.is_configured() {
        match order_lifecycle(&args.billing, store.clone()).recover_return_orders().await {
            Ok(n) => info!("recovered {} refund(s)", n),
            Err(e) => warn!("failed to recover refunds: {}", e),
        }
    }

    let tenant_reconciler = Controller::new(
        Api::<ServiceAccount>::namespaced(client.clone(), TENANT_NAMESPACE),
        ListParams::default(),
    )
    .shutdown_on_signal()
    .run(
        |sa, ctx| catch_panic(reconcile_tenant(sa, ctx), Error::ReconcilePanicked),
        error_policy,
        Arc::new(Data {
            client: client.clone(),
            clients: clients.clone(),
            store: store.clone(),
            ledger: OversellingLedger::new(KubeInventory::new(client.clone())),
            versions: versions.clone(),
            settings: args.platform.clone(),
        }),
    )
    .map(|res| report_controller_reconciled("tenant-reconciler", &res));

    let job_reconciler = Controller::new(
        Api::<Job>::namespaced(client.clone(), TENANT_NAMESPACE),
        ListParams::default().labels(&format!("{}=true", JOB_MARKER)),
    )
    .shutdown_on_signal()
    .run(
        |job, ctx| catch_panic(reconcile_job(job, ctx), Error::ReconcilePanicked),
        job_error_policy,
        Arc::new(JobData { store: store.clone() }),
    )
    .map(|res| report_controller_reconciled("job-reconciler", &res));

    let secret_reconciler = Controller::new(
        Api::<Secret>::all(client.clone()),
        ListParams::default().fields(&format!("type={}", TLS_SECRET_TYPE)),
    )
    .shutdown_on_signal()
    .run(
        |secret, ctx| catch_panic(reconcile_host_secret(secret, ctx), SyncError::Panicked),
        host_secret_error_policy,
        Arc::new(HostSecretData { clients: clients.clone() }),
    )
    .map(|res| report_controller_reconciled("secret-reconciler", &res));

    let policy_reconciler = Controller::new(Api::<VirtualClusterPolicy>::all(client.clone()), ListParams::default())
        .shutdown_on_signal()
        .run(
            |policy, cache| catch_panic(reconcile_policy(policy, cache), Error::ReconcilePanicked),
            policy_error_policy,
            versions,
        )
        .map(|res| report_controller_reconciled("policy-reconciler", &res));

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!("serving sync endpoint on {}", args.listen);
    let app = router(Arc::new(SyncBridge::new(clients)));

    let reconcilers = futures::stream::select(
        futures::stream::select(tenant_reconciler, job_reconciler),
        futures::stream::select(secret_reconciler, policy_reconciler),
    )
    .collect::<()>();
    tokio::select! {
        _ = reconcilers => info!("controller terminated"),
        res = axum::serve(listener, app).into_future() => res?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Export => {
            info!("exporting custom resource definitions");
            println!("{}", serde_yaml::to_string(&Cluster::crd())?);
            println!("{}", serde_yaml::to_string(&VirtualClusterPolicy::crd())?);
            println!("{}", serde_yaml::to_string(&McpBridge::crd())?);
        }
        Command::Run(args) => run(args).await?,
        Command::Sync(args) => {
            let caller = SyncClient::new(&args.root_pod_ip, &args.k3k_name, &args.k3k_namespace, &args.k3k_mode)?;
            let client = Client::try_default().await?;
            if caller.trigger_object(args.kind, &args.name, &args.namespace, client).await? {
                info!("synced {} {}/{}", args.kind, args.namespace, args.name);
            } else {
                info!("skipped {} {}/{}", args.kind, args.namespace, args.name);
            }
        }
        Command::Register(args) => {
            let client = Client::try_default().await?;
            let registrar = Registrar::new(
                Arc::new(KubePolicySource::new(client.clone())),
                Arc::new(KubeTenantStore::new(client)),
            );
            let tenant = registrar
                .register(&args.policy, &args.name, &args.console_id, &BTreeMap::new(), args.check_allow)
                .await?;
            info!("registered tenant {} in {}", tenant.name, tenant.k3k_namespace());
        }
        Command::Refresh(args) => {
            let client = Client::try_default().await?;
            order_lifecycle(&args.billing, Arc::new(KubeTenantStore::new(client)))
                .refresh(&args.name)
                .await?;
        }
        Command::ReturnOrder(args) => {
            let client = Client::try_default().await?;
            order_lifecycle(&args.billing, Arc::new(KubeTenantStore::new(client)))
                .process_return_last_order(&args.name, args.process)
                .await?;
        }
        Command::RefreshCost(args) => {
            let client = Client::try_default().await?;
            let registrar = Registrar::new(
                Arc::new(KubePolicySource::new(client.clone())),
                Arc::new(KubeTenantStore::new(client)),
            );
            registrar.refresh_cost(&args.name, &args.cost_name).await?;
        }
    }
    Ok(())
}
