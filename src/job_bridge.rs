//! Provisioning Jobs: the manifest the controller submits and the watch
//! that turns a finished Job into tenant state.

use crate::config::PlatformSettings;
use crate::error::{Error, Result};
use crate::labels::*;
use crate::store::{load_tenant, update_tenant, TenantStore};
use crate::tenant::{ClusterStatus, JobStatus, TenantRecord};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

const JOB_NAME_PREFIX: &str = "k3k-create-";
const JOB_TITLE: &str = "初始化虚拟集群";
const JOB_TTL_SECONDS: i32 = 600;
const JOB_BACKOFF_LIMIT: i32 = 1;
const CREATE_SCRIPT: &str = "${KO_DATA_PATH}/shell/k3k-create.sh";
const DEFAULT_VOLUME_NAME: &str = "default-volume";

pub fn job_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}{}", JOB_NAME_PREFIX, suffix)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

pub fn job_env(tenant: &TenantRecord) -> Vec<EnvVar> {
    let name = tenant.k3k_name();
    let ns = tenant.k3k_namespace();
    let (ingress_class, k3s_mode) = if tenant.is_virtual() { ("traefik", "5") } else { ("higress", "4") };
    vec![
        env("K3K_NAME", name),
        env("K3K_NAMESPACE", ns.clone()),
        env("KUBECONFIG_PATH", format!("/tmp/{}-{}-kubeconfig.yaml", ns, name)),
        env("KUBECONFIG_SERVER", tenant.api_server_host()),
        env("STORAGE_CLASS_NAME", tenant.storage_class()),
        env("K3K_MODE", tenant.cluster_mode()),
        env("INGRESS_CLASS", ingress_class),
        env("K3S_MODE", k3s_mode),
        env("K3K_POLICY", tenant.policy()),
        env("K3K_STORAGE_REQUEST_SIZE", tenant.sys_storage_size()),
        env("K3K_PVC_STORAGE_REQUEST_SIZE", tenant.data_storage_size()),
        env("DEFAULT_VOLUME_NAME", DEFAULT_VOLUME_NAME),
    ]
}

pub fn make_job(tenant: &TenantRecord, settings: &PlatformSettings, name: &str) -> Job {
    let labels = BTreeMap::from([
        (JOB_MARKER.to_string(), "true".to_string()),
        (JOB_TENANT.to_string(), tenant.name.clone()),
        (JOB_NAME_LABEL.to_string(), name.to_string()),
        (JOB_SUFFIX.to_string(), tenant.name.clone()),
    ]);
    let annotations = BTreeMap::from([
        (TITLE.to_string(), JOB_TITLE.to_string()),
        (W7_TITLE.to_string(), JOB_TITLE.to_string()),
        (DEPLOY_TITLE.to_string(), JOB_TITLE.to_string()),
    ]);
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TENANT_NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(settings.service_account_name.clone()),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "create-cluster".to_string(),
                        image: Some(settings.self_image.clone()),
                        env: Some(job_env(tenant)),
                        working_dir: Some("/tmp".to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        command: Some(vec!["sh".to_string(), "-c".to_string(), CREATE_SCRIPT.to_string()]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// Submits one provisioning Job and records it on the tenant.
pub async fn submit_job(
    client: &Client,
    store: &dyn TenantStore,
    tenant: &TenantRecord,
    settings: &PlatformSettings,
) -> Result<String> {
    let name = job_name();
    let job = make_job(tenant, settings, &name);
    info!("Create Job: {}", name);
    Api::<Job>::namespaced(client.clone(), TENANT_NAMESPACE)
        .create(&PostParams::default(), &job)
        .await
        .map_err(Error::CreateJobFailed)?;
    update_tenant(store, &tenant.name, |t| {
        t.running(&name);
        Ok(())
    })
    .await?;
    Ok(name)
}

/// Terminal state of a Job, if it reached one.
pub fn job_outcome(job: &Job) -> Option<JobStatus> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        Some(JobStatus::Complete)
    } else if status.failed.unwrap_or(0) > 0 {
        Some(JobStatus::Failed)
    } else {
        None
    }
}

/// Records the outcome of `job_name` on the tenant. Outcomes of any
/// other Job are stale and ignored. Returns whether anything changed.
pub fn apply_job_outcome(tenant: &mut TenantRecord, job_name: &str, outcome: JobStatus) -> bool {
    if tenant.job.name != job_name || tenant.job.status == outcome {
        return false;
    }
    tenant.job.status = outcome;
    if outcome == JobStatus::Complete
        && matches!(tenant.cluster_status, ClusterStatus::New | ClusterStatus::Creating)
    {
        tenant.cluster_status = ClusterStatus::Ready;
    }
    true
}

pub struct JobData {
    pub store: Arc<dyn TenantStore>,
}

pub async fn reconcile_job(job: Arc<Job>, ctx: Arc<JobData>) -> Result<Action> {
    let labels = job.metadata.labels.clone().unwrap_or_default();
    if labels.get(JOB_MARKER).map(String::as_str) != Some("true") {
        return Ok(Action::await_change());
    }
    let tenant_name = match labels.get(JOB_TENANT) {
        Some(name) if !name.is_empty() => name.clone(),
        _ => return Ok(Action::await_change()),
    };
    let job_name = job.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let outcome = match job_outcome(&job) {
        Some(outcome) => outcome,
        None => return Ok(Action::await_change()),
    };

    let mut tenant = match load_tenant(ctx.store.as_ref(), &tenant_name).await {
        Ok(tenant) => tenant,
        Err(Error::TenantNotFound(_)) => return Ok(Action::await_change()),
        Err(e) => return Err(e),
    };
    if !apply_job_outcome(&mut tenant, &job_name, outcome) {
        debug!(tenant = %tenant_name, job = %job_name, "stale or already recorded job event");
        return Ok(Action::await_change());
    }
    info!(tenant = %tenant_name, job = %job_name, status = outcome.as_str(), "provisioning job finished");
    update_tenant(ctx.store.as_ref(), &tenant_name, |t| {
        apply_job_outcome(t, &job_name, outcome);
        Ok(())
    })
    .await?;
    Ok(Action::await_change())
}

pub fn job_error_policy(_job: Arc<Job>, error: &Error, _ctx: Arc<JobData>) -> Action {
    warn!("Job reconcile failed: {}", error);
    Action::requeue(Duration::from_secs(60))
}
