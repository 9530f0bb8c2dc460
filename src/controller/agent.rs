//! The panel agent that runs inside each virtual cluster, its Service
//! there, and the host Service that fronts the virtual cluster's ingress.

use crate::common::create_or_replace;
use crate::config::PlatformSettings;
use crate::error::{Error, Result};
use crate::labels::*;
use crate::quantity;
use crate::tenant::TenantRecord;
use crate::virtual_client::VirtualClients;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::*;

const AGENT_NAMESPACE: &str = "default";
const AGENT_TITLE: &str = "面板代理";
const UPGRADE_SCRIPT: &str = "${KO_DATA_PATH}/shell/k3k-agent-upgrade.sh";
const PANEL_TOKEN: &str = "PANEL_TOKEN";
const HTTP_PORT: i32 = 8000;
const WEBHOOK_PORT: i32 = 9443;

fn s(v: &str) -> String {
    v.to_string()
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: s(name),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(s(name)),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some(s("TCP")),
        ..ServicePort::default()
    }
}

fn panel_token() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect()
}

pub fn agent_labels(tenant: &TenantRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        (s(AGENT_POD), s("true")),
        (s(JOB_TENANT), tenant.name.clone()),
        (s(AGENT_K3K_NAME), s(tenant.k3k_name())),
        (s(AGENT_K3K_NAMESPACE), tenant.k3k_namespace()),
    ])
}

/// Service in front of the agent, inside the virtual cluster.
pub fn agent_service_build(tenant: &TenantRecord) -> Service {
    let mut labels = agent_labels(tenant);
    labels.remove(AGENT_POD);
    let mut selector = agent_labels(tenant);
    selector.remove(JOB_TENANT);
    Service {
        metadata: ObjectMeta {
            name: Some(tenant.agent_name()),
            namespace: Some(s(AGENT_NAMESPACE)),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(s(W7_TITLE), s("agent服务"))])),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![port("http", HTTP_PORT), port("https", WEBHOOK_PORT)]),
            selector: Some(selector),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Host Service that routes into the virtual cluster's server pods.
pub fn virtual_ingress_service_build(tenant: &TenantRecord) -> Service {
    let mut labels = agent_labels(tenant);
    labels.remove(AGENT_POD);
    labels.insert(s("cluster"), s(tenant.k3k_name()));
    labels.insert(s("role"), s("server"));
    Service {
        metadata: ObjectMeta {
            name: Some(tenant.virtual_ingress_service_name()),
            namespace: Some(tenant.k3k_namespace()),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(s(W7_TITLE), s("k3k服务w7"))])),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![
                port("http", 80),
                port("https", 443),
                port("https-hook", WEBHOOK_PORT),
                port("http-panel", HTTP_PORT),
            ]),
            selector: Some(BTreeMap::from([
                (s("cluster"), s(tenant.k3k_name())),
                (s("role"), s("server")),
            ])),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Environment of the agent inside the virtual cluster.
pub fn agent_env(tenant: &TenantRecord, settings: &PlatformSettings, token: &str) -> Vec<EnvVar> {
    let ns = tenant.k3k_namespace();
    vec![
        env("K3K_NAME", tenant.k3k_name()),
        env("K3K_NAMESPACE", ns.clone()),
        env("K3K_CLUSTER_HOST", tenant.api_server_host()),
        env("K3K_MODE", tenant.cluster_mode()),
        env("SERVICE_ACCOUNT_NAME", tenant.k3k_name()),
        env("STORAGE_CLASS_NAME", tenant.storage_class()),
        env("WEBHOOK_ENABLED", "true"),
        env("APP_WATCH", "true"),
        env("MICROAPP_PATH", "/data/microapp"),
        env("HELM_VERSION", settings.helm_version.clone()),
        env("CLUSTER_MODE", tenant.cluster_mode()),
        env("IS_CHILD", "true"),
        env("ROOT_SVCNAME", settings.release_name_suffix.clone()),
        env("ROOT_NAMESPACE", settings.helm_namespace.clone()),
        env("SVC_NAME", tenant.agent_name()),
        env("SVC_LB_CLASS", settings.svc_lb_class.clone()),
        env("K8S_WATCH", "true"),
        env("HIGRESS_WATCH", "true"),
        env("SITE_ENABLED", "true"),
        env("ROOT_POD_IP", settings.pod_ip.clone()),
        env("STATIC_DOWN_ENABLED", "true"),
        env(PANEL_TOKEN, token),
    ]
}

pub fn agent_pod_spec(tenant: &TenantRecord, settings: &PlatformSettings, token: &str) -> PodSpec {
    let envs = agent_env(tenant, settings, token);
    let resources = |cpu: i64, memory: i64| {
        BTreeMap::from([
            (s("cpu"), quantity::cpu_quantity(cpu)),
            (s("memory"), quantity::bytes_quantity(memory)),
        ])
    };
    PodSpec {
        restart_policy: Some(s("Always")),
        service_account_name: Some(tenant.name.clone()),
        host_pid: Some(true),
        init_containers: Some(vec![Container {
            name: s("w7panel-agent-init"),
            image: Some(settings.self_image.clone()),
            env: Some(envs.clone()),
            image_pull_policy: Some(s("Always")),
            command: Some(vec![s("sh"), s("-c"), s(UPGRADE_SCRIPT)]),
            ..Container::default()
        }]),
        containers: vec![Container {
            name: s("w7panel-agent"),
            image: Some(settings.self_image.clone()),
            env: Some(envs),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..SecurityContext::default()
            }),
            image_pull_policy: Some(s("Always")),
            resources: Some(ResourceRequirements {
                requests: Some(resources(0, 0)),
                limits: Some(resources(250, 100 * 1024 * 1024)),
                ..ResourceRequirements::default()
            }),
            ports: Some(vec![
                ContainerPort {
                    container_port: HTTP_PORT,
                    protocol: Some(s("TCP")),
                    ..ContainerPort::default()
                },
                ContainerPort {
                    container_port: WEBHOOK_PORT,
                    protocol: Some(s("TCP")),
                    ..ContainerPort::default()
                },
            ]),
            args: Some(vec![s("server:start")]),
            ..Container::default()
        }],
        ..PodSpec::default()
    }
}

pub fn agent_daemon_set_build(tenant: &TenantRecord, settings: &PlatformSettings, token: &str) -> DaemonSet {
    let labels = agent_labels(tenant);
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(tenant.agent_name()),
            namespace: Some(s(AGENT_NAMESPACE)),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([
                (s(AGENT_HELM_VERSION), settings.helm_version.clone()),
                (s(AGENT_ROOT_POD_IP), settings.pod_ip.clone()),
                (s(TITLE), s(AGENT_TITLE)),
                (s("w7.cc/create-svc"), s("true")),
                (s("w7.cc.app/ports"), s(r#"{"8000":8000}"#)),
            ])),
            ..ObjectMeta::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(agent_pod_spec(tenant, settings, token)),
            },
            ..DaemonSetSpec::default()
        }),
        ..DaemonSet::default()
    }
}

/// The panel token already handed to a running agent, so re-stamping the
/// workload does not rotate it.
pub fn live_panel_token(ds: &DaemonSet) -> Option<String> {
    ds.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .find(|e| e.name == PANEL_TOKEN)
        .and_then(|e| e.value.clone())
        .filter(|v| !v.is_empty())
}

/// Stamps the desired annotations and spec onto the live DaemonSet.
pub fn merge_daemon_set(desired: DaemonSet, live: DaemonSet) -> DaemonSet {
    let mut annotations = live.metadata.annotations.clone().unwrap_or_default();
    annotations.extend(desired.metadata.annotations.unwrap_or_default());
    DaemonSet {
        metadata: ObjectMeta {
            annotations: Some(annotations),
            ..live.metadata
        },
        spec: desired.spec,
        ..live
    }
}

/// Agent Service and DaemonSet in the virtual cluster, ingress Service in
/// the host. The DaemonSet is re-stamped every time, so a new platform
/// version or host pod address rolls the agent.
pub async fn reconcile_agent(tenant: &TenantRecord, clients: &VirtualClients, settings: &PlatformSettings) -> Result<()> {
    let child = clients.client(tenant.k3k_name(), &tenant.k3k_namespace()).await?;

    let svc_api = Api::<Service>::namespaced(child.clone(), AGENT_NAMESPACE);
    create_or_replace(&svc_api, agent_service_build(tenant), |desired, live| Service {
        metadata: ObjectMeta {
            labels: desired.metadata.labels,
            ..live.metadata
        },
        spec: live.spec.map(|spec| ServiceSpec {
            ports: desired.spec.as_ref().and_then(|s| s.ports.clone()),
            selector: desired.spec.as_ref().and_then(|s| s.selector.clone()),
            ..spec
        }),
        ..live
    })
    .await
    .map_err(Error::ReconcileServiceFailed)?;

    let host_svc_api = Api::<Service>::namespaced(clients.host().clone(), &tenant.k3k_namespace());
    create_or_replace(&host_svc_api, virtual_ingress_service_build(tenant), |desired, live| Service {
        spec: live.spec.map(|spec| ServiceSpec {
            ports: desired.spec.as_ref().and_then(|s| s.ports.clone()),
            selector: desired.spec.as_ref().and_then(|s| s.selector.clone()),
            ..spec
        }),
        ..live
    })
    .await
    .map_err(Error::ReconcileServiceFailed)?;

    let ds_api = Api::<DaemonSet>::namespaced(child, AGENT_NAMESPACE);
    let token = ds_api
        .get_opt(&tenant.agent_name())
        .await
        .map_err(Error::ReconcileDaemonSetFailed)?
        .and_then(|ds| live_panel_token(&ds))
        .unwrap_or_else(panel_token);
    create_or_replace(&ds_api, agent_daemon_set_build(tenant, settings, &token), merge_daemon_set)
        .await
        .map_err(Error::ReconcileDaemonSetFailed)?;
    debug!(tenant = %tenant.name, "agent reconciled");
    Ok(())
}
