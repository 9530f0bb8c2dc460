//! Command line and environment settings.

use crate::sync::SyncKind;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(name = "k3k-tenant-controller", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the custom resource definitions this controller relies on.
    Export,
    /// Run the tenant, Job and Secret controllers plus the sync endpoint.
    Run(RunArgs),
    /// Ask the host pod to mirror one object out of this virtual cluster.
    Sync(SyncArgs),
    /// Create a tenant from a VirtualClusterPolicy.
    Register(RegisterArgs),
    /// Re-apply every order recorded on a tenant.
    Refresh(RefreshArgs),
    /// Lock the tenant's last refund reported by billing, optionally applying it.
    ReturnOrder(ReturnOrderArgs),
    /// Re-read a cost ConfigMap onto a tenant.
    RefreshCost(RefreshCostArgs),
}

/// Host-side identity stamped into the provisioning Job and agent
/// workload.
#[derive(Debug, Clone, Default, Args)]
pub struct PlatformSettings {
    #[arg(long, env = "POD_IP", default_value = "")]
    pub pod_ip: String,
    #[arg(long, env = "HELM_VERSION", default_value = "")]
    pub helm_version: String,
    #[arg(long, env = "SERVICE_ACCOUNT_NAME", default_value = "w7panel")]
    pub service_account_name: String,
    #[arg(long, env = "SELF_IMAGE", default_value = "")]
    pub self_image: String,
    #[arg(long, env = "RELEASE_NAME_SUFFIX", default_value = "")]
    pub release_name_suffix: String,
    #[arg(long, env = "HELM_NAMESPACE", default_value = "")]
    pub helm_namespace: String,
    #[arg(long, env = "SVC_LB_CLASS", default_value = "")]
    pub svc_lb_class: String,
}

#[derive(Debug, Clone, Default, Args)]
pub struct BillingSettings {
    #[arg(long = "billing-api-url", env = "BILLING_API_URL", default_value = "")]
    pub api_url: String,
    #[arg(long = "billing-token", env = "BILLING_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,
    #[arg(long = "billing-cluster-id", env = "BILLING_CLUSTER_ID", default_value = "")]
    pub cluster_id: String,
    #[arg(long = "billing-app-id", env = "BILLING_APP_ID", default_value = "")]
    pub app_id: String,
}

impl BillingSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_url.is_empty()
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub platform: PlatformSettings,
    #[command(flatten)]
    pub billing: BillingSettings,
    #[arg(long, env = "SYNC_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// ingress, configmap, secret or mcpbridge
    pub kind: SyncKind,
    pub name: String,
    pub namespace: String,
    #[arg(long, env = "ROOT_POD_IP", default_value = "")]
    pub root_pod_ip: String,
    #[arg(long, env = "K3K_NAME", default_value = "")]
    pub k3k_name: String,
    #[arg(long, env = "K3K_NAMESPACE", default_value = "")]
    pub k3k_namespace: String,
    #[arg(long, env = "K3K_MODE", default_value = "")]
    pub k3k_mode: String,
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    pub name: String,
    #[arg(long)]
    pub policy: String,
    #[arg(long, default_value = "")]
    pub console_id: String,
    /// Refuse policies that are not open for self-registration.
    #[arg(long)]
    pub check_allow: bool,
}

#[derive(Debug, Args)]
pub struct RefreshArgs {
    pub name: String,
    #[command(flatten)]
    pub billing: BillingSettings,
}

#[derive(Debug, Args)]
pub struct ReturnOrderArgs {
    pub name: String,
    #[arg(long)]
    pub process: bool,
    #[command(flatten)]
    pub billing: BillingSettings,
}

#[derive(Debug, Args)]
pub struct RefreshCostArgs {
    pub name: String,
    pub cost_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["k3k-tenant-controller", "run"]).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.listen, "0.0.0.0:8000".parse::<SocketAddr>().unwrap());
                assert_eq!(args.platform.service_account_name, "w7panel");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn sync_parses_the_kind() {
        let cli = Cli::try_parse_from([
            "k3k-tenant-controller",
            "sync",
            "mcpbridge",
            "default",
            "higress-system",
            "--root-pod-ip",
            "10.42.0.7",
        ])
        .unwrap();
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.kind, SyncKind::McpBridge);
                assert_eq!(args.namespace, "higress-system");
                assert_eq!(args.root_pod_ip, "10.42.0.7");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["k3k-tenant-controller", "sync", "pod", "a", "b"]).is_err());
    }
}
