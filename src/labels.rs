//! Label and annotation keys persisted on tenant ServiceAccounts and the
//! objects derived from them.

pub const TENANT_NAMESPACE: &str = "default";
pub const TENANT_FINALIZER: &str = "k3k.sa/finalizer";

// labels
pub const USER_MODE: &str = "w7.cc/user-mode";
pub const CLUSTER_STATUS: &str = "k3k.io/cluster-status";
pub const K3K_NAME: &str = "w7.cc/k3k-name";
pub const K3K_NAMESPACE: &str = "w7.cc/k3k-namespace";
pub const BASE_ORDER_SN: &str = "w7.cc/base-order-sn";
pub const RENEW_ORDER_SN: &str = "w7.cc/renew-order-sn";
pub const EXPAND_ORDER_SN: &str = "w7.cc/expand-order-sn";
pub const BASE_ORDER_STATUS: &str = "w7.cc/base-order-status";
pub const RENEW_ORDER_STATUS: &str = "w7.cc/renew-order-status";
pub const EXPAND_ORDER_STATUS: &str = "w7.cc/expand-order-status";
pub const BASE_ORDER_PASS: &str = "w7.cc/base-order-pass";
pub const OVER_MODE: &str = "w7.cc/over-mode";
pub const MAINTENANCE: &str = "w7.cc/weihu";
pub const CONSOLE_ID: &str = "w7.cc/console-id";
pub const DEMO_USER: &str = "w7.cc/demo-user";

// annotations
pub const CLUSTER_MODE: &str = "k3k.io/cluster-mode";
pub const CLUSTER_POLICY: &str = "k3k.io/policy";
pub const CLUSTER_POLICY_TITLE: &str = "k3k.io/policy-title";
pub const JOB_NAME: &str = "w7.cc/k3k-job-name";
pub const JOB_STATUS: &str = "w7.cc/k3k-job-status";
pub const QUOTA_LIMIT: &str = "w7.cc/quota-limit";
pub const QUOTA_LIMIT_LOCK: &str = "w7.cc/quota-limit-lock";
pub const QUOTA_LIMIT_NAME: &str = "w7.cc/quota-limit-name";
pub const COST: &str = "w7.cc/cost";
pub const COST_NAME: &str = "w7.cc/cost-name";
pub const OVER_RESOURCE: &str = "w7.cc/over-resource";
pub const OVER_BASE_RESOURCE: &str = "w7.cc/over-base-resource";
pub const RETURN_ORDER_INFO: &str = "w7.cc/return-order-info";
pub const EXPIRE_TIME: &str = "w7.cc/expiretime";
pub const PENDING_RECYCLE_TIME: &str = "w7.cc/pending-recycle-time";
pub const PAUSE: &str = "w7.cc/pause";
pub const LOCK_VERSION: &str = "w7.cc/version";
pub const POLICY_VERSION: &str = "w7.cc/policy-version";
pub const LOGIN_TIME: &str = "w7.cc/login-time";
pub const ROLE: &str = "w7.cc/role";
pub const MENU: &str = "w7.cc/menu";

// policy objects
pub const POLICY_ALLOW_REGISTER: &str = "w7.cc/allow-register";
pub const POLICY_TITLE: &str = "title";
pub const NAMESPACE_POLICY_NAME: &str = "policy.k3k.io/policy-name";

// provisioning job
pub const JOB_MARKER: &str = "k3k-job";
pub const JOB_TENANT: &str = "k3k-sa";
pub const JOB_SUFFIX: &str = "w7.cc/suffix";
pub const JOB_NAME_LABEL: &str = "job-name";

// agent workload
pub const AGENT_POD: &str = "k3k-agent-pod";
pub const AGENT_K3K_NAME: &str = "k3k-name";
pub const AGENT_K3K_NAMESPACE: &str = "k3k-namespace";
pub const AGENT_HELM_VERSION: &str = "helm-version";
pub const AGENT_ROOT_POD_IP: &str = "root-pod-ip";

// sync bridge
pub const TRANSLATED_NAME: &str = "k3k.io/name";
pub const TRANSLATED_NAMESPACE: &str = "k3k.io/namespace";
pub const TRANSLATED_CLUSTER: &str = "k3k.io/clusterName";
pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
pub const CERT_MANAGER_COMMON_NAME: &str = "cert-manager.io/common-name";
pub const SYNCED: &str = "w7.cc/sync";

// display titles
pub const TITLE: &str = "title";
pub const W7_TITLE: &str = "w7.cc/title";
pub const DEPLOY_TITLE: &str = "w7.cc/deploy-title";

// values
pub const USER_MODE_CLUSTER: &str = "cluster";
pub const USER_MODE_NORMAL: &str = "normal";
pub const USER_MODE_FOUNDER: &str = "founder";
pub const CLUSTER_MODE_VIRTUAL: &str = "virtual";
pub const CLUSTER_MODE_SHARED: &str = "shared";
