/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! sriov_domain {
    () => {
        "sriovnetwork.openshift.io"
    };
    ($s:literal) => {
        concat!(sriov_domain!(), "/", $s)
    };
}

pub const API_VERSION: &str = sriov_domain!("v1");
pub const NAMESPACE: &str = "sriov-network-operator";
pub const CONTROLLER: &str = "drain-controller";

// The drain handshake annotations. The values written under these keys are agreed with the
// per-node agent and must never change between releases.
//
// The request side lives on the Node and is written only by the per-node agent.
pub const NODE_DRAIN_ANNOTATION: &str = sriov_domain!("state");
// The grant side lives on the SriovNetworkNodeState and is written only by the drain controller.
pub const NODE_STATE_DRAIN_ANNOTATION_CURRENT: &str = sriov_domain!("current-state");

// Drain pool configuration.
pub const DEFAULT_POOL_CONFIG_NAME: &str = "default";
pub const DEFAULT_POOL_MAX_UNAVAILABLE: i32 = 1;

// Machine-config subsystem markers consumed by the platform integration. These belong to the
// machine-config operator, not to us; we only ever read the node-side annotations and flip
// `spec.paused` on pools.
pub const MC_DESIRED_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/desiredConfig";
pub const MC_CURRENT_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/currentConfig";
pub const MASTER_MCP_NAME: &str = "master";

// Cluster flavors used to select the platform integration at startup.
pub const CLUSTER_TYPE_OPENSHIFT: &str = "openshift";
pub const CLUSTER_TYPE_KUBERNETES: &str = "kubernetes";
