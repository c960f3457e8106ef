//! A minimal slice of the machine-config subsystem's pool resource.
//!
//! Only present on orchestrators with a rolling-config subsystem. The drain coordinator reads
//! the node selector and flips `spec.paused` around drains; everything else in the real
//! resource belongs to the machine-config operator and is deliberately not modeled here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "machineconfiguration.openshift.io",
    kind = "MachineConfigPool",
    plural = "machineconfigpools",
    singular = "machineconfigpool",
    version = "v1"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolSpec {
    /// Selects the nodes governed by this pool.
    pub node_selector: Option<LabelSelector>,
    /// While true, the machine-config operator suspends rollouts for the pool.
    #[serde(default)]
    pub paused: bool,
}
