use super::error::{self, Result};
use crate::constants::DEFAULT_POOL_CONFIG_NAME;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use lazy_static::lazy_static;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt};

lazy_static! {
    static ref PERCENT_RE: regex::Regex =
        regex::Regex::new(r"^([0-9]+)%$").expect("Invalid regex literal.");
}

/// `SriovNetworkNodeState` is the per-node record owned by the operator. Exactly one exists for
/// every node the operator manages, under the same name as the node. The drain controller only
/// ever touches its grant annotation; the rest of the object belongs to the per-node agent.
#[derive(
    Clone, CustomResource, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema,
)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "sriovnetwork.openshift.io",
    kind = "SriovNetworkNodeState",
    namespaced,
    plural = "sriovnetworknodestates",
    singular = "sriovnetworknodestate",
    version = "v1"
)]
pub struct SriovNetworkNodeStateSpec {}

/// `SriovNetworkPoolConfig` groups nodes into a drain pool and bounds how many of them may be
/// simultaneously unavailable. A config with empty (or absent) selector terms matches every
/// node; the config named `default` is the fallback pool for nodes no other config claims.
#[derive(Clone, CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "sriovnetwork.openshift.io",
    kind = "SriovNetworkPoolConfig",
    namespaced,
    plural = "sriovnetworkpoolconfigs",
    singular = "sriovnetworkpoolconfig",
    version = "v1",
    printcolumn = r#"{"name":"Max Unavailable", "type":"string", "jsonPath":".spec.maxUnavailable"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkPoolConfigSpec {
    /// Selects the nodes that belong to this pool.
    pub node_selector: Option<LabelSelector>,
    /// Ceiling on simultaneously drained nodes, absolute or a percentage of the pool size.
    /// Unset means the pool is uncapped.
    pub max_unavailable: Option<IntOrString>,
}

impl SriovNetworkPoolConfig {
    pub fn is_default(&self) -> bool {
        self.name_any() == DEFAULT_POOL_CONFIG_NAME
    }

    /// Resolves the configured budget against the pool's current size. Percentages round down
    /// but never reach zero for a non-empty pool; anything above the pool size is clamped to it.
    /// `None` means the pool is uncapped.
    pub fn max_unavailable(&self, pool_size: usize) -> Result<Option<usize>> {
        let configured = match self.spec.max_unavailable.as_ref() {
            None => return Ok(None),
            Some(configured) => configured,
        };

        let resolved = match configured {
            IntOrString::Int(value) => {
                ensure!(
                    *value >= 0,
                    error::NegativeMaxUnavailableSnafu {
                        value: *value,
                        pool: self.name_any(),
                    }
                );
                *value as usize
            }
            IntOrString::String(value) => {
                let percent: usize = PERCENT_RE
                    .captures(value)
                    .and_then(|captures| captures[1].parse().ok())
                    .context(error::InvalidMaxUnavailableSnafu {
                        value: value.clone(),
                        pool: self.name_any(),
                    })?;
                let scaled = pool_size.saturating_mul(percent) / 100;
                if scaled == 0 && pool_size > 0 {
                    1
                } else {
                    scaled
                }
            }
        };

        Ok(Some(resolved.min(pool_size)))
    }
}
