//! Partitions the fleet into drain pools.
//!
//! Every node belongs to exactly one pool at any instant: the lexicographically smallest
//! non-default pool config whose selector matches its labels, falling back to the `default`
//! config only when nothing else matches. Resolution is a pure function of the pool configs and
//! the node list; nothing here touches the cluster.

use models::constants::{DEFAULT_POOL_CONFIG_NAME, DEFAULT_POOL_MAX_UNAVAILABLE};
use models::node::{SriovNetworkPoolConfig, SriovNetworkPoolConfigSpec};

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use snafu::ResultExt;
use std::collections::BTreeMap;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, error::Error>;

/// A node's resolved drain pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolAssignment {
    pub pool_name: String,
    /// Budget resolved against the pool size; `None` means the pool is uncapped.
    pub max_unavailable: Option<usize>,
    /// Names of every node in the pool, the subject node included.
    pub members: Vec<String>,
}

/// Resolves the drain pool for `node` given the full fleet and pool config list.
pub fn assign_pool(
    node: &Node,
    nodes: &[Node],
    pool_configs: &[SriovNetworkPoolConfig],
) -> Result<PoolAssignment> {
    let chosen = match matching_config(node, pool_configs)? {
        Some(config) => config.clone(),
        None => default_config(pool_configs),
    };
    let pool_name = chosen.name_any();

    let mut members = Vec::new();
    for candidate in nodes {
        let assigned = match matching_config(candidate, pool_configs)? {
            Some(config) => config.name_any(),
            None => DEFAULT_POOL_CONFIG_NAME.to_string(),
        };
        if assigned == pool_name {
            members.push(candidate.name_any());
        }
    }
    if !members.contains(&node.name_any()) {
        members.push(node.name_any());
    }

    let max_unavailable = chosen
        .max_unavailable(members.len())
        .context(error::PoolBudgetSnafu)?;

    Ok(PoolAssignment {
        pool_name,
        max_unavailable,
        members,
    })
}

/// The smallest-named non-default config matching the node's labels, if any.
fn matching_config<'a>(
    node: &Node,
    pool_configs: &'a [SriovNetworkPoolConfig],
) -> Result<Option<&'a SriovNetworkPoolConfig>> {
    let mut matches = Vec::new();
    for config in pool_configs.iter().filter(|config| !config.is_default()) {
        if selector_matches(
            config.spec.node_selector.as_ref(),
            node.labels(),
            &config.name_any(),
        )? {
            matches.push(config);
        }
    }
    matches.sort_by_key(|config| config.name_any());

    if matches.len() > 1 {
        let pools: Vec<String> = matches.iter().map(|config| config.name_any()).collect();
        event!(
            Level::WARN,
            node = %node.name_any(),
            ?pools,
            "Node matches multiple drain pool configs; using the lexicographically smallest."
        );
    }

    Ok(matches.into_iter().next())
}

/// The `default` pool config, synthesized with a budget of one when no object of that name
/// exists in the cluster.
fn default_config(pool_configs: &[SriovNetworkPoolConfig]) -> SriovNetworkPoolConfig {
    pool_configs
        .iter()
        .find(|config| config.is_default())
        .cloned()
        .unwrap_or_else(|| {
            SriovNetworkPoolConfig::new(
                DEFAULT_POOL_CONFIG_NAME,
                SriovNetworkPoolConfigSpec {
                    node_selector: None,
                    max_unavailable: Some(IntOrString::Int(DEFAULT_POOL_MAX_UNAVAILABLE)),
                },
            )
        })
}

/// Evaluates a label selector against a label set, with `metav1` semantics: all `matchLabels`
/// pairs and all `matchExpressions` must hold. An absent or empty selector matches everything.
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
    pool: &str,
) -> Result<bool> {
    let selector = match selector {
        None => return Ok(true),
        Some(selector) => selector,
    };

    if let Some(match_labels) = selector.match_labels.as_ref() {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(requirements) = selector.match_expressions.as_ref() {
        for requirement in requirements {
            let value = labels.get(&requirement.key);
            let values = requirement.values.as_deref().unwrap_or(&[]);
            let matched = match requirement.operator.as_str() {
                "In" => value.map_or(false, |value| values.contains(value)),
                "NotIn" => value.map_or(true, |value| !values.contains(value)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                operator => {
                    return error::SelectorOperatorSnafu {
                        operator: operator.to_string(),
                        pool: pool.to_string(),
                    }
                    .fail()
                }
            };
            if !matched {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Unsupported selector operator '{}' in drain pool config '{}'",
            operator,
            pool
        ))]
        SelectorOperator { operator: String, pool: String },

        #[snafu(display("{}", source))]
        PoolBudget {
            source: models::node::error::Error,
        },
    }

    impl Error {
        /// Name of the pool config at fault, for event attribution.
        pub fn pool_name(&self) -> &str {
            match self {
                Self::SelectorOperator { pool, .. } => pool,
                Self::PoolBudget { source } => match source {
                    models::node::error::Error::NegativeMaxUnavailable { pool, .. } => pool,
                    models::node::error::Error::InvalidMaxUnavailable { pool, .. } => pool,
                    _ => "",
                },
            }
        }
    }
}
