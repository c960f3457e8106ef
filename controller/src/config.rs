//! Startup configuration for the drain controller, sourced from the environment.

use snafu::OptionExt;
use std::env;
use std::str::FromStr;
use tokio::time::Duration;

const NAMESPACE_ENV_VAR: &str = "NAMESPACE";
const CLUSTER_TYPE_ENV_VAR: &str = "CLUSTER_TYPE";
const MAX_PARALLEL_RECONCILES_ENV_VAR: &str = "MAX_PARALLEL_RECONCILES";
const RECONCILE_BASE_BACKOFF_ENV_VAR: &str = "RECONCILE_BASE_BACKOFF_SECONDS";
const RECONCILE_MAX_BACKOFF_ENV_VAR: &str = "RECONCILE_MAX_BACKOFF_SECONDS";
const DRAIN_REQUEUE_ENV_VAR: &str = "DRAIN_REQUEUE_SECONDS";
const DRAIN_DEADLINE_ENV_VAR: &str = "DRAIN_DEADLINE_SECONDS";

const DEFAULT_MAX_PARALLEL_RECONCILES: usize = 1;
const DEFAULT_RECONCILE_BASE_BACKOFF_SECONDS: u64 = 1;
const DEFAULT_RECONCILE_MAX_BACKOFF_SECONDS: u64 = 120;
const DEFAULT_DRAIN_REQUEUE_SECONDS: u64 = 5;
const DEFAULT_DRAIN_DEADLINE_SECONDS: u64 = 300;

/// The module-wide result type.
type Result<T> = std::result::Result<T, config_error::Error>;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace the node state and pool config objects are scoped to.
    pub namespace: String,
    /// Cluster flavor; selects the platform integration.
    pub cluster_type: String,
    /// Number of reconcile workers. Reconciles for one node never run concurrently regardless.
    pub max_parallel_reconciles: usize,
    /// Bounds for the work queue's exponential error backoff.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Delay before re-checking an in-progress or capacity-blocked drain.
    pub drain_requeue: Duration,
    /// Ceiling on a single drainer pass before the reconcile is requeued.
    pub drain_deadline: Duration,
}

impl ControllerConfig {
    pub fn from_environment() -> Result<Self> {
        Ok(ControllerConfig {
            namespace: env::var(NAMESPACE_ENV_VAR)
                .unwrap_or_else(|_| models::constants::NAMESPACE.to_string()),
            cluster_type: env::var(CLUSTER_TYPE_ENV_VAR)
                .unwrap_or_else(|_| models::constants::CLUSTER_TYPE_KUBERNETES.to_string()),
            max_parallel_reconciles: parse_env(
                MAX_PARALLEL_RECONCILES_ENV_VAR,
                DEFAULT_MAX_PARALLEL_RECONCILES,
            )?,
            base_backoff: Duration::from_secs(parse_env(
                RECONCILE_BASE_BACKOFF_ENV_VAR,
                DEFAULT_RECONCILE_BASE_BACKOFF_SECONDS,
            )?),
            max_backoff: Duration::from_secs(parse_env(
                RECONCILE_MAX_BACKOFF_ENV_VAR,
                DEFAULT_RECONCILE_MAX_BACKOFF_SECONDS,
            )?),
            drain_requeue: Duration::from_secs(parse_env(
                DRAIN_REQUEUE_ENV_VAR,
                DEFAULT_DRAIN_REQUEUE_SECONDS,
            )?),
            drain_deadline: Duration::from_secs(parse_env(
                DRAIN_DEADLINE_ENV_VAR,
                DEFAULT_DRAIN_DEADLINE_SECONDS,
            )?),
        })
    }
}

fn parse_env<T: FromStr>(variable: &'static str, default: T) -> Result<T> {
    match env::var(variable) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .ok()
            .context(config_error::InvalidValueSnafu { variable, value: raw }),
    }
}

pub mod config_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Unparseable value '{}' for environment variable '{}'",
            value,
            variable
        ))]
        InvalidValue {
            variable: &'static str,
            value: String,
        },
    }
}
