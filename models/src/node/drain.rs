//! Evicts Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! The Kubernetes API has no server-side drain; removing workloads means issuing Evictions,
//! which respect PodDisruptionBudgets (PDBs). Cordoning is not handled here; the coordinator
//! cordons through its cluster client before invoking the drainer.
//!
//! A drain is exposed as a *pass*: one pass evicts whatever is currently drainable and waits a
//! bounded amount of time for deletions. Workloads protected by an unsatisfied PDB, or slow to
//! terminate, leave the pass incomplete and the caller re-invokes it on the next reconcile. That
//! keeps the coordinator restartable and safe to run under leader election.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, EvictParams, ListParams};
use kube::ResourceExt;
use reqwest::StatusCode;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::mock;

// Maximum number of Pods to evict concurrently, including the wait for their deletion. Eviction
// traffic against the API server should stay modest.
const CONCURRENT_EVICTIONS: usize = 5;

// Delay between eviction attempts while a PodDisruptionBudget is unsatisfied or the API reports
// a misconfigured budget. `kubectl drain` waits 5 seconds in the same situation.
const EVICTION_STALL_INTERVAL: Duration = Duration::from_secs(5);

// How often to poll for a Pod's deletion, and how long a single pass will wait for it. A Pod
// that outlives the per-pass wait is picked up again by the next pass.
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DELETION_WAIT_PER_PASS: Duration = Duration::from_secs(60);

// Transient eviction failures are retried with jittered exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const NUM_RETRIES: usize = 5;

/// Wrapper struct to provide retry configurations for evictions.
struct RetryStrategy {}

impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(NUM_RETRIES)
    }
}

impl tokio_retry::Condition<error::EvictionError> for RetryStrategy {
    fn should_retry(&mut self, error: &error::EvictionError) -> bool {
        error.should_retry()
    }
}

#[async_trait]
/// The drain capability consumed by the coordinator. Implementations perform one drain pass and
/// report whether the node is fully evacuated; incomplete passes are retried by the caller.
pub trait Drainer: Clone + Sized + Send + Sync {
    async fn drain_node(&self, node_name: &str) -> Result<bool, error::DrainError>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock Drainer for use in tests.
    pub Drainer {}
    #[async_trait]
    impl Drainer for Drainer {
        async fn drain_node(&self, node_name: &str) -> Result<bool, error::DrainError>;
    }

    impl Clone for Drainer {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> Drainer for Arc<T>
where
    T: Drainer,
{
    async fn drain_node(&self, node_name: &str) -> Result<bool, error::DrainError> {
        (**self).drain_node(node_name).await
    }
}

#[derive(Clone)]
/// Eviction-based `Drainer` implementation.
pub struct EvictionDrainer {
    k8s_client: kube::client::Client,
}

impl EvictionDrainer {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        EvictionDrainer { k8s_client }
    }

    /// Finds the pods on the node that a drain must remove. DaemonSet members are left alone
    /// because their controller ignores cordons; static mirror pods cannot be controlled at all;
    /// completed pods hold no workload worth protecting.
    async fn drainable_pods(&self, node_name: &str) -> Result<Vec<Pod>, error::DrainError> {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());
        let on_node = pods
            .list(&ListParams {
                field_selector: Some(format!("spec.nodeName={}", node_name)),
                ..Default::default()
            })
            .await
            .context(error::ListTargetPodsSnafu { node_name })?;

        Ok(on_node.into_iter().filter(is_drainable).collect())
    }
}

#[async_trait]
impl Drainer for EvictionDrainer {
    #[instrument(skip(self), err)]
    async fn drain_node(&self, node_name: &str) -> Result<bool, error::DrainError> {
        let targets = self.drainable_pods(node_name).await?;
        if targets.is_empty() {
            return Ok(true);
        }

        let remaining = stream::iter(targets)
            .map(|pod| {
                let k8s_client = self.k8s_client.clone();
                async move { evict_and_await(&k8s_client, &pod).await }
            })
            .buffer_unordered(CONCURRENT_EVICTIONS)
            .filter(|gone| futures::future::ready(!gone))
            .count()
            .await;

        if remaining > 0 {
            event!(
                Level::INFO,
                remaining,
                "Pods still terminating; drain pass incomplete."
            );
        }
        Ok(remaining == 0)
    }
}

/// Given a list of all pods for a given node, decides whether a drain should evict this one.
fn is_drainable(pod: &Pod) -> bool {
    if let Some(phase) = pod.status.as_ref().and_then(|status| status.phase.as_ref()) {
        // Completed pods do not block the drain.
        if phase == "Succeeded" || phase == "Failed" {
            return false;
        }
    }

    if let Some(owner_references) = pod.metadata.owner_references.as_ref() {
        if owner_references
            .iter()
            .any(|reference| reference.controller == Some(true) && reference.kind == "DaemonSet")
        {
            event!(
                Level::INFO,
                pod = %pod.name_any(),
                "Not draining Pod: member of a DaemonSet."
            );
            return false;
        }
    }

    if let Some(annotations) = pod.metadata.annotations.as_ref() {
        if annotations.contains_key("kubernetes.io/config.mirror") {
            event!(
                Level::INFO,
                pod = %pod.name_any(),
                "Not draining Pod: static mirror Pod."
            );
            return false;
        }
    }

    true
}

/// Evicts one pod and waits boundedly for it to disappear. Returns whether the pod is gone.
async fn evict_and_await(k8s_client: &kube::client::Client, pod: &Pod) -> bool {
    match evict_pod(k8s_client, pod).await {
        Ok(()) => wait_for_deletion(k8s_client, pod).await,
        Err(err) if !err.should_retry() => {
            // 404: already gone. 403: its namespace is being torn down and the eviction API
            // refuses; the deletion is underway regardless. Neither blocks the drain.
            event!(
                Level::INFO,
                pod = %pod.name_any(),
                error = %err,
                "Treating unevictable Pod as gone."
            );
            true
        }
        Err(err) => {
            event!(
                Level::WARN,
                pod = %pod.name_any(),
                error = %err,
                "Eviction did not succeed this pass."
            );
            false
        }
    }
}

/// Create an eviction for the desired Pod, retrying transient failures.
///
/// A 429 means an unsatisfied PodDisruptionBudget, a 500 usually means overlapping budgets; both
/// clear on their own, so we stall and try again rather than clobber the budget. An eviction can
/// stay stuck this way indefinitely (invalid PDBs, insufficient capacity); the per-reconcile
/// deadline in the coordinator bounds how long a single pass spins here before requeueing.
/// See https://kubernetes.io/docs/tasks/administer-cluster/safely-drain-node/#stuck-evictions.
async fn evict_pod(
    k8s_client: &kube::client::Client,
    pod: &Pod,
) -> Result<(), error::EvictionError> {
    let pod_api = namespaced_pod_api(k8s_client, pod);

    RetryIf::spawn(
        RetryStrategy::retry_strategy(),
        || async {
            loop {
                event!(Level::INFO, pod = %pod.name_any(), "Attempting to evict Pod.");
                match pod_api.evict(&pod.name_any(), &EvictParams::default()).await {
                    Ok(_) => {
                        event!(Level::INFO, pod = %pod.name_any(), "Eviction created.");
                        return Ok(());
                    }
                    Err(kube::Error::Api(response)) => {
                        match StatusCode::from_u16(response.code as u16) {
                            Ok(StatusCode::TOO_MANY_REQUESTS)
                            | Ok(StatusCode::INTERNAL_SERVER_ERROR) => {
                                event!(
                                    Level::WARN,
                                    pod = %pod.name_any(),
                                    code = response.code,
                                    "Eviction blocked by a PodDisruptionBudget; stalling {:.0}s.",
                                    EVICTION_STALL_INTERVAL.as_secs_f64()
                                );
                                sleep(EVICTION_STALL_INTERVAL).await;
                            }
                            Ok(StatusCode::NOT_FOUND) | Ok(StatusCode::FORBIDDEN) => {
                                return Err(kube::Error::Api(response)).context(
                                    error::NonRetriableEvictionSnafu {
                                        pod_name: pod.name_any(),
                                    },
                                );
                            }
                            _ => {
                                return Err(kube::Error::Api(response)).context(
                                    error::RetriableEvictionSnafu {
                                        pod_name: pod.name_any(),
                                    },
                                );
                            }
                        }
                    }
                    Err(err) => {
                        return Err(err).context(error::RetriableEvictionSnafu {
                            pod_name: pod.name_any(),
                        });
                    }
                }
            }
        },
        RetryStrategy {},
    )
    .await
}

/// Waits for the given Pod to be deleted, up to the per-pass bound. Returns whether it is gone.
async fn wait_for_deletion(k8s_client: &kube::client::Client, pod: &Pod) -> bool {
    let pod_api = namespaced_pod_api(k8s_client, pod);
    let deadline = Instant::now() + DELETION_WAIT_PER_PASS;
    loop {
        match pod_api.get_opt(&pod.name_any()).await {
            Ok(None) => {
                event!(Level::INFO, pod = %pod.name_any(), "Pod deleted.");
                return true;
            }
            Ok(Some(_)) => {
                event!(Level::DEBUG, pod = %pod.name_any(), "Pod not yet deleted.");
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    pod = %pod.name_any(),
                    error = %err,
                    "Could not determine whether Pod has been deleted."
                );
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(DELETION_POLL_INTERVAL).await;
    }
}

/// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
fn namespaced_pod_api(k8s_client: &kube::client::Client, pod: &Pod) -> Api<Pod> {
    match pod.metadata.namespace.as_ref() {
        Some(ns) => Api::namespaced(k8s_client.clone(), ns),
        None => Api::default_namespaced(k8s_client.clone()),
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to list drainable Pods for Node '{}': {}", node_name, source))]
        ListTargetPods {
            source: kube::Error,
            node_name: String,
        },
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        /// An error occurred while attempting to evict a Pod. This may result in an attempt to
        /// retry the eviction.
        #[snafu(display("Unable to create eviction for Pod '{}': {}", pod_name, source))]
        RetriableEviction {
            source: kube::Error,
            pod_name: String,
        },

        /// The eviction can never succeed (the Pod is gone, or we lack permission to evict it).
        #[snafu(display("Eviction refused for Pod '{}': {}", pod_name, source))]
        NonRetriableEviction {
            source: kube::Error,
            pod_name: String,
        },
    }

    impl EvictionError {
        pub fn should_retry(&self) -> bool {
            match self {
                Self::RetriableEviction { .. } => true,
                Self::NonRetriableEviction { .. } => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn plain_pods_are_drainable() {
        assert!(is_drainable(&pod("workload")));
    }

    #[test]
    fn completed_pods_are_not_drainable() {
        for phase in ["Succeeded", "Failed"] {
            let mut completed = pod("batch-job");
            completed.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
            assert!(!is_drainable(&completed), "phase: {}", phase);
        }
    }

    #[test]
    fn daemonset_pods_are_not_drainable() {
        let mut daemon = pod("node-exporter");
        daemon.metadata.owner_references = Some(vec![OwnerReference {
            controller: Some(true),
            kind: "DaemonSet".to_string(),
            name: "node-exporter".to_string(),
            ..Default::default()
        }]);
        assert!(!is_drainable(&daemon));
    }

    #[test]
    fn mirror_pods_are_not_drainable() {
        let mut mirror = pod("kube-apiserver");
        mirror.metadata.annotations = Some(BTreeMap::from([(
            "kubernetes.io/config.mirror".to_string(),
            "checksum".to_string(),
        )]));
        assert!(!is_drainable(&mirror));
    }
}
