use super::{
    config::ControllerConfig,
    error::{self, Result},
    metrics::DrainControllerMetrics,
    platform::{PlatformIntegration, PlatformReadiness},
    pools::{self, PoolAssignment},
    statemachine::{determine_transition, Transition},
    workqueue::WorkQueue,
};
use models::node::drain::Drainer;
use models::node::{
    node_reference, pool_config_reference, DrainClient, DrainEvent, DrainGrant, DrainRequest,
    SriovNetworkNodeState,
};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use opentelemetry::global;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{event, instrument, Level};

/// Outcome of a single reconcile pass.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReconcileOutcome {
    Done,
    RequeueAfter(Duration),
}

/// The DrainController arbitrates drain requests across a cluster of worker nodes.
///
/// Each reconcile handles one node and is idempotent: it reads the fleet live, decides the next
/// transition from the two handshake annotations, and issues writes only where the observed
/// value differs from the desired one. Capacity admission is therefore evaluated against
/// current state on every pass; a node returning to idle frees its pool slot immediately.
pub struct DrainController<C, D, P> {
    client: C,
    drainer: D,
    platform: P,
    metrics: DrainControllerMetrics,
    drain_requeue: Duration,
    drain_deadline: Duration,
}

impl<C, D, P> DrainController<C, D, P>
where
    C: DrainClient,
    D: Drainer,
    P: PlatformIntegration,
{
    pub fn new(client: C, drainer: D, platform: P, config: &ControllerConfig) -> Self {
        // Creates the drain-controller meter via the configured GlobalMeterProvider, which is
        // setup in PrometheusExporter.
        let meter = global::meter("drain-controller");
        let metrics = DrainControllerMetrics::new(meter);
        DrainController {
            client,
            drainer,
            platform,
            metrics,
            drain_requeue: config.drain_requeue,
            drain_deadline: config.drain_deadline,
        }
    }

    /// Runs `workers` reconcile loops over the queue. Per-node ordering is preserved by the
    /// queue itself; the workers only add parallelism across distinct nodes.
    pub async fn run(&self, queue: Arc<WorkQueue>, workers: usize) {
        let workers = workers.max(1);
        let handles: Vec<_> = (0..workers)
            .map(|index| self.worker(index, Arc::clone(&queue)))
            .collect();
        futures::future::join_all(handles).await;
    }

    async fn worker(&self, index: usize, queue: Arc<WorkQueue>) {
        event!(Level::DEBUG, index, "Reconcile worker started.");
        while let Some(node_name) = queue.next().await {
            match self.reconcile(&node_name).await {
                Ok(ReconcileOutcome::Done) => queue.finish(&node_name, None),
                Ok(ReconcileOutcome::RequeueAfter(delay)) => {
                    queue.finish(&node_name, Some(delay))
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        node = %node_name,
                        error = %err,
                        "Reconcile failed; backing off."
                    );
                    queue.finish_with_error(&node_name);
                }
            }
        }
    }

    /// Reconciles one node against the fleet. Missing objects make this a no-op so deletions
    /// need no special handling.
    #[instrument(skip(self), err)]
    pub async fn reconcile(&self, node_name: &str) -> Result<ReconcileOutcome> {
        let node = match self
            .client
            .get_node(node_name)
            .await
            .context(error::DrainClientSnafu)?
        {
            None => return Ok(ReconcileOutcome::Done),
            Some(node) => node,
        };
        let node_state = match self
            .client
            .get_node_state(node_name)
            .await
            .context(error::DrainClientSnafu)?
        {
            None => {
                event!(
                    Level::DEBUG,
                    node = %node_name,
                    "Node has no state object; nothing to coordinate."
                );
                return Ok(ReconcileOutcome::Done);
            }
            Some(node_state) => node_state,
        };

        let request = DrainRequest::from_node(&node).context(error::DrainClientSnafu)?;
        let grant = match DrainGrant::from_node_state(&node_state)
            .context(error::DrainClientSnafu)?
        {
            Some(grant) => grant,
            None => self.initialize_grant(&node, request).await?,
        };

        event!(
            Level::DEBUG,
            node = %node_name,
            request = %request,
            grant = %grant,
            "Evaluating drain handshake."
        );

        match determine_transition(request, grant) {
            Transition::EnsureSchedulable => self.ensure_schedulable(&node).await,
            Transition::RequestAdmission => self.request_admission(&node).await,
            Transition::ContinueDrain => self.continue_drain(&node, request, grant).await,
            Transition::HoldComplete => self.hold_complete(&node).await,
            Transition::ReturnToIdle => self.return_to_idle(&node).await,
        }
    }

    /// First observation of a node state without a grant annotation. A cordoned node with an
    /// outstanding drain request was mid-drain when a previous controller died; resume there
    /// rather than bouncing it back through admission.
    async fn initialize_grant(&self, node: &Node, request: DrainRequest) -> Result<DrainGrant> {
        let grant = if request.wants_drain() && is_unschedulable(node) {
            DrainGrant::Draining
        } else {
            DrainGrant::Idle
        };
        event!(
            Level::INFO,
            node = %node.name_any(),
            grant = %grant,
            "Initializing drain grant annotation."
        );
        self.client
            .set_drain_grant(&node.name_any(), grant)
            .await
            .context(error::DrainClientSnafu)?;
        Ok(grant)
    }

    async fn ensure_schedulable(&self, node: &Node) -> Result<ReconcileOutcome> {
        if is_unschedulable(node) {
            self.client
                .uncordon_node(&node.name_any())
                .await
                .context(error::DrainClientSnafu)?;
            self.metrics.op("uncordon");
        } else {
            self.metrics.no_op();
        }
        Ok(ReconcileOutcome::Done)
    }

    /// Admission against the pool budget, evaluated on live state. Losing nodes are simply
    /// requeued; the retry re-reads the fleet and wins once a slot frees up.
    async fn request_admission(&self, node: &Node) -> Result<ReconcileOutcome> {
        let assignment = self.resolve_pool(node).await?;
        let node_states = self
            .client
            .list_node_states()
            .await
            .context(error::DrainClientSnafu)?;
        let draining = count_draining(&assignment, &node_states)?;

        if let Some(budget) = assignment.max_unavailable {
            if draining >= budget {
                event!(
                    Level::INFO,
                    node = %node.name_any(),
                    pool = %assignment.pool_name,
                    draining,
                    budget,
                    "Drain pool budget exhausted; holding admission."
                );
                self.metrics.op("hold");
                return Ok(ReconcileOutcome::RequeueAfter(self.drain_requeue));
            }
        }

        event!(
            Level::INFO,
            node = %node.name_any(),
            pool = %assignment.pool_name,
            draining,
            "Admitting node into drain."
        );
        if !is_unschedulable(node) {
            self.client
                .cordon_node(&node.name_any())
                .await
                .context(error::DrainClientSnafu)?;
        }

        let grant = match self.before_drain(node).await? {
            // Hooks pending: the grant still records the admission so the slot stays consumed.
            PlatformReadiness::Pending => DrainGrant::Draining,
            PlatformReadiness::Ready { pool_paused: true } => DrainGrant::DrainMcpPaused,
            PlatformReadiness::Ready { pool_paused: false } => DrainGrant::Draining,
        };
        self.client
            .set_drain_grant(&node.name_any(), grant)
            .await
            .context(error::DrainClientSnafu)?;
        self.metrics.op("admit");

        // Run the drainer on the next pass, under a fresh deadline.
        Ok(ReconcileOutcome::RequeueAfter(Duration::ZERO))
    }

    /// Drives an admitted drain forward: cordon, platform hooks, then the drainer. Every step
    /// is repeat-safe, so a crash or timeout anywhere simply replays the pass.
    async fn continue_drain(
        &self,
        node: &Node,
        request: DrainRequest,
        grant: DrainGrant,
    ) -> Result<ReconcileOutcome> {
        let node_name = node.name_any();
        if !is_unschedulable(node) {
            self.client
                .cordon_node(&node_name)
                .await
                .context(error::DrainClientSnafu)?;
        }

        let effective = match self.before_drain(node).await? {
            PlatformReadiness::Pending => {
                event!(
                    Level::INFO,
                    node = %node_name,
                    "Platform not ready for drain; requeueing."
                );
                return Ok(ReconcileOutcome::RequeueAfter(self.drain_requeue));
            }
            PlatformReadiness::Ready { pool_paused: true } => DrainGrant::DrainMcpPaused,
            PlatformReadiness::Ready { pool_paused: false } => {
                // Never downgrade a recorded pause; the pool is unpaused on release only.
                if grant == DrainGrant::DrainMcpPaused {
                    DrainGrant::DrainMcpPaused
                } else {
                    DrainGrant::Draining
                }
            }
        };
        if effective != grant {
            self.client
                .set_drain_grant(&node_name, effective)
                .await
                .context(error::DrainClientSnafu)?;
        }

        let completed = match timeout(self.drain_deadline, self.drainer.drain_node(&node_name))
            .await
        {
            Err(_elapsed) => {
                event!(
                    Level::WARN,
                    node = %node_name,
                    "Drain pass exceeded its deadline; requeueing."
                );
                false
            }
            Ok(Err(err)) => {
                self.publish_drain_failure(node, err.to_string()).await;
                return Err(err).context(error::DrainerSnafu { node_name });
            }
            Ok(Ok(completed)) => completed,
        };

        if !completed {
            self.metrics.op("drain_requeue");
            return Ok(ReconcileOutcome::RequeueAfter(self.drain_requeue));
        }

        self.client
            .set_drain_grant(&node_name, DrainGrant::DrainComplete)
            .await
            .context(error::DrainClientSnafu)?;
        let outcome = if request == DrainRequest::RebootRequired {
            DrainEvent::reboot_node()
        } else {
            DrainEvent::drain_succeeded()
        };
        if let Err(err) = self
            .client
            .publish_event(node_reference(node), &outcome)
            .await
        {
            event!(Level::WARN, error = %err, "Unable to publish drain event.");
        }
        self.metrics.op("drain_complete");
        Ok(ReconcileOutcome::Done)
    }

    /// Steady state after a completed drain. An administrator uncordoning the node out from
    /// under its grant is logged but never fought.
    async fn hold_complete(&self, node: &Node) -> Result<ReconcileOutcome> {
        if !is_unschedulable(node) {
            event!(
                Level::WARN,
                node = %node.name_any(),
                "Node holds a completed drain grant but is schedulable; leaving state unchanged."
            );
        }
        self.metrics.no_op();
        Ok(ReconcileOutcome::Done)
    }

    /// The agent released the node: unwind the platform hooks, uncordon, idle the grant. Runs
    /// for cancellations mid-drain exactly as for orderly completions.
    async fn return_to_idle(&self, node: &Node) -> Result<ReconcileOutcome> {
        let node_name = node.name_any();
        let ready = match self.platform.complete_drain(node).await {
            Ok(ready) => ready,
            Err(err) => {
                self.publish_drain_failure(node, err.to_string()).await;
                return Err(err).context(error::PlatformHookSnafu { node_name });
            }
        };
        if !ready {
            return Ok(ReconcileOutcome::RequeueAfter(self.drain_requeue));
        }

        if is_unschedulable(node) {
            self.client
                .uncordon_node(&node_name)
                .await
                .context(error::DrainClientSnafu)?;
        }
        self.client
            .set_drain_grant(&node_name, DrainGrant::Idle)
            .await
            .context(error::DrainClientSnafu)?;
        self.metrics.op("release");
        Ok(ReconcileOutcome::Done)
    }

    async fn before_drain(&self, node: &Node) -> Result<PlatformReadiness> {
        match self.platform.before_drain(node).await {
            Ok(readiness) => Ok(readiness),
            Err(err) => {
                self.publish_drain_failure(node, err.to_string()).await;
                Err(err).context(error::PlatformHookSnafu {
                    node_name: node.name_any(),
                })
            }
        }
    }

    /// Resolves this node's pool from live state, surfacing configuration mistakes as a
    /// Warning event on the offending pool config.
    async fn resolve_pool(&self, node: &Node) -> Result<PoolAssignment> {
        let nodes = self
            .client
            .list_nodes()
            .await
            .context(error::DrainClientSnafu)?;
        let pool_configs = self
            .client
            .list_pool_configs()
            .await
            .context(error::DrainClientSnafu)?;

        match pools::assign_pool(node, &nodes, &pool_configs) {
            Ok(assignment) => Ok(assignment),
            Err(err) => {
                if let Some(pool_config) = pool_configs
                    .iter()
                    .find(|config| config.name_any() == err.pool_name())
                {
                    let outcome = DrainEvent::config_error(err.to_string());
                    if let Err(publish_err) = self
                        .client
                        .publish_event(pool_config_reference(pool_config), &outcome)
                        .await
                    {
                        event!(
                            Level::WARN,
                            error = %publish_err,
                            "Unable to publish config error event."
                        );
                    }
                }
                Err(err).context(error::PoolConfigSnafu)
            }
        }
    }

    async fn publish_drain_failure(&self, node: &Node, note: String) {
        let outcome = DrainEvent::drain_failed(note);
        if let Err(err) = self
            .client
            .publish_event(node_reference(node), &outcome)
            .await
        {
            event!(Level::WARN, error = %err, "Unable to publish drain failure event.");
        }
    }
}

/// Nodes in the pool whose grant consumes a budget slot right now.
fn count_draining(
    assignment: &PoolAssignment,
    node_states: &[SriovNetworkNodeState],
) -> Result<usize> {
    let mut draining = 0;
    for state in node_states {
        if !assignment.members.contains(&state.name_any()) {
            continue;
        }
        if let Some(grant) = DrainGrant::from_node_state(state).context(error::DrainClientSnafu)? {
            if grant.consumes_slot() {
                draining += 1;
            }
        }
    }
    Ok(draining)
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::constants::{NODE_DRAIN_ANNOTATION, NODE_STATE_DRAIN_ANNOTATION_CURRENT};
    use models::node::drain::MockDrainer;
    use models::node::{
        MockDrainClient, SriovNetworkNodeStateSpec, SriovNetworkPoolConfig,
        SriovNetworkPoolConfigSpec,
    };

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::ObjectMeta;
    use mockall::mock;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    mock! {
        pub Platform {}
        #[async_trait]
        impl PlatformIntegration for Platform {
            async fn before_drain(
                &self,
                node: &Node,
            ) -> std::result::Result<PlatformReadiness, crate::platform::error::Error>;
            async fn complete_drain(
                &self,
                node: &Node,
            ) -> std::result::Result<bool, crate::platform::error::Error>;
        }

        impl Clone for Platform {
            fn clone(&self) -> Self;
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            namespace: "sriov-test".to_string(),
            cluster_type: "kubernetes".to_string(),
            max_parallel_reconciles: 1,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            drain_requeue: Duration::from_secs(5),
            drain_deadline: Duration::from_secs(30),
        }
    }

    fn test_controller(
        client: MockDrainClient,
        drainer: MockDrainer,
        platform: MockPlatform,
    ) -> DrainController<Arc<MockDrainClient>, Arc<MockDrainer>, Arc<MockPlatform>> {
        DrainController::new(
            Arc::new(client),
            Arc::new(drainer),
            Arc::new(platform),
            &test_config(),
        )
    }

    fn test_node(name: &str, request: Option<&str>, unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: request.map(|value| {
                    BTreeMap::from([(NODE_DRAIN_ANNOTATION.to_string(), value.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn test_node_state(name: &str, grant: Option<DrainGrant>) -> SriovNetworkNodeState {
        let mut node_state = SriovNetworkNodeState::new(name, SriovNetworkNodeStateSpec::default());
        if let Some(grant) = grant {
            node_state.metadata.annotations = Some(BTreeMap::from([(
                NODE_STATE_DRAIN_ANNOTATION_CURRENT.to_string(),
                grant.to_string(),
            )]));
        }
        node_state
    }

    fn default_pool_config(max_unavailable: i32) -> SriovNetworkPoolConfig {
        SriovNetworkPoolConfig::new(
            "default",
            SriovNetworkPoolConfigSpec {
                node_selector: Some(LabelSelector::default()),
                max_unavailable: Some(IntOrString::Int(max_unavailable)),
            },
        )
    }

    #[tokio::test]
    async fn missing_node_is_a_noop() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .with(eq("node1"))
            .returning(|_| Ok(None))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), MockPlatform::new());
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn converged_idle_node_issues_no_writes() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Idle"), false))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Idle)))))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), MockPlatform::new());
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn requesting_node_is_admitted_within_budget() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), false))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Idle)))))
            .times(1);
        client
            .expect_list_nodes()
            .returning(|| {
                Ok(vec![
                    test_node("node1", Some("Drain_Required"), false),
                    test_node("node2", Some("Idle"), false),
                ])
            })
            .times(1);
        client
            .expect_list_pool_configs()
            .returning(|| Ok(vec![default_pool_config(1)]))
            .times(1);
        client
            .expect_list_node_states()
            .returning(|| {
                Ok(vec![
                    test_node_state("node1", Some(DrainGrant::Idle)),
                    test_node_state("node2", Some(DrainGrant::Idle)),
                ])
            })
            .times(1);
        client
            .expect_cordon_node()
            .with(eq("node1"))
            .returning(|_| Ok(()))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::Draining))
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: false }))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::RequeueAfter(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn admission_is_held_when_the_pool_is_saturated() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), false))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Idle)))))
            .times(1);
        client
            .expect_list_nodes()
            .returning(|| {
                Ok(vec![
                    test_node("node1", Some("Drain_Required"), false),
                    test_node("node2", Some("Drain_Required"), true),
                ])
            })
            .times(1);
        client
            .expect_list_pool_configs()
            .returning(|| Ok(vec![default_pool_config(1)]))
            .times(1);
        client
            .expect_list_node_states()
            .returning(|| {
                Ok(vec![
                    test_node_state("node1", Some(DrainGrant::Idle)),
                    test_node_state("node2", Some(DrainGrant::DrainComplete)),
                ])
            })
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), MockPlatform::new());
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::RequeueAfter(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn uncapped_pool_admits_everyone() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), false))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Idle)))))
            .times(1);
        client
            .expect_list_nodes()
            .returning(|| {
                Ok(vec![
                    test_node("node1", Some("Drain_Required"), false),
                    test_node("node2", Some("Drain_Required"), true),
                    test_node("node3", Some("Drain_Required"), true),
                ])
            })
            .times(1);
        client
            .expect_list_pool_configs()
            .returning(|| {
                Ok(vec![SriovNetworkPoolConfig::new(
                    "default",
                    SriovNetworkPoolConfigSpec {
                        node_selector: Some(LabelSelector::default()),
                        max_unavailable: None,
                    },
                )])
            })
            .times(1);
        client
            .expect_list_node_states()
            .returning(|| {
                Ok(vec![
                    test_node_state("node1", Some(DrainGrant::Idle)),
                    test_node_state("node2", Some(DrainGrant::Draining)),
                    test_node_state("node3", Some(DrainGrant::DrainComplete)),
                ])
            })
            .times(1);
        client
            .expect_cordon_node()
            .returning(|_| Ok(()))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::Draining))
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: false }))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::RequeueAfter(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn labeled_pool_with_spare_budget_admits_a_second_node() {
        fn labeled_node(name: &str, request: &str, unschedulable: bool) -> Node {
            let mut node = test_node(name, Some(request), unschedulable);
            node.metadata.labels =
                Some(BTreeMap::from([("test".to_string(), String::new())]));
            node
        }
        let pool = SriovNetworkPoolConfig::new(
            "test-workers",
            SriovNetworkPoolConfigSpec {
                node_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("test".to_string(), String::new())])),
                    ..Default::default()
                }),
                max_unavailable: Some(IntOrString::Int(2)),
            },
        );

        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(labeled_node("node2", "Drain_Required", false))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node2", Some(DrainGrant::Idle)))))
            .times(1);
        client
            .expect_list_nodes()
            .returning(|| {
                Ok(vec![
                    labeled_node("node1", "Drain_Required", true),
                    labeled_node("node2", "Drain_Required", false),
                    labeled_node("node3", "Drain_Required", false),
                ])
            })
            .times(1);
        client
            .expect_list_pool_configs()
            .returning(move || Ok(vec![pool.clone()]))
            .times(1);
        client
            .expect_list_node_states()
            .returning(|| {
                Ok(vec![
                    test_node_state("node1", Some(DrainGrant::DrainComplete)),
                    test_node_state("node2", Some(DrainGrant::Idle)),
                    test_node_state("node3", Some(DrainGrant::Idle)),
                ])
            })
            .times(1);
        client
            .expect_cordon_node()
            .with(eq("node2"))
            .returning(|_| Ok(()))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node2"), eq(DrainGrant::Draining))
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: false }))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), platform);
        assert_eq!(
            controller.reconcile("node2").await.unwrap(),
            ReconcileOutcome::RequeueAfter(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn completed_drain_advances_the_grant_and_publishes() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), true))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Draining)))))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::DrainComplete))
            .returning(|_, _| Ok(()))
            .times(1);
        client
            .expect_publish_event()
            .withf(|_, outcome| outcome.reason == "DrainSucceeded")
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: false }))
            .times(1);

        let mut drainer = MockDrainer::new();
        drainer
            .expect_drain_node()
            .with(eq("node1"))
            .returning(|_| Ok(true))
            .times(1);

        let controller = test_controller(client, drainer, platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn reboot_requests_publish_a_reboot_event() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Reboot_Required"), true))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Draining)))))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::DrainComplete))
            .returning(|_, _| Ok(()))
            .times(1);
        client
            .expect_publish_event()
            .withf(|_, outcome| outcome.reason == "RebootNode")
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: false }))
            .times(1);

        let mut drainer = MockDrainer::new();
        drainer.expect_drain_node().returning(|_| Ok(true)).times(1);

        let controller = test_controller(client, drainer, platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn incomplete_drain_is_requeued_without_advancing() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), true))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Draining)))))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: false }))
            .times(1);

        let mut drainer = MockDrainer::new();
        drainer.expect_drain_node().returning(|_| Ok(false)).times(1);

        let controller = test_controller(client, drainer, platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::RequeueAfter(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn paused_platform_upgrades_the_grant() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), true))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Draining)))))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::DrainMcpPaused))
            .returning(|_, _| Ok(()))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::DrainComplete))
            .returning(|_, _| Ok(()))
            .times(1);
        client
            .expect_publish_event()
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: true }))
            .times(1);

        let mut drainer = MockDrainer::new();
        drainer.expect_drain_node().returning(|_| Ok(true)).times(1);

        let controller = test_controller(client, drainer, platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn released_node_is_uncordoned_and_idled() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Idle"), true))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::Draining)))))
            .times(1);
        client
            .expect_uncordon_node()
            .with(eq("node1"))
            .returning(|_| Ok(()))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::Idle))
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_complete_drain()
            .returning(|_| Ok(true))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn admin_uncordon_is_logged_but_not_fought() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), false))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", Some(DrainGrant::DrainComplete)))))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), MockPlatform::new());
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn missing_grant_is_initialized_to_idle() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", None, false))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", None))))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::Idle))
            .returning(|_, _| Ok(()))
            .times(1);

        let controller = test_controller(client, MockDrainer::new(), MockPlatform::new());
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn interrupted_drain_resumes_without_readmission() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(test_node("node1", Some("Drain_Required"), true))))
            .times(1);
        client
            .expect_get_node_state()
            .returning(|_| Ok(Some(test_node_state("node1", None))))
            .times(1);
        client
            .expect_set_drain_grant()
            .with(eq("node1"), eq(DrainGrant::Draining))
            .returning(|_, _| Ok(()))
            .times(1);

        let mut platform = MockPlatform::new();
        platform
            .expect_before_drain()
            .returning(|_| Ok(PlatformReadiness::Ready { pool_paused: false }))
            .times(1);

        let mut drainer = MockDrainer::new();
        drainer.expect_drain_node().returning(|_| Ok(false)).times(1);

        let controller = test_controller(client, drainer, platform);
        assert_eq!(
            controller.reconcile("node1").await.unwrap(),
            ReconcileOutcome::RequeueAfter(Duration::from_secs(5))
        );
    }
}
