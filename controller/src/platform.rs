//! Platform integration hooks that run around a drain.
//!
//! On clusters with a rolling machine-config subsystem, draining a node while its pool is
//! mid-rollout would compound two disruptions; the platform adapter pauses the governing pool
//! before the drain proceeds and unpauses it once every node in the pool has been released.
//! Plain Kubernetes clusters plug in the no-op adapter.

use crate::pools::selector_matches;
use models::constants::{
    CLUSTER_TYPE_OPENSHIFT, MASTER_MCP_NAME, MC_CURRENT_CONFIG_ANNOTATION,
    MC_DESIRED_CONFIG_ANNOTATION,
};
use models::mcp::MachineConfigPool;
use models::node::{DrainGrant, SriovNetworkNodeState};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde::Serialize;
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, error::Error>;

/// What the platform reports ahead of a drain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PlatformReadiness {
    /// The platform cannot lose this node yet; try again later.
    Pending,
    /// The node may drain. `pool_paused` records whether a rolling-config pool was paused on
    /// its behalf, which the coordinator reflects in the grant it writes.
    Ready { pool_paused: bool },
}

#[async_trait]
/// Hooks invoked before a drain begins and after the agent releases the node. Both must be safe
/// to call repeatedly: the coordinator re-runs them on every reconcile until they report ready.
pub trait PlatformIntegration: Clone + Sized + Send + Sync {
    async fn before_drain(&self, node: &Node) -> Result<PlatformReadiness>;
    async fn complete_drain(&self, node: &Node) -> Result<bool>;
}

#[async_trait]
impl<T> PlatformIntegration for Arc<T>
where
    T: PlatformIntegration,
{
    async fn before_drain(&self, node: &Node) -> Result<PlatformReadiness> {
        (**self).before_drain(node).await
    }

    async fn complete_drain(&self, node: &Node) -> Result<bool> {
        (**self).complete_drain(node).await
    }
}

#[derive(Copy, Clone, Debug, Default)]
/// Used on orchestrators without a rolling-config subsystem.
pub struct NoopPlatform;

#[async_trait]
impl PlatformIntegration for NoopPlatform {
    async fn before_drain(&self, _node: &Node) -> Result<PlatformReadiness> {
        Ok(PlatformReadiness::Ready { pool_paused: false })
    }

    async fn complete_drain(&self, _node: &Node) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Clone)]
/// Pauses and unpauses the MachineConfigPool governing a draining node.
pub struct OpenshiftPlatform {
    k8s_client: kube::client::Client,
    namespace: String,
}

impl OpenshiftPlatform {
    pub fn new(k8s_client: kube::client::Client, namespace: &str) -> Self {
        OpenshiftPlatform {
            k8s_client,
            namespace: namespace.to_string(),
        }
    }

    fn machine_config_pools(&self) -> Api<MachineConfigPool> {
        Api::all(self.k8s_client.clone())
    }

    /// The pool whose selector claims this node, preferring non-master pools on ambiguity.
    async fn governing_pool(&self, node: &Node) -> Result<Option<MachineConfigPool>> {
        let pools = self
            .machine_config_pools()
            .list(&ListParams::default())
            .await
            .context(error::ListMachineConfigPoolsSnafu)?
            .items;

        let mut matching = Vec::new();
        for pool in pools {
            let selected = selector_matches(
                pool.spec.node_selector.as_ref(),
                node.labels(),
                &pool.name_any(),
            )
            .context(error::PoolSelectorSnafu)?;
            if selected {
                matching.push(pool);
            }
        }
        matching.sort_by_key(|pool| {
            // master sorts last so worker-style pools win when both select the node
            (pool.name_any() == MASTER_MCP_NAME, pool.name_any())
        });
        Ok(matching.into_iter().next())
    }

    async fn set_paused(&self, pool_name: &str, paused: bool) -> Result<()> {
        event!(Level::INFO, pool = pool_name, paused, "Updating machine config pool pause state.");
        let patch = PausePatch {
            spec: PausePatchSpec { paused },
        };
        self.machine_config_pools()
            .patch(pool_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::PauseMachineConfigPoolSnafu { pool: pool_name })?;
        Ok(())
    }

    /// Whether any other node governed by this pool still holds a paused-pool grant. Unpausing
    /// under such a node would let a config rollout race its drain.
    async fn pool_still_draining(&self, node: &Node, pool: &MachineConfigPool) -> Result<bool> {
        let node_states: Api<SriovNetworkNodeState> =
            Api::namespaced(self.k8s_client.clone(), &self.namespace);
        let states = node_states
            .list(&ListParams::default())
            .await
            .context(error::ReadFleetSnafu)?
            .items;
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        let nodes = nodes
            .list(&ListParams::default())
            .await
            .context(error::ReadFleetSnafu)?
            .items;

        for state in states {
            if state.name_any() == node.name_any() {
                continue;
            }
            let member = match nodes.iter().find(|n| n.name_any() == state.name_any()) {
                Some(member) => member,
                None => continue,
            };
            let selected = selector_matches(
                pool.spec.node_selector.as_ref(),
                member.labels(),
                &pool.name_any(),
            )
            .context(error::PoolSelectorSnafu)?;
            if !selected {
                continue;
            }
            if DrainGrant::from_node_state(&state).context(error::ParseGrantSnafu)?
                == Some(DrainGrant::DrainMcpPaused)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl PlatformIntegration for OpenshiftPlatform {
    #[instrument(skip(self, node), fields(node = %node.name_any()), err)]
    async fn before_drain(&self, node: &Node) -> Result<PlatformReadiness> {
        // A node mid-rollout is already being disrupted by the machine-config operator; wait it
        // out rather than stacking a drain on top.
        if config_rollout_in_flight(node) {
            event!(
                Level::INFO,
                node = %node.name_any(),
                "Machine config rollout in flight; delaying drain."
            );
            return Ok(PlatformReadiness::Pending);
        }

        let pool = match self.governing_pool(node).await? {
            None => return Ok(PlatformReadiness::Ready { pool_paused: false }),
            Some(pool) => pool,
        };

        // The control-plane pool is never paused on our behalf.
        if pool.name_any() == MASTER_MCP_NAME {
            return Ok(PlatformReadiness::Ready { pool_paused: false });
        }

        if !pool.spec.paused {
            self.set_paused(&pool.name_any(), true).await?;
        }
        Ok(PlatformReadiness::Ready { pool_paused: true })
    }

    #[instrument(skip(self, node), fields(node = %node.name_any()), err)]
    async fn complete_drain(&self, node: &Node) -> Result<bool> {
        let pool = match self.governing_pool(node).await? {
            None => return Ok(true),
            Some(pool) => pool,
        };
        if pool.name_any() == MASTER_MCP_NAME || !pool.spec.paused {
            return Ok(true);
        }

        if self.pool_still_draining(node, &pool).await? {
            event!(
                Level::INFO,
                pool = %pool.name_any(),
                "Other nodes in the machine config pool are still draining; leaving it paused."
            );
            return Ok(true);
        }

        self.set_paused(&pool.name_any(), false).await?;
        Ok(true)
    }
}

#[derive(Clone)]
/// Startup-time dispatch between the supported platform adapters.
pub enum PlatformAdapter {
    Noop(NoopPlatform),
    Openshift(OpenshiftPlatform),
}

impl PlatformAdapter {
    pub fn from_cluster_type(
        k8s_client: kube::client::Client,
        namespace: &str,
        cluster_type: &str,
    ) -> Self {
        if cluster_type.eq_ignore_ascii_case(CLUSTER_TYPE_OPENSHIFT) {
            PlatformAdapter::Openshift(OpenshiftPlatform::new(k8s_client, namespace))
        } else {
            PlatformAdapter::Noop(NoopPlatform)
        }
    }
}

#[async_trait]
impl PlatformIntegration for PlatformAdapter {
    async fn before_drain(&self, node: &Node) -> Result<PlatformReadiness> {
        match self {
            PlatformAdapter::Noop(platform) => platform.before_drain(node).await,
            PlatformAdapter::Openshift(platform) => platform.before_drain(node).await,
        }
    }

    async fn complete_drain(&self, node: &Node) -> Result<bool> {
        match self {
            PlatformAdapter::Noop(platform) => platform.complete_drain(node).await,
            PlatformAdapter::Openshift(platform) => platform.complete_drain(node).await,
        }
    }
}

/// Whether the machine-config operator is still converging this node onto a new config.
fn config_rollout_in_flight(node: &Node) -> bool {
    let annotations = node.annotations();
    match (
        annotations.get(MC_DESIRED_CONFIG_ANNOTATION),
        annotations.get(MC_CURRENT_CONFIG_ANNOTATION),
    ) {
        (Some(desired), Some(current)) => desired != current,
        _ => false,
    }
}

#[derive(Debug, Serialize)]
struct PausePatch {
    spec: PausePatchSpec,
}

#[derive(Debug, Serialize)]
struct PausePatchSpec {
    paused: bool,
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to list machine config pools: {}", source))]
        ListMachineConfigPools { source: kube::Error },

        #[snafu(display(
            "Unable to update pause state on machine config pool '{}': {}",
            pool,
            source
        ))]
        PauseMachineConfigPool {
            source: kube::Error,
            pool: String,
        },

        #[snafu(display("Unable to read fleet state: {}", source))]
        ReadFleet { source: kube::Error },

        #[snafu(display("Invalid machine config pool selector: {}", source))]
        PoolSelector {
            source: crate::pools::error::Error,
        },

        #[snafu(display("Unable to parse drain grant: {}", source))]
        ParseGrant {
            source: models::node::error::Error,
        },
    }
}
