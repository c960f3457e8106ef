use super::error::{self, Result};
use super::{DrainGrant, SriovNetworkNodeState, SriovNetworkPoolConfig};
use crate::constants::{self, NODE_STATE_DRAIN_ANNOTATION_CURRENT};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::ResourceExt;
use serde::Serialize;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

/// Outcome reported on a cluster object as a Kubernetes Event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DrainEvent {
    pub reason: &'static str,
    pub note: String,
    pub warning: bool,
}

impl DrainEvent {
    pub fn drain_succeeded() -> Self {
        DrainEvent {
            reason: "DrainSucceeded",
            note: "node drained and cordoned".to_string(),
            warning: false,
        }
    }

    pub fn reboot_node() -> Self {
        DrainEvent {
            reason: "RebootNode",
            note: "node drained and cordoned; agent may reboot".to_string(),
            warning: false,
        }
    }

    pub fn drain_failed(note: String) -> Self {
        DrainEvent {
            reason: "DrainFailed",
            note,
            warning: true,
        }
    }

    pub fn config_error(note: String) -> Self {
        DrainEvent {
            reason: "ConfigError",
            note,
            warning: true,
        }
    }
}

/// Builds an Event reference for a Node.
pub fn node_reference(node: &Node) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: node.metadata.name.clone(),
        uid: node.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Builds an Event reference for a drain pool config.
pub fn pool_config_reference(pool_config: &SriovNetworkPoolConfig) -> ObjectReference {
    ObjectReference {
        api_version: Some(constants::API_VERSION.to_string()),
        kind: Some("SriovNetworkPoolConfig".to_string()),
        name: pool_config.metadata.name.clone(),
        namespace: pool_config.metadata.namespace.clone(),
        uid: pool_config.metadata.uid.clone(),
        ..Default::default()
    }
}

#[async_trait]
/// A trait providing the drain controller's view of the cluster. This is provided as a trait in
/// order to allow mocks to be used for testing purposes. All reads go straight to the API server
/// so admission decisions are made on live state, not on a stale cache.
pub trait DrainClient: Clone + Sized + Send + Sync {
    async fn get_node(&self, node_name: &str) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn get_node_state(&self, node_name: &str) -> Result<Option<SriovNetworkNodeState>>;
    async fn list_node_states(&self) -> Result<Vec<SriovNetworkNodeState>>;
    async fn list_pool_configs(&self) -> Result<Vec<SriovNetworkPoolConfig>>;
    /// Write the grant annotation on a node state object. Implementations read first and only
    /// issue a patch when the observed value differs.
    async fn set_drain_grant(&self, node_name: &str, grant: DrainGrant) -> Result<()>;
    async fn cordon_node(&self, node_name: &str) -> Result<()>;
    async fn uncordon_node(&self, node_name: &str) -> Result<()>;
    async fn publish_event(&self, reference: ObjectReference, outcome: &DrainEvent) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock DrainClient for use in tests.
    pub DrainClient {}
    #[async_trait]
    impl DrainClient for DrainClient {
        async fn get_node(&self, node_name: &str) -> Result<Option<Node>>;
        async fn list_nodes(&self) -> Result<Vec<Node>>;
        async fn get_node_state(&self, node_name: &str) -> Result<Option<SriovNetworkNodeState>>;
        async fn list_node_states(&self) -> Result<Vec<SriovNetworkNodeState>>;
        async fn list_pool_configs(&self) -> Result<Vec<SriovNetworkPoolConfig>>;
        async fn set_drain_grant(&self, node_name: &str, grant: DrainGrant) -> Result<()>;
        async fn cordon_node(&self, node_name: &str) -> Result<()>;
        async fn uncordon_node(&self, node_name: &str) -> Result<()>;
        async fn publish_event(
            &self,
            reference: ObjectReference,
            outcome: &DrainEvent,
        ) -> Result<()>;
    }

    impl Clone for DrainClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> DrainClient for Arc<T>
where
    T: DrainClient,
{
    async fn get_node(&self, node_name: &str) -> Result<Option<Node>> {
        (**self).get_node(node_name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        (**self).list_nodes().await
    }

    async fn get_node_state(&self, node_name: &str) -> Result<Option<SriovNetworkNodeState>> {
        (**self).get_node_state(node_name).await
    }

    async fn list_node_states(&self) -> Result<Vec<SriovNetworkNodeState>> {
        (**self).list_node_states().await
    }

    async fn list_pool_configs(&self) -> Result<Vec<SriovNetworkPoolConfig>> {
        (**self).list_pool_configs().await
    }

    async fn set_drain_grant(&self, node_name: &str, grant: DrainGrant) -> Result<()> {
        (**self).set_drain_grant(node_name, grant).await
    }

    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        (**self).cordon_node(node_name).await
    }

    async fn uncordon_node(&self, node_name: &str) -> Result<()> {
        (**self).uncordon_node(node_name).await
    }

    async fn publish_event(&self, reference: ObjectReference, outcome: &DrainEvent) -> Result<()> {
        (**self).publish_event(reference, outcome).await
    }
}

#[derive(Debug, Serialize)]
/// A helper struct used to serialize and send patches to the k8s API to modify the grant
/// annotation on a node state object.
struct GrantAnnotationPatch {
    metadata: GrantAnnotationPatchMetadata,
}

#[derive(Debug, Serialize)]
struct GrantAnnotationPatchMetadata {
    annotations: BTreeMap<String, String>,
}

impl GrantAnnotationPatch {
    fn new(grant: DrainGrant) -> Self {
        GrantAnnotationPatch {
            metadata: GrantAnnotationPatchMetadata {
                annotations: BTreeMap::from([(
                    NODE_STATE_DRAIN_ANNOTATION_CURRENT.to_string(),
                    grant.to_string(),
                )]),
            },
        }
    }
}

#[derive(Clone)]
/// Concrete implementation of the `DrainClient` trait. This implementation will almost certainly
/// be used in any case that isn't a unit test.
pub struct K8sDrainClient {
    k8s_client: kube::client::Client,
    namespace: String,
    reporter: Reporter,
}

impl K8sDrainClient {
    pub fn new(k8s_client: kube::client::Client, namespace: &str) -> Self {
        K8sDrainClient {
            k8s_client,
            namespace: namespace.to_string(),
            reporter: Reporter {
                controller: constants::CONTROLLER.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.k8s_client.clone())
    }

    fn node_states(&self) -> Api<SriovNetworkNodeState> {
        Api::namespaced(self.k8s_client.clone(), &self.namespace)
    }

    fn pool_configs(&self) -> Api<SriovNetworkPoolConfig> {
        Api::namespaced(self.k8s_client.clone(), &self.namespace)
    }
}

#[async_trait]
impl DrainClient for K8sDrainClient {
    #[instrument(skip(self), err)]
    async fn get_node(&self, node_name: &str) -> Result<Option<Node>> {
        self.nodes()
            .get_opt(node_name)
            .await
            .context(error::GetNodeSnafu { node_name })
    }

    #[instrument(skip(self), err)]
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .nodes()
            .list(&ListParams::default())
            .await
            .context(error::ListNodesSnafu)?
            .items)
    }

    #[instrument(skip(self), err)]
    async fn get_node_state(&self, node_name: &str) -> Result<Option<SriovNetworkNodeState>> {
        self.node_states()
            .get_opt(node_name)
            .await
            .context(error::GetNodeStateSnafu { node_name })
    }

    #[instrument(skip(self), err)]
    async fn list_node_states(&self) -> Result<Vec<SriovNetworkNodeState>> {
        Ok(self
            .node_states()
            .list(&ListParams::default())
            .await
            .context(error::ListNodeStatesSnafu)?
            .items)
    }

    #[instrument(skip(self), err)]
    async fn list_pool_configs(&self) -> Result<Vec<SriovNetworkPoolConfig>> {
        Ok(self
            .pool_configs()
            .list(&ListParams::default())
            .await
            .context(error::ListPoolConfigsSnafu)?
            .items)
    }

    #[instrument(skip(self), err)]
    async fn set_drain_grant(&self, node_name: &str, grant: DrainGrant) -> Result<()> {
        let api = self.node_states();
        let node_state = api
            .get(node_name)
            .await
            .context(error::GetNodeStateSnafu { node_name })?;

        let desired = grant.to_string();
        if node_state.annotations().get(NODE_STATE_DRAIN_ANNOTATION_CURRENT) == Some(&desired) {
            return Ok(());
        }

        let patch = serde_json::to_value(GrantAnnotationPatch::new(grant))
            .context(error::CreateK8sPatchSnafu)?;
        api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::UpdateDrainGrantSnafu { node_name })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        self.nodes()
            .cordon(node_name)
            .await
            .context(error::CordonNodeSnafu { node_name })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn uncordon_node(&self, node_name: &str) -> Result<()> {
        self.nodes()
            .uncordon(node_name)
            .await
            .context(error::UncordonNodeSnafu { node_name })?;
        Ok(())
    }

    #[instrument(skip(self, reference), err)]
    async fn publish_event(&self, reference: ObjectReference, outcome: &DrainEvent) -> Result<()> {
        let object = reference.name.clone().unwrap_or_default();
        let recorder = Recorder::new(self.k8s_client.clone(), self.reporter.clone(), reference);
        recorder
            .publish(Event {
                type_: if outcome.warning {
                    EventType::Warning
                } else {
                    EventType::Normal
                },
                reason: outcome.reason.to_string(),
                note: Some(outcome.note.clone()),
                action: "Drain".to_string(),
                secondary: None,
            })
            .await
            .context(error::PublishEventSnafu { object })?;
        Ok(())
    }
}
