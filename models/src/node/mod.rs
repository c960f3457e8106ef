mod client;
mod crd;
pub mod drain;
pub mod error;

pub use self::client::*;
pub use self::crd::*;
pub use self::error::Error as DrainHandshakeError;
use error::Result;

use crate::constants::{NODE_DRAIN_ANNOTATION, NODE_STATE_DRAIN_ANNOTATION_CURRENT};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

#[cfg(feature = "mockall")]
pub use self::client::MockDrainClient;

/// The request side of the drain handshake, written on the Node by the per-node agent and never
/// by the drain controller. The serialized forms are part of the agent protocol and must remain
/// stable across versions.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum DrainRequest {
    /// The agent needs nothing. A node holding a grant must be uncordoned and released.
    Idle,
    /// The agent asks for the node to be drained before it reconfigures hardware.
    #[serde(rename = "Drain_Required")]
    DrainRequired,
    /// As `DrainRequired`, but the agent intends to reboot once the drain completes.
    #[serde(rename = "Reboot_Required")]
    RebootRequired,
}

impl Default for DrainRequest {
    fn default() -> Self {
        DrainRequest::Idle
    }
}

serde_plain::derive_display_from_serialize!(DrainRequest);
serde_plain::derive_fromstr_from_deserialize!(DrainRequest);

impl DrainRequest {
    /// Reads the request annotation from a Node. A missing annotation counts as `Idle`; an
    /// unrecognized value is an error and must not advance the state machine.
    pub fn from_node(node: &Node) -> Result<Self> {
        match node.annotations().get(NODE_DRAIN_ANNOTATION) {
            None => Ok(DrainRequest::Idle),
            Some(value) => value.parse().context(error::UnknownAnnotationValueSnafu {
                annotation: NODE_DRAIN_ANNOTATION,
                value: value.clone(),
                object: node.name_any(),
            }),
        }
    }

    /// Whether the agent is asking for the node to be evacuated.
    pub fn wants_drain(&self) -> bool {
        matches!(self, Self::DrainRequired | Self::RebootRequired)
    }
}

/// The grant side of the drain handshake, written on the SriovNetworkNodeState exclusively by
/// the drain controller. The per-node agent polls this value and only touches hardware once it
/// reads `DrainComplete`.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
pub enum DrainGrant {
    /// No drain activity for this node.
    Idle,
    /// Admitted against the pool budget, not yet cordoned. Written rarely; the controller
    /// normally advances straight to `Draining` within one reconcile.
    #[serde(rename = "Drain_Required")]
    DrainRequired,
    /// The node is cordoned, or platform hooks are still pending.
    Draining,
    /// Draining, and the governing machine-config pool has been paused for the duration.
    #[serde(rename = "Draining_MCP_Paused")]
    DrainMcpPaused,
    /// The node is cordoned and evacuated; the agent may proceed.
    DrainComplete,
}

impl Default for DrainGrant {
    fn default() -> Self {
        DrainGrant::Idle
    }
}

serde_plain::derive_display_from_serialize!(DrainGrant);
serde_plain::derive_fromstr_from_deserialize!(DrainGrant);

impl DrainGrant {
    /// Reads the grant annotation from a node state object. Returns `None` when the annotation
    /// has not been initialized yet.
    pub fn from_node_state(node_state: &SriovNetworkNodeState) -> Result<Option<Self>> {
        node_state
            .annotations()
            .get(NODE_STATE_DRAIN_ANNOTATION_CURRENT)
            .map(|value| {
                value.parse().context(error::UnknownAnnotationValueSnafu {
                    annotation: NODE_STATE_DRAIN_ANNOTATION_CURRENT,
                    value: value.clone(),
                    object: node_state.name_any(),
                })
            })
            .transpose()
    }

    /// Whether a node holding this grant counts toward its pool's `maxUnavailable` budget.
    /// The slot is consumed from admission until the agent releases the node: an admitted but
    /// not-yet-cordoned node already holds it, and a completed drain keeps holding it.
    pub fn consumes_slot(&self) -> bool {
        matches!(
            self,
            Self::DrainRequired | Self::Draining | Self::DrainMcpPaused | Self::DrainComplete
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NODE_DRAIN_ANNOTATION;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn request_wire_values_are_stable() {
        let cases = vec![
            (DrainRequest::Idle, "Idle"),
            (DrainRequest::DrainRequired, "Drain_Required"),
            (DrainRequest::RebootRequired, "Reboot_Required"),
        ];
        for (request, expected) in cases {
            assert_eq!(request.to_string(), expected);
            assert_eq!(expected.parse::<DrainRequest>().unwrap(), request);
        }
    }

    #[test]
    fn grant_wire_values_are_stable() {
        let cases = vec![
            (DrainGrant::Idle, "Idle"),
            (DrainGrant::DrainRequired, "Drain_Required"),
            (DrainGrant::Draining, "Draining"),
            (DrainGrant::DrainMcpPaused, "Draining_MCP_Paused"),
            (DrainGrant::DrainComplete, "DrainComplete"),
        ];
        for (grant, expected) in cases {
            assert_eq!(grant.to_string(), expected);
            assert_eq!(expected.parse::<DrainGrant>().unwrap(), grant);
        }
    }

    fn node_with_request(value: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node1".to_string()),
                annotations: value.map(|value| {
                    BTreeMap::from([(NODE_DRAIN_ANNOTATION.to_string(), value.to_string())])
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn missing_request_annotation_reads_as_idle() {
        let request = DrainRequest::from_node(&node_with_request(None)).unwrap();
        assert_eq!(request, DrainRequest::Idle);
    }

    #[test]
    fn unknown_request_annotation_is_an_error() {
        assert!(DrainRequest::from_node(&node_with_request(Some("Drain_Mandatory"))).is_err());
    }

    #[test]
    fn admitted_grants_consume_pool_slots() {
        assert!(!DrainGrant::Idle.consumes_slot());
        assert!(DrainGrant::DrainRequired.consumes_slot());
        assert!(DrainGrant::Draining.consumes_slot());
        assert!(DrainGrant::DrainMcpPaused.consumes_slot());
        assert!(DrainGrant::DrainComplete.consumes_slot());
    }

    #[test]
    fn uninitialized_grant_reads_as_none() {
        let node_state =
            SriovNetworkNodeState::new("node1", SriovNetworkNodeStateSpec::default());
        assert_eq!(DrainGrant::from_node_state(&node_state).unwrap(), None);
    }
}
