use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "Unrecognized value '{}' for annotation '{}' on '{}': {}",
        value,
        annotation,
        object,
        source
    ))]
    UnknownAnnotationValue {
        source: serde_plain::Error,
        annotation: &'static str,
        value: String,
        object: String,
    },

    #[snafu(display("Unable to get Node '{}': {}", node_name, source))]
    GetNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to list Nodes: {}", source))]
    ListNodes { source: kube::Error },

    #[snafu(display("Unable to get node state '{}': {}", node_name, source))]
    GetNodeState {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to list node states: {}", source))]
    ListNodeStates { source: kube::Error },

    #[snafu(display("Unable to list drain pool configs: {}", source))]
    ListPoolConfigs { source: kube::Error },

    #[snafu(display("Unable to update drain grant for node '{}': {}", node_name, source))]
    UpdateDrainGrant {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to create patch to send to Kubernetes API: {}", source))]
    CreateK8sPatch { source: serde_json::Error },

    #[snafu(display("Unable to cordon Node '{}': {}", node_name, source))]
    CordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to uncordon Node '{}': {}", node_name, source))]
    UncordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to publish event for '{}': {}", object, source))]
    PublishEvent {
        source: kube::Error,
        object: String,
    },

    #[snafu(display(
        "Negative maxUnavailable '{}' in drain pool config '{}'",
        value,
        pool
    ))]
    NegativeMaxUnavailable { value: i32, pool: String },

    #[snafu(display(
        "Unparseable maxUnavailable '{}' in drain pool config '{}'; expected an integer or a percentage",
        value,
        pool
    ))]
    InvalidMaxUnavailable { value: String, pool: String },
}
