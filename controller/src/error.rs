use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create client: {}", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Error configuring tracing: {}", source))]
    TracingConfiguration {
        source: tracing::subscriber::SetGlobalDefaultError,
    },

    #[snafu(display("Error running prometheus HTTP server: {}", source))]
    PrometheusServer { source: std::io::Error },

    #[snafu(display("Invalid controller configuration: {}", source))]
    Configuration {
        source: crate::config::config_error::Error,
    },

    /// Reads and writes against the orchestrator. These are almost always transient (conflicts,
    /// not-found races, network) and are retried with backoff by the work queue.
    #[snafu(display("Unable to read or write cluster state: {}", source))]
    DrainClient {
        source: models::node::error::Error,
    },

    #[snafu(display("Drain failed for node '{}': {}", node_name, source))]
    Drainer {
        source: models::node::drain::error::DrainError,
        node_name: String,
    },

    #[snafu(display("Platform hook failed for node '{}': {}", node_name, source))]
    PlatformHook {
        source: crate::platform::error::Error,
        node_name: String,
    },

    #[snafu(display("Invalid drain pool configuration: {}", source))]
    PoolConfig {
        source: crate::pools::error::Error,
    },
}
