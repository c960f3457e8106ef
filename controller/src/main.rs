use controller::{
    config::ControllerConfig,
    error::{self, Result},
    platform::PlatformAdapter,
    predicates::AnnotationTransitions,
    telemetry::vend_metrics,
    workqueue::WorkQueue,
    DrainController,
};
use models::constants::CONTROLLER;
use models::node::drain::EvictionDrainer;
use models::node::{K8sDrainClient, SriovNetworkNodeState, SriovNetworkPoolConfig};

use actix_web::{web::Data, App, HttpServer};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::watcher::{watcher, Config};
use opentelemetry::sdk::propagation::TraceContextPropagator;
use snafu::ResultExt;
use std::sync::{Arc, Mutex};
use tracing::{event, Level};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACE_LEVEL: &str = "info";
const METRICS_PORT: u16 = 8080;

#[actix_web::main]
async fn main() -> Result<()> {
    init_telemetry()?;

    let config = ControllerConfig::from_environment().context(error::ConfigurationSnafu)?;

    let k8s_client = kube::client::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    // Setup the prometheus exporter first: it installs the global meter provider the
    // controller's metrics hang off of.
    let exporter = opentelemetry_prometheus::exporter().init();

    let queue = WorkQueue::new(config.base_backoff, config.max_backoff);
    let drain_client = K8sDrainClient::new(k8s_client.clone(), &config.namespace);
    let drainer = EvictionDrainer::new(k8s_client.clone());
    let platform = PlatformAdapter::from_cluster_type(
        k8s_client.clone(),
        &config.namespace,
        &config.cluster_type,
    );

    let controller = DrainController::new(drain_client, drainer, platform, &config);
    let reconcilers = controller.run(Arc::clone(&queue), config.max_parallel_reconciles);

    // Watches feed the queue through the annotation-transition filters, so only handshake
    // changes cost a reconcile. The request filter doubles as the registry of known nodes for
    // pool config changes, which touch every node's membership.
    let request_filter = Arc::new(Mutex::new(AnnotationTransitions::for_drain_requests()));

    let nodes: Api<Node> = Api::all(k8s_client.clone());
    let node_events = {
        let queue = Arc::clone(&queue);
        let filter = Arc::clone(&request_filter);
        async move {
            let mut stream = watcher(nodes, Config::default()).boxed();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(ev) => {
                        let keys = filter.lock().expect("request filter lock poisoned").observe(&ev);
                        for key in keys {
                            queue.enqueue(&key);
                        }
                    }
                    Err(err) => {
                        event!(Level::WARN, error = %err, "Node watch interrupted; retrying.")
                    }
                }
            }
        }
    };

    let node_states: Api<SriovNetworkNodeState> =
        Api::namespaced(k8s_client.clone(), &config.namespace);
    let node_state_events = {
        let queue = Arc::clone(&queue);
        async move {
            let mut filter = AnnotationTransitions::for_drain_grants();
            let mut stream = watcher(node_states, Config::default()).boxed();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(ev) => {
                        for key in filter.observe(&ev) {
                            queue.enqueue(&key);
                        }
                    }
                    Err(err) => {
                        event!(Level::WARN, error = %err, "Node state watch interrupted; retrying.")
                    }
                }
            }
        }
    };

    let pool_configs: Api<SriovNetworkPoolConfig> =
        Api::namespaced(k8s_client.clone(), &config.namespace);
    let pool_config_events = {
        let queue = Arc::clone(&queue);
        let filter = Arc::clone(&request_filter);
        async move {
            let mut stream = watcher(pool_configs, Config::default()).boxed();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(_) => {
                        // Membership or budgets may have shifted for any node.
                        let keys = filter
                            .lock()
                            .expect("request filter lock poisoned")
                            .known_keys();
                        for key in keys {
                            queue.enqueue(&key);
                        }
                    }
                    Err(err) => {
                        event!(Level::WARN, error = %err, "Pool config watch interrupted; retrying.")
                    }
                }
            }
        }
    };

    // Setup Http server to vend prometheus metrics.
    let prometheus_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(exporter.clone()))
            .service(vend_metrics)
    })
    .bind(format!("0.0.0.0:{}", METRICS_PORT))
    .context(error::PrometheusServerSnafu)?
    .run();

    tokio::select! {
        _ = node_events => {
            event!(Level::ERROR, "node watch stream ended");
        },
        _ = node_state_events => {
            event!(Level::ERROR, "node state watch stream ended");
        },
        _ = pool_config_events => {
            event!(Level::ERROR, "pool config watch stream ended");
        },
        _ = reconcilers => {
            event!(Level::ERROR, "reconcile workers exited");
        },
        _ = prometheus_server => {
            event!(Level::ERROR, "metric server exited");
        }
    };
    Ok(())
}

fn init_telemetry() -> Result<()> {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_TRACE_LEVEL));
    let stdio_formatting_layer = BunyanFormattingLayer::new(CONTROLLER.into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(stdio_formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}
