use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, Pod};

use super::{annotation, find_container, PodInjector};
use crate::config::MetricsAggregatorConfig;
use crate::constants::{
    ENABLE_METRIC_AGGREGATION_ANNOTATION_KEY, ENABLE_PROMETHEUS_SCRAPING_ANNOTATION_KEY,
    INFERENCE_SERVICE_DEFAULT_HTTP_PORT, QUEUE_PROXY_CONTAINER_NAME,
};
use crate::error::Result;

pub const KSERVE_CONTAINER_METRICS_PORT_ENV_VAR_KEY: &str = "KSERVE_CONTAINER_PROMETHEUS_METRICS_PORT";
pub const KSERVE_CONTAINER_METRICS_PATH_ENV_VAR_KEY: &str = "KSERVE_CONTAINER_PROMETHEUS_METRICS_PATH";
pub const AGGREGATE_METRICS_PORT_ENV_VAR_KEY: &str = "AGGREGATE_PROMETHEUS_METRICS_PORT";

pub const PROMETHEUS_SCRAPE_ANNOTATION_KEY: &str = "prometheus.io/scrape";
pub const PROMETHEUS_PORT_ANNOTATION_KEY: &str = "prometheus.io/port";
pub const PROMETHEUS_PATH_ANNOTATION_KEY: &str = "prometheus.io/path";
const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Lets the queue proxy merge its own metrics with the serving container's
/// on one port, and advertises the port to Prometheus.
pub struct MetricsAggregatorInjector {
    config: MetricsAggregatorConfig,
}

impl MetricsAggregatorInjector {
    pub fn new(config: MetricsAggregatorConfig) -> Self {
        Self { config }
    }

    /// The pod annotation wins over the operator default.
    fn enabled(pod: &Pod, key: &str, default: bool) -> bool {
        annotation(pod, key).map_or(default, |value| value == "true")
    }
}

#[async_trait]
impl PodInjector for MetricsAggregatorInjector {
    fn name(&self) -> &'static str {
        "metrics-aggregator"
    }

    async fn inject(&self, pod: &mut Pod, _namespace: &str) -> Result<()> {
        let aggregate = Self::enabled(
            pod,
            ENABLE_METRIC_AGGREGATION_ANNOTATION_KEY,
            self.config.enable_metric_aggregation,
        );
        let scrape = Self::enabled(
            pod,
            ENABLE_PROMETHEUS_SCRAPING_ANNOTATION_KEY,
            self.config.enable_prometheus_scraping,
        );
        let aggregate_port = self.config.aggregate_port.to_string();

        let queue_proxy = pod
            .spec
            .as_mut()
            .and_then(|spec| find_container(&mut spec.containers, QUEUE_PROXY_CONTAINER_NAME));
        let aggregating = match queue_proxy {
            Some(queue_proxy) if aggregate => {
                let env = queue_proxy.env.get_or_insert_with(Vec::new);
                if !env.iter().any(|e| e.name == AGGREGATE_METRICS_PORT_ENV_VAR_KEY) {
                    for (name, value) in [
                        (
                            KSERVE_CONTAINER_METRICS_PORT_ENV_VAR_KEY,
                            INFERENCE_SERVICE_DEFAULT_HTTP_PORT.to_string(),
                        ),
                        (KSERVE_CONTAINER_METRICS_PATH_ENV_VAR_KEY, DEFAULT_METRICS_PATH.to_string()),
                        (AGGREGATE_METRICS_PORT_ENV_VAR_KEY, aggregate_port.clone()),
                    ] {
                        env.push(EnvVar {
                            name: name.to_string(),
                            value: Some(value),
                            ..Default::default()
                        });
                    }
                }
                true
            }
            _ => false,
        };

        if scrape {
            let port = if aggregating {
                aggregate_port
            } else {
                INFERENCE_SERVICE_DEFAULT_HTTP_PORT.to_string()
            };
            let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
            for (key, value) in [
                (PROMETHEUS_SCRAPE_ANNOTATION_KEY, "true".to_string()),
                (PROMETHEUS_PORT_ANNOTATION_KEY, port),
                (PROMETHEUS_PATH_ANNOTATION_KEY, DEFAULT_METRICS_PATH.to_string()),
            ] {
                annotations.entry(key.to_string()).or_insert(value);
            }
        }
        Ok(())
    }
}
