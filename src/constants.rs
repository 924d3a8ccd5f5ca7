//! Well-known names shared by the controller and the admission webhooks.
//!
//! The internal annotations defined here are the only contract between the
//! resource builder (which writes them onto revision templates) and the pod
//! mutation pipeline (which reads them back off the created pods).

use std::fmt;

use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "serving.kserve.io";
pub const API_VERSION: &str = "v1alpha2";

/// Name of the central configuration ConfigMap in the controller namespace.
pub const INFERENCE_SERVICE_CONFIG_MAP_NAME: &str = "inferenceservice-config";

/// Label stamped on every pod belonging to an InferenceService.
/// Pods without it are never mutated.
pub const INFERENCE_SERVICE_POD_LABEL_KEY: &str = "serving.kserve.io/inferenceservice";

pub const INTERNAL_ANNOTATIONS_PREFIX: &str = "internal.serving.kserve.io";

pub const STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY: &str =
    "internal.serving.kserve.io/storage-initializer-sourceuri";
pub const LOGGER_ANNOTATION_KEY: &str = "internal.serving.kserve.io/logger";
pub const LOGGER_SINK_URL_ANNOTATION_KEY: &str = "internal.serving.kserve.io/logger-sink-url";
pub const LOGGER_MODE_ANNOTATION_KEY: &str = "internal.serving.kserve.io/logger-mode";
pub const BATCHER_ANNOTATION_KEY: &str = "internal.serving.kserve.io/batcher";
pub const BATCHER_MAX_BATCH_SIZE_ANNOTATION_KEY: &str =
    "internal.serving.kserve.io/batcher-max-batchsize";
pub const BATCHER_MAX_LATENCY_ANNOTATION_KEY: &str =
    "internal.serving.kserve.io/batcher-max-latency";
pub const BATCHER_TIMEOUT_ANNOTATION_KEY: &str = "internal.serving.kserve.io/batcher-timeout";
pub const AGENT_SHOULD_INJECT_ANNOTATION_KEY: &str = "internal.serving.kserve.io/agent";
pub const AGENT_MODEL_CONFIG_VOLUME_NAME_ANNOTATION_KEY: &str =
    "internal.serving.kserve.io/configVolumeName";
pub const AGENT_MODEL_CONFIG_MOUNT_PATH_ANNOTATION_KEY: &str =
    "internal.serving.kserve.io/configMountPath";
pub const AGENT_MODEL_DIR_ANNOTATION_KEY: &str = "internal.serving.kserve.io/modelDir";

pub const GKE_ACCELERATOR_ANNOTATION_KEY: &str = "serving.kserve.io/gke-accelerator";
pub const GKE_ACCELERATOR_NODE_SELECTOR_KEY: &str = "cloud.google.com/gke-accelerator";
pub const DEPLOYMENT_MODE_ANNOTATION_KEY: &str = "serving.kserve.io/deploymentMode";
pub const ENABLE_METRIC_AGGREGATION_ANNOTATION_KEY: &str =
    "serving.kserve.io/enable-metric-aggregation";
pub const ENABLE_PROMETHEUS_SCRAPING_ANNOTATION_KEY: &str =
    "serving.kserve.io/enable-prometheus-scraping";

pub const LAST_APPLIED_CONFIG_ANNOTATION_KEY: &str =
    "kubectl.kubernetes.io/last-applied-configuration";

// Knative autoscaling annotations.
pub const MIN_SCALE_ANNOTATION_KEY: &str = "autoscaling.knative.dev/minScale";
pub const MAX_SCALE_ANNOTATION_KEY: &str = "autoscaling.knative.dev/maxScale";
pub const AUTOSCALING_TARGET_ANNOTATION_KEY: &str = "autoscaling.knative.dev/target";
pub const AUTOSCALING_CLASS_ANNOTATION_KEY: &str = "autoscaling.knative.dev/class";
pub const AUTOSCALING_CLASS_KPA: &str = "kpa.autoscaling.knative.dev";
pub const QUEUE_SIDECAR_RESOURCE_PERCENTAGE_ANNOTATION_KEY: &str =
    "queue.sidecar.serving.knative.dev/resourcePercentage";
pub const DEFAULT_QUEUE_SIDECAR_RESOURCE_PERCENTAGE: &str = "20";

/// User annotations that must never be copied onto a revision template.
pub const SERVICE_ANNOTATION_DISALLOWED_LIST: [&str; 4] = [
    MIN_SCALE_ANNOTATION_KEY,
    MAX_SCALE_ANNOTATION_KEY,
    STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY,
    LAST_APPLIED_CONFIG_ANNOTATION_KEY,
];

pub const DEFAULT_PREDICTOR_TIMEOUT: i64 = 60;
pub const DEFAULT_TRANSFORMER_TIMEOUT: i64 = 120;
pub const DEFAULT_EXPLAINER_TIMEOUT: i64 = 300;
pub const DEFAULT_SCALING_TARGET: &str = "1";
pub const DEFAULT_MIN_REPLICAS: i32 = 1;

pub const NVIDIA_GPU_RESOURCE_TYPE: &str = "nvidia.com/gpu";
pub const GPU_IMAGE_VERSION_SUFFIX: &str = "-gpu";

pub const INFERENCE_SERVICE_CONTAINER_NAME: &str = "kserve-container";
pub const QUEUE_PROXY_CONTAINER_NAME: &str = "queue-proxy";
pub const CUSTOM_SPEC_STORAGE_URI_ENV_VAR_KEY: &str = "STORAGE_URI";

pub const DEFAULT_MODEL_LOCAL_MOUNT_PATH: &str = "/mnt/models";
pub const MODEL_CONFIG_DIR: &str = "/mnt/configs";
pub const MODEL_CONFIG_FILE_NAME: &str = "models.json";
pub const MODEL_CONFIG_VOLUME_NAME: &str = "model-config";
pub const MODEL_DIR_VOLUME_NAME: &str = "model-dir";

pub const INFERENCE_SERVICE_DEFAULT_HTTP_PORT: i32 = 8080;
pub const INFERENCE_SERVICE_DEFAULT_AGENT_PORT: i32 = 9081;
pub const COMMON_DEFAULT_HTTP_PORT: i64 = 80;

pub const KNATIVE_LOCAL_GATEWAY: &str = "knative-serving/knative-local-gateway";
pub const CLUSTER_DOMAIN: &str = "cluster.local";

pub const ARGUMENT_MODEL_NAME: &str = "--model_name";
pub const ARGUMENT_MODEL_DIR: &str = "--model_dir";
pub const ARGUMENT_MODEL_CLASS_NAME: &str = "--model_class_name";
pub const ARGUMENT_PREDICTOR_HOST: &str = "--predictor_host";
pub const ARGUMENT_HTTP_PORT: &str = "--http_port";
pub const ARGUMENT_WORKERS: &str = "--workers";
pub const ARGUMENT_NTHREAD: &str = "--nthread";

pub const KSERVICE_COMPONENT_LABEL: &str = "component";
pub const KSERVICE_MODEL_LABEL: &str = "model";
pub const KSERVICE_ENDPOINT_LABEL: &str = "endpoint";

/// Storage URI schemes accepted verbatim by the storage initializer.
pub const SUPPORTED_STORAGE_URI_PREFIXES: [&str; 6] =
    ["gs://", "s3://", "pvc://", "file://", "https://", "http://"];
pub const PVC_URI_PREFIX: &str = "pvc://";
pub const AZURE_BLOB_URL_PATTERN: &str = r"^https://(.+?)\.blob\.core\.windows\.net/(.+)$";

/// The three kinds of workload an endpoint can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Predictor,
    Transformer,
    Explainer,
}

impl Component {
    pub const ALL: [Component; 3] = [
        Component::Predictor,
        Component::Transformer,
        Component::Explainer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Predictor => "predictor",
            Component::Transformer => "transformer",
            Component::Explainer => "explainer",
        }
    }

    pub fn default_timeout(self) -> i64 {
        match self {
            Component::Predictor => DEFAULT_PREDICTOR_TIMEOUT,
            Component::Transformer => DEFAULT_TRANSFORMER_TIMEOUT,
            Component::Explainer => DEFAULT_EXPLAINER_TIMEOUT,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two parallel endpoints of an InferenceService is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Default,
    Canary,
}

impl Endpoint {
    pub fn from_canary(is_canary: bool) -> Self {
        if is_canary {
            Endpoint::Canary
        } else {
            Endpoint::Default
        }
    }

    pub fn is_canary(self) -> bool {
        self == Endpoint::Canary
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Default => "default",
            Endpoint::Canary => "canary",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How components are materialized in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Serverless,
    RawDeployment,
}

impl DeploymentMode {
    pub fn from_annotations(
        annotations: Option<&std::collections::BTreeMap<String, String>>,
    ) -> Self {
        match annotations.and_then(|a| a.get(DEPLOYMENT_MODE_ANNOTATION_KEY)) {
            Some(mode) if mode == "RawDeployment" => DeploymentMode::RawDeployment,
            _ => DeploymentMode::Serverless,
        }
    }
}

/// `<isvc>-<component>-<endpoint>`
pub fn service_name(isvc_name: &str, component: Component, endpoint: Endpoint) -> String {
    format!("{isvc_name}-{component}-{endpoint}")
}

pub fn default_service_name(isvc_name: &str, component: Component) -> String {
    service_name(isvc_name, component, Endpoint::Default)
}

pub fn canary_service_name(isvc_name: &str, component: Component) -> String {
    service_name(isvc_name, component, Endpoint::Canary)
}

/// In-cluster short hostname of a component service: `<service>.<namespace>`.
pub fn component_url(
    isvc_name: &str,
    namespace: &str,
    component: Component,
    endpoint: Endpoint,
) -> String {
    format!(
        "{}.{namespace}",
        service_name(isvc_name, component, endpoint)
    )
}

pub fn model_config_name(isvc_name: &str, shard_id: u32) -> String {
    format!("modelconfig-{isvc_name}-{shard_id}")
}

pub fn inference_service_prefix(name: &str) -> String {
    format!("/v1/models/{name}")
}

pub fn predict_path(name: &str) -> String {
    format!("/v1/models/{name}:predict")
}

pub fn predict_prefix() -> &'static str {
    r"^/v1/models/[\w-]+(:predict)?"
}

pub fn explain_prefix() -> &'static str {
    r"^/v1/models/[\w-]+:explain$"
}

/// Fully qualified in-cluster hostname of a Kubernetes service.
pub fn cluster_service_hostname(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}.svc.{CLUSTER_DOMAIN}")
}

pub fn local_gateway_host() -> String {
    format!("knative-local-gateway.istio-system.svc.{CLUSTER_DOMAIN}")
}

const PORT_MATCH: &str = r"(?::\d{1,5})?";

/// Regular expression matching `host` as an HTTP authority, tolerating an
/// optional port and, for cluster-local names, the optional `.svc[.<domain>]`
/// suffixes.
pub fn host_regexp(host: &str) -> String {
    let local_suffix = format!(".svc.{CLUSTER_DOMAIN}");
    match host.strip_suffix(&local_suffix) {
        None => format!("^{}{PORT_MATCH}$", regex::escape(host)),
        Some(prefix) => {
            let cluster_suffix = regex::escape(&format!(".{CLUSTER_DOMAIN}"));
            let svc_suffix = regex::escape(".svc");
            format!(
                "^{}({svc_suffix}({cluster_suffix})?)?{PORT_MATCH}$",
                regex::escape(prefix)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names() {
        assert_eq!(
            default_service_name("flowers", Component::Predictor),
            "flowers-predictor-default"
        );
        assert_eq!(
            canary_service_name("flowers", Component::Transformer),
            "flowers-transformer-canary"
        );
        assert_eq!(
            component_url("flowers", "models", Component::Explainer, Endpoint::Default),
            "flowers-explainer-default.models"
        );
    }

    #[test]
    fn test_host_regexp_external_host() {
        let re = regex::Regex::new(&host_regexp("flowers.models.example.com")).unwrap();
        assert!(re.is_match("flowers.models.example.com"));
        assert!(re.is_match("flowers.models.example.com:8080"));
        assert!(!re.is_match("flowersXmodels.example.com"));
    }

    #[test]
    fn test_host_regexp_cluster_local_host() {
        let re = regex::Regex::new(&host_regexp("flowers.models.svc.cluster.local")).unwrap();
        assert!(re.is_match("flowers.models"));
        assert!(re.is_match("flowers.models.svc"));
        assert!(re.is_match("flowers.models.svc.cluster.local:80"));
        assert!(!re.is_match("flowers.other"));
    }

    #[test]
    fn test_deployment_mode_from_annotations() {
        let mut annotations = std::collections::BTreeMap::new();
        assert_eq!(
            DeploymentMode::from_annotations(Some(&annotations)),
            DeploymentMode::Serverless
        );
        annotations.insert(
            DEPLOYMENT_MODE_ANNOTATION_KEY.to_string(),
            "RawDeployment".to_string(),
        );
        assert_eq!(
            DeploymentMode::from_annotations(Some(&annotations)),
            DeploymentMode::RawDeployment
        );
        assert_eq!(
            DeploymentMode::from_annotations(None),
            DeploymentMode::Serverless
        );
    }
}
