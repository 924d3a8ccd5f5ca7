//! Typed view of the central `inferenceservice-config` ConfigMap.
//!
//! Each key of the ConfigMap holds a JSON document. The document is parsed on
//! every reconcile and every admission request; nothing is cached between
//! calls. A key that is absent falls back to its defaults, a key that is
//! present but malformed is a [`ConfigError`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{de::DeserializeOwned, Deserialize};

use crate::constants::INFERENCE_SERVICE_CONFIG_MAP_NAME;
use crate::error::{ConfigError, Result};
use crate::subscriber::{ObjectClient, QualifiedName};

mod runtimes;
mod sidecars;

pub use runtimes::{FrameworkConfig, IngressConfig, RuntimeTable};
pub use sidecars::{
    AgentConfig, BatcherConfig, LoggerConfig, MetricsAggregatorConfig, SidecarResources,
    StorageInitializerConfig,
};

pub const PREDICTORS_KEY: &str = "predictors";
pub const TRANSFORMERS_KEY: &str = "transformers";
pub const EXPLAINERS_KEY: &str = "explainers";
pub const INGRESS_KEY: &str = "ingress";
pub const STORAGE_INITIALIZER_KEY: &str = "storageInitializer";
pub const LOGGER_KEY: &str = "logger";
pub const BATCHER_KEY: &str = "batcher";
pub const AGENT_KEY: &str = "agent";
pub const METRICS_AGGREGATOR_KEY: &str = "metricsAggregator";
pub const RESOURCE_DEFAULTS_KEY: &str = "resourceDefaults";

/// Default requests and limits applied to framework containers that leave
/// them unset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefaults {
    #[serde(default = "ResourceDefaults::default_cpu")]
    pub cpu: String,
    #[serde(default = "ResourceDefaults::default_memory")]
    pub memory: String,
}

impl ResourceDefaults {
    fn default_cpu() -> String {
        "1".to_string()
    }

    fn default_memory() -> String {
        "2Gi".to_string()
    }
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cpu: Self::default_cpu(),
            memory: Self::default_memory(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InferenceServicesConfig {
    pub predictors: RuntimeTable,
    pub transformers: RuntimeTable,
    pub explainers: RuntimeTable,
    pub ingress: IngressConfig,
    pub storage_initializer: StorageInitializerConfig,
    pub logger: LoggerConfig,
    pub batcher: BatcherConfig,
    pub agent: AgentConfig,
    pub metrics_aggregator: MetricsAggregatorConfig,
    pub resource_defaults: ResourceDefaults,
}

impl InferenceServicesConfig {
    /// Fetches and parses the ConfigMap living in `namespace`.
    pub async fn load(config_maps: &dyn ObjectClient<ConfigMap>, namespace: &str) -> Result<Self> {
        let key = QualifiedName::new(namespace, INFERENCE_SERVICE_CONFIG_MAP_NAME);
        let config_map = config_maps
            .get(&key)
            .await?
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        Ok(Self::from_config_map(&config_map)?)
    }

    pub fn from_config_map(config_map: &ConfigMap) -> Result<Self, ConfigError> {
        let empty = BTreeMap::new();
        Self::from_data(config_map.data.as_ref().unwrap_or(&empty))
    }

    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let ingress: IngressConfig = parse_key(data, INGRESS_KEY)?;
        if data.contains_key(INGRESS_KEY) {
            ingress.validate()?;
        }

        Ok(Self {
            predictors: parse_key(data, PREDICTORS_KEY)?,
            transformers: parse_key(data, TRANSFORMERS_KEY)?,
            explainers: parse_key(data, EXPLAINERS_KEY)?,
            ingress,
            storage_initializer: parse_key(data, STORAGE_INITIALIZER_KEY)?,
            logger: parse_key(data, LOGGER_KEY)?,
            batcher: parse_key(data, BATCHER_KEY)?,
            agent: parse_key(data, AGENT_KEY)?,
            metrics_aggregator: parse_key(data, METRICS_AGGREGATOR_KEY)?,
            resource_defaults: parse_key(data, RESOURCE_DEFAULTS_KEY)?,
        })
    }
}

fn parse_key<T>(data: &BTreeMap<String, String>, key: &'static str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    match data.get(key) {
        None => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|source| ConfigError::Parse { key, source }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::reconciler::tests::FakeObjectClient;

    /// A ConfigMap payload resembling what the operator ships with.
    pub(crate) fn sample_data() -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert(
            PREDICTORS_KEY.to_string(),
            serde_json::json!({
                "tensorflow": {
                    "image": "tensorflow/serving",
                    "defaultImageVersion": "1.14.0",
                    "defaultGpuImageVersion": "1.14.0-gpu",
                    "allowedImageVersions": ["1.11.0", "1.14.0", "1.14.0-gpu"]
                },
                "sklearn": {
                    "image": "kserve/sklearnserver",
                    "defaultImageVersion": "v0.5.0",
                    "allowedImageVersions": ["v0.4.0", "v0.5.0"]
                },
                "xgboost": {
                    "image": "kserve/xgbserver",
                    "defaultImageVersion": "v0.5.0",
                    "allowedImageVersions": ["v0.4.0", "v0.5.0"]
                },
                "pytorch": {
                    "image": "kserve/pytorchserver",
                    "defaultImageVersion": "v0.5.0",
                    "defaultGpuImageVersion": "v0.5.0-gpu",
                    "allowedImageVersions": ["v0.5.0", "v0.5.0-gpu"]
                },
                "onnx": {
                    "image": "mcr.microsoft.com/onnxruntime/server",
                    "defaultImageVersion": "v1.0.0",
                    "allowedImageVersions": ["v1.0.0"]
                },
                "triton": {
                    "image": "nvcr.io/nvidia/tritonserver",
                    "defaultImageVersion": "20.08-py3",
                    "allowedImageVersions": ["20.08-py3"]
                },
                "lightgbm": {
                    "image": "kserve/lgbserver",
                    "defaultImageVersion": "v0.5.0",
                    "allowedImageVersions": ["v0.4.0", "v0.5.0"]
                },
                "pmml": {
                    "image": "kserve/pmmlserver",
                    "defaultImageVersion": "v0.5.0",
                    "allowedImageVersions": ["v0.4.0", "v0.5.0"]
                }
            })
            .to_string(),
        );
        data.insert(
            EXPLAINERS_KEY.to_string(),
            serde_json::json!({
                "alibi": {
                    "image": "kserve/alibi-explainer",
                    "defaultImageVersion": "v0.5.0",
                    "allowedImageVersions": ["v0.5.0"]
                },
                "aix": {
                    "image": "kserve/aix-explainer",
                    "defaultImageVersion": "v0.5.0",
                    "allowedImageVersions": ["v0.5.0"]
                }
            })
            .to_string(),
        );
        data.insert(
            INGRESS_KEY.to_string(),
            serde_json::json!({
                "ingressGateway": "knative-serving/knative-ingress-gateway",
                "ingressService": "istio-ingressgateway.istio-system.svc.cluster.local"
            })
            .to_string(),
        );
        data.insert(
            STORAGE_INITIALIZER_KEY.to_string(),
            serde_json::json!({
                "image": "kserve/storage-initializer:v0.5.0",
                "cpuRequest": "100m",
                "cpuLimit": "1",
                "memoryRequest": "200Mi",
                "memoryLimit": "1Gi"
            })
            .to_string(),
        );
        data.insert(
            AGENT_KEY.to_string(),
            serde_json::json!({"image": "kserve/agent:v0.5.0"}).to_string(),
        );
        data
    }

    pub(crate) fn sample_config() -> InferenceServicesConfig {
        InferenceServicesConfig::from_data(&sample_data()).unwrap()
    }

    pub(crate) fn sample_config_map(namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(INFERENCE_SERVICE_CONFIG_MAP_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(sample_data()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parses_all_keys() {
        let config = sample_config();
        let tf = config.predictors.get("tensorflow").unwrap();
        assert_eq!(tf.image, "tensorflow/serving");
        assert_eq!(tf.default_gpu_image_version.as_deref(), Some("1.14.0-gpu"));
        assert_eq!(
            config.ingress.ingress_gateway,
            "knative-serving/knative-ingress-gateway"
        );
        assert_eq!(config.storage_initializer.resources.cpu_request, "100m");
        assert_eq!(config.agent.image, "kserve/agent:v0.5.0");
        assert_eq!(config.batcher.max_batch_size, "32");
        assert_eq!(config.resource_defaults, ResourceDefaults::default());
    }

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let config = InferenceServicesConfig::from_data(&BTreeMap::new()).unwrap();
        assert!(config.predictors.get("tensorflow").is_none());
        assert_eq!(config.resource_defaults.memory, "2Gi");
        assert!(!config.storage_initializer.image.is_empty());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let mut data = sample_data();
        data.insert(LOGGER_KEY.to_string(), "{not json".to_string());
        let err = InferenceServicesConfig::from_data(&data).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { key: LOGGER_KEY, .. }));
    }

    #[tokio::test]
    async fn test_load_requires_config_map() {
        let config_maps = FakeObjectClient::<ConfigMap>::default();
        let err = InferenceServicesConfig::load(&config_maps, "kserve").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(ConfigError::NotFound(_))));

        let config_maps = FakeObjectClient::with([(
            QualifiedName::new("kserve", INFERENCE_SERVICE_CONFIG_MAP_NAME),
            sample_config_map("kserve"),
        )]);
        let config = InferenceServicesConfig::load(&config_maps, "kserve").await.unwrap();
        assert!(config.predictors.get("sklearn").is_some());
    }

    #[test]
    fn test_incomplete_ingress_is_rejected() {
        let mut data = sample_data();
        data.insert(
            INGRESS_KEY.to_string(),
            serde_json::json!({"ingressGateway": "gw"}).to_string(),
        );
        let err = InferenceServicesConfig::from_data(&data).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: INGRESS_KEY, .. }));
    }
}
