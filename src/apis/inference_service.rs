use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::status::InferenceServiceStatus;
use crate::constants::Endpoint;

/// Desired state of an InferenceService: a default endpoint and an optional
/// canary endpoint receiving `canaryTrafficPercent` of the traffic.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[kube(
    group = "serving.kserve.io",
    version = "v1alpha2",
    kind = "InferenceService",
    plural = "inferenceservices",
    shortname = "isvc",
    status = "InferenceServiceStatus",
    derive = "Default",
    derive = "PartialEq",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InferenceServiceSpec {
    pub default: EndpointSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<EndpointSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_traffic_percent: Option<i32>,
}

impl InferenceServiceSpec {
    pub fn canary_traffic_percent(&self) -> i32 {
        self.canary_traffic_percent.unwrap_or(0)
    }

    pub fn endpoint(&self, endpoint: Endpoint) -> Option<&EndpointSpec> {
        match endpoint {
            Endpoint::Default => Some(&self.default),
            Endpoint::Canary => self.canary.as_ref(),
        }
    }

    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = &mut EndpointSpec> {
        std::iter::once(&mut self.default).chain(self.canary.as_mut())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub predictor: PredictorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explainer: Option<ExplainerSpec>,
}

/// Settings shared by every component regardless of framework.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    /// `None` means the platform default of one replica; `0` enables scale to zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    /// `0` means unbounded.
    #[serde(default)]
    pub max_replicas: i32,
    /// Hard limit of concurrent requests per container; `0` means unlimited.
    #[serde(default)]
    pub parallelism: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<LoggerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batcher: Option<BatcherSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoggerMode {
    #[default]
    All,
    Request,
    Response,
}

impl LoggerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoggerMode::All => "all",
            LoggerMode::Request => "request",
            LoggerMode::Response => "response",
        }
    }
}

/// Request/response payload logging to a CloudEvents sink.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub mode: LoggerMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatcherSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<i32>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,
}

/// Fields common to all prepackaged model servers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime_version: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct XGBoostSpec {
    #[serde(flatten)]
    pub model: ModelSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nthread: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LightGBMSpec {
    #[serde(flatten)]
    pub model: ModelSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nthread: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PyTorchSpec {
    #[serde(flatten)]
    pub model: ModelSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_class_name: Option<String>,
}

/// An arbitrary user container.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CustomSpec {
    pub container: Container,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlibiExplainerType {
    #[default]
    AnchorTabular,
    AnchorImages,
    AnchorText,
    Counterfactuals,
    Contrastive,
}

impl AlibiExplainerType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlibiExplainerType::AnchorTabular => "AnchorTabular",
            AlibiExplainerType::AnchorImages => "AnchorImages",
            AlibiExplainerType::AnchorText => "AnchorText",
            AlibiExplainerType::Counterfactuals => "Counterfactuals",
            AlibiExplainerType::Contrastive => "Contrastive",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlibiExplainerSpec {
    #[serde(rename = "type", default)]
    pub type_: AlibiExplainerType,
    #[serde(flatten)]
    pub model: ModelSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AixExplainerType {
    #[default]
    LimeImages,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AixExplainerSpec {
    #[serde(rename = "type", default)]
    pub type_: AixExplainerType,
    #[serde(flatten)]
    pub model: ModelSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// Exactly one framework field must be set; see [`PredictorSpec::framework`].
///
/// [`PredictorSpec::framework`]: super::framework
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensorflow: Option<ModelSpec>,
    #[serde(default, rename = "tensorrt", skip_serializing_if = "Option::is_none")]
    pub tensor_rt: Option<ModelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triton: Option<ModelSpec>,
    #[serde(default, rename = "xgboost", skip_serializing_if = "Option::is_none")]
    pub xgboost: Option<XGBoostSpec>,
    #[serde(default, rename = "lightgbm", skip_serializing_if = "Option::is_none")]
    pub lightgbm: Option<LightGBMSpec>,
    #[serde(default, rename = "sklearn", skip_serializing_if = "Option::is_none")]
    pub sklearn: Option<ModelSpec>,
    #[serde(default, rename = "onnx", skip_serializing_if = "Option::is_none")]
    pub onnx: Option<ModelSpec>,
    #[serde(default, rename = "pytorch", skip_serializing_if = "Option::is_none")]
    pub pytorch: Option<PyTorchSpec>,
    #[serde(default, rename = "pmml", skip_serializing_if = "Option::is_none")]
    pub pmml: Option<ModelSpec>,
    #[serde(flatten)]
    pub deployment: DeploymentSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomSpec>,
    #[serde(flatten)]
    pub deployment: DeploymentSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExplainerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alibi: Option<AlibiExplainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aix: Option<AixExplainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomSpec>,
    #[serde(flatten)]
    pub deployment: DeploymentSpec,
}
