//! Resolution of the "exactly one framework" unions into sum types, and the
//! per-framework container each one runs.

use k8s_openapi::api::core::v1::{Container, EnvVar, ResourceRequirements};

use super::inference_service::{
    AixExplainerSpec, AlibiExplainerSpec, CustomSpec, ExplainerSpec, LightGBMSpec, ModelSpec,
    PredictorSpec, PyTorchSpec, TransformerSpec, XGBoostSpec,
};
use crate::config::{FrameworkConfig, InferenceServicesConfig, RuntimeTable};
use crate::constants::{
    ARGUMENT_HTTP_PORT, ARGUMENT_MODEL_CLASS_NAME, ARGUMENT_MODEL_DIR, ARGUMENT_MODEL_NAME,
    ARGUMENT_NTHREAD, ARGUMENT_PREDICTOR_HOST, ARGUMENT_WORKERS,
    CUSTOM_SPEC_STORAGE_URI_ENV_VAR_KEY, DEFAULT_MODEL_LOCAL_MOUNT_PATH,
    INFERENCE_SERVICE_CONTAINER_NAME, INFERENCE_SERVICE_DEFAULT_HTTP_PORT,
};
use crate::error::ValidationError;

/// Inputs shared by all container builders.
#[derive(Debug, Clone, Copy)]
pub struct ContainerContext<'a> {
    /// Name of the owning InferenceService, used as the model name.
    pub name: &'a str,
    pub parallelism: i32,
    /// `<service>.<namespace>` of the component that receives forwarded
    /// requests. Only transformers and explainers use it.
    pub predictor_host: &'a str,
    pub config: &'a InferenceServicesConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictorFramework<'a> {
    Custom(&'a CustomSpec),
    Tensorflow(&'a ModelSpec),
    TensorRT(&'a ModelSpec),
    Triton(&'a ModelSpec),
    XGBoost(&'a XGBoostSpec),
    LightGBM(&'a LightGBMSpec),
    SKLearn(&'a ModelSpec),
    ONNX(&'a ModelSpec),
    PyTorch(&'a PyTorchSpec),
    PMML(&'a ModelSpec),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformerFramework<'a> {
    Custom(&'a CustomSpec),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExplainerFramework<'a> {
    Alibi(&'a AlibiExplainerSpec),
    Aix(&'a AixExplainerSpec),
    Custom(&'a CustomSpec),
}

fn exactly_one<T>(
    candidates: Vec<T>,
    violation: fn(usize) -> ValidationError,
) -> Result<T, ValidationError> {
    let count = candidates.len();
    match <[T; 1]>::try_from(candidates) {
        Ok([only]) => Ok(only),
        Err(_) => Err(violation(count)),
    }
}

impl PredictorSpec {
    pub fn framework(&self) -> Result<PredictorFramework<'_>, ValidationError> {
        let mut candidates = Vec::new();
        candidates.extend(self.custom.as_ref().map(PredictorFramework::Custom));
        candidates.extend(self.tensorflow.as_ref().map(PredictorFramework::Tensorflow));
        candidates.extend(self.tensor_rt.as_ref().map(PredictorFramework::TensorRT));
        candidates.extend(self.triton.as_ref().map(PredictorFramework::Triton));
        candidates.extend(self.xgboost.as_ref().map(PredictorFramework::XGBoost));
        candidates.extend(self.lightgbm.as_ref().map(PredictorFramework::LightGBM));
        candidates.extend(self.sklearn.as_ref().map(PredictorFramework::SKLearn));
        candidates.extend(self.onnx.as_ref().map(PredictorFramework::ONNX));
        candidates.extend(self.pytorch.as_ref().map(PredictorFramework::PyTorch));
        candidates.extend(self.pmml.as_ref().map(PredictorFramework::PMML));
        exactly_one(candidates, ValidationError::ExactlyOnePredictorViolated)
    }

    /// Every populated prepackaged framework, keyed by its config name.
    pub(crate) fn models_mut(&mut self) -> Vec<(&'static str, &mut ModelSpec)> {
        let mut models = Vec::new();
        models.extend(self.tensorflow.as_mut().map(|m| ("tensorflow", m)));
        models.extend(self.tensor_rt.as_mut().map(|m| ("tensorrt", m)));
        models.extend(self.triton.as_mut().map(|m| ("triton", m)));
        models.extend(self.xgboost.as_mut().map(|m| ("xgboost", &mut m.model)));
        models.extend(self.lightgbm.as_mut().map(|m| ("lightgbm", &mut m.model)));
        models.extend(self.sklearn.as_mut().map(|m| ("sklearn", m)));
        models.extend(self.onnx.as_mut().map(|m| ("onnx", m)));
        models.extend(self.pytorch.as_mut().map(|m| ("pytorch", &mut m.model)));
        models.extend(self.pmml.as_mut().map(|m| ("pmml", m)));
        models
    }
}

impl TransformerSpec {
    pub fn framework(&self) -> Result<TransformerFramework<'_>, ValidationError> {
        let candidates = self
            .custom
            .as_ref()
            .map(TransformerFramework::Custom)
            .into_iter()
            .collect();
        exactly_one(candidates, ValidationError::ExactlyOneTransformerViolated)
    }
}

impl ExplainerSpec {
    pub fn framework(&self) -> Result<ExplainerFramework<'_>, ValidationError> {
        let mut candidates = Vec::new();
        candidates.extend(self.alibi.as_ref().map(ExplainerFramework::Alibi));
        candidates.extend(self.aix.as_ref().map(ExplainerFramework::Aix));
        candidates.extend(self.custom.as_ref().map(ExplainerFramework::Custom));
        exactly_one(candidates, ValidationError::ExactlyOneExplainerViolated)
    }

    pub(crate) fn models_mut(&mut self) -> Vec<(&'static str, &mut ModelSpec)> {
        let mut models = Vec::new();
        models.extend(self.alibi.as_mut().map(|m| ("alibi", &mut m.model)));
        models.extend(self.aix.as_mut().map(|m| ("aix", &mut m.model)));
        models
    }
}

impl CustomSpec {
    /// A custom container declares its model location through the
    /// `STORAGE_URI` environment variable.
    pub fn storage_uri(&self) -> Option<&str> {
        self.container
            .env
            .as_ref()?
            .iter()
            .find(|env| env.name == CUSTOM_SPEC_STORAGE_URI_ENV_VAR_KEY)
            .and_then(|env| env.value.as_deref())
            .filter(|uri| !uri.is_empty())
    }

    fn container(&self) -> Container {
        let mut container = self.container.clone();
        if container.name.is_empty() {
            container.name = INFERENCE_SERVICE_CONTAINER_NAME.to_string();
        }
        container
    }
}

fn model_storage_uri(model: &ModelSpec) -> Option<&str> {
    Some(model.storage_uri.as_str()).filter(|uri| !uri.is_empty())
}

fn lookup<'c>(table: &'c RuntimeTable, framework: &str) -> Result<&'c FrameworkConfig, ValidationError> {
    table
        .get(framework)
        .ok_or_else(|| ValidationError::MissingFrameworkConfig(framework.to_string()))
}

fn model_container(
    model: &ModelSpec,
    config: &FrameworkConfig,
    command: Option<Vec<String>>,
    args: Vec<String>,
) -> Container {
    let version = if model.runtime_version.is_empty() {
        &config.default_image_version
    } else {
        &model.runtime_version
    };
    Container {
        name: INFERENCE_SERVICE_CONTAINER_NAME.to_string(),
        image: Some(config.image_for(version)),
        command,
        args: Some(args),
        resources: Some(model.resources.clone()).filter(|r| *r != ResourceRequirements::default()),
        ..Default::default()
    }
}

/// Arguments understood by the python model servers.
fn python_server_args(name: &str, parallelism: i32) -> Vec<String> {
    let mut args = vec![
        format!("{ARGUMENT_MODEL_NAME}={name}"),
        format!("{ARGUMENT_MODEL_DIR}={DEFAULT_MODEL_LOCAL_MOUNT_PATH}"),
        format!("{ARGUMENT_HTTP_PORT}={INFERENCE_SERVICE_DEFAULT_HTTP_PORT}"),
    ];
    if parallelism != 0 {
        args.push(format!("{ARGUMENT_WORKERS}={parallelism}"));
    }
    args
}

impl<'a> PredictorFramework<'a> {
    /// Key of this framework in the `predictors` configuration.
    pub fn name(&self) -> &'static str {
        match self {
            PredictorFramework::Custom(_) => "custom",
            PredictorFramework::Tensorflow(_) => "tensorflow",
            PredictorFramework::TensorRT(_) => "tensorrt",
            PredictorFramework::Triton(_) => "triton",
            PredictorFramework::XGBoost(_) => "xgboost",
            PredictorFramework::LightGBM(_) => "lightgbm",
            PredictorFramework::SKLearn(_) => "sklearn",
            PredictorFramework::ONNX(_) => "onnx",
            PredictorFramework::PyTorch(_) => "pytorch",
            PredictorFramework::PMML(_) => "pmml",
        }
    }

    /// The prepackaged model fields, or `None` for a custom container.
    pub fn model(&self) -> Option<&'a ModelSpec> {
        match *self {
            PredictorFramework::Custom(_) => None,
            PredictorFramework::Tensorflow(m)
            | PredictorFramework::TensorRT(m)
            | PredictorFramework::Triton(m)
            | PredictorFramework::SKLearn(m)
            | PredictorFramework::ONNX(m)
            | PredictorFramework::PMML(m) => Some(m),
            PredictorFramework::XGBoost(x) => Some(&x.model),
            PredictorFramework::LightGBM(l) => Some(&l.model),
            PredictorFramework::PyTorch(p) => Some(&p.model),
        }
    }

    pub fn custom(&self) -> Option<&'a CustomSpec> {
        match *self {
            PredictorFramework::Custom(c) => Some(c),
            _ => None,
        }
    }

    pub fn storage_uri(&self) -> Option<&'a str> {
        match *self {
            PredictorFramework::Custom(c) => c.storage_uri(),
            _ => self.model().and_then(model_storage_uri),
        }
    }

    pub fn build_container(&self, ctx: &ContainerContext<'_>) -> Result<Container, ValidationError> {
        let name = ctx.name;
        let (model, command, args) = match self {
            PredictorFramework::Custom(c) => return Ok(c.container()),
            PredictorFramework::Tensorflow(m) => (
                *m,
                Some(vec!["/usr/bin/tensorflow_model_server".to_string()]),
                vec![
                    "--port=9000".to_string(),
                    format!("--rest_api_port={INFERENCE_SERVICE_DEFAULT_HTTP_PORT}"),
                    format!("--model_name={name}"),
                    format!("--model_base_path={DEFAULT_MODEL_LOCAL_MOUNT_PATH}"),
                    "--rest_api_timeout_in_ms=60000".to_string(),
                ],
            ),
            PredictorFramework::TensorRT(m) => (
                *m,
                None,
                vec![
                    "trtserver".to_string(),
                    format!("--model-store={DEFAULT_MODEL_LOCAL_MOUNT_PATH}"),
                    "--allow-poll-model-repository=false".to_string(),
                    "--allow-grpc=true".to_string(),
                    "--allow-http=true".to_string(),
                    "--grpc-port=9000".to_string(),
                    format!("--http-port={INFERENCE_SERVICE_DEFAULT_HTTP_PORT}"),
                ],
            ),
            PredictorFramework::Triton(m) => (
                *m,
                None,
                vec![
                    "tritonserver".to_string(),
                    format!("--model-store={DEFAULT_MODEL_LOCAL_MOUNT_PATH}"),
                    "--grpc-port=9000".to_string(),
                    format!("--http-port={INFERENCE_SERVICE_DEFAULT_HTTP_PORT}"),
                    "--allow-grpc=true".to_string(),
                    "--allow-http=true".to_string(),
                ],
            ),
            PredictorFramework::ONNX(m) => (
                *m,
                None,
                vec![
                    format!("--model_path={DEFAULT_MODEL_LOCAL_MOUNT_PATH}/model.onnx"),
                    format!("--http_port={INFERENCE_SERVICE_DEFAULT_HTTP_PORT}"),
                    "--grpc_port=9000".to_string(),
                ],
            ),
            PredictorFramework::XGBoost(x) => {
                let mut args = python_server_args(name, ctx.parallelism);
                if let Some(n) = x.nthread.filter(|n| *n != 0) {
                    args.push(format!("{ARGUMENT_NTHREAD}={n}"));
                }
                (&x.model, None, args)
            }
            PredictorFramework::LightGBM(l) => {
                let mut args = python_server_args(name, ctx.parallelism);
                if let Some(n) = l.nthread.filter(|n| *n != 0) {
                    args.push(format!("{ARGUMENT_NTHREAD}={n}"));
                }
                (&l.model, None, args)
            }
            PredictorFramework::PyTorch(p) => {
                let mut args = python_server_args(name, ctx.parallelism);
                if let Some(class) = p.model_class_name.as_deref().filter(|c| !c.is_empty()) {
                    args.push(format!("{ARGUMENT_MODEL_CLASS_NAME}={class}"));
                }
                (&p.model, None, args)
            }
            PredictorFramework::SKLearn(m) | PredictorFramework::PMML(m) => {
                (*m, None, python_server_args(name, ctx.parallelism))
            }
        };
        let config = lookup(&ctx.config.predictors, self.name())?;
        Ok(model_container(model, config, command, args))
    }
}

impl<'a> TransformerFramework<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            TransformerFramework::Custom(_) => "custom",
        }
    }

    pub fn storage_uri(&self) -> Option<&'a str> {
        match *self {
            TransformerFramework::Custom(c) => c.storage_uri(),
        }
    }

    pub fn build_container(&self, ctx: &ContainerContext<'_>) -> Result<Container, ValidationError> {
        let TransformerFramework::Custom(custom) = self;
        let mut container = custom.container();
        container.args.get_or_insert_with(Vec::new).extend([
            ARGUMENT_MODEL_NAME.to_string(),
            ctx.name.to_string(),
            ARGUMENT_PREDICTOR_HOST.to_string(),
            ctx.predictor_host.to_string(),
            ARGUMENT_HTTP_PORT.to_string(),
            INFERENCE_SERVICE_DEFAULT_HTTP_PORT.to_string(),
        ]);
        Ok(container)
    }
}

impl<'a> ExplainerFramework<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            ExplainerFramework::Alibi(_) => "alibi",
            ExplainerFramework::Aix(_) => "aix",
            ExplainerFramework::Custom(_) => "custom",
        }
    }

    pub fn model(&self) -> Option<&'a ModelSpec> {
        match *self {
            ExplainerFramework::Alibi(a) => Some(&a.model),
            ExplainerFramework::Aix(a) => Some(&a.model),
            ExplainerFramework::Custom(_) => None,
        }
    }

    pub fn custom(&self) -> Option<&'a CustomSpec> {
        match *self {
            ExplainerFramework::Custom(c) => Some(c),
            _ => None,
        }
    }

    pub fn storage_uri(&self) -> Option<&'a str> {
        match *self {
            ExplainerFramework::Custom(c) => c.storage_uri(),
            _ => self.model().and_then(model_storage_uri),
        }
    }

    pub fn build_container(&self, ctx: &ContainerContext<'_>) -> Result<Container, ValidationError> {
        let (model, explainer_type, extra) = match self {
            ExplainerFramework::Custom(c) => return Ok(c.container()),
            ExplainerFramework::Alibi(a) => (&a.model, vec![a.type_.as_str().to_string()], &a.config),
            ExplainerFramework::Aix(a) => (
                &a.model,
                vec!["--explainer_type".to_string(), format!("{:?}", a.type_)],
                &a.config,
            ),
        };
        let config = lookup(&ctx.config.explainers, self.name())?;

        let mut args = vec![
            ARGUMENT_MODEL_NAME.to_string(),
            ctx.name.to_string(),
            ARGUMENT_HTTP_PORT.to_string(),
            INFERENCE_SERVICE_DEFAULT_HTTP_PORT.to_string(),
            ARGUMENT_PREDICTOR_HOST.to_string(),
            ctx.predictor_host.to_string(),
        ];
        if ctx.parallelism != 0 {
            args.extend([ARGUMENT_WORKERS.to_string(), ctx.parallelism.to_string()]);
        }
        if model_storage_uri(model).is_some() {
            args.extend([
                "--storage_uri".to_string(),
                DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
            ]);
        }
        args.extend(explainer_type);
        for (key, value) in extra {
            args.extend([format!("--{key}"), value.clone()]);
        }
        Ok(model_container(model, config, None, args))
    }
}

/// Environment variable carrying `value` under `name`.
pub(crate) fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::inference_service::AlibiExplainerType;
    use crate::config::tests::sample_config;

    fn ctx<'a>(config: &'a InferenceServicesConfig, parallelism: i32) -> ContainerContext<'a> {
        ContainerContext {
            name: "someName",
            parallelism,
            predictor_host: "someName-predictor-default.default",
            config,
        }
    }

    #[test]
    fn test_zero_frameworks_is_violation() {
        let err = PredictorSpec::default().framework().unwrap_err();
        assert_eq!(err, ValidationError::ExactlyOnePredictorViolated(0));
    }

    #[test]
    fn test_several_frameworks_are_violations() {
        let model = || Some(ModelSpec::default());
        let cases = [
            PredictorSpec {
                tensorflow: model(),
                sklearn: model(),
                ..Default::default()
            },
            PredictorSpec {
                custom: Some(CustomSpec::default()),
                tensorflow: model(),
                ..Default::default()
            },
            PredictorSpec {
                xgboost: Some(XGBoostSpec::default()),
                lightgbm: Some(LightGBMSpec::default()),
                ..Default::default()
            },
            PredictorSpec {
                pytorch: Some(PyTorchSpec::default()),
                onnx: model(),
                ..Default::default()
            },
            PredictorSpec {
                tensor_rt: model(),
                triton: model(),
                ..Default::default()
            },
            PredictorSpec {
                pmml: model(),
                custom: Some(CustomSpec::default()),
                ..Default::default()
            },
        ];
        for predictor in cases {
            assert_eq!(
                predictor.framework().unwrap_err(),
                ValidationError::ExactlyOnePredictorViolated(2),
                "{predictor:?}"
            );
        }

        let triple = PredictorSpec {
            sklearn: model(),
            xgboost: Some(XGBoostSpec::default()),
            pmml: model(),
            ..Default::default()
        };
        assert_eq!(
            triple.framework().unwrap_err(),
            ValidationError::ExactlyOnePredictorViolated(3)
        );

        let explainer = ExplainerSpec {
            alibi: Some(AlibiExplainerSpec::default()),
            aix: Some(AixExplainerSpec::default()),
            custom: Some(CustomSpec::default()),
            ..Default::default()
        };
        assert_eq!(
            explainer.framework().unwrap_err(),
            ValidationError::ExactlyOneExplainerViolated(3)
        );
    }

    #[test]
    fn test_storage_uri_outlives_resolved_framework() {
        let predictor = PredictorSpec {
            sklearn: Some(ModelSpec {
                storage_uri: "gs://bucket/model".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (uri, model) = {
            let framework = predictor.framework().unwrap();
            (framework.storage_uri(), framework.model())
        };
        assert_eq!(uri, Some("gs://bucket/model"));
        assert_eq!(model.map(|m| m.storage_uri.as_str()), uri);
    }

    #[test]
    fn test_explainer_with_nothing_is_violation() {
        assert_eq!(
            ExplainerSpec::default().framework().unwrap_err(),
            ValidationError::ExactlyOneExplainerViolated(0)
        );
    }

    #[test]
    fn test_sklearn_container_with_workers() {
        let config = sample_config();
        let predictor = PredictorSpec {
            sklearn: Some(ModelSpec {
                storage_uri: "gs://b/m".into(),
                runtime_version: "v0.5.0".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = predictor
            .framework()
            .unwrap()
            .build_container(&ctx(&config, 1))
            .unwrap();
        assert_eq!(container.name, INFERENCE_SERVICE_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("kserve/sklearnserver:v0.5.0"));
        assert_eq!(
            container.args.unwrap(),
            vec![
                "--model_name=someName",
                "--model_dir=/mnt/models",
                "--http_port=8080",
                "--workers=1",
            ]
        );
    }

    #[test]
    fn test_tensorflow_container_uses_default_version() {
        let config = sample_config();
        let predictor = PredictorSpec {
            tensorflow: Some(ModelSpec {
                storage_uri: "gs://b/m".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let framework = predictor.framework().unwrap();
        assert_eq!(framework.storage_uri(), Some("gs://b/m"));
        let container = framework.build_container(&ctx(&config, 0)).unwrap();
        assert_eq!(container.image.as_deref(), Some("tensorflow/serving:1.14.0"));
        assert_eq!(
            container.command.unwrap(),
            vec!["/usr/bin/tensorflow_model_server"]
        );
    }

    #[test]
    fn test_custom_storage_uri_from_env() {
        let custom = CustomSpec {
            container: Container {
                image: Some("custom:1".into()),
                env: Some(vec![env_var(CUSTOM_SPEC_STORAGE_URI_ENV_VAR_KEY, "hdfs://modelzoo")]),
                ..Default::default()
            },
        };
        let predictor = PredictorSpec {
            custom: Some(custom),
            ..Default::default()
        };
        let framework = predictor.framework().unwrap();
        assert_eq!(framework.storage_uri(), Some("hdfs://modelzoo"));
        let config = sample_config();
        let container = framework.build_container(&ctx(&config, 0)).unwrap();
        assert_eq!(container.name, INFERENCE_SERVICE_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("custom:1"));
    }

    #[test]
    fn test_transformer_appends_forwarding_args() {
        let config = sample_config();
        let transformer = TransformerSpec {
            custom: Some(CustomSpec {
                container: Container {
                    image: Some("transformer:0.1.0".into()),
                    ..Default::default()
                },
            }),
            ..Default::default()
        };
        let container = transformer
            .framework()
            .unwrap()
            .build_container(&ctx(&config, 0))
            .unwrap();
        assert_eq!(
            container.args.unwrap(),
            vec![
                "--model_name",
                "someName",
                "--predictor_host",
                "someName-predictor-default.default",
                "--http_port",
                "8080",
            ]
        );
    }

    #[test]
    fn test_alibi_explainer_args() {
        let config = sample_config();
        let explainer = ExplainerSpec {
            alibi: Some(AlibiExplainerSpec {
                type_: AlibiExplainerType::AnchorTabular,
                model: ModelSpec {
                    storage_uri: "gs://b/explainer".into(),
                    runtime_version: "v0.5.0".into(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = explainer
            .framework()
            .unwrap()
            .build_container(&ctx(&config, 2))
            .unwrap();
        assert_eq!(container.image.as_deref(), Some("kserve/alibi-explainer:v0.5.0"));
        assert_eq!(
            container.args.unwrap(),
            vec![
                "--model_name",
                "someName",
                "--http_port",
                "8080",
                "--predictor_host",
                "someName-predictor-default.default",
                "--workers",
                "2",
                "--storage_uri",
                "/mnt/models",
                "AnchorTabular",
            ]
        );
    }

    #[test]
    fn test_missing_framework_config() {
        let config = InferenceServicesConfig::default();
        let predictor = PredictorSpec {
            pmml: Some(ModelSpec::default()),
            ..Default::default()
        };
        let err = predictor
            .framework()
            .unwrap()
            .build_container(&ctx(&config, 0))
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingFrameworkConfig("pmml".into()));
    }
}
