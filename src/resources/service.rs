//! Builds the desired workload of one component of one endpoint.
//!
//! The revision template produced here is shared by both deployment modes:
//! serverless wraps it in a Knative Service, raw mode in a Deployment plus a
//! Service. Everything the pod mutation webhook needs is passed along as
//! internal annotations on the template.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec};
use kube::api::ObjectMeta;
use kube::Resource;

use super::credentials::CredentialBuilder;
use super::knative::{KnativeService, KnativeServiceSpec, RevisionSpec, RevisionTemplateSpec};
use crate::apis::framework::ContainerContext;
use crate::apis::inference_service::{DeploymentSpec, InferenceService};
use crate::apis::PredictorFramework;
use crate::config::InferenceServicesConfig;
use crate::constants::{
    self, Component, Endpoint, AGENT_MODEL_CONFIG_MOUNT_PATH_ANNOTATION_KEY,
    AGENT_MODEL_CONFIG_VOLUME_NAME_ANNOTATION_KEY, AGENT_MODEL_DIR_ANNOTATION_KEY,
    AGENT_SHOULD_INJECT_ANNOTATION_KEY, AUTOSCALING_CLASS_ANNOTATION_KEY, AUTOSCALING_CLASS_KPA,
    AUTOSCALING_TARGET_ANNOTATION_KEY, BATCHER_ANNOTATION_KEY,
    BATCHER_MAX_BATCH_SIZE_ANNOTATION_KEY, BATCHER_MAX_LATENCY_ANNOTATION_KEY,
    BATCHER_TIMEOUT_ANNOTATION_KEY, DEFAULT_MIN_REPLICAS, DEFAULT_MODEL_LOCAL_MOUNT_PATH,
    DEFAULT_QUEUE_SIDECAR_RESOURCE_PERCENTAGE, DEFAULT_SCALING_TARGET,
    INFERENCE_SERVICE_DEFAULT_HTTP_PORT, INFERENCE_SERVICE_POD_LABEL_KEY, KSERVICE_COMPONENT_LABEL,
    KSERVICE_ENDPOINT_LABEL, KSERVICE_MODEL_LABEL, LOGGER_ANNOTATION_KEY,
    LOGGER_MODE_ANNOTATION_KEY, LOGGER_SINK_URL_ANNOTATION_KEY, MAX_SCALE_ANNOTATION_KEY,
    MIN_SCALE_ANNOTATION_KEY, MODEL_CONFIG_DIR, QUEUE_SIDECAR_RESOURCE_PERCENTAGE_ANNOTATION_KEY,
    SERVICE_ANNOTATION_DISALLOWED_LIST, STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY,
};
use crate::error::{Error, Result};

/// Everything needed to materialize one component in either deployment mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentTemplate {
    /// Metadata of the owned top-level object.
    pub metadata: ObjectMeta,
    pub template: RevisionTemplateSpec,
    /// Replica floor; only raw mode uses it directly.
    pub min_replicas: i32,
}

impl ComponentTemplate {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// ConfigMap the agent reads its model list from, set for multi-model
    /// predictors only.
    pub fn model_config_name(&self) -> Option<&str> {
        self.template
            .metadata
            .annotations
            .as_ref()?
            .get(AGENT_MODEL_CONFIG_VOLUME_NAME_ANNOTATION_KEY)
            .map(String::as_str)
    }

    pub fn into_knative_service(self) -> KnativeService {
        KnativeService {
            metadata: self.metadata,
            spec: KnativeServiceSpec {
                template: self.template,
            },
            status: None,
        }
    }
}

pub struct ServiceBuilder<'a> {
    config: &'a InferenceServicesConfig,
    credentials: &'a dyn CredentialBuilder,
}

impl<'a> ServiceBuilder<'a> {
    pub fn new(config: &'a InferenceServicesConfig, credentials: &'a dyn CredentialBuilder) -> Self {
        Self { config, credentials }
    }

    /// Knative Service for `component` of `endpoint`, or `None` if the spec
    /// does not declare that component.
    pub async fn create_component_service(
        &self,
        isvc: &InferenceService,
        component: Component,
        endpoint: Endpoint,
    ) -> Result<Option<KnativeService>> {
        Ok(self
            .create_component_template(isvc, component, endpoint)
            .await?
            .map(ComponentTemplate::into_knative_service))
    }

    pub async fn create_component_template(
        &self,
        isvc: &InferenceService,
        component: Component,
        endpoint: Endpoint,
    ) -> Result<Option<ComponentTemplate>> {
        let name = isvc
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::MissingField("InferenceService".into(), "metadata.name"))?;
        let namespace = isvc
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::MissingField(name.to_string(), "metadata.namespace"))?;
        let Some(endpoint_spec) = isvc.spec.endpoint(endpoint) else {
            return Ok(None);
        };

        let predictor_host;
        let mut ctx = ContainerContext {
            name,
            parallelism: 0,
            predictor_host: "",
            config: self.config,
        };
        let mut multi_model = false;

        let (deployment, storage_uri, container) = match component {
            Component::Predictor => {
                let predictor = &endpoint_spec.predictor;
                let framework = predictor.framework()?;
                ctx.parallelism = predictor.deployment.parallelism;
                multi_model = !matches!(framework, PredictorFramework::Custom(_))
                    && framework.storage_uri().is_none();
                (
                    &predictor.deployment,
                    framework.storage_uri(),
                    framework.build_container(&ctx)?,
                )
            }
            Component::Transformer => {
                let Some(transformer) = &endpoint_spec.transformer else {
                    return Ok(None);
                };
                let framework = transformer.framework()?;
                predictor_host =
                    constants::component_url(name, namespace, Component::Predictor, endpoint);
                ctx.parallelism = transformer.deployment.parallelism;
                ctx.predictor_host = &predictor_host;
                (
                    &transformer.deployment,
                    framework.storage_uri(),
                    framework.build_container(&ctx)?,
                )
            }
            Component::Explainer => {
                let Some(explainer) = &endpoint_spec.explainer else {
                    return Ok(None);
                };
                let framework = explainer.framework()?;
                let upstream = if endpoint_spec.transformer.is_some() {
                    Component::Transformer
                } else {
                    Component::Predictor
                };
                predictor_host = constants::component_url(name, namespace, upstream, endpoint);
                ctx.parallelism = explainer.deployment.parallelism;
                ctx.predictor_host = &predictor_host;
                (
                    &explainer.deployment,
                    framework.storage_uri(),
                    framework.build_container(&ctx)?,
                )
            }
        };

        let mut annotations = build_annotations(isvc.metadata.annotations.as_ref(), deployment);
        if let Some(uri) = storage_uri {
            annotations.insert(
                STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY.to_string(),
                uri.to_string(),
            );
        }
        if multi_model {
            add_agent_annotations(name, &mut annotations);
        }
        add_batcher_annotations(deployment, &mut annotations);
        let mut container = container;
        if add_logger_annotations(deployment, &mut annotations) {
            add_logger_container_port(&mut container);
        }

        let service_name = constants::service_name(name, component, endpoint);
        let mut labels = isvc.metadata.labels.clone().unwrap_or_default();
        labels.insert(INFERENCE_SERVICE_POD_LABEL_KEY.to_string(), name.to_string());
        labels.insert(KSERVICE_COMPONENT_LABEL.to_string(), component.to_string());
        labels.insert(KSERVICE_MODEL_LABEL.to_string(), name.to_string());
        labels.insert(KSERVICE_ENDPOINT_LABEL.to_string(), endpoint.to_string());

        let mut pod_spec = PodSpec {
            service_account_name: Some(deployment.service_account_name.clone())
                .filter(|sa| !sa.is_empty()),
            containers: vec![container],
            ..Default::default()
        };
        let mut volumes = Vec::new();
        self.credentials
            .create_secret_volume_and_env(
                namespace,
                &deployment.service_account_name,
                &mut pod_spec.containers[0],
                &mut volumes,
            )
            .await?;
        if !volumes.is_empty() {
            pod_spec.volumes = Some(volumes);
        }

        Ok(Some(ComponentTemplate {
            metadata: ObjectMeta {
                name: Some(service_name),
                namespace: Some(namespace.to_string()),
                labels: isvc.metadata.labels.clone(),
                owner_references: isvc.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            template: RevisionTemplateSpec {
                metadata: ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                spec: RevisionSpec {
                    timeout_seconds: Some(component.default_timeout()),
                    container_concurrency: Some(i64::from(deployment.parallelism)),
                    pod_spec,
                },
            },
            min_replicas: deployment.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS),
        }))
    }
}

/// Autoscaling annotations of a revision template. User annotations are
/// copied over except the disallowed ones; user-set target, class and queue
/// sidecar percentage win over the defaults.
pub fn build_annotations(
    user: Option<&BTreeMap<String, String>>,
    deployment: &DeploymentSpec,
) -> BTreeMap<String, String> {
    let mut annotations: BTreeMap<String, String> = user
        .into_iter()
        .flatten()
        .filter(|(key, _)| !SERVICE_ANNOTATION_DISALLOWED_LIST.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    match deployment.min_replicas {
        None => {
            annotations.insert(
                MIN_SCALE_ANNOTATION_KEY.to_string(),
                DEFAULT_MIN_REPLICAS.to_string(),
            );
        }
        Some(0) => {}
        Some(min) => {
            annotations.insert(MIN_SCALE_ANNOTATION_KEY.to_string(), min.to_string());
        }
    }
    if deployment.max_replicas != 0 {
        annotations.insert(
            MAX_SCALE_ANNOTATION_KEY.to_string(),
            deployment.max_replicas.to_string(),
        );
    }
    annotations
        .entry(QUEUE_SIDECAR_RESOURCE_PERCENTAGE_ANNOTATION_KEY.to_string())
        .or_insert_with(|| DEFAULT_QUEUE_SIDECAR_RESOURCE_PERCENTAGE.to_string());
    annotations
        .entry(AUTOSCALING_TARGET_ANNOTATION_KEY.to_string())
        .or_insert_with(|| match deployment.parallelism {
            0 => DEFAULT_SCALING_TARGET.to_string(),
            parallelism => parallelism.to_string(),
        });
    annotations
        .entry(AUTOSCALING_CLASS_ANNOTATION_KEY.to_string())
        .or_insert_with(|| AUTOSCALING_CLASS_KPA.to_string());
    annotations
}

fn add_logger_annotations(deployment: &DeploymentSpec, annotations: &mut BTreeMap<String, String>) -> bool {
    let Some(logger) = &deployment.logger else {
        return false;
    };
    annotations.insert(LOGGER_ANNOTATION_KEY.to_string(), "true".to_string());
    if let Some(url) = &logger.url {
        annotations.insert(LOGGER_SINK_URL_ANNOTATION_KEY.to_string(), url.clone());
    }
    annotations.insert(
        LOGGER_MODE_ANNOTATION_KEY.to_string(),
        logger.mode.as_str().to_string(),
    );
    true
}

fn add_batcher_annotations(deployment: &DeploymentSpec, annotations: &mut BTreeMap<String, String>) {
    let Some(batcher) = &deployment.batcher else {
        return;
    };
    annotations.insert(BATCHER_ANNOTATION_KEY.to_string(), "true".to_string());
    for (key, value) in [
        (BATCHER_MAX_BATCH_SIZE_ANNOTATION_KEY, batcher.max_batch_size),
        (BATCHER_MAX_LATENCY_ANNOTATION_KEY, batcher.max_latency),
        (BATCHER_TIMEOUT_ANNOTATION_KEY, batcher.timeout),
    ] {
        if let Some(value) = value {
            annotations.insert(key.to_string(), value.to_string());
        }
    }
}

fn add_agent_annotations(name: &str, annotations: &mut BTreeMap<String, String>) {
    annotations.insert(AGENT_SHOULD_INJECT_ANNOTATION_KEY.to_string(), "true".to_string());
    annotations.insert(
        AGENT_MODEL_CONFIG_VOLUME_NAME_ANNOTATION_KEY.to_string(),
        constants::model_config_name(name, 0),
    );
    annotations.insert(
        AGENT_MODEL_CONFIG_MOUNT_PATH_ANNOTATION_KEY.to_string(),
        MODEL_CONFIG_DIR.to_string(),
    );
    annotations.insert(
        AGENT_MODEL_DIR_ANNOTATION_KEY.to_string(),
        DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
    );
}

fn add_logger_container_port(container: &mut Container) {
    if container.ports.as_ref().map_or(true, Vec::is_empty) {
        container.ports = Some(vec![ContainerPort {
            container_port: INFERENCE_SERVICE_DEFAULT_HTTP_PORT,
            ..Default::default()
        }]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::inference_service::{
        EndpointSpec, ExplainerSpec, InferenceServiceSpec, LoggerMode, LoggerSpec, ModelSpec,
        PredictorSpec, TransformerSpec, AlibiExplainerSpec, CustomSpec, BatcherSpec,
    };
    use crate::config::tests::sample_config;
    use crate::resources::credentials::NoopCredentialBuilder;

    fn isvc(spec: InferenceServiceSpec) -> InferenceService {
        let mut isvc = InferenceService::new("flowers", spec);
        isvc.metadata.namespace = Some("models".into());
        isvc.metadata.uid = Some("uid-1".into());
        isvc
    }

    fn tensorflow(storage_uri: &str) -> PredictorSpec {
        PredictorSpec {
            tensorflow: Some(ModelSpec {
                storage_uri: storage_uri.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn annotations_of(template: &ComponentTemplate) -> &BTreeMap<String, String> {
        template.template.metadata.annotations.as_ref().unwrap()
    }

    #[tokio::test]
    async fn test_tensorflow_predictor_service() {
        let config = sample_config();
        let builder = ServiceBuilder::new(&config, &NoopCredentialBuilder);
        let service = isvc(InferenceServiceSpec {
            default: EndpointSpec {
                predictor: tensorflow("gs://b/m"),
                ..Default::default()
            },
            ..Default::default()
        });

        let ksvc = builder
            .create_component_service(&service, Component::Predictor, Endpoint::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ksvc.metadata.name.as_deref(), Some("flowers-predictor-default"));
        assert_eq!(ksvc.metadata.namespace.as_deref(), Some("models"));
        assert_eq!(ksvc.metadata.owner_references.as_ref().unwrap()[0].uid, "uid-1");

        let template = &ksvc.spec.template;
        let annotations = template.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY], "gs://b/m");
        assert_eq!(annotations[AUTOSCALING_TARGET_ANNOTATION_KEY], "1");
        assert_eq!(annotations[MIN_SCALE_ANNOTATION_KEY], "1");
        assert_eq!(annotations[AUTOSCALING_CLASS_ANNOTATION_KEY], AUTOSCALING_CLASS_KPA);
        assert_eq!(annotations[QUEUE_SIDECAR_RESOURCE_PERCENTAGE_ANNOTATION_KEY], "20");
        assert!(!annotations.contains_key(AGENT_SHOULD_INJECT_ANNOTATION_KEY));

        let labels = template.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[INFERENCE_SERVICE_POD_LABEL_KEY], "flowers");
        assert_eq!(labels[KSERVICE_COMPONENT_LABEL], "predictor");
        assert_eq!(labels[KSERVICE_ENDPOINT_LABEL], "default");

        assert_eq!(template.spec.timeout_seconds, Some(60));
        assert_eq!(template.spec.container_concurrency, Some(0));
        let container = &template.spec.pod_spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("tensorflow/serving:1.14.0"));
    }

    #[tokio::test]
    async fn test_absent_components_build_nothing() {
        let config = sample_config();
        let builder = ServiceBuilder::new(&config, &NoopCredentialBuilder);
        let service = isvc(InferenceServiceSpec {
            default: EndpointSpec {
                predictor: tensorflow("gs://b/m"),
                ..Default::default()
            },
            ..Default::default()
        });
        for (component, endpoint) in [
            (Component::Transformer, Endpoint::Default),
            (Component::Explainer, Endpoint::Default),
            (Component::Predictor, Endpoint::Canary),
        ] {
            let built = builder
                .create_component_template(&service, component, endpoint)
                .await
                .unwrap();
            assert!(built.is_none(), "{component} {endpoint}");
        }
    }

    #[tokio::test]
    async fn test_explainer_targets_transformer_when_present() {
        let config = sample_config();
        let builder = ServiceBuilder::new(&config, &NoopCredentialBuilder);
        let service = isvc(InferenceServiceSpec {
            default: EndpointSpec {
                predictor: tensorflow("gs://b/m"),
                transformer: Some(TransformerSpec {
                    custom: Some(CustomSpec::default()),
                    ..Default::default()
                }),
                explainer: Some(ExplainerSpec {
                    alibi: Some(AlibiExplainerSpec::default()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        });
        let template = builder
            .create_component_template(&service, Component::Explainer, Endpoint::Default)
            .await
            .unwrap()
            .unwrap();
        let args = template.template.spec.pod_spec.containers[0].args.clone().unwrap();
        assert!(args.contains(&"flowers-transformer-default.models".to_string()));
        assert_eq!(template.template.spec.timeout_seconds, Some(300));
    }

    #[tokio::test]
    async fn test_predictor_without_storage_uri_is_multi_model() {
        let config = sample_config();
        let builder = ServiceBuilder::new(&config, &NoopCredentialBuilder);
        let service = isvc(InferenceServiceSpec {
            default: EndpointSpec {
                predictor: tensorflow(""),
                ..Default::default()
            },
            ..Default::default()
        });
        let template = builder
            .create_component_template(&service, Component::Predictor, Endpoint::Default)
            .await
            .unwrap()
            .unwrap();
        let annotations = annotations_of(&template);
        assert_eq!(annotations[AGENT_SHOULD_INJECT_ANNOTATION_KEY], "true");
        assert_eq!(
            annotations[AGENT_MODEL_CONFIG_VOLUME_NAME_ANNOTATION_KEY],
            "modelconfig-flowers-0"
        );
        assert!(!annotations.contains_key(STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY));
        assert_eq!(template.model_config_name(), Some("modelconfig-flowers-0"));
    }

    #[tokio::test]
    async fn test_logger_and_batcher_annotations() {
        let config = sample_config();
        let builder = ServiceBuilder::new(&config, &NoopCredentialBuilder);
        let mut predictor = tensorflow("gs://b/m");
        predictor.deployment.logger = Some(LoggerSpec {
            url: Some("http://sink".into()),
            mode: LoggerMode::Request,
        });
        predictor.deployment.batcher = Some(BatcherSpec {
            max_batch_size: Some(16),
            ..Default::default()
        });
        let service = isvc(InferenceServiceSpec {
            default: EndpointSpec {
                predictor,
                ..Default::default()
            },
            ..Default::default()
        });
        let template = builder
            .create_component_template(&service, Component::Predictor, Endpoint::Default)
            .await
            .unwrap()
            .unwrap();
        let annotations = annotations_of(&template);
        assert_eq!(annotations[LOGGER_ANNOTATION_KEY], "true");
        assert_eq!(annotations[LOGGER_SINK_URL_ANNOTATION_KEY], "http://sink");
        assert_eq!(annotations[LOGGER_MODE_ANNOTATION_KEY], "request");
        assert_eq!(annotations[BATCHER_ANNOTATION_KEY], "true");
        assert_eq!(annotations[BATCHER_MAX_BATCH_SIZE_ANNOTATION_KEY], "16");
        assert!(!annotations.contains_key(BATCHER_TIMEOUT_ANNOTATION_KEY));

        let ports = template.template.spec.pod_spec.containers[0].ports.clone().unwrap();
        assert_eq!(ports[0].container_port, 8080);
    }

    #[test]
    fn test_build_annotations_respects_user_values() {
        let user = BTreeMap::from([
            (MIN_SCALE_ANNOTATION_KEY.to_string(), "5".to_string()),
            (AUTOSCALING_TARGET_ANNOTATION_KEY.to_string(), "10".to_string()),
            ("team".to_string(), "vision".to_string()),
            (
                STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY.to_string(),
                "gs://stale".to_string(),
            ),
        ]);
        let deployment = DeploymentSpec {
            min_replicas: Some(0),
            max_replicas: 3,
            parallelism: 4,
            ..Default::default()
        };
        let annotations = build_annotations(Some(&user), &deployment);
        assert!(!annotations.contains_key(MIN_SCALE_ANNOTATION_KEY));
        assert!(!annotations.contains_key(STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY));
        assert_eq!(annotations[MAX_SCALE_ANNOTATION_KEY], "3");
        assert_eq!(annotations[AUTOSCALING_TARGET_ANNOTATION_KEY], "10");
        assert_eq!(annotations["team"], "vision");
    }

    #[test]
    fn test_parallelism_becomes_target() {
        let deployment = DeploymentSpec {
            min_replicas: Some(2),
            parallelism: 4,
            ..Default::default()
        };
        let annotations = build_annotations(None, &deployment);
        assert_eq!(annotations[AUTOSCALING_TARGET_ANNOTATION_KEY], "4");
        assert_eq!(annotations[MIN_SCALE_ANNOTATION_KEY], "2");
        assert!(!annotations.contains_key(MAX_SCALE_ANNOTATION_KEY));
    }
}
