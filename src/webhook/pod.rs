//! The pod mutation pipeline.
//!
//! Pods labelled with their InferenceService run through a fixed sequence of
//! injectors. Each injector reads the internal annotations the resource
//! builder stamped on the revision template and leaves the pod unchanged when
//! its own container, volume or setting is already there, so mutating a pod
//! twice yields the same pod.

mod accelerator;
mod affinity;
mod agent;
mod metrics_aggregator;
mod storage_initializer;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::{Container, Pod};
use kube_core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube_core::DynamicObject;
use serde_json::Value;

pub use accelerator::AcceleratorInjector;
pub use affinity::AffinityInjector;
pub use agent::AgentInjector;
pub use metrics_aggregator::MetricsAggregatorInjector;
pub use storage_initializer::StorageInitializerInjector;

use super::{decode, into_request, patch_response, WebhookState};
use crate::config::InferenceServicesConfig;
use crate::constants::INFERENCE_SERVICE_POD_LABEL_KEY;
use crate::error::{Error, Result};
use crate::resources::credentials::CredentialBuilder;

/// One step of the pipeline.
#[async_trait]
pub trait PodInjector: Send + Sync {
    fn name(&self) -> &'static str;

    /// `namespace` is the namespace of the admission request; pods created
    /// by a ReplicaSet do not carry one yet.
    async fn inject(&self, pod: &mut Pod, namespace: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MutationPipeline {
    injectors: Vec<Box<dyn PodInjector>>,
}

impl MutationPipeline {
    /// Accelerator selector, affinity, storage initializer, agent, then
    /// metrics aggregation.
    pub fn standard(config: &InferenceServicesConfig, credentials: Arc<dyn CredentialBuilder>) -> Self {
        Self::default()
            .with(AcceleratorInjector)
            .with(AffinityInjector)
            .with(StorageInitializerInjector::new(
                config.storage_initializer.clone(),
                credentials,
            ))
            .with(AgentInjector::new(
                config.agent.clone(),
                config.logger.clone(),
                config.batcher.clone(),
            ))
            .with(MetricsAggregatorInjector::new(config.metrics_aggregator.clone()))
    }

    pub fn with(mut self, injector: impl PodInjector + 'static) -> Self {
        self.injectors.push(Box::new(injector));
        self
    }

    /// Runs every injector in order, stopping at the first failure.
    /// Returns `false` without touching the pod if it does not belong to an
    /// InferenceService.
    pub async fn mutate(&self, pod: &mut Pod, namespace: &str) -> Result<bool> {
        if label(pod, INFERENCE_SERVICE_POD_LABEL_KEY).is_none() {
            return Ok(false);
        }
        for injector in &self.injectors {
            injector.inject(pod, namespace).await.map_err(|err| match err {
                err @ Error::Injection { .. } => err,
                err => Error::injection(injector.name(), err.to_string()),
            })?;
        }
        Ok(true)
    }
}

pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match into_request(review) {
        Ok(request) => mutate_request(&state, &request).await,
        Err(response) => response,
    };
    Json(response.into_review())
}

async fn mutate_request(state: &WebhookState, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let Some(object) = &request.object else {
        return AdmissionResponse::from(request);
    };
    // Only pod creation is intercepted.
    if !matches!(request.operation, Operation::Create) {
        return AdmissionResponse::from(request);
    }
    let namespace = request.namespace.as_deref().unwrap_or_default();
    match mutated(state, object, namespace).await {
        Ok(Some((original, mutated))) => {
            let name = object.metadata.name.as_deref();
            let name = name.or(object.metadata.generate_name.as_deref()).unwrap_or_default();
            log::info!("mutated pod {name} in {namespace} ({})", request.uid);
            patch_response(request, &original, &mutated)
        }
        Ok(None) => AdmissionResponse::from(request),
        Err(err) => {
            log::error!("failed to mutate pod ({}): {err}", request.uid);
            AdmissionResponse::from(request).deny(err.to_string())
        }
    }
}

/// The submitted pod and the mutated one, or `None` for pods that are not
/// part of an InferenceService.
async fn mutated(
    state: &WebhookState,
    object: &DynamicObject,
    namespace: &str,
) -> Result<Option<(Value, Value)>> {
    let mut pod: Pod = decode(object)?;
    if label(&pod, INFERENCE_SERVICE_POD_LABEL_KEY).is_none() {
        return Ok(None);
    }

    let config = state.load_config().await?;
    let pipeline = MutationPipeline::standard(&config, state.credentials.clone());
    pipeline.mutate(&mut pod, namespace).await?;

    let original = serde_json::to_value(object)?;
    let mut mutated = original.clone();
    mutated["metadata"] = serde_json::to_value(&pod.metadata)?;
    mutated["spec"] = serde_json::to_value(&pod.spec)?;
    Ok(Some((original, mutated)))
}

fn find_container<'a>(containers: &'a mut [Container], name: &str) -> Option<&'a mut Container> {
    containers.iter_mut().find(|container| container.name == name)
}

fn has_container(containers: Option<&Vec<Container>>, name: &str) -> bool {
    containers.is_some_and(|containers| containers.iter().any(|container| container.name == name))
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{EnvVar, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::config::tests::sample_config;
    use crate::constants::{
        GKE_ACCELERATOR_ANNOTATION_KEY, INFERENCE_SERVICE_CONTAINER_NAME, QUEUE_PROXY_CONTAINER_NAME,
        STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY,
    };
    use crate::resources::credentials::NoopCredentialBuilder;
    use crate::webhook::tests::{post_review, review, state_with_config, state_without_config};

    /// A pod the way Knative creates it for a revision of `flowers`.
    pub(crate) fn isvc_pod(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                generate_name: Some("flowers-predictor-default-00001-deployment-".into()),
                labels: Some(BTreeMap::from([
                    (INFERENCE_SERVICE_POD_LABEL_KEY.to_string(), "flowers".to_string()),
                    ("component".to_string(), "predictor".to_string()),
                    ("endpoint".to_string(), "default".to_string()),
                ])),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![
                    Container {
                        name: INFERENCE_SERVICE_CONTAINER_NAME.to_string(),
                        image: Some("kserve/sklearnserver:v0.5.0".into()),
                        ..Default::default()
                    },
                    Container {
                        name: QUEUE_PROXY_CONTAINER_NAME.to_string(),
                        env: Some(vec![EnvVar {
                            name: "USER_PORT".into(),
                            value: Some("8080".into()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pipeline() -> MutationPipeline {
        MutationPipeline::standard(&sample_config(), Arc::new(NoopCredentialBuilder))
    }

    struct Recording {
        name: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl PodInjector for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn inject(&self, _pod: &mut Pod, _namespace: &str) -> Result<()> {
            self.calls.lock().push(self.name);
            if self.fail {
                return Err(Error::Credentials("secret unreadable".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_failure_aborts_the_pipeline() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let step = |name, fail| Recording {
            name,
            calls: calls.clone(),
            fail,
        };
        let pipeline = MutationPipeline::default()
            .with(step("first", false))
            .with(step("second", true))
            .with(step("third", false));

        let err = pipeline.mutate(&mut isvc_pod(&[]), "models").await.unwrap_err();
        assert!(matches!(err, Error::Injection { injector: "second", .. }), "{err}");
        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_unlabelled_pods_are_untouched() {
        let mut pod = isvc_pod(&[(STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY, "gs://b/m")]);
        pod.metadata.labels = None;
        let before = pod.clone();
        assert!(!pipeline().mutate(&mut pod, "models").await.unwrap());
        assert_eq!(pod, before);
    }

    #[tokio::test]
    async fn test_pipeline_is_idempotent() {
        let mut pod = isvc_pod(&[
            (STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY, "pvc://claim/models/iris"),
            (GKE_ACCELERATOR_ANNOTATION_KEY, "nvidia-tesla-t4"),
            (crate::constants::LOGGER_ANNOTATION_KEY, "true"),
            (crate::constants::ENABLE_METRIC_AGGREGATION_ANNOTATION_KEY, "true"),
            (crate::constants::ENABLE_PROMETHEUS_SCRAPING_ANNOTATION_KEY, "true"),
        ]);
        assert!(pipeline().mutate(&mut pod, "models").await.unwrap());
        let once = pod.clone();
        assert!(pipeline().mutate(&mut pod, "models").await.unwrap());
        assert_eq!(pod, once);

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.init_containers.as_ref().unwrap().len(), 1);
        assert!(has_container(Some(&spec.containers), "agent"));
        assert!(spec.affinity.is_some());
        assert_eq!(
            spec.node_selector.as_ref().unwrap()["cloud.google.com/gke-accelerator"],
            "nvidia-tesla-t4"
        );
    }

    fn pod_review(pod: &Pod) -> Value {
        review(("", "v1", "Pod"), "pods", serde_json::to_value(pod).unwrap())
    }

    #[tokio::test]
    async fn test_mutate_pods_endpoint_patches_isvc_pods() {
        let pod = isvc_pod(&[(STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY, "gs://b/m")]);
        let response = post_review(state_with_config(), "/mutate-pods", pod_review(&pod)).await;
        assert_eq!(response["allowed"], true);
        assert_eq!(response["patchType"], "JSONPatch");
    }

    #[tokio::test]
    async fn test_mutate_pods_endpoint_skips_foreign_pods() {
        let mut pod = isvc_pod(&[]);
        pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        // Foreign pods never need the ConfigMap.
        let response = post_review(state_without_config(), "/mutate-pods", pod_review(&pod)).await;
        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").map_or(true, Value::is_null));
    }

    #[tokio::test]
    async fn test_mutate_pods_endpoint_fails_closed() {
        let pod = isvc_pod(&[(STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY, "gs://b/m")]);
        let response = post_review(state_without_config(), "/mutate-pods", pod_review(&pod)).await;
        assert_eq!(response["allowed"], false);

        let mut broken = pod_review(&pod);
        broken["request"]["object"]["spec"]["containers"] = json!("not a list");
        let response = post_review(state_with_config(), "/mutate-pods", broken).await;
        assert_eq!(response["allowed"], false);
    }
}
