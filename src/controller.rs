//! The InferenceService reconcile loop.
//!
//! One pass reads the operator ConfigMap, converges every component of both
//! endpoints, converges routing, then writes the aggregated status if it
//! changed. The controller runtime runs at most one pass per InferenceService
//! at a time.

pub mod events;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::ObjectMeta;
use kube::Resource;
use kube_client::api::PostParams;
use kube_client::{Api, Client};
use kube_runtime::controller::Action;
use kube_runtime::events::EventType;

use self::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::apis::{ComponentReadiness, InferenceService, InferenceServiceStatus};
use crate::config::InferenceServicesConfig;
use crate::constants::{self, Component, DeploymentMode, Endpoint, MODEL_CONFIG_FILE_NAME};
use crate::error::{Error, Result};
use crate::reconciler::{ensure_absent, ensure_exists, Reconciler};
use crate::resources::credentials::{CredentialBuilder, ServiceAccountCredentialBuilder};
use crate::resources::istio::VirtualService;
use crate::resources::knative::KnativeService;
use crate::resources::raw;
use crate::resources::service::{ComponentTemplate, ServiceBuilder};
use crate::resources::virtual_service::{resolve_routes, VirtualServiceBuilder};
use crate::subscriber::{KubeObjectClient, ObjectClient, QualifiedName};

const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Writes the status subresource of an InferenceService.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn replace_status(
        &self,
        isvc: &InferenceService,
        status: InferenceServiceStatus,
    ) -> Result<()>;
}

pub struct KubeStatusWriter {
    client: Client,
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn replace_status(
        &self,
        isvc: &InferenceService,
        status: InferenceServiceStatus,
    ) -> Result<()> {
        let key = QualifiedName::from_resource(isvc)
            .ok_or_else(|| Error::MissingField("InferenceService".into(), "metadata.name"))?;
        let api = match &key.namespace {
            Some(namespace) => Api::<InferenceService>::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        };
        let mut updated = isvc.clone();
        updated.status = Some(status);
        // Carries the observed resourceVersion, so a concurrent write conflicts.
        api.replace_status(&key.name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await?;
        Ok(())
    }
}

/// Collaborators of a reconcile pass.
pub struct Context {
    pub config_maps: Arc<dyn ObjectClient<ConfigMap>>,
    pub knative_services: Arc<dyn ObjectClient<KnativeService>>,
    pub virtual_services: Arc<dyn ObjectClient<VirtualService>>,
    pub deployments: Arc<dyn ObjectClient<Deployment>>,
    pub services: Arc<dyn ObjectClient<Service>>,
    pub status: Arc<dyn StatusWriter>,
    pub credentials: Arc<dyn CredentialBuilder>,
    pub events: Arc<dyn EventPublisher>,
    /// Namespace holding the `inferenceservice-config` ConfigMap.
    pub config_namespace: String,
}

impl Context {
    pub fn new(client: Client, config_namespace: impl Into<String>) -> Self {
        Self {
            config_maps: Arc::new(KubeObjectClient::new(client.clone())),
            knative_services: Arc::new(KubeObjectClient::new(client.clone())),
            virtual_services: Arc::new(KubeObjectClient::new(client.clone())),
            deployments: Arc::new(KubeObjectClient::new(client.clone())),
            services: Arc::new(KubeObjectClient::new(client.clone())),
            status: Arc::new(KubeStatusWriter {
                client: client.clone(),
            }),
            credentials: Arc::new(ServiceAccountCredentialBuilder::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client)),
            config_namespace: config_namespace.into(),
        }
    }
}

/// Transient failures are retried after a delay; anything else waits for the
/// InferenceService, its children or the ConfigMap to change.
pub fn error_policy(isvc: Arc<InferenceService>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = isvc.metadata.name.as_deref().unwrap_or_default();
    if error.is_retryable() {
        log::warn!("reconciling InferenceService {name} failed, retrying: {error}");
        Action::requeue(RETRY_DELAY)
    } else {
        log::error!("reconciling InferenceService {name} failed: {error}");
        Action::await_change()
    }
}

pub async fn reconcile(isvc: Arc<InferenceService>, ctx: Arc<Context>) -> Result<Action> {
    let key = QualifiedName::from_resource(isvc.as_ref())
        .ok_or_else(|| Error::MissingField("InferenceService".into(), "metadata.name"))?;
    log::info!("reconciling InferenceService {key}");

    let status = match reconcile_inference_service(&isvc, &ctx).await {
        Ok(status) => status,
        Err(err) => {
            ctx.events
                .publish(
                    &isvc.object_ref(&()),
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(format!("{}: {err}", err.reason())),
                )
                .await;
            return Err(err);
        }
    };

    if isvc.status.as_ref() != Some(&status) {
        log::debug!("writing status of {key}, ready: {}", status.is_ready());
        ctx.status.replace_status(&isvc, status).await?;
    }
    Ok(Action::await_change())
}

async fn reconcile_inference_service(
    isvc: &InferenceService,
    ctx: &Context,
) -> Result<InferenceServiceStatus> {
    let config =
        InferenceServicesConfig::load(ctx.config_maps.as_ref(), &ctx.config_namespace).await?;
    let mode = DeploymentMode::from_annotations(isvc.metadata.annotations.as_ref());

    let mut status = isvc.status.clone().unwrap_or_default();
    status.initialize_conditions();
    status.observed_generation = isvc.metadata.generation;

    let builder = ServiceBuilder::new(&config, ctx.credentials.as_ref());
    for endpoint in [Endpoint::Default, Endpoint::Canary] {
        for component in Component::ALL {
            let desired = builder
                .create_component_template(isvc, component, endpoint)
                .await?;
            if let Some(model_config) = desired.as_ref().and_then(ComponentTemplate::model_config_name) {
                ensure_model_config(isvc, model_config, ctx).await?;
            }
            let readiness = match mode {
                DeploymentMode::Serverless => {
                    reconcile_knative(isvc, component, endpoint, desired, ctx).await?
                }
                DeploymentMode::RawDeployment => {
                    reconcile_raw(isvc, component, endpoint, desired, ctx).await?
                }
            };
            status.propagate_status(endpoint, component, readiness.as_ref());
        }
    }

    let outcome = match mode {
        DeploymentMode::Serverless => {
            let (virtual_service, outcome) =
                VirtualServiceBuilder::new(&config.ingress).create_virtual_service(isvc, &status);
            if let Some(virtual_service) = virtual_service {
                Reconciler::new(ctx.virtual_services.as_ref(), virtual_service)
                    .reconcile()
                    .await?;
            }
            outcome
        }
        DeploymentMode::RawDeployment => resolve_routes(isvc, &status),
    };
    status.propagate_route_status(&outcome);
    Ok(status)
}

fn component_key(isvc: &InferenceService, component: Component, endpoint: Endpoint) -> QualifiedName {
    QualifiedName {
        namespace: isvc.metadata.namespace.clone(),
        name: constants::service_name(
            isvc.metadata.name.as_deref().unwrap_or_default(),
            component,
            endpoint,
        ),
    }
}

async fn component_deleted(isvc: &InferenceService, key: &QualifiedName, ctx: &Context) {
    ctx.events
        .publish(
            &isvc.object_ref(&()),
            EventType::Normal,
            reasons::COMPONENT_DELETED,
            actions::RECONCILE,
            Some(format!("deleted {}", key.name)),
        )
        .await;
}

async fn reconcile_knative(
    isvc: &InferenceService,
    component: Component,
    endpoint: Endpoint,
    desired: Option<ComponentTemplate>,
    ctx: &Context,
) -> Result<Option<ComponentReadiness>> {
    match desired {
        Some(template) => {
            let live = Reconciler::new(ctx.knative_services.as_ref(), template.into_knative_service())
                .reconcile()
                .await?;
            Ok(Some(live.readiness()))
        }
        None => {
            let key = component_key(isvc, component, endpoint);
            if ensure_absent(ctx.knative_services.as_ref(), &key).await? {
                component_deleted(isvc, &key, ctx).await;
            }
            Ok(None)
        }
    }
}

async fn reconcile_raw(
    isvc: &InferenceService,
    component: Component,
    endpoint: Endpoint,
    desired: Option<ComponentTemplate>,
    ctx: &Context,
) -> Result<Option<ComponentReadiness>> {
    match desired {
        Some(template) => {
            let deployment = Reconciler::new(ctx.deployments.as_ref(), raw::build_deployment(&template))
                .reconcile()
                .await?;
            Reconciler::new(ctx.services.as_ref(), raw::build_service(&template))
                .reconcile()
                .await?;
            Ok(Some(raw::deployment_readiness(&deployment)))
        }
        None => {
            let key = component_key(isvc, component, endpoint);
            let deleted = ensure_absent(ctx.deployments.as_ref(), &key).await?;
            if ensure_absent(ctx.services.as_ref(), &key).await? || deleted {
                component_deleted(isvc, &key, ctx).await;
            }
            Ok(None)
        }
    }
}

/// The model list is owned by whoever registers models; only an empty list
/// is seeded here.
async fn ensure_model_config(isvc: &InferenceService, name: &str, ctx: &Context) -> Result<()> {
    let desired = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: isvc.metadata.namespace.clone(),
            owner_references: isvc.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            MODEL_CONFIG_FILE_NAME.to_string(),
            "[]".to_string(),
        )])),
        ..Default::default()
    };
    ensure_exists(ctx.config_maps.as_ref(), &desired).await?;
    Ok(())
}
