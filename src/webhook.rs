//! Admission webhooks.
//!
//! Three endpoints share one router:
//! - `POST /validate-inferenceservices` rejects invalid InferenceService specs
//! - `POST /mutate-inferenceservices` fills unset fields from the operator config
//! - `POST /mutate-pods` runs the pod mutation pipeline on InferenceService pods
//!
//! Every handler loads the operator ConfigMap fresh and fails closed: an error
//! anywhere denies the request instead of letting the object through untouched.

pub mod inference_service;
pub mod pod;

use std::sync::Arc;

use axum::{routing::post, Router};
use k8s_openapi::api::core::v1::ConfigMap;
use kube_client::Client;
use kube_core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube_core::DynamicObject;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::InferenceServicesConfig;
use crate::error::Result;
use crate::resources::credentials::{CredentialBuilder, ServiceAccountCredentialBuilder};
use crate::subscriber::{KubeObjectClient, ObjectClient};

/// Shared state of the webhook handlers.
pub struct WebhookState {
    config_maps: Arc<dyn ObjectClient<ConfigMap>>,
    credentials: Arc<dyn CredentialBuilder>,
    config_namespace: String,
}

impl WebhookState {
    pub fn new(client: Client, config_namespace: impl Into<String>) -> Self {
        Self::with_clients(
            Arc::new(KubeObjectClient::new(client.clone())),
            Arc::new(ServiceAccountCredentialBuilder::new(client)),
            config_namespace,
        )
    }

    pub fn with_clients(
        config_maps: Arc<dyn ObjectClient<ConfigMap>>,
        credentials: Arc<dyn CredentialBuilder>,
        config_namespace: impl Into<String>,
    ) -> Self {
        Self {
            config_maps,
            credentials,
            config_namespace: config_namespace.into(),
        }
    }

    async fn load_config(&self) -> Result<InferenceServicesConfig> {
        InferenceServicesConfig::load(self.config_maps.as_ref(), &self.config_namespace).await
    }
}

pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(
            "/validate-inferenceservices",
            post(inference_service::validate_handler),
        )
        .route(
            "/mutate-inferenceservices",
            post(inference_service::mutate_handler),
        )
        .route("/mutate-pods", post(pod::mutate_handler))
        .with_state(state)
}

/// Unwraps the request of a review, answering malformed reviews directly.
fn into_request(
    review: AdmissionReview<DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    let request: Result<AdmissionRequest<DynamicObject>, _> = review.try_into();
    request.map_err(|err| {
        log::error!("malformed admission review: {err}");
        AdmissionResponse::invalid(err.to_string())
    })
}

fn decode<K: DeserializeOwned>(object: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Allows the request with the RFC 6902 difference between `original` and
/// `mutated`, or without a patch if they are equal.
fn patch_response(
    request: &AdmissionRequest<DynamicObject>,
    original: &Value,
    mutated: &Value,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let patch = json_patch::diff(original, mutated);
    if patch.0.is_empty() {
        return response;
    }
    log::debug!("patching {} with {} operation(s)", request.uid, patch.0.len());
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(err) => {
            log::error!("failed to serialize patch for {}: {err}", request.uid);
            AdmissionResponse::from(request).deny(format!("patch serialization error: {err}"))
        }
    }
}
