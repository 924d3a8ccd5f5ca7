//! Validating and defaulting webhooks for InferenceService.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube_core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube_core::DynamicObject;
use serde_json::Value;

use super::{decode, into_request, patch_response, WebhookState};
use crate::apis::defaults::apply_defaults;
use crate::apis::validation::validate;
use crate::apis::InferenceService;
use crate::error::Result;

pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match into_request(review) {
        Ok(request) => validate_request(&state, &request).await,
        Err(response) => response,
    };
    Json(response.into_review())
}

pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match into_request(review) {
        Ok(request) => default_request(&state, &request).await,
        Err(response) => response,
    };
    Json(response.into_review())
}

async fn validate_request(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    // Deletes carry no object and are never validated.
    let Some(object) = &request.object else {
        return AdmissionResponse::from(request);
    };
    let name = object.metadata.name.as_deref().unwrap_or_default();
    match check(state, object).await {
        Ok(()) => {
            log::info!("admitted InferenceService {name} ({})", request.uid);
            AdmissionResponse::from(request)
        }
        Err(err) => {
            log::info!("denied InferenceService {name} ({}): {err}", request.uid);
            AdmissionResponse::from(request).deny(err.to_string())
        }
    }
}

async fn check(state: &WebhookState, object: &DynamicObject) -> Result<()> {
    let isvc: InferenceService = decode(object)?;
    let config = state.load_config().await?;
    validate(&isvc, &config)?;
    Ok(())
}

async fn default_request(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let Some(object) = &request.object else {
        return AdmissionResponse::from(request);
    };
    match defaulted(state, object).await {
        Ok((original, mutated)) => patch_response(request, &original, &mutated),
        Err(err) => {
            log::warn!("defaulting {} failed: {err}", request.uid);
            AdmissionResponse::from(request).deny(err.to_string())
        }
    }
}

/// The submitted object and the same object with a defaulted spec.
async fn defaulted(state: &WebhookState, object: &DynamicObject) -> Result<(Value, Value)> {
    let mut isvc: InferenceService = decode(object)?;
    let config = state.load_config().await?;
    apply_defaults(&mut isvc.spec, &config);

    let original = serde_json::to_value(object)?;
    let mut mutated = original.clone();
    mutated["spec"] = serde_json::to_value(&isvc.spec)?;
    Ok((original, mutated))
}
