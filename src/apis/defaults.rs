//! Fills unset fields of an InferenceService spec from the operator config.
//! Applying defaults twice yields the same spec as applying them once.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::inference_service::{EndpointSpec, InferenceServiceSpec, ModelSpec};
use crate::config::{InferenceServicesConfig, ResourceDefaults, RuntimeTable};
use crate::constants::NVIDIA_GPU_RESOURCE_TYPE;

pub fn apply_defaults(spec: &mut InferenceServiceSpec, config: &InferenceServicesConfig) {
    for endpoint in spec.endpoints_mut() {
        default_endpoint(endpoint, config);
    }
}

fn default_endpoint(endpoint: &mut EndpointSpec, config: &InferenceServicesConfig) {
    let predictor = &mut endpoint.predictor;
    if let Some(custom) = predictor.custom.as_mut() {
        default_resources(
            custom.container.resources.get_or_insert_with(Default::default),
            &config.resource_defaults,
        );
    }
    default_single_model(predictor.models_mut(), &config.predictors, &config.resource_defaults);

    if let Some(transformer) = endpoint.transformer.as_mut() {
        if let Some(custom) = transformer.custom.as_mut() {
            default_resources(
                custom.container.resources.get_or_insert_with(Default::default),
                &config.resource_defaults,
            );
        }
    }

    if let Some(explainer) = endpoint.explainer.as_mut() {
        if let Some(custom) = explainer.custom.as_mut() {
            default_resources(
                custom.container.resources.get_or_insert_with(Default::default),
                &config.resource_defaults,
            );
        }
        default_single_model(explainer.models_mut(), &config.explainers, &config.resource_defaults);
    }
}

/// Ambiguous unions are left untouched; validation rejects them.
fn default_single_model(
    models: Vec<(&'static str, &mut ModelSpec)>,
    runtimes: &RuntimeTable,
    resources: &ResourceDefaults,
) {
    let Ok([(framework, model)]) = <[_; 1]>::try_from(models) else {
        return;
    };
    if model.runtime_version.is_empty() {
        if let Some(runtime) = runtimes.get(framework) {
            model.runtime_version = match &runtime.default_gpu_image_version {
                Some(gpu) if requests_gpu(&model.resources) => gpu.clone(),
                _ => runtime.default_image_version.clone(),
            };
        }
    }
    default_resources(&mut model.resources, resources);
}

pub(crate) fn requests_gpu(resources: &ResourceRequirements) -> bool {
    resources
        .limits
        .as_ref()
        .is_some_and(|limits| limits.contains_key(NVIDIA_GPU_RESOURCE_TYPE))
}

fn default_resources(resources: &mut ResourceRequirements, defaults: &ResourceDefaults) {
    for map in [&mut resources.requests, &mut resources.limits] {
        let map = map.get_or_insert_with(BTreeMap::new);
        map.entry("cpu".to_string())
            .or_insert_with(|| Quantity(defaults.cpu.clone()));
        map.entry("memory".to_string())
            .or_insert_with(|| Quantity(defaults.memory.clone()));
    }
}
