//! Admission-time checks on an InferenceService. Every rule here reports a
//! [`ValidationError`]; nothing touches the cluster.

use std::sync::OnceLock;

use k8s_openapi::api::core::v1::Container;
use regex::Regex;

use super::defaults::requests_gpu;
use super::framework::ExplainerFramework;
use super::inference_service::{
    CustomSpec, DeploymentSpec, EndpointSpec, InferenceService, InferenceServiceSpec, ModelSpec,
};
use crate::config::{InferenceServicesConfig, RuntimeTable};
use crate::constants::{
    DeploymentMode, AZURE_BLOB_URL_PATTERN, GPU_IMAGE_VERSION_SUFFIX,
    SUPPORTED_STORAGE_URI_PREFIXES,
};
use crate::error::ValidationError;

const DNS_1035_LABEL_PATTERN: &str = "^[a-z]([-a-z0-9]*[a-z0-9])?$";
const DNS_1035_LABEL_MAX_LENGTH: usize = 63;

fn dns_1035_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DNS_1035_LABEL_PATTERN).expect("static pattern"))
}

fn azure_blob_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(AZURE_BLOB_URL_PATTERN).expect("static pattern"))
}

fn scheme_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\w+?://").expect("static pattern"))
}

pub fn validate(isvc: &InferenceService, config: &InferenceServicesConfig) -> Result<(), ValidationError> {
    let name = isvc.metadata.name.as_deref().unwrap_or_default();
    validate_name(name)?;
    let mode = DeploymentMode::from_annotations(isvc.metadata.annotations.as_ref());
    validate_spec(&isvc.spec, mode, config)
}

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > DNS_1035_LABEL_MAX_LENGTH || !dns_1035_label().is_match(name) {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn validate_spec(
    spec: &InferenceServiceSpec,
    mode: DeploymentMode,
    config: &InferenceServicesConfig,
) -> Result<(), ValidationError> {
    validate_canary(spec, mode)?;
    validate_endpoint(&spec.default, config)?;
    if let Some(canary) = &spec.canary {
        validate_endpoint(canary, config)?;
    }
    Ok(())
}

fn validate_canary(spec: &InferenceServiceSpec, mode: DeploymentMode) -> Result<(), ValidationError> {
    let percent = spec.canary_traffic_percent();
    if !(0..=100).contains(&percent) {
        return Err(ValidationError::TrafficBoundsExceeded(percent));
    }
    if spec.canary.is_none() && percent != 0 {
        return Err(ValidationError::TrafficProvidedWithoutCanary);
    }
    if spec.canary.is_some() && mode == DeploymentMode::RawDeployment {
        return Err(ValidationError::CanaryUnsupportedInRawMode);
    }
    Ok(())
}

fn validate_endpoint(endpoint: &EndpointSpec, config: &InferenceServicesConfig) -> Result<(), ValidationError> {
    let predictor = endpoint.predictor.framework()?;
    validate_deployment(&endpoint.predictor.deployment)?;
    if let Some(model) = predictor.model() {
        validate_model(predictor.name(), model, &config.predictors)?;
    }
    if let Some(custom) = predictor.custom() {
        validate_custom(custom)?;
    }
    if let Some(uri) = predictor.storage_uri() {
        validate_storage_uri(uri)?;
    }

    if let Some(transformer) = &endpoint.transformer {
        let framework = transformer.framework()?;
        validate_deployment(&transformer.deployment)?;
        let super::TransformerFramework::Custom(custom) = framework;
        validate_custom(custom)?;
    }

    if let Some(explainer) = &endpoint.explainer {
        let framework = explainer.framework()?;
        validate_deployment(&explainer.deployment)?;
        match framework {
            ExplainerFramework::Custom(custom) => validate_custom(custom)?,
            _ => {
                if let Some(model) = framework.model() {
                    validate_model(framework.name(), model, &config.explainers)?;
                }
            }
        }
        if let Some(uri) = framework.storage_uri() {
            validate_storage_uri(uri)?;
        }
    }
    Ok(())
}

fn validate_deployment(deployment: &DeploymentSpec) -> Result<(), ValidationError> {
    let min = deployment.min_replicas;
    let max = deployment.max_replicas;
    if min.is_some_and(|min| min < 0) {
        return Err(ValidationError::MinReplicasLowerBoundExceeded);
    }
    if max < 0 {
        return Err(ValidationError::MaxReplicasLowerBoundExceeded);
    }
    if max != 0 && min.is_some_and(|min| min > max) {
        return Err(ValidationError::MinReplicasShouldBeLessThanMax);
    }
    if deployment.parallelism < 0 {
        return Err(ValidationError::ParallelismLowerBoundExceeded);
    }
    Ok(())
}

/// Runtime version against the allow-list, and for frameworks with a GPU
/// build, the version suffix against the GPU resources requested.
fn validate_model(framework: &str, model: &ModelSpec, runtimes: &RuntimeTable) -> Result<(), ValidationError> {
    let runtime = runtimes
        .get(framework)
        .ok_or_else(|| ValidationError::MissingFrameworkConfig(framework.to_string()))?;
    let version = if model.runtime_version.is_empty() {
        runtime.default_image_version.as_str()
    } else {
        model.runtime_version.as_str()
    };
    if !runtime.is_version_allowed(version) {
        return Err(ValidationError::InvalidRuntimeVersion {
            framework: framework.to_string(),
            version: version.to_string(),
            allowed: runtime.allowed_image_versions.clone(),
        });
    }
    if runtime.supports_gpu() {
        let gpu = requests_gpu(&model.resources);
        if gpu != version.contains(GPU_IMAGE_VERSION_SUFFIX) {
            return Err(ValidationError::GpuVersionMismatch {
                framework: framework.to_string(),
                version: version.to_string(),
                gpu,
            });
        }
    }
    Ok(())
}

fn validate_custom(custom: &CustomSpec) -> Result<(), ValidationError> {
    let forbidden = forbidden_container_fields(&custom.container);
    if !forbidden.is_empty() {
        return Err(ValidationError::CustomContainerForbiddenFields(forbidden.join(", ")));
    }
    Ok(())
}

fn forbidden_container_fields(container: &Container) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if container.stdin.unwrap_or(false) {
        fields.push("stdin");
    }
    if container.stdin_once.unwrap_or(false) {
        fields.push("stdinOnce");
    }
    if container.tty.unwrap_or(false) {
        fields.push("tty");
    }
    fields
}

/// Accepts an empty URI, a plain local path, a known scheme, or an Azure blob
/// URL naming both an account and a path.
pub fn validate_storage_uri(uri: &str) -> Result<(), ValidationError> {
    if uri.is_empty() || !scheme_pattern().is_match(uri) {
        return Ok(());
    }
    let unsupported = || ValidationError::UnsupportedStorageUri(uri.to_string());
    if is_azure_blob_host(uri) {
        return azure_blob_url()
            .is_match(uri)
            .then_some(())
            .ok_or_else(unsupported);
    }
    if SUPPORTED_STORAGE_URI_PREFIXES
        .iter()
        .any(|prefix| uri.starts_with(prefix))
    {
        return Ok(());
    }
    Err(unsupported())
}

fn is_azure_blob_host(uri: &str) -> bool {
    let Some((_, rest)) = uri.split_once("://") else {
        return false;
    };
    let host = rest.split('/').next().unwrap_or_default();
    host.ends_with("blob.core.windows.net")
}
