//! Error taxonomy.
//!
//! - [`ValidationError`]: a bad user spec, rejected at admission time.
//! - [`ConfigError`]: a malformed operator ConfigMap. Not user-fixable, so the
//!   controller stops retrying until the ConfigMap changes.
//! - [`Error::Kube`]: transient API server failures, retried with backoff.
//!
//! Partial readiness is not an error; it is an `Unknown` condition.

use thiserror::Error;

/// Violations detected by the spec resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("exactly one predictor framework must be specified, found {0}")]
    ExactlyOnePredictorViolated(usize),
    #[error("exactly one transformer framework must be specified, found {0}")]
    ExactlyOneTransformerViolated(usize),
    #[error("exactly one explainer framework must be specified, found {0}")]
    ExactlyOneExplainerViolated(usize),
    #[error("runtime version {version} for {framework} is not allowed, must be one of {allowed:?}")]
    InvalidRuntimeVersion {
        framework: String,
        version: String,
        allowed: Vec<String>,
    },
    #[error("{framework} runtime version {version} does not match the GPU resources requested (GPU: {gpu})")]
    GpuVersionMismatch {
        framework: String,
        version: String,
        gpu: bool,
    },
    #[error("minReplicas cannot be less than 0")]
    MinReplicasLowerBoundExceeded,
    #[error("maxReplicas cannot be less than 0")]
    MaxReplicasLowerBoundExceeded,
    #[error("minReplicas cannot be greater than maxReplicas")]
    MinReplicasShouldBeLessThanMax,
    #[error("parallelism cannot be less than 0")]
    ParallelismLowerBoundExceeded,
    #[error("canaryTrafficPercent must be between 0 and 100, got {0}")]
    TrafficBoundsExceeded(i32),
    #[error("canaryTrafficPercent was provided without a canary endpoint")]
    TrafficProvidedWithoutCanary,
    #[error("canary endpoints are not supported in RawDeployment mode")]
    CanaryUnsupportedInRawMode,
    #[error("storage URI {0:?} has an unsupported scheme")]
    UnsupportedStorageUri(String),
    #[error("Custom container validation error: must not set the field(s): {0}")]
    CustomContainerForbiddenFields(String),
    #[error("no configuration found for {0}")]
    MissingFrameworkConfig(String),
    #[error("invalid InferenceService name {0:?}: must be a DNS-1035 label")]
    InvalidName(String),
}

/// The operator ConfigMap could not be interpreted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configmap {0} not found")]
    NotFound(String),
    #[error("unable to parse {key} config json: {source}")]
    Parse {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {key} config: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Top-level error for controller and webhook operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube_client::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("credential error: {0}")]
    Credentials(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("object {0} is missing {1}")]
    MissingField(String, &'static str),

    #[error("pod mutation failed in {injector}: {message}")]
    Injection {
        injector: &'static str,
        message: String,
    },
}

impl Error {
    /// Whether retrying without any change to the cluster could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(_) | Error::Credentials(_) => true,
            Error::Validation(_)
            | Error::Config(_)
            | Error::Serialization(_)
            | Error::MissingField(..)
            | Error::Injection { .. } => false,
        }
    }

    /// Short machine-readable reason used for events.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "ApiError",
            Error::Validation(_) => "InvalidSpec",
            Error::Config(_) => "InvalidConfiguration",
            Error::Credentials(_) => "CredentialError",
            Error::Serialization(_) => "SerializationError",
            Error::MissingField(..) => "MissingField",
            Error::Injection { .. } => "InjectionFailed",
        }
    }

    pub fn injection(injector: &'static str, message: impl Into<String>) -> Self {
        Error::Injection {
            injector,
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!Error::from(ValidationError::TrafficProvidedWithoutCanary).is_retryable());
        assert!(!Error::from(ConfigError::NotFound("cm".into())).is_retryable());
        assert!(Error::Credentials("sa not found".into()).is_retryable());
    }

    #[test]
    fn test_event_reasons() {
        assert_eq!(Error::from(ValidationError::TrafficProvidedWithoutCanary).reason(), "InvalidSpec");
        assert_eq!(Error::from(ConfigError::NotFound("cm".into())).reason(), "InvalidConfiguration");
        assert_eq!(Error::MissingField("Service".into(), "metadata.name").reason(), "MissingField");
        assert_eq!(Error::injection("agent", "no queue-proxy").reason(), "InjectionFailed");
    }

    #[test]
    fn test_custom_container_message() {
        let err = ValidationError::CustomContainerForbiddenFields("stdin, stdinOnce".into());
        assert_eq!(
            err.to_string(),
            "Custom container validation error: must not set the field(s): stdin, stdinOnce"
        );
    }
}
