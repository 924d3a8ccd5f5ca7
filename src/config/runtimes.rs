use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ConfigError;

/// Image coordinates of one model server or explainer framework.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkConfig {
    pub image: String,
    pub default_image_version: String,
    /// Frameworks with a separate GPU build carry its version here; their
    /// runtime versions are then checked against the GPU resources requested.
    #[serde(default)]
    pub default_gpu_image_version: Option<String>,
    /// Runtime versions users may pick; an empty list admits none.
    #[serde(default)]
    pub allowed_image_versions: Vec<String>,
}

impl FrameworkConfig {
    pub fn image_for(&self, runtime_version: &str) -> String {
        format!("{}:{}", self.image, runtime_version)
    }

    pub fn supports_gpu(&self) -> bool {
        self.default_gpu_image_version.is_some()
    }

    pub fn is_version_allowed(&self, version: &str) -> bool {
        self.allowed_image_versions.iter().any(|v| v == version)
    }
}

/// Framework name (`tensorflow`, `alibi`, ...) to image configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RuntimeTable(BTreeMap<String, FrameworkConfig>);

impl RuntimeTable {
    pub fn get(&self, framework: &str) -> Option<&FrameworkConfig> {
        self.0.get(framework)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default)]
    pub ingress_gateway: String,
    #[serde(default, rename = "ingressService")]
    pub ingress_service_name: String,
}

impl IngressConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.ingress_gateway.is_empty() || self.ingress_service_name.is_empty() {
            return Err(ConfigError::Invalid {
                key: super::INGRESS_KEY,
                message: "ingressGateway and ingressService are required".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allow_list_rejects_everything() {
        let config = FrameworkConfig {
            image: "kserve/sklearnserver".into(),
            default_image_version: "v0.5.0".into(),
            ..Default::default()
        };
        assert!(!config.is_version_allowed("whatever"));
        assert!(!config.is_version_allowed("v0.5.0"));
        assert!(!config.supports_gpu());
        assert_eq!(config.image_for("v0.5.0"), "kserve/sklearnserver:v0.5.0");
    }

    #[test]
    fn test_allow_list_is_enforced() {
        let config = FrameworkConfig {
            allowed_image_versions: vec!["1.14.0".into()],
            ..Default::default()
        };
        assert!(config.is_version_allowed("1.14.0"));
        assert!(!config.is_version_allowed("1.13.0"));
    }
}
