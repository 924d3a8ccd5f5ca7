//! The subset of `serving.knative.dev/v1` Service this controller writes
//! and reads back.

use k8s_openapi::api::core::v1::PodSpec;
use kube::api::ObjectMeta;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::apis::status::{Addressable, Condition, ComponentReadiness, READY};

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    status = "KnativeServiceStatus",
    derive = "Default",
    derive = "PartialEq",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KnativeServiceSpec {
    pub template: RevisionTemplateSpec,
}

/// A `serving.knative.dev/v1` Service.
pub type KnativeService = Service;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RevisionTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: RevisionSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<i64>,
    #[serde(flatten)]
    pub pod_spec: PodSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnativeServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_created_revision_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_ready_revision_name: Option<String>,
}

/// Host part of a URL such as `http://flowers-predictor-default.models.example.com`.
fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

impl KnativeService {
    /// Readiness as reported by Knative; a service that has not reported a
    /// status yet yields an empty [`ComponentReadiness`].
    pub fn readiness(&self) -> ComponentReadiness {
        let Some(status) = &self.status else {
            return ComponentReadiness::default();
        };
        ComponentReadiness {
            ready: status.conditions.iter().find(|c| c.type_ == READY).cloned(),
            hostname: status.url.as_deref().map(url_host).map(str::to_string),
            revision: status.latest_created_revision_name.clone(),
            replicas: None,
        }
    }
}
