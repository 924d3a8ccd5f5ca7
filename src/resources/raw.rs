//! RawDeployment mode: a component becomes an `apps/v1` Deployment fronted by
//! a ClusterIP Service instead of a Knative Service.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use super::service::ComponentTemplate;
use crate::apis::status::{ComponentReadiness, Condition, ConditionStatus, READY};
use crate::constants::{self, COMMON_DEFAULT_HTTP_PORT, INFERENCE_SERVICE_DEFAULT_HTTP_PORT};

const APP_LABEL: &str = "app";
const DEPLOYMENT_AVAILABLE: &str = "Available";

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

pub fn build_deployment(component: &ComponentTemplate) -> Deployment {
    let name = component.name();
    let mut pod_metadata = component.template.metadata.clone();
    pod_metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(selector_labels(name));

    Deployment {
        metadata: component.metadata.clone(),
        spec: Some(DeploymentSpec {
            // No scale to zero without an activator in front.
            replicas: Some(component.min_replicas.max(1)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(pod_metadata),
                spec: Some(component.template.spec.pod_spec.clone()),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn build_service(component: &ComponentTemplate) -> Service {
    Service {
        metadata: ObjectMeta {
            name: component.metadata.name.clone(),
            namespace: component.metadata.namespace.clone(),
            labels: component.metadata.labels.clone(),
            owner_references: component.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(component.name())),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: COMMON_DEFAULT_HTTP_PORT as i32,
                target_port: Some(IntOrString::Int(INFERENCE_SERVICE_DEFAULT_HTTP_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn condition_status(status: &str) -> ConditionStatus {
    match status {
        "True" => ConditionStatus::True,
        "False" => ConditionStatus::False,
        _ => ConditionStatus::Unknown,
    }
}

/// Readiness of a raw component: the Deployment's `Available` condition, the
/// Service's cluster hostname and the available replica count.
pub fn deployment_readiness(deployment: &Deployment) -> ComponentReadiness {
    let Some(status) = &deployment.status else {
        return ComponentReadiness::default();
    };
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let namespace = deployment.metadata.namespace.as_deref().unwrap_or_default();
    let ready = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == DEPLOYMENT_AVAILABLE)
        .map(|c| Condition {
            type_: READY.to_string(),
            status: condition_status(&c.status),
            reason: c.reason.clone().unwrap_or_default(),
            message: c.message.clone().unwrap_or_default(),
            last_transition_time: None,
        });
    ComponentReadiness {
        ready,
        hostname: Some(constants::cluster_service_hostname(name, namespace)),
        revision: None,
        replicas: Some(status.available_replicas.unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

    use super::*;
    use crate::resources::knative::{RevisionSpec, RevisionTemplateSpec};

    fn component() -> ComponentTemplate {
        ComponentTemplate {
            metadata: ObjectMeta {
                name: Some("flowers-predictor-default".into()),
                namespace: Some("models".into()),
                ..Default::default()
            },
            template: RevisionTemplateSpec {
                metadata: ObjectMeta {
                    labels: Some(BTreeMap::from([(
                        constants::INFERENCE_SERVICE_POD_LABEL_KEY.to_string(),
                        "flowers".to_string(),
                    )])),
                    ..Default::default()
                },
                spec: RevisionSpec::default(),
            },
            min_replicas: 0,
        }
    }

    #[test]
    fn test_deployment_selects_its_pods() {
        let deployment = build_deployment(&component());
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let selector = spec.selector.match_labels.unwrap();
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        for (key, value) in &selector {
            assert_eq!(pod_labels.get(key), Some(value));
        }
        assert_eq!(pod_labels[constants::INFERENCE_SERVICE_POD_LABEL_KEY], "flowers");
    }

    #[test]
    fn test_service_forwards_to_serving_port() {
        let service = build_service(&component());
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn test_readiness_from_available_condition() {
        let mut deployment = build_deployment(&component());
        assert_eq!(deployment_readiness(&deployment), ComponentReadiness::default());

        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            conditions: Some(vec![DeploymentCondition {
                type_: DEPLOYMENT_AVAILABLE.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let readiness = deployment_readiness(&deployment);
        assert!(readiness.ready.unwrap().is_true());
        assert_eq!(readiness.replicas, Some(2));
        assert_eq!(
            readiness.hostname.as_deref(),
            Some("flowers-predictor-default.models.svc.cluster.local")
        );
    }
}
