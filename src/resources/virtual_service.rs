//! Routes external and cluster-local traffic to the default and canary
//! endpoints. Routing is all-or-nothing: if any required component has not
//! reported a hostname yet, no VirtualService is produced and the failure
//! reason ends up on the `RoutesReady` condition.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::Resource;

use super::istio::{
    Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRetry, HttpRoute,
    HttpRouteDestination, PortSelector, StringMatch, VirtualService, VirtualServiceSpec,
};
use crate::apis::inference_service::{EndpointSpec, InferenceService};
use crate::apis::status::{ComponentStatusMap, InferenceServiceStatus, RouteOutcome};
use crate::config::IngressConfig;
use crate::constants::{
    self, Component, Endpoint, COMMON_DEFAULT_HTTP_PORT, KNATIVE_LOCAL_GATEWAY,
};

pub const PREDICTOR_STATUS_UNKNOWN: &str = "PredictorStatusUnknown";
pub const PREDICTOR_HOSTNAME_UNKNOWN: &str = "PredictorHostnameUnknown";
pub const TRANSFORMER_STATUS_UNKNOWN: &str = "TransformerStatusUnknown";
pub const TRANSFORMER_HOSTNAME_UNKNOWN: &str = "TransformerHostnameUnknown";
pub const EXPLAINER_STATUS_UNKNOWN: &str = "ExplainerStatusUnknown";
pub const EXPLAINER_HOSTNAME_UNKNOWN: &str = "ExplainerHostnameUnknown";

pub const PREDICTOR_MISSING_MESSAGE: &str = "Failed to reconcile predictor";
pub const TRANSFORMER_MISSING_MESSAGE: &str = "Failed to reconcile transformer";
pub const EXPLAINER_MISSING_MESSAGE: &str = "Failed to reconcile explainer";

const EXPLAIN_RETRY_ATTEMPTS: i32 = 3;
const EXPLAIN_PER_TRY_TIMEOUT: &str = "600s";

struct RouteFailure {
    reason: &'static str,
    message: &'static str,
}

impl From<RouteFailure> for RouteOutcome {
    fn from(failure: RouteFailure) -> Self {
        RouteOutcome::Failed {
            reason: failure.reason,
            message: failure.message.to_string(),
        }
    }
}

fn status_reasons(component: Component) -> (&'static str, &'static str, &'static str) {
    match component {
        Component::Predictor => (
            PREDICTOR_STATUS_UNKNOWN,
            PREDICTOR_HOSTNAME_UNKNOWN,
            PREDICTOR_MISSING_MESSAGE,
        ),
        Component::Transformer => (
            TRANSFORMER_STATUS_UNKNOWN,
            TRANSFORMER_HOSTNAME_UNKNOWN,
            TRANSFORMER_MISSING_MESSAGE,
        ),
        Component::Explainer => (
            EXPLAINER_STATUS_UNKNOWN,
            EXPLAINER_HOSTNAME_UNKNOWN,
            EXPLAINER_MISSING_MESSAGE,
        ),
    }
}

/// Hostname recorded for a component once it became ready.
fn ready_hostname(statuses: Option<&ComponentStatusMap>, component: Component) -> Result<&str, RouteFailure> {
    let (status_unknown, hostname_unknown, message) = status_reasons(component);
    let entry = statuses
        .and_then(|map| map.get(&component))
        .ok_or(RouteFailure {
            reason: status_unknown,
            message,
        })?;
    if entry.hostname.is_empty() {
        return Err(RouteFailure {
            reason: hostname_unknown,
            message,
        });
    }
    Ok(&entry.hostname)
}

pub struct VirtualServiceBuilder<'a> {
    ingress: &'a IngressConfig,
}

impl<'a> VirtualServiceBuilder<'a> {
    pub fn new(ingress: &'a IngressConfig) -> Self {
        Self { ingress }
    }

    /// The VirtualService together with the route status to record, or no
    /// VirtualService and a failed route status.
    pub fn create_virtual_service(
        &self,
        isvc: &InferenceService,
        status: &InferenceServiceStatus,
    ) -> (Option<VirtualService>, RouteOutcome) {
        match self.build(isvc, status) {
            Ok((virtual_service, outcome)) => (Some(virtual_service), outcome),
            Err(failure) => (None, failure.into()),
        }
    }

    fn build(
        &self,
        isvc: &InferenceService,
        status: &InferenceServiceStatus,
    ) -> Result<(VirtualService, RouteOutcome), RouteFailure> {
        let name = isvc.metadata.name.as_deref().unwrap_or_default();
        let namespace = isvc.metadata.namespace.as_deref().unwrap_or_default();
        let canary_weight = isvc.spec.canary_traffic_percent();
        let default_weight = 100 - canary_weight;

        let endpoints = [
            (Endpoint::Default, Some(&isvc.spec.default), status.default.as_ref(), default_weight),
            (Endpoint::Canary, isvc.spec.canary.as_ref(), status.canary.as_ref(), canary_weight),
        ];

        let mut predict_destinations = Vec::new();
        for (endpoint, spec, statuses, weight) in endpoints {
            let Some(spec) = spec else { continue };
            let (target, _) = predict_target(spec, statuses)?;
            predict_destinations.push(self.destination(
                &constants::service_name(name, target, endpoint),
                namespace,
                weight,
            ));
        }

        let mut explain_destinations = Vec::new();
        for (endpoint, spec, statuses, weight) in endpoints {
            if !spec.is_some_and(|s| s.explainer.is_some()) {
                continue;
            }
            ready_hostname(statuses, Component::Explainer)?;
            explain_destinations.push(self.destination(
                &constants::service_name(name, Component::Explainer, endpoint),
                namespace,
                weight,
            ));
        }

        let service_hostname = ready_hostname(status.default.as_ref(), Component::Predictor)?
            .replace(&format!("-{}-{}", Component::Predictor, Endpoint::Default), "");
        let cluster_hostname = constants::cluster_service_hostname(name, namespace);

        let mut http = vec![HttpRoute {
            match_: self.matches(constants::predict_prefix(), &service_hostname, &cluster_hostname),
            route: predict_destinations,
            retries: Some(HttpRetry {
                attempts: 0,
                per_try_timeout: None,
            }),
        }];
        if !explain_destinations.is_empty() {
            http.push(HttpRoute {
                match_: self.matches(constants::explain_prefix(), &service_hostname, &cluster_hostname),
                route: explain_destinations,
                retries: Some(HttpRetry {
                    attempts: EXPLAIN_RETRY_ATTEMPTS,
                    per_try_timeout: Some(EXPLAIN_PER_TRY_TIMEOUT.to_string()),
                }),
            });
        }

        let virtual_service = VirtualService {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: isvc.metadata.labels.clone(),
                annotations: isvc.metadata.annotations.clone(),
                owner_references: isvc.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            spec: VirtualServiceSpec {
                hosts: vec![service_hostname.clone(), cluster_hostname.clone()],
                gateways: vec![
                    self.ingress.ingress_gateway.clone(),
                    KNATIVE_LOCAL_GATEWAY.to_string(),
                ],
                http,
            },
        };

        let outcome = RouteOutcome::Ready {
            url: format!(
                "http://{service_hostname}{}",
                constants::inference_service_prefix(name)
            ),
            address: format!("http://{cluster_hostname}{}", constants::predict_path(name)),
            default_weight,
            canary_weight: isvc.spec.canary.is_some().then_some(canary_weight),
        };
        Ok((virtual_service, outcome))
    }

    fn matches(&self, uri_regex: &str, service_hostname: &str, cluster_hostname: &str) -> Vec<HttpMatchRequest> {
        vec![
            HttpMatchRequest {
                uri: Some(StringMatch::Regex(uri_regex.to_string())),
                authority: Some(StringMatch::Regex(constants::host_regexp(service_hostname))),
                gateways: vec![self.ingress.ingress_gateway.clone()],
            },
            HttpMatchRequest {
                uri: Some(StringMatch::Regex(uri_regex.to_string())),
                authority: Some(StringMatch::Regex(constants::host_regexp(cluster_hostname))),
                gateways: vec![KNATIVE_LOCAL_GATEWAY.to_string()],
            },
        ]
    }

    /// Requests go through the local gateway with the `Host` header naming
    /// the target component service.
    fn destination(&self, target: &str, namespace: &str, weight: i32) -> HttpRouteDestination {
        HttpRouteDestination {
            destination: Destination {
                host: constants::local_gateway_host(),
                port: Some(PortSelector {
                    number: COMMON_DEFAULT_HTTP_PORT,
                }),
            },
            weight,
            headers: Some(Headers {
                request: Some(HeaderOperations {
                    set: BTreeMap::from([(
                        "Host".to_string(),
                        constants::cluster_service_hostname(target, namespace),
                    )]),
                }),
            }),
        }
    }
}

/// The predictor must be ready; a configured transformer must be ready too
/// and takes its place as the entry point.
fn predict_target<'s>(
    spec: &EndpointSpec,
    statuses: Option<&'s ComponentStatusMap>,
) -> Result<(Component, &'s str), RouteFailure> {
    let predictor = ready_hostname(statuses, Component::Predictor)?;
    if spec.transformer.is_some() {
        let transformer = ready_hostname(statuses, Component::Transformer)?;
        return Ok((Component::Transformer, transformer));
    }
    Ok((Component::Predictor, predictor))
}

/// Routing for modes without a mesh: clients address the entry component's
/// own service, which receives all traffic.
pub fn resolve_routes(isvc: &InferenceService, status: &InferenceServiceStatus) -> RouteOutcome {
    let name = isvc.metadata.name.as_deref().unwrap_or_default();
    match predict_target(&isvc.spec.default, status.default.as_ref()) {
        Ok((_, hostname)) => RouteOutcome::Ready {
            url: format!("http://{hostname}{}", constants::inference_service_prefix(name)),
            address: format!("http://{hostname}{}", constants::predict_path(name)),
            default_weight: 100,
            canary_weight: None,
        },
        Err(failure) => failure.into(),
    }
}
