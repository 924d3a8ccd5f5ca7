//! Observed state of an InferenceService and the condition bookkeeping that
//! folds per-component readiness into a single `Ready` condition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{Component, Endpoint};

pub const READY: &str = "Ready";
pub const ROUTES_READY: &str = "RoutesReady";
pub const DEFAULT_PREDICTOR_READY: &str = "DefaultPredictorReady";
pub const DEFAULT_TRANSFORMER_READY: &str = "DefaultTransformerReady";
pub const DEFAULT_EXPLAINER_READY: &str = "DefaultExplainerReady";
pub const CANARY_PREDICTOR_READY: &str = "CanaryPredictorReady";
pub const CANARY_TRANSFORMER_READY: &str = "CanaryTransformerReady";
pub const CANARY_EXPLAINER_READY: &str = "CanaryExplainerReady";

/// Condition type tracking one component of one endpoint.
pub fn component_condition_type(endpoint: Endpoint, component: Component) -> &'static str {
    match (endpoint, component) {
        (Endpoint::Default, Component::Predictor) => DEFAULT_PREDICTOR_READY,
        (Endpoint::Default, Component::Transformer) => DEFAULT_TRANSFORMER_READY,
        (Endpoint::Default, Component::Explainer) => DEFAULT_EXPLAINER_READY,
        (Endpoint::Canary, Component::Predictor) => CANARY_PREDICTOR_READY,
        (Endpoint::Canary, Component::Transformer) => CANARY_TRANSFORMER_READY,
        (Endpoint::Canary, Component::Explainer) => CANARY_EXPLAINER_READY,
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition. Also used to read the conditions of the
/// Knative services this controller owns.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// A happy condition that is `True` exactly when every living condition is.
#[derive(Debug, Clone, Copy)]
pub struct ConditionSet {
    pub happy: &'static str,
    pub living: &'static [&'static str],
}

pub const INFERENCE_SERVICE_CONDITIONS: ConditionSet = ConditionSet {
    happy: READY,
    living: &[ROUTES_READY, DEFAULT_PREDICTOR_READY],
};

impl ConditionSet {
    fn is_living(&self, type_: &str) -> bool {
        self.living.contains(&type_)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Addressable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Observed state of one component service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfigurationSpec {
    /// Latest created revision.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Empty until the component has become ready.
    #[serde(default, rename = "host", skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

pub type ComponentStatusMap = BTreeMap<Component, StatusConfigurationSpec>;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_traffic: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ComponentStatusMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<ComponentStatusMap>,
}

/// Readiness of an owned resource as seen by the controller, independent of
/// whether it is a Knative service or a raw Deployment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentReadiness {
    /// The resource's own `Ready` condition, absent until it reports one.
    pub ready: Option<Condition>,
    pub hostname: Option<String>,
    pub revision: Option<String>,
    pub replicas: Option<i32>,
}

/// Outcome of building the ingress route.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteOutcome {
    Ready {
        url: String,
        address: String,
        default_weight: i32,
        canary_weight: Option<i32>,
    },
    Failed {
        reason: &'static str,
        message: String,
    },
}

impl InferenceServiceStatus {
    /// Adds every managed condition that is missing, as `Unknown`.
    pub fn initialize_conditions(&mut self) {
        let set = INFERENCE_SERVICE_CONDITIONS;
        for type_ in set.living.iter().chain([&set.happy]) {
            if self.get_condition(type_).is_none() {
                self.conditions
                    .push(Condition::new(*type_, ConditionStatus::Unknown, "", ""));
            }
        }
    }

    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.get_condition(type_).is_some_and(Condition::is_true)
    }

    pub fn is_ready(&self) -> bool {
        INFERENCE_SERVICE_CONDITIONS
            .living
            .iter()
            .all(|type_| self.is_condition_true(type_))
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.set_condition(type_, ConditionStatus::True, "", "");
    }

    pub fn mark_false(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_condition(type_, ConditionStatus::False, reason, message);
    }

    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_condition(type_, ConditionStatus::Unknown, reason, message);
    }

    /// Removes a condition. Living conditions are reset to `Unknown` instead.
    pub fn clear_condition(&mut self, type_: &str) {
        if INFERENCE_SERVICE_CONDITIONS.is_living(type_) {
            self.mark_unknown(type_, "", "");
            return;
        }
        self.conditions.retain(|c| c.type_ != type_);
    }

    /// The transition time only moves when the status itself changes.
    fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = Some(Utc::now());
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self
                .conditions
                .push(Condition::new(type_, status, reason, message)),
        }
        if INFERENCE_SERVICE_CONDITIONS.is_living(type_) {
            self.recompute_happy();
        }
    }

    fn recompute_happy(&mut self) {
        let set = INFERENCE_SERVICE_CONDITIONS;
        let mut worst: Option<Condition> = None;
        for type_ in set.living {
            let condition = self
                .get_condition(type_)
                .cloned()
                .unwrap_or_else(|| Condition::new(*type_, ConditionStatus::Unknown, "", ""));
            match (condition.status, worst.as_ref().map(|w| w.status)) {
                (ConditionStatus::True, _) => {}
                (ConditionStatus::False, Some(ConditionStatus::False)) => {}
                (ConditionStatus::False, _) => worst = Some(condition),
                (ConditionStatus::Unknown, None) => worst = Some(condition),
                (ConditionStatus::Unknown, Some(_)) => {}
            }
        }
        let (status, reason, message) = match worst {
            None => (ConditionStatus::True, String::new(), String::new()),
            Some(c) => (c.status, c.reason, c.message),
        };
        match self.conditions.iter_mut().find(|c| c.type_ == set.happy) {
            Some(happy) => {
                if happy.status != status {
                    happy.status = status;
                    happy.last_transition_time = Some(Utc::now());
                }
                happy.reason = reason;
                happy.message = message;
            }
            None => self
                .conditions
                .push(Condition::new(set.happy, status, reason, message)),
        }
    }

    fn component_map(&mut self, endpoint: Endpoint) -> &mut Option<ComponentStatusMap> {
        match endpoint {
            Endpoint::Default => &mut self.default,
            Endpoint::Canary => &mut self.canary,
        }
    }

    pub fn component(&self, endpoint: Endpoint, component: Component) -> Option<&StatusConfigurationSpec> {
        let map = match endpoint {
            Endpoint::Default => self.default.as_ref(),
            Endpoint::Canary => self.canary.as_ref(),
        };
        map?.get(&component)
    }

    pub fn propagate_default_status(&mut self, component: Component, readiness: Option<&ComponentReadiness>) {
        self.propagate_status(Endpoint::Default, component, readiness);
    }

    pub fn propagate_canary_status(&mut self, component: Component, readiness: Option<&ComponentReadiness>) {
        self.propagate_status(Endpoint::Canary, component, readiness);
    }

    /// Folds the readiness of an owned resource into the component map and
    /// its condition. `None` means the resource does not exist: the condition
    /// and the map entry are removed.
    pub fn propagate_status(
        &mut self,
        endpoint: Endpoint,
        component: Component,
        readiness: Option<&ComponentReadiness>,
    ) {
        let condition_type = component_condition_type(endpoint, component);
        let Some(readiness) = readiness else {
            self.clear_condition(condition_type);
            let map = self.component_map(endpoint);
            if let Some(entries) = map.as_mut() {
                entries.remove(&component);
            }
            if map.as_ref().is_some_and(BTreeMap::is_empty) {
                *map = None;
            }
            return;
        };

        let mut entry = self
            .component(endpoint, component)
            .cloned()
            .unwrap_or_default();
        if let Some(revision) = &readiness.revision {
            entry.name = revision.clone();
        }
        entry.replicas = readiness.replicas;

        match &readiness.ready {
            None => {}
            Some(ready) => match ready.status {
                ConditionStatus::Unknown => {
                    self.mark_unknown(condition_type, &ready.reason, &ready.message)
                }
                ConditionStatus::True => {
                    self.mark_true(condition_type);
                    entry.hostname = readiness.hostname.clone().unwrap_or_default();
                }
                ConditionStatus::False => {
                    self.mark_false(condition_type, &ready.reason, &ready.message);
                    entry.hostname.clear();
                }
            },
        }

        self.component_map(endpoint)
            .get_or_insert_with(BTreeMap::new)
            .insert(component, entry);
    }

    /// Routing is all-or-nothing: a failure clears every routing field.
    pub fn propagate_route_status(&mut self, outcome: &RouteOutcome) {
        match outcome {
            RouteOutcome::Ready {
                url,
                address,
                default_weight,
                canary_weight,
            } => {
                self.url = Some(url.clone());
                self.address = Some(Addressable {
                    url: Some(address.clone()),
                });
                self.traffic = Some(*default_weight);
                self.canary_traffic = *canary_weight;
                self.mark_true(ROUTES_READY);
            }
            RouteOutcome::Failed { reason, message } => {
                self.url = None;
                self.address = None;
                self.traffic = None;
                self.canary_traffic = None;
                self.mark_false(ROUTES_READY, reason, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: ConditionStatus) -> ComponentReadiness {
        ComponentReadiness {
            ready: Some(Condition::new(READY, status, "RevisionMissing", "waiting")),
            hostname: Some("flowers-predictor-default.models.example.com".into()),
            revision: Some("flowers-predictor-default-00001".into()),
            replicas: Some(1),
        }
    }

    fn routed() -> RouteOutcome {
        RouteOutcome::Ready {
            url: "http://flowers.models.example.com/v1/models/flowers".into(),
            address: "http://flowers.models.svc.cluster.local/v1/models/flowers:predict".into(),
            default_weight: 100,
            canary_weight: None,
        }
    }

    #[test]
    fn test_initialize_conditions_are_unknown() {
        let mut status = InferenceServiceStatus::default();
        status.initialize_conditions();
        assert_eq!(status.conditions.len(), 3);
        for type_ in [READY, ROUTES_READY, DEFAULT_PREDICTOR_READY] {
            assert_eq!(
                status.get_condition(type_).unwrap().status,
                ConditionStatus::Unknown
            );
        }
        assert!(!status.is_ready());
    }

    #[test]
    fn test_ready_requires_all_living_conditions() {
        let mut status = InferenceServiceStatus::default();
        status.initialize_conditions();

        status.propagate_default_status(Component::Predictor, Some(&ready(ConditionStatus::True)));
        assert!(!status.is_ready());
        assert_eq!(status.get_condition(READY).unwrap().status, ConditionStatus::Unknown);

        status.propagate_route_status(&routed());
        assert!(status.is_ready());
        assert!(status.is_condition_true(READY));
    }

    #[test]
    fn test_tracked_conditions_do_not_gate_readiness() {
        let mut status = InferenceServiceStatus::default();
        status.propagate_default_status(Component::Predictor, Some(&ready(ConditionStatus::True)));
        status.propagate_default_status(Component::Explainer, Some(&ready(ConditionStatus::False)));
        status.propagate_route_status(&routed());
        assert!(status.is_ready());
        assert_eq!(
            status.get_condition(DEFAULT_EXPLAINER_READY).unwrap().status,
            ConditionStatus::False
        );
    }

    #[test]
    fn test_false_living_condition_makes_ready_false() {
        let mut status = InferenceServiceStatus::default();
        status.propagate_route_status(&routed());
        status.propagate_default_status(Component::Predictor, Some(&ready(ConditionStatus::False)));
        let happy = status.get_condition(READY).unwrap();
        assert_eq!(happy.status, ConditionStatus::False);
        assert_eq!(happy.reason, "RevisionMissing");
        assert!(status
            .component(Endpoint::Default, Component::Predictor)
            .unwrap()
            .hostname
            .is_empty());
    }

    #[test]
    fn test_hostname_recorded_when_ready() {
        let mut status = InferenceServiceStatus::default();
        status.propagate_canary_status(Component::Transformer, Some(&ready(ConditionStatus::True)));
        let entry = status.component(Endpoint::Canary, Component::Transformer).unwrap();
        assert_eq!(entry.hostname, "flowers-predictor-default.models.example.com");
        assert_eq!(entry.name, "flowers-predictor-default-00001");
        assert!(status.is_condition_true(CANARY_TRANSFORMER_READY));
    }

    #[test]
    fn test_missing_ready_condition_changes_nothing() {
        let mut status = InferenceServiceStatus::default();
        status.initialize_conditions();
        let readiness = ComponentReadiness {
            ready: None,
            ..ready(ConditionStatus::True)
        };
        status.propagate_default_status(Component::Predictor, Some(&readiness));
        assert_eq!(
            status.get_condition(DEFAULT_PREDICTOR_READY).unwrap().status,
            ConditionStatus::Unknown
        );
        assert!(status.component(Endpoint::Default, Component::Predictor).is_some());
    }

    #[test]
    fn test_tombstone_clears_condition_and_entry() {
        let mut status = InferenceServiceStatus::default();
        status.propagate_canary_status(Component::Predictor, Some(&ready(ConditionStatus::True)));
        assert!(status.get_condition(CANARY_PREDICTOR_READY).is_some());

        status.propagate_canary_status(Component::Predictor, None);
        assert!(status.get_condition(CANARY_PREDICTOR_READY).is_none());
        assert!(status.canary.is_none());
    }

    #[test]
    fn test_transition_time_stable_without_status_change() {
        let mut status = InferenceServiceStatus::default();
        status.mark_true(ROUTES_READY);
        let first = status.get_condition(ROUTES_READY).unwrap().last_transition_time;
        status.mark_true(ROUTES_READY);
        assert_eq!(status.get_condition(ROUTES_READY).unwrap().last_transition_time, first);
    }

    #[test]
    fn test_route_failure_clears_routing_fields() {
        let mut status = InferenceServiceStatus::default();
        status.propagate_route_status(&routed());
        status.propagate_route_status(&RouteOutcome::Failed {
            reason: "PredictorHostnameUnknown",
            message: "Failed to reconcile predictor".to_string(),
        });
        assert!(status.url.is_none());
        assert!(status.traffic.is_none());
        let routes = status.get_condition(ROUTES_READY).unwrap();
        assert_eq!(routes.status, ConditionStatus::False);
        assert_eq!(routes.reason, "PredictorHostnameUnknown");
    }

    #[test]
    fn test_component_map_serializes_lowercase_keys() {
        let mut status = InferenceServiceStatus::default();
        status.propagate_default_status(Component::Predictor, Some(&ready(ConditionStatus::True)));
        let value = serde_json::to_value(&status).unwrap();
        assert!(value["default"]["predictor"]["host"].is_string());
    }
}
