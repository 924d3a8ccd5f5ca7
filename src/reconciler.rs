//! Create-or-update convergence of one owned object.
//!
//! A [`Reconciler`] compares the desired object against the live one using a
//! [`SemanticDiff`] limited to the fields this controller owns, so fields
//! populated by the API server or other controllers never cause a write.
//! Reconciling an unchanged desired object issues no write at all.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube_core::Resource;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::resources::istio::VirtualService;
use crate::resources::knative::KnativeService;
use crate::subscriber::{ObjectClient, QualifiedName};

/// Outcome of comparing desired and live state. A failed lookup is an error
/// rather than a state, and fails the reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Create,
    Update,
    Existed,
}

/// Equality over controller-owned fields.
pub trait SemanticDiff {
    fn semantic_equals(&self, existing: &Self) -> bool;

    /// Copy the owned fields onto the live object, leaving the rest intact.
    fn merge_onto(&self, existing: &mut Self);
}

/// Whether every field set in `desired` has the same value in `existing`.
/// Nulls, empty strings and empty collections in `desired` count as unset.
pub fn is_derivative(desired: &Value, existing: &Value) -> bool {
    match (desired, existing) {
        (Value::Null, _) => true,
        (Value::String(d), _) if d.is_empty() => true,
        (Value::Object(d), _) if d.is_empty() => true,
        (Value::Array(d), _) if d.is_empty() => true,
        (Value::Object(d), Value::Object(e)) => d
            .iter()
            .all(|(key, value)| is_derivative(value, e.get(key).unwrap_or(&Value::Null))),
        (Value::Array(d), Value::Array(e)) => {
            d.len() == e.len() && d.iter().zip(e).all(|(d, e)| is_derivative(d, e))
        }
        (d, e) => d == e,
    }
}

fn derives<T: Serialize>(desired: &T, existing: &T) -> bool {
    match (serde_json::to_value(desired), serde_json::to_value(existing)) {
        (Ok(desired), Ok(existing)) => is_derivative(&desired, &existing),
        _ => false,
    }
}

/// Exact equality, an absent map counting as empty.
fn same_map(
    desired: Option<&BTreeMap<String, String>>,
    existing: Option<&BTreeMap<String, String>>,
) -> bool {
    desired.filter(|m| !m.is_empty()) == existing.filter(|m| !m.is_empty())
}

/// The revision template metadata is recomputed in full on every reconcile,
/// so its labels and annotations must match exactly.
impl SemanticDiff for KnativeService {
    fn semantic_equals(&self, existing: &Self) -> bool {
        let (desired, live) = (&self.spec.template, &existing.spec.template);
        derives(&desired.spec, &live.spec)
            && same_map(desired.metadata.annotations.as_ref(), live.metadata.annotations.as_ref())
            && same_map(desired.metadata.labels.as_ref(), live.metadata.labels.as_ref())
            && same_map(self.metadata.labels.as_ref(), existing.metadata.labels.as_ref())
    }

    fn merge_onto(&self, existing: &mut Self) {
        existing.spec = self.spec.clone();
        existing.metadata.labels = self.metadata.labels.clone();
    }
}

impl SemanticDiff for VirtualService {
    fn semantic_equals(&self, existing: &Self) -> bool {
        self.spec == existing.spec
    }

    fn merge_onto(&self, existing: &mut Self) {
        existing.spec = self.spec.clone();
        existing.metadata.labels = self.metadata.labels.clone();
        existing.metadata.annotations = self.metadata.annotations.clone();
    }
}

impl SemanticDiff for Deployment {
    fn semantic_equals(&self, existing: &Self) -> bool {
        derives(&self.spec, &existing.spec)
    }

    fn merge_onto(&self, existing: &mut Self) {
        existing.spec = self.spec.clone();
    }
}

/// Only ports and selector; `clusterIP` and friends belong to the API server.
impl SemanticDiff for Service {
    fn semantic_equals(&self, existing: &Self) -> bool {
        let desired = self.spec.as_ref();
        let live = existing.spec.as_ref();
        derives(&desired.and_then(|s| s.ports.as_ref()), &live.and_then(|s| s.ports.as_ref()))
            && desired.and_then(|s| s.selector.as_ref()) == live.and_then(|s| s.selector.as_ref())
    }

    fn merge_onto(&self, existing: &mut Self) {
        let desired = self.spec.clone().unwrap_or_default();
        let live = existing.spec.get_or_insert_with(Default::default);
        live.ports = desired.ports;
        live.selector = desired.selector;
    }
}

impl SemanticDiff for ConfigMap {
    fn semantic_equals(&self, existing: &Self) -> bool {
        self.data == existing.data && self.binary_data == existing.binary_data
    }

    fn merge_onto(&self, existing: &mut Self) {
        existing.data = self.data.clone();
        existing.binary_data = self.binary_data.clone();
    }
}

impl SemanticDiff for Secret {
    fn semantic_equals(&self, existing: &Self) -> bool {
        self.data == existing.data
    }

    fn merge_onto(&self, existing: &mut Self) {
        existing.data = self.data.clone();
    }
}

fn key_of<K: Resource>(object: &K) -> Result<QualifiedName> {
    QualifiedName::from_resource(object).ok_or_else(|| {
        Error::MissingField(
            std::any::type_name::<K>().to_string(),
            "metadata.name",
        )
    })
}

/// Converges a single desired object.
pub struct Reconciler<'a, K> {
    client: &'a dyn ObjectClient<K>,
    desired: K,
}

impl<'a, K> Reconciler<'a, K>
where
    K: Resource + SemanticDiff + Clone + Send + Sync,
{
    pub fn new(client: &'a dyn ObjectClient<K>, desired: K) -> Self {
        Self { client, desired }
    }

    pub async fn check_exist(&self) -> Result<(CheckResult, Option<K>)> {
        let key = key_of(&self.desired)?;
        let Some(existing) = self.client.get(&key).await? else {
            return Ok((CheckResult::Create, None));
        };
        let state = if self.desired.semantic_equals(&existing) {
            CheckResult::Existed
        } else {
            CheckResult::Update
        };
        Ok((state, Some(existing)))
    }

    /// The live object after convergence.
    pub async fn reconcile(self) -> Result<K> {
        let (state, existing) = self.check_exist().await?;
        match (state, existing) {
            (CheckResult::Existed, Some(existing)) => Ok(existing),
            (CheckResult::Update, Some(mut existing)) => {
                self.desired.merge_onto(&mut existing);
                self.client.replace(&existing).await
            }
            _ => self.client.create(&self.desired).await,
        }
    }
}

/// Creates `desired` if it is missing and never touches an existing object.
pub async fn ensure_exists<K>(client: &dyn ObjectClient<K>, desired: &K) -> Result<K>
where
    K: Resource + Clone + Send + Sync,
{
    let key = key_of(desired)?;
    match client.get(&key).await? {
        Some(existing) => Ok(existing),
        None => client.create(desired).await,
    }
}

/// Removes the object named `key`; `true` if there was one.
pub async fn ensure_absent<K>(client: &dyn ObjectClient<K>, key: &QualifiedName) -> Result<bool>
where
    K: Send + Sync,
{
    if client.get(key).await?.is_none() {
        return Ok(false);
    }
    client.delete(key).await?;
    Ok(true)
}
