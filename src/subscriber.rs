//! Object identity, API access and watch streams for the objects the
//! controller reads and owns.

use std::fmt;

use kube_core::Resource;

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// `None` for objects that have not been given a name yet.
    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        Some(Self {
            namespace: resource.meta().namespace.clone(),
            name: resource.meta().name.clone()?,
        })
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A change observed on a watched object.
#[derive(Debug, Clone)]
pub struct Event<Entry> {
    pub key: QualifiedName,
    pub entry: Entry,
    /// False once the object has been deleted.
    pub exists: bool,
}

pub mod client;
pub use client::{KubeObjectClient, ObjectClient};

pub mod objects;
pub use objects::objects;
