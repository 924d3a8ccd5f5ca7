//! Kubernetes objects derived from an InferenceService.

pub mod credentials;
pub mod istio;
pub mod knative;
pub mod raw;
pub mod service;
pub mod virtual_service;
