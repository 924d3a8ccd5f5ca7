//! isvc-controller runs the control plane of `InferenceService` resources.
//!
//! The controller half turns each InferenceService into per-component Knative
//! Services (or Deployments and Services in RawDeployment mode), routes
//! traffic between the default and canary endpoints with an Istio
//! VirtualService, and folds the state of everything it owns back into the
//! InferenceService status.
//!
//! The webhook half validates and defaults InferenceServices on admission,
//! and mutates the pods of their revisions: it adds the storage initializer,
//! the agent sidecar and the scheduling and metrics settings requested
//! through internal annotations.

pub mod apis;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod reconciler;
pub mod resources;
mod runner;
pub mod subscriber;
pub mod webhook;

pub use apis::InferenceService;
pub use config::InferenceServicesConfig;
pub use error::{Error, Result};
pub use runner::{run, RunError, RunOptions};
pub use webhook::{webhook_router, WebhookState};
