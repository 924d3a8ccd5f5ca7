//! The `InferenceService` custom resource and the logic that operates on its
//! spec and status without touching the cluster.

pub mod defaults;
pub mod framework;
pub mod inference_service;
pub mod status;
pub mod validation;

pub use framework::{ExplainerFramework, PredictorFramework, TransformerFramework};
pub use inference_service::*;
pub use status::{
    ComponentReadiness, ComponentStatusMap, Condition, ConditionSet, ConditionStatus,
    InferenceServiceStatus, StatusConfigurationSpec,
};
