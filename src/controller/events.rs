//! Kubernetes Events emitted on InferenceServices.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! the reconcile that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube_client::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};

pub const CONTROLLER_NAME: &str = "inferenceservice-controller";

pub mod reasons {
    pub const RECONCILE_FAILED: &str = "InternalError";
    pub const COMPONENT_DELETED: &str = "ComponentDeleted";
}

pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: CONTROLLER_NAME.to_string(),
                instance: None,
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            log::warn!(
                "failed to publish {reason} event on {}: {err}",
                object.name.as_deref().unwrap_or_default()
            );
        }
    }
}

pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _object: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}
