use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

use super::{annotation, PodInjector};
use crate::constants::{GKE_ACCELERATOR_ANNOTATION_KEY, GKE_ACCELERATOR_NODE_SELECTOR_KEY};
use crate::error::Result;

/// Schedules pods asking for a GKE accelerator type onto nodes that have it.
/// A node selector the pod already carries for the same key wins.
pub struct AcceleratorInjector;

#[async_trait]
impl PodInjector for AcceleratorInjector {
    fn name(&self) -> &'static str {
        "accelerator-selector"
    }

    async fn inject(&self, pod: &mut Pod, _namespace: &str) -> Result<()> {
        let Some(accelerator) = annotation(pod, GKE_ACCELERATOR_ANNOTATION_KEY).map(str::to_string) else {
            return Ok(());
        };
        let Some(spec) = pod.spec.as_mut() else {
            return Ok(());
        };
        spec.node_selector
            .get_or_insert_with(Default::default)
            .entry(GKE_ACCELERATOR_NODE_SELECTOR_KEY.to_string())
            .or_insert(accelerator);
        Ok(())
    }
}
