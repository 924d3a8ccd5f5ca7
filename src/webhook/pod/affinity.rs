use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Affinity, Pod, PodAffinityTerm, PodAntiAffinity, WeightedPodAffinityTerm};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::{label, PodInjector};
use crate::constants::INFERENCE_SERVICE_POD_LABEL_KEY;
use crate::error::Result;

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Spreads the replicas of an InferenceService over nodes. Pods that already
/// declare any affinity are left alone.
pub struct AffinityInjector;

#[async_trait]
impl PodInjector for AffinityInjector {
    fn name(&self) -> &'static str {
        "affinity"
    }

    async fn inject(&self, pod: &mut Pod, _namespace: &str) -> Result<()> {
        let Some(isvc) = label(pod, INFERENCE_SERVICE_POD_LABEL_KEY).map(str::to_string) else {
            return Ok(());
        };
        let Some(spec) = pod.spec.as_mut() else {
            return Ok(());
        };
        if spec.affinity.is_some() {
            return Ok(());
        }
        spec.affinity = Some(Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![
                    WeightedPodAffinityTerm {
                        weight: 100,
                        pod_affinity_term: PodAffinityTerm {
                            label_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([(
                                    INFERENCE_SERVICE_POD_LABEL_KEY.to_string(),
                                    isvc,
                                )])),
                                ..Default::default()
                            }),
                            topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                            ..Default::default()
                        },
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        });
        Ok(())
    }
}
