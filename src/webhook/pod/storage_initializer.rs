use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource, Pod, Volume, VolumeMount,
};

use super::{annotation, find_container, has_container, PodInjector};
use crate::config::StorageInitializerConfig;
use crate::constants::{
    AGENT_SHOULD_INJECT_ANNOTATION_KEY, CUSTOM_SPEC_STORAGE_URI_ENV_VAR_KEY,
    DEFAULT_MODEL_LOCAL_MOUNT_PATH, INFERENCE_SERVICE_CONTAINER_NAME, PVC_URI_PREFIX,
    STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY,
};
use crate::error::{Error, Result};
use crate::resources::credentials::CredentialBuilder;

pub const STORAGE_INITIALIZER_CONTAINER_NAME: &str = "storage-initializer";
pub const STORAGE_INITIALIZER_VOLUME_NAME: &str = "kserve-provision-location";
pub const PVC_SOURCE_VOLUME_NAME: &str = "kserve-pvc-source";
pub const PVC_SOURCE_MOUNT_PATH: &str = "/mnt/pvc";

const INJECTOR: &str = "storage-initializer";

/// Downloads the model into a volume shared with the serving container
/// before it starts. Steps aside when the agent pulls models instead.
pub struct StorageInitializerInjector {
    config: StorageInitializerConfig,
    credentials: Arc<dyn CredentialBuilder>,
}

impl StorageInitializerInjector {
    pub fn new(config: StorageInitializerConfig, credentials: Arc<dyn CredentialBuilder>) -> Self {
        Self { config, credentials }
    }
}

/// `pvc://<claim>/<path>` into the claim name and the path inside it.
fn parse_pvc_uri(uri: &str) -> Result<(&str, &str)> {
    let rest = uri.strip_prefix(PVC_URI_PREFIX).unwrap_or(uri);
    let (claim, path) = rest.split_once('/').unwrap_or((rest, ""));
    if claim.is_empty() {
        return Err(Error::injection(
            INJECTOR,
            format!("invalid pvc storage uri {uri:?}: missing claim name"),
        ));
    }
    Ok((claim, path))
}

#[async_trait]
impl PodInjector for StorageInitializerInjector {
    fn name(&self) -> &'static str {
        INJECTOR
    }

    async fn inject(&self, pod: &mut Pod, namespace: &str) -> Result<()> {
        let Some(source_uri) = annotation(pod, STORAGE_INITIALIZER_SOURCE_URI_ANNOTATION_KEY).map(str::to_string)
        else {
            return Ok(());
        };
        if annotation(pod, AGENT_SHOULD_INJECT_ANNOTATION_KEY).is_some() {
            return Ok(());
        }
        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| namespace.to_string());
        let spec = pod.spec.get_or_insert_with(Default::default);
        if has_container(spec.init_containers.as_ref(), STORAGE_INITIALIZER_CONTAINER_NAME) {
            return Ok(());
        }
        let serving = find_container(&mut spec.containers, INFERENCE_SERVICE_CONTAINER_NAME).ok_or_else(|| {
            Error::injection(
                INJECTOR,
                format!("cannot find container {INFERENCE_SERVICE_CONTAINER_NAME}"),
            )
        })?;

        let mut volumes = Vec::new();
        let mut init_mounts = Vec::new();
        let mut source = source_uri.clone();
        if source_uri.starts_with(PVC_URI_PREFIX) {
            let (claim, path) = parse_pvc_uri(&source_uri)?;
            volumes.push(Volume {
                name: PVC_SOURCE_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: Some(false),
                }),
                ..Default::default()
            });
            let pvc_mount = VolumeMount {
                name: PVC_SOURCE_VOLUME_NAME.to_string(),
                mount_path: PVC_SOURCE_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            };
            init_mounts.push(pvc_mount.clone());
            // The model may link back into the claim.
            serving.volume_mounts.get_or_insert_with(Vec::new).push(pvc_mount);
            source = format!("{PVC_SOURCE_MOUNT_PATH}/{path}");
        }

        volumes.push(Volume {
            name: STORAGE_INITIALIZER_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        init_mounts.push(VolumeMount {
            name: STORAGE_INITIALIZER_VOLUME_NAME.to_string(),
            mount_path: DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
            read_only: Some(false),
            ..Default::default()
        });
        serving.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
            name: STORAGE_INITIALIZER_VOLUME_NAME.to_string(),
            mount_path: DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        for env in serving.env.iter_mut().flatten() {
            if env.name == CUSTOM_SPEC_STORAGE_URI_ENV_VAR_KEY && env.value.as_deref().is_some_and(|v| !v.is_empty()) {
                env.value = Some(DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string());
            }
        }
        let service_account = spec.service_account_name.clone().unwrap_or_default();

        let mut init_container = Container {
            name: STORAGE_INITIALIZER_CONTAINER_NAME.to_string(),
            image: Some(self.config.image.clone()),
            args: Some(vec![source, DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string()]),
            resources: Some(self.config.resources.requirements()),
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            volume_mounts: Some(init_mounts),
            ..Default::default()
        };
        let pod_volumes = spec.volumes.get_or_insert_with(Vec::new);
        pod_volumes.extend(volumes);
        self.credentials
            .create_secret_volume_and_env(&namespace, &service_account, &mut init_container, pod_volumes)
            .await?;
        spec.init_containers.get_or_insert_with(Vec::new).push(init_container);
        Ok(())
    }
}
