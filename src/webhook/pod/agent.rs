//! The agent sidecar.
//!
//! One container serves up to three concerns, each switched on by its own
//! internal annotation:
//! - model pulling (`internal.serving.kserve.io/agent`)
//! - request batching (`internal.serving.kserve.io/batcher`)
//! - payload logging (`internal.serving.kserve.io/logger`)
//!
//! The agent sits between the queue proxy and the serving container: the
//! queue proxy's `USER_PORT` is pointed at the agent, which forwards to the
//! port the queue proxy used to target.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, Pod, Volume, VolumeMount,
};

use super::{annotation, find_container, has_container, label, PodInjector};
use crate::config::{AgentConfig, BatcherConfig, LoggerConfig};
use crate::constants::*;
use crate::error::{Error, Result};

pub const AGENT_CONTAINER_NAME: &str = "agent";
const AGENT_PORT_NAME: &str = "agent-port";
const USER_PORT_ENV_VAR_KEY: &str = "USER_PORT";

const INJECTOR: &str = "agent";

pub struct AgentInjector {
    agent: AgentConfig,
    logger: LoggerConfig,
    batcher: BatcherConfig,
}

impl AgentInjector {
    pub fn new(agent: AgentConfig, logger: LoggerConfig, batcher: BatcherConfig) -> Self {
        Self {
            agent,
            logger,
            batcher,
        }
    }

    fn puller_args(pod: &Pod) -> Vec<String> {
        let config_dir = annotation(pod, AGENT_MODEL_CONFIG_MOUNT_PATH_ANNOTATION_KEY).unwrap_or(MODEL_CONFIG_DIR);
        let model_dir = annotation(pod, AGENT_MODEL_DIR_ANNOTATION_KEY).unwrap_or(DEFAULT_MODEL_LOCAL_MOUNT_PATH);
        vec![
            "--enable-puller".to_string(),
            "--config-dir".to_string(),
            config_dir.to_string(),
            "--model-dir".to_string(),
            model_dir.to_string(),
        ]
    }

    fn batcher_args(&self, pod: &Pod) -> Vec<String> {
        let max_batch_size =
            annotation(pod, BATCHER_MAX_BATCH_SIZE_ANNOTATION_KEY).unwrap_or(self.batcher.max_batch_size.as_str());
        let max_latency = annotation(pod, BATCHER_MAX_LATENCY_ANNOTATION_KEY).unwrap_or(self.batcher.max_latency.as_str());
        let mut args = vec![
            "--enable-batcher".to_string(),
            "--max-batchsize".to_string(),
            max_batch_size.to_string(),
            "--max-latency".to_string(),
            max_latency.to_string(),
        ];
        if let Some(timeout) = annotation(pod, BATCHER_TIMEOUT_ANNOTATION_KEY) {
            args.extend(["--timeout".to_string(), timeout.to_string()]);
        }
        args
    }

    fn logger_args(&self, pod: &Pod, namespace: &str) -> Vec<String> {
        let url = annotation(pod, LOGGER_SINK_URL_ANNOTATION_KEY).unwrap_or(self.logger.default_url.as_str());
        let mode = annotation(pod, LOGGER_MODE_ANNOTATION_KEY).unwrap_or("all");
        let source = pod
            .metadata
            .name
            .as_deref()
            .or(pod.metadata.generate_name.as_deref())
            .unwrap_or_default();
        [
            ("--log-url", url),
            ("--source-uri", source),
            ("--log-mode", mode),
            ("--inference-service", label(pod, INFERENCE_SERVICE_POD_LABEL_KEY).unwrap_or_default()),
            ("--namespace", namespace),
            ("--endpoint", label(pod, KSERVICE_ENDPOINT_LABEL).unwrap_or_default()),
            ("--component", label(pod, KSERVICE_COMPONENT_LABEL).unwrap_or_default()),
        ]
        .into_iter()
        .flat_map(|(flag, value)| [flag.to_string(), value.to_string()])
        .collect()
    }
}

#[async_trait]
impl PodInjector for AgentInjector {
    fn name(&self) -> &'static str {
        INJECTOR
    }

    async fn inject(&self, pod: &mut Pod, namespace: &str) -> Result<()> {
        let puller = annotation(pod, AGENT_SHOULD_INJECT_ANNOTATION_KEY).is_some();
        let batcher = annotation(pod, BATCHER_ANNOTATION_KEY).is_some();
        let logger = annotation(pod, LOGGER_ANNOTATION_KEY).is_some();
        if !(puller || batcher || logger) {
            return Ok(());
        }
        let Some(spec) = pod.spec.as_ref() else {
            return Ok(());
        };
        if has_container(Some(&spec.containers), AGENT_CONTAINER_NAME) {
            return Ok(());
        }

        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| namespace.to_string());
        let mut args = Vec::new();
        if puller {
            args.extend(Self::puller_args(pod));
        }
        if batcher {
            args.extend(self.batcher_args(pod));
        }
        if logger {
            args.extend(self.logger_args(pod, &namespace));
        }
        let model_config = annotation(pod, AGENT_MODEL_CONFIG_VOLUME_NAME_ANNOTATION_KEY).map(str::to_string);
        let config_dir = annotation(pod, AGENT_MODEL_CONFIG_MOUNT_PATH_ANNOTATION_KEY)
            .unwrap_or(MODEL_CONFIG_DIR)
            .to_string();
        let model_dir = annotation(pod, AGENT_MODEL_DIR_ANNOTATION_KEY)
            .unwrap_or(DEFAULT_MODEL_LOCAL_MOUNT_PATH)
            .to_string();

        let spec = pod.spec.get_or_insert_with(Default::default);
        let mut agent_env = None;
        let mut component_port = INFERENCE_SERVICE_DEFAULT_HTTP_PORT.to_string();
        if let Some(queue_proxy) = find_container(&mut spec.containers, QUEUE_PROXY_CONTAINER_NAME) {
            agent_env = queue_proxy.env.clone();
            for env in queue_proxy.env.iter_mut().flatten() {
                if env.name == USER_PORT_ENV_VAR_KEY {
                    if let Some(port) = env.value.replace(INFERENCE_SERVICE_DEFAULT_AGENT_PORT.to_string()) {
                        component_port = port;
                    }
                }
            }
        }
        args.extend(["--component-port".to_string(), component_port]);

        let mut agent = Container {
            name: AGENT_CONTAINER_NAME.to_string(),
            image: Some(self.agent.image.clone()),
            args: Some(args),
            env: agent_env,
            ports: Some(vec![ContainerPort {
                name: Some(AGENT_PORT_NAME.to_string()),
                container_port: INFERENCE_SERVICE_DEFAULT_AGENT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(self.agent.resources.requirements()),
            ..Default::default()
        };

        if puller {
            let model_config = model_config.ok_or_else(|| {
                Error::injection(
                    INJECTOR,
                    format!("model pulling requires the {AGENT_MODEL_CONFIG_VOLUME_NAME_ANNOTATION_KEY} annotation"),
                )
            })?;
            spec.volumes.get_or_insert_with(Vec::new).extend([
                Volume {
                    name: MODEL_CONFIG_VOLUME_NAME.to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(model_config),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: MODEL_DIR_VOLUME_NAME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
            ]);
            agent.volume_mounts = Some(vec![
                VolumeMount {
                    name: MODEL_DIR_VOLUME_NAME.to_string(),
                    mount_path: model_dir.clone(),
                    read_only: Some(false),
                    ..Default::default()
                },
                VolumeMount {
                    name: MODEL_CONFIG_VOLUME_NAME.to_string(),
                    mount_path: config_dir,
                    read_only: Some(true),
                    ..Default::default()
                },
            ]);
            if let Some(serving) = find_container(&mut spec.containers, INFERENCE_SERVICE_CONTAINER_NAME) {
                serving.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
                    name: MODEL_DIR_VOLUME_NAME.to_string(),
                    mount_path: model_dir,
                    read_only: Some(true),
                    ..Default::default()
                });
            }
        }

        spec.containers.push(agent);
        Ok(())
    }
}
