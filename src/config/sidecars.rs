use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;

/// Requests and limits of an injected container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarResources {
    #[serde(default = "default_cpu_request")]
    pub cpu_request: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
    #[serde(default = "default_memory_request")]
    pub memory_request: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
}

fn default_cpu_request() -> String {
    "100m".to_string()
}

fn default_cpu_limit() -> String {
    "1".to_string()
}

fn default_memory_request() -> String {
    "200Mi".to_string()
}

fn default_memory_limit() -> String {
    "1Gi".to_string()
}

impl Default for SidecarResources {
    fn default() -> Self {
        Self {
            cpu_request: default_cpu_request(),
            cpu_limit: default_cpu_limit(),
            memory_request: default_memory_request(),
            memory_limit: default_memory_limit(),
        }
    }
}

impl SidecarResources {
    pub fn requirements(&self) -> ResourceRequirements {
        let pair = |cpu: &str, memory: &str| {
            BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ])
        };
        ResourceRequirements {
            requests: Some(pair(&self.cpu_request, &self.memory_request)),
            limits: Some(pair(&self.cpu_limit, &self.memory_limit)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInitializerConfig {
    #[serde(default = "StorageInitializerConfig::default_image")]
    pub image: String,
    #[serde(flatten)]
    pub resources: SidecarResources,
}

impl StorageInitializerConfig {
    fn default_image() -> String {
        "kserve/storage-initializer:latest".to_string()
    }
}

impl Default for StorageInitializerConfig {
    fn default() -> Self {
        Self {
            image: Self::default_image(),
            resources: SidecarResources::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "AgentConfig::default_image")]
    pub image: String,
    #[serde(flatten)]
    pub resources: SidecarResources,
}

impl AgentConfig {
    fn default_image() -> String {
        "kserve/agent:latest".to_string()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            image: Self::default_image(),
            resources: SidecarResources::default(),
        }
    }
}

/// Defaults for request logging when the spec leaves them out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    #[serde(default = "LoggerConfig::default_url")]
    pub default_url: String,
}

impl LoggerConfig {
    fn default_url() -> String {
        "http://default-broker".to_string()
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            default_url: Self::default_url(),
        }
    }
}

/// Defaults for request batching when the spec leaves them out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherConfig {
    #[serde(default = "BatcherConfig::default_max_batch_size")]
    pub max_batch_size: String,
    #[serde(default = "BatcherConfig::default_max_latency")]
    pub max_latency: String,
}

impl BatcherConfig {
    fn default_max_batch_size() -> String {
        "32".to_string()
    }

    fn default_max_latency() -> String {
        "5000".to_string()
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: Self::default_max_batch_size(),
            max_latency: Self::default_max_latency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAggregatorConfig {
    /// Applied when the pod carries no aggregation annotation.
    #[serde(default)]
    pub enable_metric_aggregation: bool,
    /// Applied when the pod carries no scraping annotation.
    #[serde(default)]
    pub enable_prometheus_scraping: bool,
    #[serde(default = "MetricsAggregatorConfig::default_port")]
    pub aggregate_port: i32,
}

impl MetricsAggregatorConfig {
    fn default_port() -> i32 {
        9088
    }
}

impl Default for MetricsAggregatorConfig {
    fn default() -> Self {
        Self {
            enable_metric_aggregation: false,
            enable_prometheus_scraping: false,
            aggregate_port: Self::default_port(),
        }
    }
}
