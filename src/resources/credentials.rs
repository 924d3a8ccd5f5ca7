//! Storage credentials attached to serving containers, resolved from the
//! secrets of the component's service account.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Secret, SecretKeySelector, SecretVolumeSource, ServiceAccount,
    Volume, VolumeMount,
};
use kube_client::{Api, Client};

use crate::apis::framework::env_var;
use crate::error::{Error, Result};

pub const S3_ENDPOINT_ANNOTATION_KEY: &str = "serving.kserve.io/s3-endpoint";
pub const S3_USE_HTTPS_ANNOTATION_KEY: &str = "serving.kserve.io/s3-usehttps";
pub const S3_VERIFY_SSL_ANNOTATION_KEY: &str = "serving.kserve.io/s3-verifyssl";
pub const S3_REGION_ANNOTATION_KEY: &str = "serving.kserve.io/s3-region";

pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const S3_ENDPOINT: &str = "S3_ENDPOINT";
pub const AWS_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
pub const S3_USE_HTTPS: &str = "S3_USE_HTTPS";
pub const S3_VERIFY_SSL: &str = "S3_VERIFY_SSL";
pub const AWS_REGION: &str = "AWS_REGION";

pub const GCS_CREDENTIAL_FILE_NAME: &str = "gcloud-application-credentials.json";
pub const GCS_CREDENTIAL_VOLUME_NAME: &str = "user-gcp-sa";
pub const GCS_CREDENTIAL_MOUNT_PATH: &str = "/var/secret/";
pub const GCS_CREDENTIAL_ENV_KEY: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Adds whatever env vars and volumes the container needs to read model
/// storage on behalf of `service_account`.
#[async_trait]
pub trait CredentialBuilder: Send + Sync {
    async fn create_secret_volume_and_env(
        &self,
        namespace: &str,
        service_account: &str,
        container: &mut Container,
        volumes: &mut Vec<Volume>,
    ) -> Result<()>;
}

/// Attaches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCredentialBuilder;

#[async_trait]
impl CredentialBuilder for NoopCredentialBuilder {
    async fn create_secret_volume_and_env(
        &self,
        _namespace: &str,
        _service_account: &str,
        _container: &mut Container,
        _volumes: &mut Vec<Volume>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Reads the service account and its secrets from the API server.
#[derive(Clone)]
pub struct ServiceAccountCredentialBuilder {
    client: Client,
}

impl ServiceAccountCredentialBuilder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialBuilder for ServiceAccountCredentialBuilder {
    async fn create_secret_volume_and_env(
        &self,
        namespace: &str,
        service_account: &str,
        container: &mut Container,
        volumes: &mut Vec<Volume>,
    ) -> Result<()> {
        let service_account = if service_account.is_empty() {
            DEFAULT_SERVICE_ACCOUNT
        } else {
            service_account
        };
        let accounts = Api::<ServiceAccount>::namespaced(self.client.clone(), namespace);
        let account = accounts.get_opt(service_account).await?.ok_or_else(|| {
            Error::Credentials(format!(
                "service account {namespace}/{service_account} not found"
            ))
        })?;

        let secrets = Api::<Secret>::namespaced(self.client.clone(), namespace);
        for reference in account.secrets.iter().flatten() {
            let Some(name) = reference.name.as_deref() else {
                continue;
            };
            match secrets.get_opt(name).await? {
                Some(secret) => apply_secret(&secret, container, volumes),
                None => log::warn!("secret {namespace}/{name} of service account {service_account} not found"),
            }
        }
        Ok(())
    }
}

fn secret_key_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// S3 secrets are recognized by their endpoint annotation, GCS secrets by
/// their credential file key.
pub fn apply_secret(secret: &Secret, container: &mut Container, volumes: &mut Vec<Volume>) {
    let Some(name) = secret.metadata.name.as_deref() else {
        return;
    };
    let empty = BTreeMap::new();
    let annotations = secret.metadata.annotations.as_ref().unwrap_or(&empty);
    let has_key = |key: &str| {
        secret.data.as_ref().is_some_and(|d| d.contains_key(key))
            || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
    };

    if let Some(endpoint) = annotations.get(S3_ENDPOINT_ANNOTATION_KEY) {
        let use_https = annotations
            .get(S3_USE_HTTPS_ANNOTATION_KEY)
            .map_or("1", String::as_str);
        let scheme = if use_https == "0" { "http" } else { "https" };
        let env = container.env.get_or_insert_with(Vec::new);
        env.push(secret_key_env(AWS_ACCESS_KEY_ID, name, AWS_ACCESS_KEY_ID));
        env.push(secret_key_env(AWS_SECRET_ACCESS_KEY, name, AWS_SECRET_ACCESS_KEY));
        env.push(env_var(S3_ENDPOINT, endpoint.clone()));
        env.push(env_var(AWS_ENDPOINT_URL, format!("{scheme}://{endpoint}")));
        if let Some(use_https) = annotations.get(S3_USE_HTTPS_ANNOTATION_KEY) {
            env.push(env_var(S3_USE_HTTPS, use_https.clone()));
        }
        if let Some(verify) = annotations.get(S3_VERIFY_SSL_ANNOTATION_KEY) {
            env.push(env_var(S3_VERIFY_SSL, verify.clone()));
        }
        if let Some(region) = annotations.get(S3_REGION_ANNOTATION_KEY) {
            env.push(env_var(AWS_REGION, region.clone()));
        }
    } else if has_key(GCS_CREDENTIAL_FILE_NAME) {
        volumes.push(Volume {
            name: GCS_CREDENTIAL_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: GCS_CREDENTIAL_VOLUME_NAME.to_string(),
                mount_path: GCS_CREDENTIAL_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        container.env.get_or_insert_with(Vec::new).push(env_var(
            GCS_CREDENTIAL_ENV_KEY,
            format!("{GCS_CREDENTIAL_MOUNT_PATH}{GCS_CREDENTIAL_FILE_NAME}"),
        ));
    } else {
        log::debug!("secret {name} carries no recognized storage credentials");
    }
}
