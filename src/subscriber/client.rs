use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube_client::api::{DeleteParams, PostParams};
use kube_client::{Api, Client};
use kube_core::{NamespaceResourceScope, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::QualifiedName;
use crate::error::{Error, Result};

/// The four calls a reconciler needs against one object kind.
#[async_trait]
pub trait ObjectClient<K>: Send + Sync {
    /// `Ok(None)` if the object does not exist.
    async fn get(&self, key: &QualifiedName) -> Result<Option<K>>;

    async fn create(&self, object: &K) -> Result<K>;

    /// Fails on a resourceVersion conflict.
    async fn replace(&self, object: &K) -> Result<K>;

    /// Succeeds if the object is already gone.
    async fn delete(&self, key: &QualifiedName) -> Result<()>;
}

/// [`ObjectClient`] backed by the API server.
pub struct KubeObjectClient<K> {
    client: Client,
    _ph: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeObjectClient<K> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

impl<K> KubeObjectClient<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _ph: PhantomData,
        }
    }
}

impl<K> KubeObjectClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

fn object_key<K: Resource>(object: &K) -> Result<QualifiedName> {
    QualifiedName::from_resource(object)
        .ok_or_else(|| Error::MissingField(std::any::type_name::<K>().to_string(), "metadata.name"))
}

#[async_trait]
impl<K> ObjectClient<K> for KubeObjectClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, key: &QualifiedName) -> Result<Option<K>> {
        Ok(self.api(key.namespace.as_deref()).get_opt(&key.name).await?)
    }

    async fn create(&self, object: &K) -> Result<K> {
        let key = object_key(object)?;
        log::info!("creating {} {key}", K::kind(&Default::default()));
        Ok(self
            .api(key.namespace.as_deref())
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn replace(&self, object: &K) -> Result<K> {
        let key = object_key(object)?;
        log::info!("updating {} {key}", K::kind(&Default::default()));
        Ok(self
            .api(key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), object)
            .await?)
    }

    async fn delete(&self, key: &QualifiedName) -> Result<()> {
        log::info!("deleting {} {key}", K::kind(&Default::default()));
        match self
            .api(key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube_client::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
