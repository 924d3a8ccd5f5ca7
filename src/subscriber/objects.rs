use std::{fmt::Debug, hash::Hash};

use futures::{future, Stream, TryStreamExt};
use kube_client::Api;
use kube_core::Resource;
use kube_runtime::{reflector, watcher, WatchStreamExt};
use serde::de::DeserializeOwned;

use super::{Event, QualifiedName};

/// Every change to the objects of type `K` selected by `watcher_config`,
/// flagged with whether the object still exists afterwards.
pub fn objects<K: Resource>(
    client: Api<K>,
    watcher_config: watcher::Config,
) -> impl Stream<Item = Result<Event<K>, watcher::Error>>
where
    K: 'static + Debug + Clone + DeserializeOwned + Send + Sync,
    K::DynamicType: Clone + Eq + Hash + Default,
{
    let writer = reflector::store::Writer::<K>::default();
    let store = writer.as_reader();

    reflector(writer, watcher(client, watcher_config))
        .touched_objects()
        .try_filter_map(move |resource| {
            let exists = store
                .get(&reflector::ObjectRef::from_obj(&resource))
                .is_some();
            // Unnamed objects cannot be addressed again.
            let event = QualifiedName::from_resource(&resource).map(|key| Event {
                key,
                entry: resource,
                exists,
            });
            future::ready(Ok(event))
        })
}
