use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube_client::{Api, Client};
use kube_runtime::{watcher, Controller};
use tokio_util::sync::CancellationToken;

use crate::apis::InferenceService;
use crate::constants::INFERENCE_SERVICE_CONFIG_MAP_NAME;
use crate::controller::{self, Context};
use crate::resources::istio::VirtualService;
use crate::resources::knative::KnativeService;
use crate::subscriber;
use crate::webhook::{self, WebhookState};

/// Where the control plane runs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Namespace of the `inferenceservice-config` ConfigMap.
    pub config_namespace: String,
    /// Plain HTTP listener for admission reviews; TLS is terminated in front.
    pub webhook_addr: SocketAddr,
    /// Stops the controller and the webhook server when cancelled.
    pub shutdown: CancellationToken,
}

/// Runs the InferenceService controller and the admission webhooks until
/// either stops or `options.shutdown` is cancelled.
pub async fn run(client: Client, options: RunOptions) -> Result<(), RunError> {
    let RunOptions {
        config_namespace,
        webhook_addr,
        shutdown,
    } = options;

    // Every ConfigMap change re-runs every InferenceService.
    let (reload_tx, reload_rx) = mpsc::channel(0);
    let config_maps = Api::<ConfigMap>::namespaced(client.clone(), &config_namespace);
    let config_changes = forward_config_changes(config_maps, reload_tx);

    let ctx = Arc::new(Context::new(client.clone(), config_namespace.clone()));
    let controller = Controller::new(
        Api::<InferenceService>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(Api::<KnativeService>::all(client.clone()), watcher::Config::default())
    .owns(Api::<VirtualService>::all(client.clone()), watcher::Config::default())
    .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
    .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
    .reconcile_all_on(reload_rx)
    .graceful_shutdown_on(shutdown.clone().cancelled_owned())
    .run(controller::reconcile, controller::error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok((object, _)) => log::debug!("reconciled {object}"),
            Err(err) => log::debug!("reconcile dispatch: {err}"),
        }
    });

    let listener = tokio::net::TcpListener::bind(webhook_addr)
        .await
        .map_err(RunError::Bind)?;
    log::info!("serving admission webhooks on {webhook_addr}");
    let router = webhook::webhook_router(Arc::new(WebhookState::new(client, config_namespace)));
    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let result = tokio::select! {
        () = controller => Ok(()),
        served = server.into_future() => served.map_err(RunError::Serve),
        watched = config_changes => watched,
    };
    shutdown.cancel();
    result
}

/// Signals `reload` whenever the operator ConfigMap changes.
async fn forward_config_changes(
    config_maps: Api<ConfigMap>,
    mut reload: mpsc::Sender<()>,
) -> Result<(), RunError> {
    let watcher_config =
        watcher::Config::default().fields(&format!("metadata.name={INFERENCE_SERVICE_CONFIG_MAP_NAME}"));
    let mut sub = std::pin::pin!(subscriber::objects(config_maps, watcher_config));
    while let Some(event) = sub.try_next().await.map_err(RunError::Subscribe)? {
        log::info!(
            "configmap {} {}, reconciling all InferenceServices",
            event.key,
            if event.exists { "changed" } else { "deleted" }
        );
        // A full channel already holds a pending reload.
        if let Err(err) = reload.try_send(()) {
            if err.is_disconnected() {
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("watching the configmap failed: {0}")]
    Subscribe(#[source] watcher::Error),
    #[error("binding the webhook listener failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("serving webhooks failed: {0}")]
    Serve(#[source] std::io::Error),
}
