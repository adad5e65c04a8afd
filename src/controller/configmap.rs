use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{BaseController, Controller, NewControllerFunc};
use crate::informer::Informer;
use crate::rollout::{patch_deployment, restart_patch};

static CONFIG_NAME_SUFFIX: &str = "-config";
pub static ASSOCIATE_DEPLOYMENT_ANNOTATION: &str = "laborer.configmap.associate.deployment";

/// Restarts the deployments associated with a configmap whenever that configmap changes.
pub struct ConfigMapController {
    base: BaseController,
    configmaps: Informer<ConfigMap>,
    deployments: Arc<Informer<Deployment>>,
}

pub fn new_controller_func(client: Client) -> NewControllerFunc {
    Arc::new(
        move |namespace: &str, token: CancellationToken| -> Box<dyn Controller> {
            Box::new(ConfigMapController::new(namespace, client.clone(), token))
        },
    )
}

impl ConfigMapController {
    pub fn new(namespace: &str, client: Client, token: CancellationToken) -> Self {
        let deployments_api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        let deployments = Arc::new(Informer::new(deployments_api.clone()));

        let restarter = Arc::new(Restarter {
            namespace: namespace.to_string(),
            versions: Mutex::new(ResourceVersions::default()),
            deployments: deployments.clone(),
            deployments_api,
        });
        let configmaps = Informer::new(Api::namespaced(client, namespace)).with_handler(Arc::new(
            move |event: watcher::Event<ConfigMap>| {
                let restarter = restarter.clone();
                async move { restarter.on_event(event).await }.boxed()
            },
        ));

        Self {
            base: BaseController::new(namespace, token),
            configmaps,
            deployments,
        }
    }
}

#[async_trait]
impl Controller for ConfigMapController {
    fn namespace(&self) -> &str {
        self.base.namespace()
    }

    async fn run(&self) {
        info!("Starting configmap controller for namespace {}", self.namespace());
        self.deployments.start(self.base.token().clone());
        self.configmaps.start(self.base.token().clone());

        let token = self.base.token();
        if !self.deployments.wait_for_cache_sync(token).await
            || !self.configmaps.wait_for_cache_sync(token).await
        {
            warn!(
                "ConfigMap controller for namespace {} stopped before caches synced",
                self.namespace()
            );
        }
    }

    fn stop(&self) {
        info!("Stopping configmap controller for namespace {}", self.namespace());
        self.base.stop();
    }
}

struct Restarter {
    namespace: String,
    versions: Mutex<ResourceVersions>,
    deployments: Arc<Informer<Deployment>>,
    deployments_api: Api<Deployment>,
}

impl Restarter {
    async fn on_event(&self, event: watcher::Event<ConfigMap>) {
        let updated = match self.versions.lock() {
            Ok(mut versions) => versions.observe(event),
            Err(poisoned) => poisoned.into_inner().observe(event),
        };
        let Some(configmap) = updated else {
            return;
        };
        debug!("ConfigMap {}/{} updated", self.namespace, configmap.name_any());

        for name in deployments_to_restart(&configmap) {
            if self.deployments.get(&self.namespace, &name).is_none() {
                warn!(
                    "ConfigMap {} is associated with deployment {}/{}, which does not exist",
                    configmap.name_any(),
                    self.namespace,
                    name
                );
                continue;
            }

            info!(
                "ConfigMap {} triggers restart of deployment {}/{}",
                configmap.name_any(),
                self.namespace,
                name
            );
            let patch = restart_patch(Utc::now());
            if let Err(e) = patch_deployment(&self.deployments_api, &name, &patch).await {
                error!(
                    "ConfigMap controller for namespace {} failed to apply {}: {:?}",
                    self.namespace, patch, e
                );
            }
        }
    }
}

/// Deployments named by the `-config` suffix convention plus those listed in the
/// association annotation (a JSON array of names).
pub fn deployments_to_restart(configmap: &ConfigMap) -> BTreeSet<String> {
    let mut deployments = BTreeSet::new();
    let name = configmap.name_any();

    if let Some(deployment) = name.strip_suffix(CONFIG_NAME_SUFFIX) {
        deployments.insert(deployment.to_string());
    }

    if let Some(annotation) = configmap.annotations().get(ASSOCIATE_DEPLOYMENT_ANNOTATION) {
        match serde_json::from_str::<Vec<String>>(annotation) {
            Ok(names) => deployments.extend(names),
            Err(e) => error!(
                "Failed to parse annotation {} of configmap {}/{}: {}",
                ASSOCIATE_DEPLOYMENT_ANNOTATION,
                configmap.namespace().unwrap_or_default(),
                name,
                e
            ),
        }
    }
    deployments
}

/// Recovers updates from a watcher by remembering the last resource version of every
/// configmap. Unchanged versions are resync echoes; relists only count once synced.
#[derive(Default)]
struct ResourceVersions {
    versions: HashMap<String, Option<String>>,
    relisted: Option<HashSet<String>>,
    synced: bool,
}

impl ResourceVersions {
    /// Returns the configmap if the event is an update.
    fn observe(&mut self, event: watcher::Event<ConfigMap>) -> Option<ConfigMap> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            watcher::Event::InitApply(configmap) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(configmap.name_any());
                }
                let changed = self.record(&configmap);
                (self.synced && changed).then_some(configmap)
            }
            watcher::Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    self.versions.retain(|name, _| relisted.contains(name));
                }
                self.synced = true;
                None
            }
            watcher::Event::Apply(configmap) => self.record(&configmap).then_some(configmap),
            watcher::Event::Delete(configmap) => {
                self.versions.remove(&configmap.name_any());
                None
            }
        }
    }

    /// True when a known configmap came back with another resource version.
    fn record(&mut self, configmap: &ConfigMap) -> bool {
        let version = configmap.resource_version();
        match self.versions.insert(configmap.name_any(), version.clone()) {
            Some(previous) => previous != version,
            None => false,
        }
    }
}
