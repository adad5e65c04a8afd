use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{BaseController, Controller, NewControllerFunc};
use crate::event::ImageEvent;
use crate::informer::Informer;
use crate::rollout::{container_images_patch, patch_deployment};

/// Moves deployment containers to a newly pushed tag of the image they run.
pub struct DeploymentController {
    base: BaseController,
    informer: Informer<Deployment>,
    deployments: Api<Deployment>,
}

pub fn new_controller_func(client: Client) -> NewControllerFunc {
    Arc::new(
        move |namespace: &str, token: CancellationToken| -> Box<dyn Controller> {
            Box::new(DeploymentController::new(namespace, client.clone(), token))
        },
    )
}

impl DeploymentController {
    pub fn new(namespace: &str, client: Client, token: CancellationToken) -> Self {
        let deployments: Api<Deployment> = Api::namespaced(client, namespace);
        Self {
            base: BaseController::new(namespace, token),
            informer: Informer::new(deployments.clone()),
            deployments,
        }
    }
}

#[async_trait]
impl Controller for DeploymentController {
    fn namespace(&self) -> &str {
        self.base.namespace()
    }

    async fn run(&self) {
        info!("Starting deployment controller for namespace {}", self.namespace());
        self.informer.start(self.base.token().clone());

        if !self.informer.wait_for_cache_sync(self.base.token()).await {
            warn!(
                "Deployment controller for namespace {} stopped before caches synced",
                self.namespace()
            );
            return;
        }
        for deployment in self.informer.list() {
            debug!("Namespace {} has deployment {}", self.namespace(), deployment.name_any());
        }
    }

    fn stop(&self) {
        info!("Stopping deployment controller for namespace {}", self.namespace());
        self.base.stop();
    }

    async fn process_image_event(&self, event: &ImageEvent) {
        for (name, images) in plan_image_updates(&self.informer.list(), event) {
            info!(
                "Image event {} triggers update of deployment {}/{}",
                event,
                self.namespace(),
                name
            );
            let patch = container_images_patch(&images);
            if let Err(e) = patch_deployment(&self.deployments, &name, &patch).await {
                error!(
                    "Deployment controller for namespace {} failed to apply {}: {:?}",
                    self.namespace(),
                    patch,
                    e
                );
            }
        }
    }
}

/// For every deployment running the event's image under another tag, the containers to
/// move to the event's tag as `(container name, new image)`.
pub fn plan_image_updates(
    deployments: &[Arc<Deployment>],
    event: &ImageEvent,
) -> Vec<(String, Vec<(String, String)>)> {
    deployments
        .iter()
        .filter_map(|deployment| {
            let containers = &deployment
                .spec
                .as_ref()?
                .template
                .spec
                .as_ref()?
                .containers;

            let images: Vec<(String, String)> = containers
                .iter()
                .filter(|container| {
                    container.image.as_deref().is_some_and(|image| {
                        let current = ImageEvent::from_reference(image);
                        current.image == event.image && current.tag != event.tag
                    })
                })
                .map(|container| (container.name.clone(), event.image_and_tag()))
                .collect();

            (!images.is_empty()).then(|| (deployment.name_any(), images))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str, containers: serde_json::Value) -> Arc<Deployment> {
        Arc::new(
            serde_json::from_value(json!({
                "metadata": {"name": name, "namespace": "team"},
                "spec": {
                    "selector": {"matchLabels": {"app": name}},
                    "template": {"spec": {"containers": containers}}
                }
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_push_updates_only_matching_container() {
        let deployments = vec![deployment(
            "app",
            json!([
                {"name": "app", "image": "registry.example.com/team/app:v1"},
                {"name": "sidecar", "image": "other/app:v1"}
            ]),
        )];
        let event = ImageEvent::from_reference("registry.example.com/team/app:v2");

        let plan = plan_image_updates(&deployments, &event);

        assert_eq!(
            plan,
            vec![(
                "app".to_string(),
                vec![(
                    "app".to_string(),
                    "registry.example.com/team/app:v2".to_string()
                )]
            )]
        );
    }

    #[test]
    fn test_same_tag_is_not_patched() {
        let deployments = vec![deployment(
            "app",
            json!([{"name": "app", "image": "team/app:v2"}]),
        )];
        let event = ImageEvent::from_reference("team/app:v2");

        assert!(plan_image_updates(&deployments, &event).is_empty());
    }

    #[test]
    fn test_untagged_container_counts_as_latest() {
        let deployments = vec![
            deployment("a", json!([{"name": "app", "image": "team/app"}])),
            deployment("b", json!([{"name": "app", "image": "team/app:v1"}])),
        ];
        let event = ImageEvent::from_reference("team/app");

        let plan = plan_image_updates(&deployments, &event);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].0, "b");
        assert_eq!(plan[0].1[0].1, "team/app:latest");
    }

    #[test]
    fn test_deployment_without_template_spec_is_skipped() {
        let deployments = vec![Arc::new(Deployment::default())];
        let event = ImageEvent::from_reference("team/app:v2");
        assert!(plan_image_updates(&deployments, &event).is_empty());
    }
}
