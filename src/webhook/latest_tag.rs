use anyhow::Context;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use json_patch::jsonptr::PointerBuf;
use json_patch::{Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::image_reference::ImageReference;
use crate::repository::{RepositoryError, RepositoryService};
use crate::state::AppState;

/// Mutating webhook that pins the images of new deployments to their latest pushed tag.
pub async fn latest_tag_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to read admission request: {:#}", e);
            return Json(AdmissionResponse::invalid(format!("{:#}", e)).into_review());
        }
    };

    let response = AdmissionResponse::from(&request);
    let deployment = match (&request.operation, &request.object) {
        (Operation::Create, Some(deployment)) => deployment,
        _ => {
            debug!(
                "Admission request {} is a {:?} without a new deployment, allowing unchanged",
                request.uid, request.operation
            );
            return Json(response.into_review());
        }
    };

    let operations = latest_tag_patches(state.repository.as_ref(), deployment).await;
    if operations.is_empty() {
        return Json(response.into_review());
    }

    info!(
        "Pinning {} images of deployment {}/{} to their latest tags",
        operations.len(),
        request.namespace.as_deref().unwrap_or_default(),
        deployment.name_any()
    );
    match response.with_patch(Patch(operations)) {
        Ok(response) => Json(response.into_review()),
        Err(e) => {
            error!("Failed to serialize admission patch: {}", e);
            Json(AdmissionResponse::from(&request).into_review())
        }
    }
}

fn decode_request(body: &[u8]) -> anyhow::Result<AdmissionRequest<Deployment>> {
    let review: AdmissionReview<Deployment> =
        serde_json::from_slice(body).context("Failed to decode admission review")?;
    let request: AdmissionRequest<Deployment> = review
        .try_into()
        .context("Admission review carries no request")?;
    Ok(request)
}

/// One replace operation per container whose declared tag is not the latest one.
/// Containers whose tag cannot be resolved are left as they are.
pub async fn latest_tag_patches(
    repository: &dyn RepositoryService,
    deployment: &Deployment,
) -> Vec<PatchOperation> {
    let Some(pod_spec) = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
    else {
        return Vec::new();
    };

    let mut operations = Vec::new();
    if let Some(init_containers) = &pod_spec.init_containers {
        operations.extend(container_patches(repository, "initContainers", init_containers).await);
    }
    operations.extend(container_patches(repository, "containers", &pod_spec.containers).await);
    operations
}

async fn container_patches(
    repository: &dyn RepositoryService,
    field: &str,
    containers: &[Container],
) -> Vec<PatchOperation> {
    let mut operations = Vec::new();
    for (index, container) in containers.iter().enumerate() {
        let Some(image) = container.image.as_deref() else {
            continue;
        };
        let reference = match ImageReference::parse(image) {
            Ok(reference) => reference,
            Err(e) => {
                warn!("Failed to parse image {} of container {}: {}", image, container.name, e);
                continue;
            }
        };

        let latest = match repository
            .latest_tag(reference.host(), reference.project(), &reference.repo)
            .await
        {
            Ok(tag) => tag,
            Err(e @ RepositoryError::NotFoundRepo { .. }) => {
                debug!("No latest tag for image {}: {}", image, e);
                continue;
            }
            Err(e) => {
                warn!("Failed to resolve latest tag of image {}: {}", image, e);
                continue;
            }
        };
        if latest == reference.tag {
            continue;
        }

        let index = index.to_string();
        operations.push(PatchOperation::Replace(ReplaceOperation {
            path: PointerBuf::from_tokens(["spec", "template", "spec", field, index.as_str(), "image"]),
            value: Value::String(reference.with_tag(&latest).to_string()),
        }));
    }
    operations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockRepositoryService;
    use serde_json::json;
    use std::collections::HashMap;

    fn deployment(init_containers: Value, containers: Value) -> Deployment {
        serde_json::from_value(json!({
            "metadata": {"name": "app", "namespace": "team"},
            "spec": {
                "selector": {"matchLabels": {"app": "app"}},
                "template": {"spec": {
                    "initContainers": init_containers,
                    "containers": containers
                }}
            }
        }))
        .unwrap()
    }

    fn mock(entries: &[(&str, &str)]) -> MockRepositoryService {
        MockRepositoryService::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    #[tokio::test]
    async fn test_untagged_image_is_pinned_to_latest_tag() {
        let repository = mock(&[("team/app", "v5")]);
        let deployment = deployment(json!([]), json!([{"name": "app", "image": "team/app"}]));

        let operations = latest_tag_patches(&repository, &deployment).await;

        assert_eq!(
            serde_json::to_value(Patch(operations)).unwrap(),
            json!([{
                "op": "replace",
                "path": "/spec/template/spec/containers/0/image",
                "value": "team/app:v5"
            }])
        );
    }

    #[tokio::test]
    async fn test_up_to_date_image_is_not_patched() {
        let repository = mock(&[("team/app", "v5")]);
        let deployment = deployment(json!([]), json!([{"name": "app", "image": "team/app:v5"}]));

        assert!(latest_tag_patches(&repository, &deployment).await.is_empty());
    }

    #[tokio::test]
    async fn test_init_containers_and_unresolved_images() {
        let repository = mock(&[
            ("registry.example.com/team/migrate", "v2"),
            ("team/app", "v5"),
        ]);
        let deployment = deployment(
            json!([{"name": "migrate", "image": "registry.example.com/team/migrate:v1"}]),
            json!([
                {"name": "unknown", "image": "library/nginx:1.25"},
                {"name": "app", "image": "team/app:v4"}
            ]),
        );

        let operations = latest_tag_patches(&repository, &deployment).await;

        assert_eq!(
            serde_json::to_value(Patch(operations)).unwrap(),
            json!([
                {
                    "op": "replace",
                    "path": "/spec/template/spec/initContainers/0/image",
                    "value": "registry.example.com/team/migrate:v2"
                },
                {
                    "op": "replace",
                    "path": "/spec/template/spec/containers/1/image",
                    "value": "team/app:v5"
                }
            ])
        );
    }

    #[tokio::test]
    async fn test_deployment_without_pod_spec() {
        let repository = mock(&[]);
        assert!(
            latest_tag_patches(&repository, &Deployment::default())
                .await
                .is_empty()
        );
    }
}
