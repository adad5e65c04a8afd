use anyhow::Context;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde_json::{Value, json};
use tracing::debug;

pub static LABORER_FIELD_MANAGER: &str = "laborer";
pub static KUBECTL_ROLLOUT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Pod template annotation change that makes the deployment controller roll every pod.
pub fn restart_patch(now: DateTime<Utc>) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        KUBECTL_ROLLOUT_ANNOTATION: now.to_rfc3339(),
                    }
                }
            }
        }
    })
}

/// Strategic merge patch replacing only the listed `(container name, image)` pairs.
/// Containers merge by name, so the others are left as they are.
pub fn container_images_patch(images: &[(String, String)]) -> Value {
    let containers: Vec<Value> = images
        .iter()
        .map(|(name, image)| json!({ "name": name, "image": image }))
        .collect();
    json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": containers,
                }
            }
        }
    })
}

pub async fn patch_deployment(
    api: &Api<Deployment>,
    name: &str,
    patch: &Value,
) -> anyhow::Result<()> {
    debug!("Patching Deployment {} with patch {}", name, patch);
    api.patch(
        name,
        &PatchParams::apply(LABORER_FIELD_MANAGER),
        &Patch::Strategic(patch),
    )
    .await
    .with_context(|| format!("Failed to patch Deployment {}", name))?;
    Ok(())
}
