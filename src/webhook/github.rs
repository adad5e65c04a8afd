use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::event::ImageEvent;
use crate::state::AppState;
use crate::webhook::PayloadError;

static PUBLISHED: &str = "published";
static CONTAINER_PACKAGE_TYPE: &str = "CONTAINER";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PackageWebhook {
    pub package: Option<Package>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Package {
    pub name: String,
    pub package_type: String,
    pub package_version: PackageVersion,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PackageVersion {
    pub version: String,
    pub package_url: String,
}

#[derive(Deserialize)]
struct Action {
    action: Option<String>,
}

/// Checks `action` before decoding the rest of the payload.
fn decode_published(body: &[u8]) -> Result<PackageWebhook, PayloadError> {
    if body.is_empty() {
        return Err(PayloadError::Empty);
    }
    let Action { action } = serde_json::from_slice(body)?;
    if action.as_deref() != Some(PUBLISHED) {
        return Err(PayloadError::Unsupported {
            field: "action",
            value: action,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

/// The image of a published container package, if the payload is one.
pub fn image_event(body: &[u8]) -> Option<ImageEvent> {
    let webhook = match decode_published(body) {
        Ok(webhook) => webhook,
        Err(e @ PayloadError::Malformed(_)) => {
            warn!(
                "Ignoring github webhook body {}: {}",
                String::from_utf8_lossy(body),
                e
            );
            return None;
        }
        Err(e) => {
            warn!("Ignoring github webhook: {}", e);
            return None;
        }
    };

    match webhook.package {
        Some(package)
            if package.package_type == CONTAINER_PACKAGE_TYPE
                && !package.package_version.package_url.is_empty() =>
        {
            debug!(
                "GitHub published package {} version {}",
                package.name, package.package_version.version
            );
            Some(ImageEvent::from_reference(
                &package.package_version.package_url,
            ))
        }
        package => {
            warn!("GitHub package lacks essential content, ignored: {:?}", package);
            None
        }
    }
}

pub async fn github_image_webhook(State(state): State<AppState>, body: Bytes) -> StatusCode {
    if let Some(event) = image_event(&body) {
        state.collector.collect(event).await;
    }
    StatusCode::OK
}
