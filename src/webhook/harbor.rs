use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::event::ImageEvent;
use crate::state::AppState;
use crate::webhook::PayloadError;

static PUSH_ARTIFACT: &str = "PUSH_ARTIFACT";

/// Harbor webhook payload, e.g.
///
/// ```json
/// {"type": "PUSH_ARTIFACT", "occur_at": 1603728502, "operator": "admin",
///  "event_data": {"resources": [{"digest": "sha256:…", "tag": "v1.0.0",
///  "resource_url": "harbor.example.com/image/image:v1.0.0"}],
///  "repository": {"name": "image", "namespace": "image", "repo_full_name": "image/image"}}}
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HarborWebhook {
    pub occur_at: Option<i64>,
    pub operator: Option<String>,
    pub event_data: EventData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventData {
    pub resources: Vec<EventResource>,
    pub repository: Repository,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventResource {
    pub digest: Option<String>,
    pub tag: Option<String>,
    pub resource_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub repo_full_name: String,
}

#[derive(Deserialize)]
struct EventType {
    #[serde(rename = "type")]
    event_type: Option<String>,
}

/// Checks `type` before decoding the rest of the payload.
fn decode_push(body: &[u8]) -> Result<HarborWebhook, PayloadError> {
    if body.is_empty() {
        return Err(PayloadError::Empty);
    }
    let EventType { event_type } = serde_json::from_slice(body)?;
    if event_type.as_deref() != Some(PUSH_ARTIFACT) {
        return Err(PayloadError::Unsupported {
            field: "type",
            value: event_type,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

/// Image events carried by a push notification; anything else yields none.
pub fn image_events(body: &[u8]) -> Vec<ImageEvent> {
    let webhook = match decode_push(body) {
        Ok(webhook) => webhook,
        Err(e @ PayloadError::Malformed(_)) => {
            warn!(
                "Ignoring harbor webhook body {}: {}",
                String::from_utf8_lossy(body),
                e
            );
            return Vec::new();
        }
        Err(e) => {
            info!("Ignoring harbor webhook: {}", e);
            return Vec::new();
        }
    };
    debug!(
        "Harbor push to {} by {:?} at {:?}",
        webhook.event_data.repository.repo_full_name, webhook.operator, webhook.occur_at
    );

    webhook
        .event_data
        .resources
        .iter()
        .filter(|resource| !resource.resource_url.is_empty())
        .map(|resource| {
            debug!(
                "Harbor pushed {} (tag {:?}, digest {:?})",
                resource.resource_url, resource.tag, resource.digest
            );
            ImageEvent::from_reference(&resource.resource_url)
        })
        .collect()
}

pub async fn harbor_image_webhook(State(state): State<AppState>, body: Bytes) -> StatusCode {
    for event in image_events(&body) {
        state.collector.collect(event).await;
    }
    StatusCode::OK
}
