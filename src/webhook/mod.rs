pub mod github;
pub mod harbor;
pub mod latest_tag;

/// Why a push notification produced no image events.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("body is empty")]
    Empty,
    #[error("failed to decode body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported {field} {value:?}")]
    Unsupported {
        field: &'static str,
        value: Option<String>,
    },
}
