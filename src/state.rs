use std::sync::Arc;

use crate::event::ImageEventCollector;
use crate::repository::RepositoryService;

/// Shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub(crate) collector: ImageEventCollector,
    pub(crate) repository: Arc<dyn RepositoryService>,
}
