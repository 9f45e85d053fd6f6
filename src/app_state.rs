use std::sync::Arc;

use crate::routes::common::IdempotencyStore;
use crate::services::jobs::JobsService;
use crate::services::suggestions::SuggestionsService;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobsService>,
    pub suggestions: Arc<SuggestionsService>,
    pub idempotency: Arc<IdempotencyStore>,
}

impl AppState {
    pub fn new(jobs: JobsService, suggestions: SuggestionsService) -> Self {
        Self {
            jobs: Arc::new(jobs),
            suggestions: Arc::new(suggestions),
            idempotency: Arc::new(IdempotencyStore::new()),
        }
    }
}
