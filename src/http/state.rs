use crate::sync::SyncService;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Handle to the running sync actor
    pub sync: SyncService,
}

impl AppState {
    pub fn new(sync: SyncService) -> Self {
        Self { sync }
    }
}
