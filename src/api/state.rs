use std::sync::Arc;

use crate::engine::Monitor;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    /// Write side of the event log, used by attempt ingestion.
    pub pool: Pool,
    pub monitor: Arc<Monitor>,
}
