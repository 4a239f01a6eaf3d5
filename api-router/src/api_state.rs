use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use retrieval_pipeline::QueryPipeline;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub query_pipeline: Arc<QueryPipeline>,
}
