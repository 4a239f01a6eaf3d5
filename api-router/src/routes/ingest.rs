use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use common::storage::types::job::{Job, JobPayload};

use crate::{api_state::ApiState, error::ApiError};

/// Ingest job input; the background worker fetches the blob and runs the
/// pipeline.
#[derive(Debug, Deserialize)]
pub struct IngestParams {
    pub user_id: String,
    pub class_id: String,
    pub s3_key: String,
    pub doc_id: String,
}

pub async fn enqueue_ingest(
    State(state): State<ApiState>,
    Json(params): Json<IngestParams>,
) -> Result<impl IntoResponse, ApiError> {
    info!(doc_id = %params.doc_id, s3_key = %params.s3_key, "enqueueing ingest job");

    let user_id = params.user_id.clone();
    Job::enqueue(
        JobPayload::Ingest {
            user_id: params.user_id,
            class_id: params.class_id,
            s3_key: params.s3_key,
            doc_id: params.doc_id,
        },
        user_id,
        &state.db,
    )
    .await?;

    Ok((StatusCode::OK, Json(json!({ "status": "success" }))))
}
