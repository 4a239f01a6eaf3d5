use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{sse::Event, IntoResponse, Sse},
    Json,
};
use futures::{stream::BoxStream, StreamExt};
use retrieval_pipeline::{
    answer::{respond::QueryResponse, stream::response_to_events, stream::StreamEvent},
    QueryOutcome, QueryRequest,
};
use tracing::info;
use uuid::Uuid;

use crate::api_state::ApiState;

/// Streaming query endpoint: one SSE stream with `data: <json>` frames,
/// keepalives included, `done` (or a single `error`) as the final event.
pub async fn query_stream(
    State(state): State<ApiState>,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4().to_string();
    info!(%request_id, user_id = %request.user_id, "query stream started");

    let events: BoxStream<'static, StreamEvent> =
        match state.query_pipeline.answer_events(request).await {
            QueryOutcome::Streaming(stream) => stream,
            QueryOutcome::Immediate(response) => {
                futures::stream::iter(response_to_events(response)).boxed()
            }
        };

    let sse_stream = events.map(|event| Event::default().json_data(&event));

    let mut headers = HeaderMap::new();
    headers.insert(
        header::HeaderName::from_static("x-request-id"),
        HeaderValue::from_str(&request_id).unwrap_or(HeaderValue::from_static("invalid")),
    );

    (headers, Sse::new(sse_stream))
}

/// Non-streaming variant returning the full response envelope at once.
pub async fn query_sync(
    State(state): State<ApiState>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    info!(user_id = %request.user_id, "sync query");
    Json(state.query_pipeline.answer(request).await)
}
