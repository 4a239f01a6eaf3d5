use api_router::{api_routes_v1, api_state::ApiState};
use axum::{extract::FromRef, Router};
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::get_config,
};
use ingestion_pipeline::{run_worker_loop, IngestionPipeline};
use retrieval_pipeline::QueryPipeline;
use std::sync::Arc;
use summarizer::Summarizer;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    db.ensure_initialized(config.embedding_dimensions as usize)
        .await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let storage = StorageManager::new(&config).await?;

    let query_pipeline = Arc::new(QueryPipeline::new(
        Arc::clone(&db),
        Arc::clone(&openai_client),
        config.clone(),
    ));

    let api_state = ApiState {
        db: Arc::clone(&db),
        config: config.clone(),
        query_pipeline,
    };

    let app = Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .with_state(AppState { api_state });

    // Background worker shares the process with the HTTP server.
    let ingestion_pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&db),
        Arc::clone(&openai_client),
        config.clone(),
        storage,
    ));
    let summarizer = Arc::new(Summarizer::new(
        Arc::clone(&db),
        openai_client,
        config.clone(),
    ));
    let worker_db = Arc::clone(&db);
    tokio::spawn(async move {
        info!("Starting worker process");
        if let Err(e) = run_worker_loop(worker_db, ingestion_pipeline, summarizer).await {
            error!("Worker process error: {}", e);
        }
    });

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Clone, FromRef)]
struct AppState {
    api_state: ApiState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use common::utils::config::AppConfig;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn build_test_app() -> Router {
        let namespace = "test_ns";
        let database = format!("test_db_{}", Uuid::new_v4());

        let config = AppConfig {
            openai_api_key: "test-key".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: namespace.into(),
            surrealdb_database: database.clone(),
            openai_base_url: "https://example.com".into(),
            ..Default::default()
        };

        let db = Arc::new(
            SurrealDbClient::memory(namespace, &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );
        db.ensure_initialized(3)
            .await
            .expect("failed to build indexes");

        let openai_client = Arc::new(async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        ));

        let query_pipeline = Arc::new(QueryPipeline::new(
            Arc::clone(&db),
            openai_client,
            config.clone(),
        ));

        let api_state = ApiState {
            db,
            config,
            query_pipeline,
        };

        Router::new()
            .nest("/api/v1", api_routes_v1(&api_state))
            .with_state(AppState { api_state })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let app = build_test_app().await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/live")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);

        let ready_response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("ready response");
        assert_eq!(ready_response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingest_endpoint_enqueues_job() {
        let app = build_test_app().await;

        let body = serde_json::json!({
            "user_id": "user-1",
            "class_id": "class-1",
            "s3_key": "uploads/notes.pdf",
            "doc_id": "doc-1",
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("ingest response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
