#![allow(clippy::missing_docs_in_private_items)]

pub mod chunking;
pub mod metrics;
pub mod parser;
pub mod pipeline;

pub use pipeline::{DefaultIngestServices, IngestServices, IngestionPipeline};

use std::sync::Arc;

use common::storage::{
    db::SurrealDbClient,
    types::job::{Job, JobPayload, JobStatus, MAX_ATTEMPTS},
};
use summarizer::Summarizer;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// Claim-and-process loop for the background worker: ingest jobs first, then
/// summary jobs, with bounded retries tracked on the job record.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    ingestion_pipeline: Arc<IngestionPipeline>,
    summarizer: Arc<Summarizer>,
) -> Result<(), Box<dyn std::error::Error>> {
    let idle_backoff = Duration::from_millis(500);

    loop {
        match Job::claim_next(&db).await {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                info!(%job_id, "claimed job");

                let outcome = process_job(&job, &ingestion_pipeline, &summarizer).await;

                match outcome {
                    Ok(()) => {
                        if let Err(err) =
                            Job::update_status(&job_id, JobStatus::Completed, &db).await
                        {
                            error!(%job_id, error = %err, "failed to record job status");
                        }
                    }
                    Err(err) => {
                        let attempts = match &job.status {
                            JobStatus::InProgress { attempts, .. } => *attempts,
                            _ => 1,
                        };
                        error!(%job_id, error = %err, attempts, "job failed");

                        // Jobs with attempts left stay in progress and are
                        // reclaimed; exhausted ones are marked failed.
                        if attempts >= MAX_ATTEMPTS {
                            if let Err(status_err) =
                                Job::update_status(&job_id, JobStatus::Error(err.to_string()), &db)
                                    .await
                            {
                                error!(%job_id, error = %status_err, "failed to record job status");
                            }
                        }
                    }
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(error = %err, "failed to claim job");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process_job(
    job: &Job,
    ingestion_pipeline: &IngestionPipeline,
    summarizer: &Summarizer,
) -> Result<(), common::error::AppError> {
    match &job.payload {
        JobPayload::Ingest {
            user_id,
            class_id,
            s3_key,
            doc_id,
        } => {
            ingestion_pipeline
                .run_ingest_job(user_id, class_id, s3_key, doc_id)
                .await?;
            Ok(())
        }
        JobPayload::Summary {
            user_id,
            class_id,
            doc_id,
            file_name,
        } => {
            summarizer
                .generate_document_summary(user_id, class_id, doc_id, file_name)
                .await?;
            Ok(())
        }
    }
}
