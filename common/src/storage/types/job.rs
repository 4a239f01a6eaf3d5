use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const MAX_ATTEMPTS: u32 = 3;

/// Work item payloads. Ingest jobs are always claimed before summary jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Ingest {
        user_id: String,
        class_id: String,
        s3_key: String,
        doc_id: String,
    },
    Summary {
        user_id: String,
        class_id: String,
        doc_id: String,
        file_name: String,
    },
}

impl JobPayload {
    /// Queue weight; lower claims first.
    fn priority(&self) -> u8 {
        match self {
            JobPayload::Ingest { .. } => 0,
            JobPayload::Summary { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Created,
    InProgress {
        attempts: u32,
        last_attempt: chrono::DateTime<chrono::Utc>,
    },
    Completed,
    Error(String),
}

stored_object!(Job, "job", {
    payload: JobPayload,
    status: JobStatus,
    priority: u8,
    user_id: String
});

impl Job {
    pub fn new(payload: JobPayload, user_id: String) -> Self {
        let now = Utc::now();
        let priority = payload.priority();

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            payload,
            status: JobStatus::Created,
            priority,
            user_id,
        }
    }

    pub async fn enqueue(
        payload: JobPayload,
        user_id: String,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let job = Self::new(payload, user_id);
        db.store_item(job).await?;

        Ok(())
    }

    pub async fn update_status(
        id: &str,
        status: JobStatus,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(surrealdb::opt::PatchOp::replace("/status", status))
            .patch(surrealdb::opt::PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    /// Claim the next ready job, ingest before summary, oldest first. The
    /// claimed job is marked in-progress with its attempt count bumped.
    pub async fn claim_next(db: &SurrealDbClient) -> Result<Option<Self>, AppError> {
        let candidates = Self::get_unfinished(db).await?;
        let Some(job) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let attempts = match &job.status {
            JobStatus::InProgress { attempts, .. } => attempts.saturating_add(1),
            _ => 1,
        };
        let claimed_status = JobStatus::InProgress {
            attempts,
            last_attempt: Utc::now(),
        };
        Self::update_status(&job.id, claimed_status.clone(), db).await?;

        Ok(Some(Self {
            status: claimed_status,
            ..job
        }))
    }

    /// Newly created jobs plus in-progress ones that have attempts left.
    pub async fn get_unfinished(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let jobs: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE \
                    status = 'Created' \
                    OR ( \
                        status.InProgress != NONE \
                        AND status.InProgress.attempts < $max_attempts \
                    ) \
                 ORDER BY priority ASC, created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("max_attempts", MAX_ATTEMPTS))
            .await?
            .take(0)?;

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_payload(user_id: &str) -> JobPayload {
        JobPayload::Ingest {
            user_id: user_id.to_string(),
            class_id: "class-1".to_string(),
            s3_key: "uploads/notes.pdf".to_string(),
            doc_id: "doc-1".to_string(),
        }
    }

    fn summary_payload(user_id: &str) -> JobPayload {
        JobPayload::Summary {
            user_id: user_id.to_string(),
            class_id: "class-1".to_string(),
            doc_id: "doc-1".to_string(),
            file_name: "notes.pdf".to_string(),
        }
    }

    async fn setup_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let db = setup_db().await;

        Job::enqueue(ingest_payload("user-1"), "user-1".into(), &db)
            .await
            .expect("enqueue");

        let claimed = Job::claim_next(&db)
            .await
            .expect("claim")
            .expect("job available");
        assert!(matches!(
            claimed.status,
            JobStatus::InProgress { attempts: 1, .. }
        ));

        Job::update_status(&claimed.id, JobStatus::Completed, &db)
            .await
            .expect("complete");

        let next = Job::claim_next(&db).await.expect("claim");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_ingest_claims_before_summary() {
        let db = setup_db().await;

        // Enqueue the summary first so only priority can win the ordering.
        Job::enqueue(summary_payload("user-1"), "user-1".into(), &db)
            .await
            .expect("enqueue summary");
        Job::enqueue(ingest_payload("user-1"), "user-1".into(), &db)
            .await
            .expect("enqueue ingest");

        let first = Job::claim_next(&db)
            .await
            .expect("claim")
            .expect("job available");
        assert!(matches!(first.payload, JobPayload::Ingest { .. }));

        Job::update_status(&first.id, JobStatus::Completed, &db)
            .await
            .expect("complete ingest");

        let second = Job::claim_next(&db)
            .await
            .expect("claim")
            .expect("job available");
        assert!(matches!(second.payload, JobPayload::Summary { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_jobs_are_not_reclaimed() {
        let db = setup_db().await;

        let mut job = Job::new(ingest_payload("user-1"), "user-1".into());
        job.status = JobStatus::InProgress {
            attempts: MAX_ATTEMPTS,
            last_attempt: Utc::now(),
        };
        db.store_item(job).await.expect("store");

        let claimed = Job::claim_next(&db).await.expect("claim");
        assert!(claimed.is_none());
    }
}
