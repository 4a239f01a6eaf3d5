use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Lifecycle of a document's background summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Missing,
    Processing,
    Ready,
    Failed,
    NoChunks,
}

stored_object!(DocumentRecord, "document", {
    user_id: String,
    class_id: String,
    file_name: String,
    is_processing: bool,
    summary_status: SummaryStatus,
    has_summary: bool,
    pdf_s3_key: Option<String>,
    key_terms: Option<Vec<String>>
});

impl DocumentRecord {
    pub fn new(user_id: String, class_id: String, file_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            class_id,
            file_name,
            is_processing: true,
            summary_status: SummaryStatus::Missing,
            has_summary: false,
            pdf_s3_key: None,
            key_terms: None,
        }
    }

    pub async fn set_processing(
        id: &str,
        is_processing: bool,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _record: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/is_processing", is_processing))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    pub async fn set_summary_status(
        id: &str,
        status: SummaryStatus,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let has_summary = matches!(status, SummaryStatus::Ready);
        let _record: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/summary_status", status))
            .patch(PatchOp::replace("/has_summary", has_summary))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }
}
