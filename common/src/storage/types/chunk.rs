#![allow(clippy::module_name_repetitions)]
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_retry::Retry;
use tracing::warn;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Where a chunk's text came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Pdf,
    Docx,
    Summary,
    SectionSummary,
    OnDemand,
    OnDemandSections,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    Section,
    Document,
}

stored_object!(Chunk, "chunk", {
    user_id: String,
    class_id: String,
    doc_id: String,
    file_name: String,
    title: String,
    author: String,
    page_number: Option<u32>,
    source_type: SourceType,
    is_summary: bool,
    summary_type: Option<SummaryType>,
    section_index: Option<u32>,
    start_page: Option<u32>,
    end_page: Option<u32>,
    text: String,
    original_text: Option<String>,
    chunk_hash: Option<String>,
    embedding: Vec<f32>
});

/// Shared provenance for every chunk produced from one document.
#[derive(Debug, Clone)]
pub struct ChunkProvenance {
    pub user_id: String,
    pub class_id: String,
    pub doc_id: String,
    pub file_name: String,
    pub title: String,
    pub author: String,
}

/// Scope selector for summary lookups.
#[derive(Debug, Clone)]
pub enum SummaryScope<'a> {
    Doc(&'a str),
    Class(&'a str),
}

/// Vector-search filter; always scoped by user, optionally narrowed to a
/// document or a class.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub user_id: String,
    pub doc_id: Option<String>,
    pub class_id: Option<String>,
}

/// Search result carrying the hydrated chunk and its similarity score.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub score: f32,
}

impl Chunk {
    /// A chunk of source material (one slice of a page or paragraph).
    pub fn source(
        meta: &ChunkProvenance,
        page_number: Option<u32>,
        source_type: SourceType,
        text: String,
        original_text: Option<String>,
        chunk_hash: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id: meta.user_id.clone(),
            class_id: meta.class_id.clone(),
            doc_id: meta.doc_id.clone(),
            file_name: meta.file_name.clone(),
            title: meta.title.clone(),
            author: meta.author.clone(),
            page_number,
            source_type,
            is_summary: false,
            summary_type: None,
            section_index: None,
            start_page: None,
            end_page: None,
            text,
            original_text,
            chunk_hash: Some(chunk_hash),
            embedding,
        }
    }

    /// A document-level summary chunk.
    pub fn document_summary(
        meta: &ChunkProvenance,
        source_type: SourceType,
        text: String,
        chunk_hash: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id: meta.user_id.clone(),
            class_id: meta.class_id.clone(),
            doc_id: meta.doc_id.clone(),
            file_name: meta.file_name.clone(),
            title: meta.title.clone(),
            author: meta.author.clone(),
            page_number: None,
            source_type,
            is_summary: true,
            summary_type: Some(SummaryType::Document),
            section_index: None,
            start_page: None,
            end_page: None,
            text,
            original_text: None,
            chunk_hash: Some(chunk_hash),
            embedding,
        }
    }

    /// An intermediate section summary produced by section-aware ingestion.
    pub fn section_summary(
        meta: &ChunkProvenance,
        section_index: u32,
        start_page: u32,
        end_page: u32,
        text: String,
        chunk_hash: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id: meta.user_id.clone(),
            class_id: meta.class_id.clone(),
            doc_id: meta.doc_id.clone(),
            file_name: meta.file_name.clone(),
            title: meta.title.clone(),
            author: meta.author.clone(),
            page_number: None,
            source_type: SourceType::SectionSummary,
            is_summary: true,
            summary_type: Some(SummaryType::Section),
            section_index: Some(section_index),
            start_page: Some(start_page),
            end_page: Some(end_page),
            text,
            original_text: None,
            chunk_hash: Some(chunk_hash),
            embedding,
        }
    }

    /// Bulk-insert a batch in one transaction, retrying up to 3 times with a
    /// 0.75 s × attempt backoff. Returns the number of retries that were
    /// needed so ingestion metrics can report them.
    pub async fn insert_batch(
        chunks: &[Chunk],
        db: &SurrealDbClient,
    ) -> Result<u32, AppError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let attempts = AtomicU32::new(0);
        let backoff = (1..=3u64).map(|attempt| Duration::from_millis(750 * attempt));

        Retry::spawn(backoff, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            Self::insert_batch_once(chunks, db).await.map_err(|err| {
                warn!(attempt, error = %err, "chunk batch insert failed");
                err
            })
        })
        .await?;

        Ok(attempts.load(Ordering::Relaxed).saturating_sub(1))
    }

    async fn insert_batch_once(chunks: &[Chunk], db: &SurrealDbClient) -> Result<(), AppError> {
        let mut request = db.client.query("BEGIN TRANSACTION;");
        for (i, chunk) in chunks.iter().enumerate() {
            request = request
                .query(format!(
                    "CREATE type::thing('{table}', $id_{i}) CONTENT $chunk_{i};",
                    table = Self::table_name(),
                ))
                .bind((format!("id_{i}"), chunk.id.clone()))
                .bind((format!("chunk_{i}"), chunk.clone()));
        }
        let response = request
            .query("COMMIT TRANSACTION;")
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// KNN search over the chunk embeddings with similarity scores.
    /// `num_candidates` bounds the index's search effort and is expected to
    /// be much larger than `k`.
    pub async fn vector_search(
        query_embedding: Vec<f32>,
        filter: &ChunkFilter,
        k: usize,
        num_candidates: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        let mut scope_clause = String::new();
        if filter.doc_id.is_some() {
            scope_clause.push_str(" AND doc_id = $doc_id");
        } else if filter.class_id.is_some() {
            scope_clause.push_str(" AND class_id = $class_id");
        }

        let sql = format!(
            r#"
            SELECT *, vector::similarity::cosine(embedding, $embedding) AS score
            FROM {table}
            WHERE user_id = $user_id
              AND is_summary = false{scope_clause}
              AND embedding <|{k},{ef}|> $embedding
            ORDER BY score DESC
            LIMIT {k};
            "#,
            table = Self::table_name(),
            ef = num_candidates.max(k),
        );

        let mut request = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("user_id", filter.user_id.clone()));
        if let Some(doc_id) = &filter.doc_id {
            request = request.bind(("doc_id", doc_id.clone()));
        }
        if let Some(class_id) = &filter.class_id {
            request = request.bind(("class_id", class_id.clone()));
        }

        eprintln!("DEBUG SQL: {sql}");
        let mut response = request
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;
        eprintln!("DEBUG RESPONSE: {response:?}");

        let take_result = response.take::<Vec<ScoredChunk>>(0);
        if let Err(e) = &take_result {
            eprintln!("DEBUG TAKE ERROR: {e:?}");
        }
        let rows: Vec<ScoredChunk> = take_result.unwrap_or_default();

        Ok(rows)
    }

    /// The cached document-level summary for a document or a class, if any.
    pub async fn find_summary(
        user_id: &str,
        scope: SummaryScope<'_>,
        db: &SurrealDbClient,
    ) -> Result<Option<Chunk>, AppError> {
        let (scope_field, scope_value) = match scope {
            SummaryScope::Doc(doc_id) => ("doc_id", doc_id.to_owned()),
            SummaryScope::Class(class_id) => ("class_id", class_id.to_owned()),
        };

        let sql = format!(
            "SELECT * FROM {table} \
             WHERE user_id = $user_id \
               AND is_summary = true \
               AND (summary_type IS NONE OR summary_type != 'section') \
               AND {scope_field} = $scope \
             ORDER BY created_at DESC \
             LIMIT 1;",
            table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("user_id", user_id.to_owned()))
            .bind(("scope", scope_value))
            .await?;

        let rows: Vec<Chunk> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Section summaries for a document, ordered by section index.
    pub async fn find_section_summaries(
        user_id: &str,
        doc_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Chunk>, AppError> {
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE user_id = $user_id \
               AND doc_id = $doc_id \
               AND is_summary = true \
               AND summary_type = 'section' \
             ORDER BY section_index ASC;",
            table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?;

        let rows: Vec<Chunk> = response.take(0)?;
        Ok(rows)
    }

    /// Chunk rehydration for follow-up turns.
    pub async fn find_by_id(id: &str, db: &SurrealDbClient) -> Result<Option<Chunk>, AppError> {
        Ok(db.get_item::<Chunk>(id).await?)
    }

    /// Document-level summaries for a class, excluding intermediate section
    /// summaries, ordered by file name.
    pub async fn fetch_class_summaries(
        user_id: &str,
        class_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Chunk>, AppError> {
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE user_id = $user_id \
               AND class_id = $class_id \
               AND is_summary = true \
               AND (summary_type IS NONE OR summary_type != 'section') \
               AND source_type != 'section_summary' \
             ORDER BY file_name ASC;",
            table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("user_id", user_id.to_owned()))
            .bind(("class_id", class_id.to_owned()))
            .await?;

        let rows: Vec<Chunk> = response.take(0)?;
        Ok(rows)
    }

    /// All non-summary chunks for a document ordered by page number
    /// (summarization input).
    pub async fn fetch_doc_chunks(
        user_id: &str,
        doc_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Chunk>, AppError> {
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE user_id = $user_id \
               AND doc_id = $doc_id \
               AND is_summary = false \
             ORDER BY page_number ASC;",
            table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?;

        let rows: Vec<Chunk> = response.take(0)?;
        Ok(rows)
    }

    /// The text summarization should read: the raw body when a contextual
    /// header was prepended, otherwise the searchable text itself.
    pub fn summarization_text(&self) -> &str {
        self.original_text.as_deref().unwrap_or(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance(user_id: &str) -> ChunkProvenance {
        ChunkProvenance {
            user_id: user_id.to_string(),
            class_id: "class-1".to_string(),
            doc_id: "doc-1".to_string(),
            file_name: "notes.pdf".to_string(),
            title: "Notes".to_string(),
            author: "Unknown".to_string(),
        }
    }

    async fn setup_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized(3).await.expect("build indexes");
        db
    }

    #[tokio::test]
    async fn test_insert_batch_and_vector_search() {
        let db = setup_db().await;
        let meta = provenance("user-1");

        let close = Chunk::source(
            &meta,
            Some(1),
            SourceType::Pdf,
            "Entropy measures disorder.".into(),
            None,
            "hash-a".into(),
            vec![1.0, 0.0, 0.0],
        );
        let far = Chunk::source(
            &meta,
            Some(2),
            SourceType::Pdf,
            "Unrelated material.".into(),
            None,
            "hash-b".into(),
            vec![0.0, 1.0, 0.0],
        );

        let retries = Chunk::insert_batch(&[close.clone(), far.clone()], &db)
            .await
            .expect("insert batch");
        assert_eq!(retries, 0);

        let filter = ChunkFilter {
            user_id: "user-1".into(),
            doc_id: Some("doc-1".into()),
            class_id: None,
        };
        let results = Chunk::vector_search(vec![1.0, 0.0, 0.0], &filter, 2, 100, &db)
            .await
            .expect("vector search");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.id, close.id);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_vector_search_excludes_summaries_and_other_users() {
        let db = setup_db().await;
        let meta = provenance("user-1");

        let source = Chunk::source(
            &meta,
            Some(1),
            SourceType::Pdf,
            "Source text.".into(),
            None,
            "hash-src".into(),
            vec![1.0, 0.0, 0.0],
        );
        let summary = Chunk::document_summary(
            &meta,
            SourceType::Summary,
            "Summary text.".into(),
            "hash-sum".into(),
            vec![1.0, 0.0, 0.0],
        );
        let other_meta = provenance("user-2");
        let foreign = Chunk::source(
            &other_meta,
            Some(1),
            SourceType::Pdf,
            "Foreign text.".into(),
            None,
            "hash-for".into(),
            vec![1.0, 0.0, 0.0],
        );

        Chunk::insert_batch(&[source.clone(), summary, foreign], &db)
            .await
            .expect("insert batch");

        let filter = ChunkFilter {
            user_id: "user-1".into(),
            doc_id: None,
            class_id: Some("class-1".into()),
        };
        let results = Chunk::vector_search(vec![1.0, 0.0, 0.0], &filter, 10, 100, &db)
            .await
            .expect("vector search");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, source.id);
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected_across_runs() {
        let db = setup_db().await;
        let meta = provenance("user-1");

        let original = Chunk::source(
            &meta,
            Some(1),
            SourceType::Pdf,
            "Hello world.".into(),
            None,
            "same-hash".into(),
            vec![1.0, 0.0, 0.0],
        );
        Chunk::insert_batch(&[original], &db)
            .await
            .expect("first insert");

        let duplicate = Chunk::source(
            &meta,
            Some(2),
            SourceType::Pdf,
            "Hello world.".into(),
            None,
            "same-hash".into(),
            vec![1.0, 0.0, 0.0],
        );
        let result = Chunk::insert_batch(&[duplicate], &db).await;
        assert!(result.is_err(), "unique (doc_id, chunk_hash) index should reject");
    }

    #[tokio::test]
    async fn test_find_summary_and_section_ordering() {
        let db = setup_db().await;
        let meta = provenance("user-1");

        let doc_summary = Chunk::document_summary(
            &meta,
            SourceType::Summary,
            "Doc summary.".into(),
            "hash-doc".into(),
            vec![0.5, 0.5, 0.0],
        );
        let second = Chunk::section_summary(
            &meta,
            2,
            6,
            10,
            "Second section.".into(),
            "hash-s2".into(),
            vec![0.5, 0.5, 0.0],
        );
        let first = Chunk::section_summary(
            &meta,
            1,
            1,
            5,
            "First section.".into(),
            "hash-s1".into(),
            vec![0.5, 0.5, 0.0],
        );

        Chunk::insert_batch(&[doc_summary.clone(), second, first], &db)
            .await
            .expect("insert batch");

        let found = Chunk::find_summary("user-1", SummaryScope::Doc("doc-1"), &db)
            .await
            .expect("find summary")
            .expect("summary present");
        assert_eq!(found.id, doc_summary.id);

        let sections = Chunk::find_section_summaries("user-1", "doc-1", &db)
            .await
            .expect("find sections");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section_index, Some(1));
        assert_eq!(sections[1].section_index, Some(2));

        let class_summaries = Chunk::fetch_class_summaries("user-1", "class-1", &db)
            .await
            .expect("class summaries");
        assert_eq!(class_summaries.len(), 1);
        assert_eq!(class_summaries[0].id, doc_summary.id);
    }

    #[tokio::test]
    async fn test_fetch_doc_chunks_ordered_by_page() {
        let db = setup_db().await;
        let meta = provenance("user-1");

        let page_two = Chunk::source(
            &meta,
            Some(2),
            SourceType::Pdf,
            "Page two.".into(),
            None,
            "hash-2".into(),
            vec![0.0, 1.0, 0.0],
        );
        let page_one = Chunk::source(
            &meta,
            Some(1),
            SourceType::Pdf,
            "Page one.".into(),
            Some("Original page one.".into()),
            "hash-1".into(),
            vec![1.0, 0.0, 0.0],
        );

        Chunk::insert_batch(&[page_two, page_one.clone()], &db)
            .await
            .expect("insert batch");

        let chunks = Chunk::fetch_doc_chunks("user-1", "doc-1", &db)
            .await
            .expect("fetch doc chunks");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_number, Some(1));
        assert_eq!(chunks[0].summarization_text(), "Original page one.");
        assert_eq!(chunks[1].summarization_text(), "Page two.");
    }
}
