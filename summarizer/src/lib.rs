#![allow(clippy::missing_docs_in_private_items)]

pub mod prompts;

use std::{sync::Arc, time::Duration};

use async_openai::types::{
    ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::{Chunk, ChunkProvenance, SourceType, SummaryScope},
            document_record::{DocumentRecord, SummaryStatus},
        },
    },
    utils::{
        config::AppConfig,
        embedding::generate_embedding,
        hashing::chunk_hash,
        rate_ledger::RateLedger,
        tokens::{batch_by_tokens, est_tokens},
    },
};

/// Map-reduce groups chunks into blocks of at most this many characters.
const MAP_REDUCE_BLOCK_CHARS: usize = 8_000;
/// Fallback length when the final reduce step fails.
const REDUCE_FALLBACK_CHARS: usize = 3_000;
/// Hierarchical class summarization batches summaries up to this many tokens.
const CLASS_BATCH_TOKENS: usize = 6_000;
/// How long summarization waits on the token budget.
const RESERVE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SummaryError {
    /// The class input exceeds the hierarchical ceiling; refused without an
    /// LLM call.
    #[error("class input exceeds the hierarchical summarization ceiling")]
    ClassTooLarge,
    #[error(transparent)]
    App(#[from] AppError),
}

/// Outcome of a background document-summary job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryOutcome {
    Ready { method: &'static str },
    NoChunks,
    Failed,
}

/// The two model calls summarization needs, factored out for tests.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    async fn complete(&self, prompt: String) -> Result<String, AppError>;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
}

pub struct OpenAiSummaryModel {
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    ledger: RateLedger,
    chat_model: String,
    temperature: f32,
    max_output_tokens: u32,
    embedding_model: String,
    embedding_dimensions: u32,
}

impl OpenAiSummaryModel {
    pub fn new(
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        ledger: RateLedger,
        config: &AppConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            chat_model: config.route_models.summary.clone(),
            temperature: config.rag_temp_sum,
            max_output_tokens: config.rag_max_tokens_sum,
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
        }
    }
}

#[async_trait]
impl SummaryModel for OpenAiSummaryModel {
    async fn complete(&self, prompt: String) -> Result<String, AppError> {
        let needed = (est_tokens(&prompt) + self.max_output_tokens as usize) as u64;
        if !self.ledger.try_acquire(needed, RESERVE_WAIT).await {
            return Err(AppError::Busy("summary generation".into()));
        }

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .temperature(self.temperature)
            .max_tokens(self.max_output_tokens)
            .messages([ChatCompletionRequestUserMessage::from(prompt).into()])
            .build()?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let needed = est_tokens(text) as u64;
        if !self.ledger.try_acquire(needed, RESERVE_WAIT).await {
            return Err(AppError::Busy("summary embedding".into()));
        }

        generate_embedding(
            &self.client,
            text,
            &self.embedding_model,
            self.embedding_dimensions,
        )
        .await
    }
}

pub struct Summarizer {
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    model: Arc<dyn SummaryModel>,
}

impl Summarizer {
    pub fn new(
        db: Arc<SurrealDbClient>,
        openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        config: AppConfig,
    ) -> Self {
        let ledger = RateLedger::new(Arc::clone(&db), config.tpm_limit);
        let model = Arc::new(OpenAiSummaryModel::new(openai_client, ledger, &config));
        Self::with_model(db, config, model)
    }

    pub fn with_model(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        model: Arc<dyn SummaryModel>,
    ) -> Self {
        Self { db, config, model }
    }

    /// Background job run after ingestion. Fast path combines stored section
    /// summaries; the slow path summarizes the document's chunks, switching
    /// to map-reduce past the single-request ceiling.
    #[tracing::instrument(skip_all, fields(doc_id = %doc_id, user_id = %user_id))]
    pub async fn generate_document_summary(
        &self,
        user_id: &str,
        class_id: &str,
        doc_id: &str,
        file_name: &str,
    ) -> Result<SummaryOutcome, AppError> {
        if let Err(err) =
            DocumentRecord::set_summary_status(doc_id, SummaryStatus::Processing, &self.db).await
        {
            warn!(error = %err, "could not mark summary as processing");
        }

        let sections = Chunk::find_section_summaries(user_id, doc_id, &self.db).await?;

        let (summary_text, method) = if sections.is_empty() {
            let chunks = Chunk::fetch_doc_chunks(user_id, doc_id, &self.db).await?;
            if chunks.is_empty() {
                warn!("no chunks found for document");
                DocumentRecord::set_summary_status(doc_id, SummaryStatus::NoChunks, &self.db)
                    .await?;
                return Ok(SummaryOutcome::NoChunks);
            }

            let texts: Vec<String> = chunks
                .iter()
                .map(|chunk| chunk.summarization_text().to_string())
                .collect();
            let full_text = texts.join("\n\n");

            if est_tokens(&full_text) <= self.config.max_tokens_per_request {
                (
                    self.model
                        .complete(prompts::document_summary(&full_text))
                        .await,
                    "single",
                )
            } else {
                (self.map_reduce(&texts).await, "map_reduce")
            }
        } else {
            let combined: Vec<String> = sections.iter().map(|s| s.text.clone()).collect();
            (
                self.model
                    .complete(prompts::combine_sections(
                        &combined.join(prompts::SUMMARY_SEPARATOR),
                    ))
                    .await,
                "section_combine",
            )
        };

        let summary_text = match summary_text {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                error!("summary generation produced empty output");
                DocumentRecord::set_summary_status(doc_id, SummaryStatus::Failed, &self.db)
                    .await?;
                return Ok(SummaryOutcome::Failed);
            }
            Err(err) => {
                error!(error = %err, "summary generation failed");
                DocumentRecord::set_summary_status(doc_id, SummaryStatus::Failed, &self.db)
                    .await?;
                return Ok(SummaryOutcome::Failed);
            }
        };

        self.persist_summary(
            user_id,
            class_id,
            doc_id,
            file_name,
            SourceType::Summary,
            &summary_text,
        )
        .await?;
        DocumentRecord::set_summary_status(doc_id, SummaryStatus::Ready, &self.db).await?;

        info!(
            method,
            summary_chars = summary_text.len(),
            "document summary stored"
        );

        Ok(SummaryOutcome::Ready { method })
    }

    /// Cached document summary, or inline on-demand generation persisted as
    /// the cache for every later query.
    pub async fn get_summary_with_fallback(
        &self,
        user_id: &str,
        class_id: &str,
        doc_id: &str,
    ) -> Result<Option<Chunk>, AppError> {
        if let Some(cached) =
            Chunk::find_summary(user_id, SummaryScope::Doc(doc_id), &self.db).await?
        {
            return Ok(Some(cached));
        }

        info!(doc_id, "no cached summary, generating on demand");
        self.generate_on_demand(user_id, class_id, doc_id).await
    }

    /// Document summaries for a class, generating up to
    /// `summary_on_demand_max` missing ones inline.
    pub async fn class_summaries_with_fallback(
        &self,
        user_id: &str,
        class_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut summaries = Chunk::fetch_class_summaries(user_id, class_id, &self.db).await?;
        let covered: std::collections::HashSet<String> =
            summaries.iter().map(|s| s.doc_id.clone()).collect();

        let uncovered = self.docs_without_summaries(user_id, class_id, &covered).await?;
        for doc_id in uncovered.into_iter().take(self.config.summary_on_demand_max) {
            match self.generate_on_demand(user_id, class_id, &doc_id).await {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(err) => {
                    warn!(doc_id = %doc_id, error = %err, "on-demand class summary failed")
                }
            }
        }

        Ok(summaries)
    }

    /// Condensed class overview with hierarchical map-reduce for large
    /// classes. Refuses before any LLM call when the input exceeds the
    /// hierarchical ceiling.
    pub async fn class_summary_text(
        &self,
        docs: &[Chunk],
        user_query: &str,
    ) -> Result<String, SummaryError> {
        let combined_tokens: usize = docs.iter().map(|d| est_tokens(&d.text)).sum();

        if combined_tokens > self.config.max_hierarchical_input_tokens {
            return Err(SummaryError::ClassTooLarge);
        }

        let texts: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();

        if combined_tokens > self.config.max_class_summary_tokens
            && self.config.hierarchical_class_summary_enabled
        {
            return Ok(self.hierarchical_class_summary(&texts, user_query).await?);
        }

        let combined = texts.join(prompts::SUMMARY_SEPARATOR);
        if combined_tokens > self.config.max_prompt_tokens {
            return Ok(self
                .model
                .complete(prompts::condense_class(&combined, user_query))
                .await?);
        }

        Ok(combined)
    }

    /// Condensed overview for class-summary mode. Unlike
    /// `class_summary_text`, small classes still go through the condenser so
    /// the user's formatting instructions apply to the final text.
    pub async fn class_overview(
        &self,
        docs: &[Chunk],
        user_query: &str,
    ) -> Result<String, SummaryError> {
        let combined_tokens: usize = docs.iter().map(|d| est_tokens(&d.text)).sum();

        if combined_tokens > self.config.max_hierarchical_input_tokens {
            return Err(SummaryError::ClassTooLarge);
        }

        let texts: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();

        if combined_tokens > self.config.max_class_summary_tokens
            && self.config.hierarchical_class_summary_enabled
        {
            return Ok(self.hierarchical_class_summary(&texts, user_query).await?);
        }

        let combined = texts.join(prompts::SUMMARY_SEPARATOR);
        Ok(self
            .model
            .complete(prompts::condense_class(&combined, user_query))
            .await?)
    }

    /// Re-style a stored summary per the user's implicit instructions.
    pub async fn condense(&self, summary_text: &str, user_query: &str) -> Result<String, AppError> {
        self.model
            .complete(prompts::condense_summary(summary_text, user_query))
            .await
    }

    /// Markdown study guide over already-assembled context.
    pub async fn study_guide(&self, context: &str, user_query: &str) -> Result<String, AppError> {
        let context = if est_tokens(context) > self.config.max_prompt_tokens {
            self.condense(context, user_query).await?
        } else {
            context.to_string()
        };

        self.model
            .complete(prompts::study_guide(&context, user_query))
            .await
    }

    /// Two-level map-reduce over chunk texts: greedy 8000-char blocks, one
    /// summary per block, then a final merge. A failed merge falls back to
    /// the truncated intermediates.
    async fn map_reduce(&self, texts: &[String]) -> Result<String, AppError> {
        let mut blocks: Vec<String> = Vec::new();
        let mut current = String::new();

        for text in texts {
            if !current.is_empty() && current.len() + text.len() > MAP_REDUCE_BLOCK_CHARS {
                blocks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(text);
        }
        if !current.is_empty() {
            blocks.push(current);
        }

        let mut intermediates: Vec<String> = Vec::new();
        for (index, block) in blocks.iter().enumerate() {
            match self.model.complete(prompts::document_summary(block)).await {
                Ok(summary) if !summary.trim().is_empty() => intermediates.push(summary),
                Ok(_) => {}
                Err(err) => {
                    warn!(block = index, error = %err, "block summary failed, skipping");
                }
            }
        }

        if intermediates.is_empty() {
            return Err(AppError::Processing(
                "map-reduce produced no intermediate summaries".into(),
            ));
        }

        let merged = intermediates.join(prompts::SUMMARY_SEPARATOR);
        match self.model.complete(prompts::document_summary(&merged)).await {
            Ok(final_summary) if !final_summary.trim().is_empty() => Ok(final_summary),
            Ok(_) | Err(_) => Ok(truncate_chars(&merged, REDUCE_FALLBACK_CHARS)),
        }
    }

    async fn hierarchical_class_summary(
        &self,
        texts: &[&str],
        user_query: &str,
    ) -> Result<String, AppError> {
        let batches = batch_by_tokens(texts, CLASS_BATCH_TOKENS);
        info!(
            summaries = texts.len(),
            batches = batches.len(),
            "hierarchical class summarization"
        );

        if batches.len() == 1 {
            let combined = texts.join(prompts::SUMMARY_SEPARATOR);
            return self
                .model
                .complete(prompts::condense_class(&combined, user_query))
                .await;
        }

        let mut intermediates: Vec<String> = Vec::new();
        for (index, batch) in batches.iter().enumerate() {
            let batch_text = batch.join(prompts::SUMMARY_SEPARATOR);
            match self.model.complete(prompts::class_batch(&batch_text)).await {
                Ok(summary) => intermediates.push(summary),
                Err(err) => {
                    warn!(batch = index, error = %err, "class batch summary failed, using raw text");
                    intermediates.push(truncate_chars(&batch_text, 2_000));
                }
            }
        }

        let merged = intermediates.join(prompts::SUMMARY_SEPARATOR);
        self.model
            .complete(prompts::condense_class(&merged, user_query))
            .await
    }

    async fn generate_on_demand(
        &self,
        user_id: &str,
        class_id: &str,
        doc_id: &str,
    ) -> Result<Option<Chunk>, AppError> {
        let sections = Chunk::find_section_summaries(user_id, doc_id, &self.db).await?;

        if !sections.is_empty() {
            let file_name = sections
                .first()
                .map(|s| s.file_name.clone())
                .unwrap_or_else(|| "Unknown Document".to_string());
            let combined: Vec<String> = sections.iter().map(|s| s.text.clone()).collect();
            let summary_text = self
                .model
                .complete(prompts::combine_sections(
                    &combined.join(prompts::SUMMARY_SEPARATOR),
                ))
                .await?;

            let chunk = self
                .persist_summary(
                    user_id,
                    class_id,
                    doc_id,
                    &file_name,
                    SourceType::OnDemandSections,
                    &summary_text,
                )
                .await?;
            return Ok(Some(chunk));
        }

        let chunks = Chunk::fetch_doc_chunks(user_id, doc_id, &self.db).await?;
        if chunks.is_empty() {
            warn!(doc_id, "no chunks available for on-demand summary");
            return Ok(None);
        }

        let file_name = chunks
            .first()
            .map(|c| c.file_name.clone())
            .unwrap_or_else(|| "Unknown Document".to_string());
        let texts: Vec<String> = chunks
            .iter()
            .map(|chunk| chunk.summarization_text().to_string())
            .collect();
        let mut full_text = texts.join("\n\n");

        // Inline generation gets a wider window than chat prompts but still
        // needs a cap to finish before the caller's timeout.
        let max_context_tokens = self.config.max_prompt_tokens * 3;
        if est_tokens(&full_text) > max_context_tokens {
            full_text = truncate_chars(&full_text, max_context_tokens * 4);
        }

        let summary_text = self
            .model
            .complete(prompts::document_summary(&full_text))
            .await?;

        let chunk = self
            .persist_summary(
                user_id,
                class_id,
                doc_id,
                &file_name,
                SourceType::OnDemand,
                &summary_text,
            )
            .await?;

        Ok(Some(chunk))
    }

    /// Replace any existing document-level summary so at most one exists in
    /// steady state, then store and return the new summary chunk.
    async fn persist_summary(
        &self,
        user_id: &str,
        class_id: &str,
        doc_id: &str,
        file_name: &str,
        source_type: SourceType,
        summary_text: &str,
    ) -> Result<Chunk, AppError> {
        let embedding = self.model.embed(summary_text).await?;

        self.db
            .query(
                "DELETE chunk WHERE user_id = $user_id AND doc_id = $doc_id \
                 AND is_summary = true \
                 AND (summary_type IS NONE OR summary_type != 'section');",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?;

        let provenance = ChunkProvenance {
            user_id: user_id.to_string(),
            class_id: class_id.to_string(),
            doc_id: doc_id.to_string(),
            file_name: file_name.to_string(),
            title: file_name.to_string(),
            author: "Unknown".to_string(),
        };
        let chunk = Chunk::document_summary(
            &provenance,
            source_type,
            summary_text.to_string(),
            chunk_hash(summary_text),
            embedding,
        );

        self.db.store_item(chunk.clone()).await?;

        Ok(chunk)
    }

    async fn docs_without_summaries(
        &self,
        user_id: &str,
        class_id: &str,
        covered: &std::collections::HashSet<String>,
    ) -> Result<Vec<String>, AppError> {
        #[derive(serde::Deserialize)]
        struct Row {
            doc_id: String,
        }

        let mut response = self
            .db
            .query(
                "SELECT doc_id FROM chunk \
                 WHERE user_id = $user_id AND class_id = $class_id AND is_summary = false;",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("class_id", class_id.to_owned()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        let mut seen = std::collections::HashSet::new();
        let mut uncovered = Vec::new();
        for row in rows {
            if covered.contains(&row.doc_id) || !seen.insert(row.doc_id.clone()) {
                continue;
            }
            uncovered.push(row.doc_id);
        }

        Ok(uncovered)
    }
}

/// Truncate on a char boundary without splitting a code point.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
