use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_retry::Retry;
use tracing::{error, info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            chunk::{Chunk, ChunkProvenance, SourceType},
            document_record::DocumentRecord,
            job::{Job, JobPayload},
        },
    },
    utils::{
        config::AppConfig,
        embedding::generate_embeddings,
        rate_ledger::RateLedger,
        tokens::est_tokens,
    },
};

use crate::{
    chunking::{
        self, contextual_header, fixed_split, split_headings, EmbeddingContext, FIXED_CHUNK_CHARS,
    },
    metrics::IngestMetrics,
    parser::{DocumentFormat, ParsedDocument, SourceUnit},
};

/// Batches queued between the producer side and the single consumer.
const BATCH_QUEUE_DEPTH: usize = 8;
/// Draft lists in flight from the producer pool to the batcher.
const DRAFT_QUEUE_DEPTH: usize = 32;
/// Embedding retry policy: up to 2 retries, 1.5 s apart.
const EMBED_RETRIES: usize = 2;
const EMBED_RETRY_SLEEP: Duration = Duration::from_millis(1_500);
/// How long the consumer waits on the token budget per batch.
const EMBED_RESERVE_WAIT: Duration = Duration::from_secs(10);

/// One chunk awaiting embedding and persistence.
#[derive(Debug, Clone)]
struct ChunkDraft {
    text: String,
    original_text: Option<String>,
    page_number: Option<u32>,
    hash: String,
}

/// External calls the pipeline makes, factored out so tests can stub the
/// embedding service.
#[async_trait]
pub trait IngestServices: Send + Sync {
    async fn acquire_tokens(&self, tokens: u64, max_wait: Duration) -> bool;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;
    async fn split_oversized(&self, text: &str) -> Vec<String>;
}

pub struct DefaultIngestServices {
    openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    ledger: RateLedger,
    embedding_model: String,
    embedding_dimensions: u32,
}

impl DefaultIngestServices {
    pub fn new(
        openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        ledger: RateLedger,
        config: &AppConfig,
    ) -> Self {
        Self {
            openai_client,
            ledger,
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
        }
    }
}

#[async_trait]
impl IngestServices for DefaultIngestServices {
    async fn acquire_tokens(&self, tokens: u64, max_wait: Duration) -> bool {
        self.ledger.try_acquire(tokens, max_wait).await
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        generate_embeddings(
            &self.openai_client,
            &texts,
            &self.embedding_model,
            self.embedding_dimensions,
        )
        .await
    }

    async fn split_oversized(&self, text: &str) -> Vec<String> {
        let ctx = EmbeddingContext {
            client: &self.openai_client,
            model: &self.embedding_model,
            dimensions: self.embedding_dimensions,
            ledger: &self.ledger,
        };
        chunking::split_oversized(text, &ctx).await
    }
}

pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    storage: StorageManager,
    services: Arc<dyn IngestServices>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        config: AppConfig,
        storage: StorageManager,
    ) -> Self {
        let ledger = RateLedger::new(Arc::clone(&db), config.tpm_limit);
        let services = Arc::new(DefaultIngestServices::new(openai_client, ledger, &config));
        Self::with_services(db, config, storage, services)
    }

    pub fn with_services(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        storage: StorageManager,
        services: Arc<dyn IngestServices>,
    ) -> Self {
        Self {
            db,
            config,
            storage,
            services,
        }
    }

    /// Entry point for one ingest job: fetch the blob, parse, run the
    /// producer/consumer pipeline, clear the processing flag and enqueue the
    /// follow-up summary job.
    #[tracing::instrument(skip_all, fields(doc_id = %doc_id, user_id = %user_id))]
    pub async fn run_ingest_job(
        &self,
        user_id: &str,
        class_id: &str,
        s3_key: &str,
        doc_id: &str,
    ) -> Result<IngestMetrics, AppError> {
        let format = DocumentFormat::from_key(s3_key)?;
        let bytes = self.storage.get(s3_key).await?;
        let file_name = s3_key.rsplit('/').next().unwrap_or(s3_key).to_string();

        let parser = format.parser();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&bytes)).await??;

        let provenance = ChunkProvenance {
            user_id: user_id.to_string(),
            class_id: class_id.to_string(),
            doc_id: doc_id.to_string(),
            file_name: file_name.clone(),
            title: parsed.metadata.title.clone(),
            author: parsed.metadata.author.clone(),
        };

        let result = self.run_pipeline(parsed, format, provenance).await;

        // Cleared on completion whether the run was full or partial.
        if let Err(err) = DocumentRecord::set_processing(doc_id, false, &self.db).await {
            warn!(error = %err, "failed to clear is_processing");
        }

        let metrics = result?;
        metrics.emit(doc_id);

        Job::enqueue(
            JobPayload::Summary {
                user_id: user_id.to_string(),
                class_id: class_id.to_string(),
                doc_id: doc_id.to_string(),
                file_name,
            },
            user_id.to_string(),
            &self.db,
        )
        .await?;

        Ok(metrics)
    }

    /// Producer pool → bounded batch queue → single consumer. The consumer
    /// exits when the batch channel closes behind the final flush, and the
    /// orchestrator joins it before reporting completion.
    async fn run_pipeline(
        &self,
        parsed: ParsedDocument,
        format: DocumentFormat,
        provenance: ChunkProvenance,
    ) -> Result<IngestMetrics, AppError> {
        let mut metrics = IngestMetrics::default();
        match format {
            DocumentFormat::Pdf => {
                metrics.pages_total = parsed.stats.units_total;
                metrics.pages_empty = parsed.stats.units_empty;
            }
            DocumentFormat::Docx => {
                metrics.paragraphs_total = parsed.stats.units_total;
            }
        }

        let work: Arc<Mutex<VecDeque<SourceUnit>>> = Arc::new(Mutex::new(
            parsed
                .units
                .into_iter()
                .filter(|unit| !unit.text.trim().is_empty())
                .collect(),
        ));

        let (draft_tx, draft_rx) = mpsc::channel::<Vec<ChunkDraft>>(DRAFT_QUEUE_DEPTH);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<ChunkDraft>>(BATCH_QUEUE_DEPTH);

        let worker_count = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4);

        let mut producers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let work = Arc::clone(&work);
            let draft_tx = draft_tx.clone();
            let services = Arc::clone(&self.services);
            let file_name = provenance.file_name.clone();
            let headers_enabled = self.config.contextual_headers_enabled;

            producers.push(tokio::spawn(async move {
                loop {
                    let unit = {
                        let mut queue = work.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        queue.pop_front()
                    };
                    let Some(unit) = unit else { break };

                    let drafts = produce_drafts(
                        &unit,
                        format,
                        &file_name,
                        headers_enabled,
                        services.as_ref(),
                    )
                    .await;
                    if !drafts.is_empty() && draft_tx.send(drafts).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(draft_tx);

        let batch_chars = self.config.batch_chars;
        let batcher = tokio::spawn(batch_drafts(draft_rx, batch_tx, batch_chars));

        let consumer = {
            let db = Arc::clone(&self.db);
            let services = Arc::clone(&self.services);
            let provenance = provenance.clone();
            let source_type = match format {
                DocumentFormat::Pdf => SourceType::Pdf,
                DocumentFormat::Docx => SourceType::Docx,
            };
            tokio::spawn(consume_batches(
                batch_rx, db, services, provenance, source_type,
            ))
        };

        for producer in producers {
            producer.await?;
        }
        batcher.await?;
        let consumer_metrics = consumer.await?;

        metrics.chunks_produced = consumer_metrics.chunks_produced;
        metrics.chunks_inserted = consumer_metrics.chunks_inserted;
        metrics.duplicates_skipped = consumer_metrics.duplicates_skipped;
        metrics.embed_batches = consumer_metrics.embed_batches;
        metrics.embed_latency_ms_total = consumer_metrics.embed_latency_ms_total;
        metrics.insert_retries_total = consumer_metrics.insert_retries_total;
        metrics.total_chars = consumer_metrics.total_chars;
        metrics.max_chunk_chars = consumer_metrics.max_chunk_chars;

        Ok(metrics)
    }
}

/// Chunk one source unit according to the format's chunking policy.
async fn produce_drafts(
    unit: &SourceUnit,
    format: DocumentFormat,
    file_name: &str,
    headers_enabled: bool,
    services: &dyn IngestServices,
) -> Vec<ChunkDraft> {
    let pieces: Vec<String> = match format {
        DocumentFormat::Pdf => {
            let sections = split_headings(&unit.text);
            let sections = if sections.is_empty() {
                fixed_split(&unit.text)
            } else {
                sections
            };

            let mut pieces = Vec::with_capacity(sections.len());
            for section in sections {
                pieces.extend(services.split_oversized(&section).await);
            }
            pieces
        }
        DocumentFormat::Docx => {
            if unit.text.len() > FIXED_CHUNK_CHARS {
                fixed_split(&unit.text)
            } else {
                vec![unit.text.clone()]
            }
        }
    };

    let unit_label = match format {
        DocumentFormat::Pdf => format!("page {}", unit.number),
        DocumentFormat::Docx => format!("paragraph {}", unit.number),
    };

    pieces
        .into_iter()
        .filter(|piece| !piece.trim().is_empty())
        .map(|piece| {
            let hash = chunking::chunk_hash(&piece);
            if headers_enabled {
                ChunkDraft {
                    text: contextual_header(file_name, &unit_label, &piece),
                    original_text: Some(piece),
                    page_number: Some(unit.number),
                    hash,
                }
            } else {
                ChunkDraft {
                    text: piece,
                    original_text: None,
                    page_number: Some(unit.number),
                    hash,
                }
            }
        })
        .collect()
}

/// Accumulate drafts into batches of roughly `batch_chars` characters and
/// push them onto the bounded batch queue. Dropping the sender after the
/// final flush is the consumer's termination sentinel.
async fn batch_drafts(
    mut draft_rx: mpsc::Receiver<Vec<ChunkDraft>>,
    batch_tx: mpsc::Sender<Vec<ChunkDraft>>,
    batch_chars: usize,
) {
    let mut batch: Vec<ChunkDraft> = Vec::new();
    let mut batch_len = 0usize;

    while let Some(drafts) = draft_rx.recv().await {
        for draft in drafts {
            batch_len += draft.text.len();
            batch.push(draft);
            if batch_len >= batch_chars {
                if batch_tx.send(std::mem::take(&mut batch)).await.is_err() {
                    return;
                }
                batch_len = 0;
            }
        }
    }

    if !batch.is_empty() {
        let _ = batch_tx.send(batch).await;
    }
}

/// The single consumer: reserve budget, embed, dedup and persist each batch.
/// A failed batch is dropped with an error log; the ingest carries on.
async fn consume_batches(
    mut batch_rx: mpsc::Receiver<Vec<ChunkDraft>>,
    db: Arc<SurrealDbClient>,
    services: Arc<dyn IngestServices>,
    provenance: ChunkProvenance,
    source_type: SourceType,
) -> IngestMetrics {
    let mut metrics = IngestMetrics::default();
    let mut seen_hashes: HashSet<String> = HashSet::new();

    while let Some(batch) = batch_rx.recv().await {
        for draft in &batch {
            metrics.observe_chunk(draft.text.len());
        }

        // Intra-run dedup by normalized-text hash, first occurrence wins.
        let mut fresh: Vec<ChunkDraft> = Vec::with_capacity(batch.len());
        for draft in batch {
            if seen_hashes.insert(draft.hash.clone()) {
                fresh.push(draft);
            } else {
                metrics.duplicates_skipped += 1;
            }
        }
        if fresh.is_empty() {
            continue;
        }

        let texts: Vec<String> = fresh.iter().map(|draft| draft.text.clone()).collect();
        let tokens_needed: u64 = texts.iter().map(|t| est_tokens(t) as u64).sum();
        if !services.acquire_tokens(tokens_needed, EMBED_RESERVE_WAIT).await {
            error!(
                chunks = fresh.len(),
                "token budget unavailable, dropping batch"
            );
            continue;
        }

        let embed_started = Instant::now();
        let retry_sleep = std::iter::repeat(EMBED_RETRY_SLEEP).take(EMBED_RETRIES);
        let embeddings = match Retry::spawn(retry_sleep, || {
            services.embed_batch(texts.clone())
        })
        .await
        {
            Ok(embeddings) => embeddings,
            Err(err) => {
                error!(error = %err, chunks = fresh.len(), "embedding failed, dropping batch");
                continue;
            }
        };
        metrics.embed_batches += 1;
        metrics.embed_latency_ms_total +=
            u64::try_from(embed_started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let chunks: Vec<Chunk> = fresh
            .into_iter()
            .zip(embeddings)
            .map(|(draft, embedding)| {
                Chunk::source(
                    &provenance,
                    draft.page_number,
                    source_type,
                    draft.text,
                    draft.original_text,
                    draft.hash,
                    embedding,
                )
            })
            .collect();

        match Chunk::insert_batch(&chunks, &db).await {
            Ok(retries) => {
                metrics.insert_retries_total += retries;
                metrics.chunks_inserted += chunks.len();
            }
            Err(err) => {
                error!(error = %err, chunks = chunks.len(), "insert failed, dropping batch");
            }
        }
    }

    info!(
        chunks_inserted = metrics.chunks_inserted,
        duplicates_skipped = metrics.duplicates_skipped,
        "ingest consumer drained"
    );

    metrics
}
