use tracing::info;

/// Counters for one ingest run, emitted as a single structured log line.
#[derive(Debug, Default, Clone)]
pub struct IngestMetrics {
    pub pages_total: usize,
    pub pages_empty: usize,
    pub paragraphs_total: usize,
    pub chunks_produced: usize,
    pub chunks_inserted: usize,
    pub duplicates_skipped: usize,
    pub embed_batches: usize,
    pub embed_latency_ms_total: u64,
    pub insert_retries_total: u32,
    pub total_chars: usize,
    pub max_chunk_chars: usize,
}

impl IngestMetrics {
    pub fn observe_chunk(&mut self, chars: usize) {
        self.chunks_produced += 1;
        self.total_chars += chars;
        self.max_chunk_chars = self.max_chunk_chars.max(chars);
    }

    pub fn emit(&self, doc_id: &str) {
        info!(
            target: "ingest",
            doc_id,
            pages_total = self.pages_total,
            pages_empty = self.pages_empty,
            paragraphs_total = self.paragraphs_total,
            chunks_produced = self.chunks_produced,
            chunks_inserted = self.chunks_inserted,
            duplicates_skipped = self.duplicates_skipped,
            embed_batches = self.embed_batches,
            embed_latency_ms_total = self.embed_latency_ms_total,
            insert_retries_total = self.insert_retries_total,
            total_chars = self.total_chars,
            max_chunk_chars = self.max_chunk_chars,
            "ingest finished"
        );
    }
}
