use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::chunk::{Chunk, ChunkFilter},
    },
    utils::tokens::est_tokens,
};

use crate::{
    mmr::{mmr_order, MMR_LAMBDA},
    route_params::RouteParams,
    services::QueryServices,
};

/// How long a query waits on the token budget before going busy.
const QUERY_RESERVE_WAIT: Duration = Duration::from_secs(10);
/// The MMR rerank only waits briefly; on timeout it is skipped.
const MMR_RESERVE_WAIT: Duration = Duration::from_secs(2);

/// A retained chunk in final display order; position + 1 is its display
/// number.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Embed the query, vector-search, dedup by `(doc_id, page_number)` and
/// MMR-rerank the retained set. Returns chunks in display order.
/// `AppError::Busy` signals that the token budget could not be reserved.
pub async fn retrieve_chunks(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    query: &str,
    filter: &ChunkFilter,
    params: &RouteParams,
    reranking_enabled: bool,
) -> Result<Vec<RetrievedChunk>, AppError> {
    let tokens_needed = est_tokens(query) as u64;
    if !services.acquire_tokens(tokens_needed, QUERY_RESERVE_WAIT).await {
        return Err(AppError::Busy("query embedding".into()));
    }

    let query_vec = services.embed(query).await?;

    let raw = Chunk::vector_search(
        query_vec.clone(),
        filter,
        params.k,
        params.num_candidates,
        db,
    )
    .await?;
    let hits_raw = raw.len();

    // First-wins dedup: the highest-scoring chunk per (doc, page) survives.
    let mut seen: HashSet<(String, Option<u32>)> = HashSet::new();
    let mut retained: Vec<RetrievedChunk> = Vec::with_capacity(raw.len());
    for scored in raw {
        let key = (scored.chunk.doc_id.clone(), scored.chunk.page_number);
        if !seen.insert(key) {
            continue;
        }
        retained.push(RetrievedChunk {
            chunk: scored.chunk,
            score: scored.score,
        });
    }

    info!(
        k = params.k,
        candidates = params.num_candidates,
        hits_raw,
        hits_unique = retained.len(),
        "vector retrieval"
    );

    if reranking_enabled && retained.len() > 1 {
        retained = rerank_mmr(services, &query_vec, retained).await;
    }

    Ok(retained)
}

/// Diversify the retained set with MMR. Gated on a short budget
/// reservation for re-embedding the candidate texts; skipped (original
/// order kept) when the budget or the embedding call is unavailable.
async fn rerank_mmr(
    services: &dyn QueryServices,
    query_vec: &[f32],
    retained: Vec<RetrievedChunk>,
) -> Vec<RetrievedChunk> {
    let texts: Vec<String> = retained.iter().map(|r| r.chunk.text.clone()).collect();
    let tokens_needed: u64 = texts.iter().map(|t| est_tokens(t) as u64).sum();

    if !services.acquire_tokens(tokens_needed, MMR_RESERVE_WAIT).await {
        debug!("token budget unavailable, skipping MMR rerank");
        return retained;
    }

    let embeddings = match services.embed_batch(texts).await {
        Ok(embeddings) => embeddings,
        Err(err) => {
            warn!(error = %err, "candidate embedding failed, skipping MMR rerank");
            return retained;
        }
    };

    let order = mmr_order(query_vec, &embeddings, MMR_LAMBDA);
    let mut slots: Vec<Option<RetrievedChunk>> = retained.into_iter().map(Some).collect();

    order
        .into_iter()
        .filter_map(|index| slots.get_mut(index).and_then(Option::take))
        .collect()
}
