//! Maximal Marginal Relevance rerank over the retained candidate set.

/// Relevance/diversity trade-off; 0.7 favors query relevance.
pub const MMR_LAMBDA: f32 = 0.7;

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Select an ordering of all candidates by MMR: seed with the highest query
/// similarity, then repeatedly take the candidate maximizing
/// `λ·sim(q, d) − (1−λ)·max_{s∈selected} sim(d, s)`. Ties break by
/// insertion order. Returns candidate indexes in selection order.
pub fn mmr_order(query_vec: &[f32], doc_vecs: &[Vec<f32>], lambda: f32) -> Vec<usize> {
    if doc_vecs.is_empty() {
        return Vec::new();
    }

    let query = normalize(query_vec);
    let docs: Vec<Vec<f32>> = doc_vecs.iter().map(|v| normalize(v)).collect();
    let query_sims: Vec<f32> = docs.iter().map(|d| cosine(&query, d)).collect();

    let mut rest: Vec<usize> = (0..docs.len()).collect();
    let mut selected: Vec<usize> = Vec::with_capacity(docs.len());

    // Seed with the best query similarity; strict comparison keeps the
    // first-returned candidate on ties.
    let mut seed_position = 0;
    for (position, candidate) in rest.iter().enumerate() {
        if query_sims[*candidate] > query_sims[rest[seed_position]] {
            seed_position = position;
        }
    }
    selected.push(rest.remove(seed_position));

    while !rest.is_empty() {
        let mut best_position = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (position, candidate) in rest.iter().enumerate() {
            let sim_q = query_sims[*candidate];
            let sim_selected = selected
                .iter()
                .map(|s| cosine(&docs[*candidate], &docs[*s]))
                .fold(f32::NEG_INFINITY, f32::max);
            let score = lambda * sim_q - (1.0 - lambda) * sim_selected;
            if score > best_score {
                best_score = score;
                best_position = position;
            }
        }
        selected.push(rest.remove(best_position));
    }

    selected
}
