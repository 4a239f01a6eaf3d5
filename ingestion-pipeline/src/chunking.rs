use text_splitter::{ChunkConfig, TextSplitter};
use tracing::warn;

pub use common::utils::hashing::{chunk_hash, normalize_text};
use common::{
    error::AppError,
    utils::{embedding::generate_embeddings, rate_ledger::RateLedger, tokens::est_tokens},
};

/// Canonical fixed-size fallback: 1200 chars with 120 overlap.
pub const FIXED_CHUNK_CHARS: usize = 1_200;
pub const FIXED_CHUNK_OVERLAP: usize = 120;
/// Chunks longer than this go through the semantic splitter.
pub const SEMANTIC_SPLIT_THRESHOLD: usize = 2_000;

/// How long a semantic split is willing to wait on the token budget.
const SEMANTIC_RESERVE_WAIT: std::time::Duration = std::time::Duration::from_secs(10);

/// Split page markdown on its heading hierarchy (levels 1-6). Content before
/// the first heading becomes its own section. Returns an empty vec when the
/// page has no headings, signalling the fixed-size fallback.
pub fn split_headings(markdown: &str) -> Vec<String> {
    if !markdown.lines().any(is_heading_line) {
        return Vec::new();
    }

    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in markdown.lines() {
        if is_heading_line(line) && !current.trim().is_empty() {
            sections.push(current.trim().to_string());
            current = String::new();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current.trim().to_string());
    }

    sections
}

fn is_heading_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed
            .chars()
            .nth(hashes)
            .is_some_and(|c| c == ' ' || c == '\t')
}

/// Fixed-size splitter with overlap; the fallback for heading-less pages and
/// oversized paragraphs.
pub fn fixed_split(text: &str) -> Vec<String> {
    let config = match ChunkConfig::new(FIXED_CHUNK_CHARS).with_overlap(FIXED_CHUNK_OVERLAP) {
        Ok(config) => config,
        Err(err) => {
            // Static sizes; only reachable if the constants are edited badly.
            warn!(error = %err, "invalid fixed chunk config, returning whole text");
            return vec![text.to_string()];
        }
    };
    let splitter = TextSplitter::new(config);

    let chunks: Vec<String> = splitter.chunks(text).map(str::to_owned).collect();
    if chunks.is_empty() {
        vec![text.to_string()]
    } else {
        chunks
    }
}

/// Contextual header prepended to `text` when the feature flag is on;
/// `original_text` keeps the raw body.
pub fn contextual_header(file_name: &str, unit_label: &str, body: &str) -> String {
    format!("{file_name} - {unit_label}\n\n{body}")
}

/// Everything the semantic splitter needs to call the embeddings endpoint.
pub struct EmbeddingContext<'a> {
    pub client: &'a async_openai::Client<async_openai::config::OpenAIConfig>,
    pub model: &'a str,
    pub dimensions: u32,
    pub ledger: &'a RateLedger,
}

/// Split an oversized chunk at semantic breakpoints: embed each sentence,
/// then break where the cosine distance between neighbours is more than one
/// standard deviation above the mean. Falls back to the fixed splitter when
/// the budget cannot be reserved or embedding fails.
pub async fn split_oversized(text: &str, ctx: &EmbeddingContext<'_>) -> Vec<String> {
    if text.len() <= SEMANTIC_SPLIT_THRESHOLD {
        return vec![text.to_string()];
    }

    match semantic_split(text, ctx).await {
        Ok(chunks) => chunks,
        Err(err) => {
            warn!(error = %err, "semantic split unavailable, using fixed splitter");
            fixed_split(text)
        }
    }
}

async fn semantic_split(text: &str, ctx: &EmbeddingContext<'_>) -> Result<Vec<String>, AppError> {
    let sentences = split_sentences(text);
    if sentences.len() < 3 {
        return Ok(fixed_split(text));
    }

    let needed = est_tokens(text) as u64;
    if !ctx.ledger.try_acquire(needed, SEMANTIC_RESERVE_WAIT).await {
        return Err(AppError::Busy(
            "token budget unavailable for semantic split".into(),
        ));
    }

    let embeddings =
        generate_embeddings(ctx.client, &sentences, ctx.model, ctx.dimensions).await?;

    let distances: Vec<f32> = embeddings
        .windows(2)
        .map(|pair| 1.0 - cosine(&pair[0], &pair[1]))
        .collect();
    let breaks = breakpoints(&distances);

    Ok(group_sentences(&sentences, &breaks))
}

/// Break after sentence `i` when `distances[i]` is an outlier
/// (> mean + one standard deviation).
pub(crate) fn breakpoints(distances: &[f32]) -> Vec<usize> {
    if distances.is_empty() {
        return Vec::new();
    }

    let mean = distances.iter().sum::<f32>() / distances.len() as f32;
    let variance = distances
        .iter()
        .map(|d| (d - mean) * (d - mean))
        .sum::<f32>()
        / distances.len() as f32;
    let threshold = mean + variance.sqrt();

    distances
        .iter()
        .enumerate()
        .filter(|(_, distance)| **distance > threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Join sentences into chunks, breaking after each index in `breaks`.
pub(crate) fn group_sentences(sentences: &[String], breaks: &[usize]) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for (i, sentence) in sentences.iter().enumerate() {
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);

        if breaks.contains(&i) {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    sentences
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_heading_hierarchy() {
        let markdown = "intro text\n# Chapter One\nbody one\n## Section\nbody two";
        let sections = split_headings(markdown);

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0], "intro text");
        assert!(sections[1].starts_with("# Chapter One"));
        assert!(sections[2].starts_with("## Section"));
    }

    #[test]
    fn headingless_page_returns_empty() {
        assert!(split_headings("plain text\nwith no headings").is_empty());
        // A hash without a following space is not a heading.
        assert!(split_headings("#hashtag but not a heading").is_empty());
    }

    #[test]
    fn fixed_split_respects_bounds() {
        let text = "word ".repeat(1_000);
        let chunks = fixed_split(&text);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= FIXED_CHUNK_CHARS));
    }

    #[test]
    fn short_text_stays_whole() {
        let chunks = fixed_split("just a short sentence");
        assert_eq!(chunks, vec!["just a short sentence".to_string()]);
    }

    #[test]
    fn contextual_header_preserves_body() {
        let headed = contextual_header("notes.pdf", "page 3", "The body.");
        assert_eq!(headed, "notes.pdf - page 3\n\nThe body.");
    }

    #[test]
    fn breakpoints_flag_outlier_distances() {
        // One clear topic shift among near-identical distances.
        let distances = vec![0.05, 0.04, 0.9, 0.05, 0.06];
        assert_eq!(breakpoints(&distances), vec![2]);

        // Uniform distances produce no breaks.
        assert!(breakpoints(&[0.1, 0.1, 0.1]).is_empty());
    }

    #[test]
    fn groups_sentences_at_breaks() {
        let sentences = vec![
            "One.".to_string(),
            "Two.".to_string(),
            "Three.".to_string(),
            "Four.".to_string(),
        ];
        let chunks = group_sentences(&sentences, &[1]);

        assert_eq!(chunks, vec!["One. Two.".to_string(), "Three. Four.".to_string()]);
    }

    #[test]
    fn sentence_splitting_handles_terminators() {
        let sentences = split_sentences("First one. Second one! Third one? Trailing");
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[3], "Trailing");
    }
}
