use sha1::{Digest, Sha1};

/// Collapse whitespace and lowercase; the canonical form hashed for dedup.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable hash of the normalized text, used by the `(doc_id, chunk_hash)`
/// dedup index.
pub fn chunk_hash(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(normalize_text(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(normalize_text("  Hello\n\n  World "), "hello world");
    }

    #[test]
    fn identical_normalized_text_hashes_identically() {
        assert_eq!(chunk_hash("Hello world."), chunk_hash("  hello   WORLD. "));
        assert_ne!(chunk_hash("Hello world."), chunk_hash("Goodbye world."));
    }
}
