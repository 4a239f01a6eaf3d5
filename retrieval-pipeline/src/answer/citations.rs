use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use common::storage::types::{
    chat::{ChunkReference, Citation, WireChunk},
    chunk::Chunk,
};

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("citation pattern"))
}

/// Renumber `[N]` citations to 1..m in order of first appearance, rewriting
/// both the answer and the chunk list. Cited chunks get their new numbers;
/// chunks never cited keep their old numbers and stay in the full list for
/// debugging. Returns `(answer, all_chunks, cited_chunks)`. Idempotent.
pub fn renumber_citations(
    answer: &str,
    chunks: Vec<WireChunk>,
) -> (String, Vec<WireChunk>, Vec<WireChunk>) {
    let pattern = citation_pattern();

    let valid: HashMap<u32, &WireChunk> =
        chunks.iter().map(|chunk| (chunk.chunk_number, chunk)).collect();

    let mut mapping: HashMap<u32, u32> = HashMap::new();
    let mut first_appearance: Vec<u32> = Vec::new();
    for capture in pattern.captures_iter(answer) {
        let Ok(number) = capture[1].parse::<u32>() else {
            continue;
        };
        if !valid.contains_key(&number) {
            continue;
        }
        if !mapping.contains_key(&number) {
            let next = mapping.len() as u32 + 1;
            mapping.insert(number, next);
            first_appearance.push(number);
        }
    }

    if mapping.is_empty() {
        return (answer.to_string(), chunks, Vec::new());
    }

    let rewritten = pattern.replace_all(answer, |caps: &regex::Captures| {
        let number: u32 = caps[1].parse().unwrap_or(0);
        match mapping.get(&number) {
            Some(new) => format!("[{new}]"),
            None => caps[0].to_string(),
        }
    });

    let cited: Vec<WireChunk> = first_appearance
        .iter()
        .filter_map(|old| {
            valid.get(old).map(|chunk| WireChunk {
                chunk_number: mapping[old],
                ..(*chunk).clone()
            })
        })
        .collect();

    let all: Vec<WireChunk> = chunks
        .iter()
        .map(|chunk| match mapping.get(&chunk.chunk_number) {
            Some(new) => WireChunk {
                chunk_number: *new,
                ..chunk.clone()
            },
            None => chunk.clone(),
        })
        .collect();

    (rewritten.into_owned(), all, cited)
}

/// Compact references matching the emitted display numbers.
pub fn references_for(chunks: &[WireChunk]) -> Vec<ChunkReference> {
    chunks
        .iter()
        .map(|chunk| ChunkReference {
            chunk_id: chunk.id.clone(),
            display_number: chunk.chunk_number,
            page_number: chunk.page_number,
        })
        .collect()
}

/// Unique file citations with proxy download links, first occurrence wins.
pub fn file_citations(chunks: &[&Chunk]) -> Vec<Citation> {
    let mut seen = std::collections::HashSet::new();
    let mut citations = Vec::new();

    for chunk in chunks {
        if !seen.insert(chunk.file_name.clone()) {
            continue;
        }
        let encoded: String = url::form_urlencoded::byte_serialize(chunk.file_name.as_bytes())
            .collect();
        citations.push(Citation {
            href: Some(format!("/api/v1/download?s3_key={encoded}")),
            text: chunk.file_name.clone(),
            doc_id: Some(chunk.doc_id.clone()),
        });
    }

    citations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_chunk(number: u32, id: &str) -> WireChunk {
        WireChunk {
            id: id.to_string(),
            chunk_number: number,
            text: Some(format!("text {id}")),
            page_number: Some(number),
            doc_id: Some("doc-1".to_string()),
        }
    }

    #[test]
    fn renumbers_in_first_appearance_order() {
        let chunks = vec![wire_chunk(2, "b"), wire_chunk(3, "c"), wire_chunk(5, "e")];
        let answer = "Claim one [5]. Claim two [2]. Claim one again [5].";

        let (rewritten, _all, cited) = renumber_citations(answer, chunks);

        assert_eq!(rewritten, "Claim one [1]. Claim two [2]. Claim one again [1].");
        assert_eq!(cited.len(), 2);
        assert_eq!(cited[0].id, "e");
        assert_eq!(cited[0].chunk_number, 1);
        assert_eq!(cited[1].id, "b");
        assert_eq!(cited[1].chunk_number, 2);
    }

    #[test]
    fn uncited_chunks_stay_in_full_list_only() {
        let chunks = vec![wire_chunk(1, "a"), wire_chunk(2, "b")];
        let answer = "Only the second matters [2].";

        let (rewritten, all, cited) = renumber_citations(answer, chunks);

        assert_eq!(rewritten, "Only the second matters [1].");
        assert_eq!(all.len(), 2);
        assert_eq!(cited.len(), 1);
        assert_eq!(cited[0].id, "b");
    }

    #[test]
    fn invalid_numbers_are_left_alone() {
        let chunks = vec![wire_chunk(1, "a")];
        let answer = "Valid [1] and invalid [9].";

        let (rewritten, _all, cited) = renumber_citations(answer, chunks);

        assert_eq!(rewritten, "Valid [1] and invalid [9].");
        assert_eq!(cited.len(), 1);
    }

    #[test]
    fn renumbering_is_idempotent() {
        let chunks = vec![wire_chunk(2, "b"), wire_chunk(3, "c"), wire_chunk(5, "e")];
        let answer = "One [5]. Two [2]. One again [5].";

        let (first_answer, first_all, first_cited) = renumber_citations(answer, chunks);
        let (second_answer, _second_all, second_cited) =
            renumber_citations(&first_answer, first_all.clone());

        assert_eq!(first_answer, second_answer);
        assert_eq!(first_cited, second_cited);
    }

    #[test]
    fn no_citations_returns_answer_untouched() {
        let chunks = vec![wire_chunk(1, "a")];
        let answer = "No references here.";

        let (rewritten, all, cited) = renumber_citations(answer, chunks);

        assert_eq!(rewritten, answer);
        assert_eq!(all.len(), 1);
        assert!(cited.is_empty());
    }

    #[test]
    fn references_match_display_numbers() {
        let chunks = vec![wire_chunk(1, "a"), wire_chunk(2, "b")];
        let refs = references_for(&chunks);

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].chunk_id, "a");
        assert_eq!(refs[0].display_number, 1);
        assert_eq!(refs[1].page_number, Some(2));
    }
}
