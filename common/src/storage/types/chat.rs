#![allow(clippy::module_name_repetitions)]
use serde::{Deserialize, Serialize};

/// Role of one turn in the request-supplied chat history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Compact reference an assistant turn keeps for follow-up rehydration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReference {
    pub chunk_id: String,
    pub display_number: u32,
    pub page_number: Option<u32>,
}

/// One turn of chat history. The history is append-only per request; the
/// last assistant turn's `chunk_references` is the authoritative record for
/// follow-ups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    #[serde(
        rename = "chunkReferences",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub chunk_references: Option<Vec<ChunkReference>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            chunk_references: None,
            suggestions: None,
        }
    }

    pub fn assistant(content: impl Into<String>, references: Vec<ChunkReference>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            chunk_references: Some(references),
            suggestions: None,
        }
    }
}

/// Chunk record on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireChunk {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "chunkNumber")]
    pub chunk_number: u32,
    pub text: Option<String>,
    #[serde(rename = "pageNumber")]
    pub page_number: Option<u32>,
    #[serde(rename = "docId")]
    pub doc_id: Option<String>,
}

/// File-level citation; one entry per distinct file, first occurrence wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub href: Option<String>,
    pub text: String,
    #[serde(rename = "docId")]
    pub doc_id: Option<String>,
}

/// The most recent assistant turn's references, newest first.
pub fn last_assistant_references(history: &[ChatTurn]) -> Option<&[ChunkReference]> {
    history
        .iter()
        .rev()
        .find(|turn| turn.role == ChatRole::Assistant)
        .and_then(|turn| turn.chunk_references.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_references_from_latest_assistant_turn() {
        let history = vec![
            ChatTurn::user("first question"),
            ChatTurn::assistant(
                "first answer",
                vec![ChunkReference {
                    chunk_id: "old".into(),
                    display_number: 1,
                    page_number: None,
                }],
            ),
            ChatTurn::user("second question"),
            ChatTurn::assistant(
                "second answer",
                vec![ChunkReference {
                    chunk_id: "new".into(),
                    display_number: 1,
                    page_number: Some(7),
                }],
            ),
        ];

        let refs = last_assistant_references(&history).expect("references present");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].chunk_id, "new");
        assert_eq!(refs[0].page_number, Some(7));
    }

    #[test]
    fn wire_chunk_uses_compact_field_names() {
        let chunk = WireChunk {
            id: "abc".into(),
            chunk_number: 2,
            text: Some("body".into()),
            page_number: Some(3),
            doc_id: Some("doc".into()),
        };

        let json = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(json["_id"], "abc");
        assert_eq!(json["chunkNumber"], 2);
        assert_eq!(json["pageNumber"], 3);
        assert_eq!(json["docId"], "doc");
    }
}
