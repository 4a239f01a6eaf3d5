use serde::{Deserialize, Serialize};

use common::storage::types::chat::{ChatTurn, ChunkReference, Citation, WireChunk};

/// Terminal statuses surfaced in the response envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Busy,
    NoHit,
    NeedsContext,
    ContextTooLarge,
    ClassTooLarge,
    LlmError,
    Error,
}

/// The non-streaming response envelope; also the payload behind the
/// streaming `done` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub message: String,
    pub citation: Vec<Citation>,
    pub chats: Vec<ChatTurn>,
    pub chunks: Vec<WireChunk>,
    #[serde(rename = "chunkReferences")]
    pub chunk_references: Vec<ChunkReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl QueryResponse {
    /// Successful answer with citations and history already appended.
    pub fn answered(
        message: String,
        citation: Vec<Citation>,
        chats: Vec<ChatTurn>,
        chunks: Vec<WireChunk>,
        chunk_references: Vec<ChunkReference>,
    ) -> Self {
        Self {
            message,
            citation,
            chats,
            chunks,
            chunk_references,
            status: None,
            suggestions: None,
            retryable: None,
        }
    }

    /// Terminal status response carrying only a user-facing message.
    pub fn status_only(message: impl Into<String>, status: ResponseStatus, chats: Vec<ChatTurn>) -> Self {
        Self {
            message: message.into(),
            citation: Vec::new(),
            chats,
            chunks: Vec::new(),
            chunk_references: Vec::new(),
            status: Some(status),
            suggestions: None,
            retryable: matches!(status, ResponseStatus::LlmError | ResponseStatus::Error)
                .then_some(true),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = Some(suggestions);
        self
    }
}

/// Canned refinement hints shown when retrieval comes up empty.
pub fn refine_suggestions() -> Vec<String> {
    vec![
        "Ask about a specific key term, e.g. \u{201c}Define entropy in Chapter 2\u{201d}.".to_string(),
        "Refer to a section number, e.g. \u{201c}Summarise Section 3.4\u{201d}.".to_string(),
        "Break the question into a smaller part, e.g. \u{201c}List the main theorems first\u{201d}.".to_string(),
    ]
}

pub fn busy_message() -> &'static str {
    "System is busy processing other requests. Please retry in a few seconds."
}

pub fn no_hit_message() -> &'static str {
    "I couldn't find anything relevant for that question. Make sure you're on the correct \
     class or document and try asking a more specific question."
}

pub fn select_scope_message() -> &'static str {
    "Please select a class or document to summarise."
}

pub fn quote_needs_context_message() -> &'static str {
    "Could you specify what the quote should relate to? For example: \u{201c}a quote about \
     the impact of the industrial revolution on society\u{201d}."
}

pub fn quote_unverified_message() -> &'static str {
    "I couldn't verify any exact quotes in the selected context. Could you narrow the topic \
     or specify a section?"
}

pub fn class_too_large_summary_message() -> &'static str {
    "This class has too many documents or documents that are too large to summarize at once. \
     Please open individual documents to summarize them separately."
}

pub fn class_too_large_guide_message() -> &'static str {
    "This class contains too much content to generate a study guide. Please open individual \
     documents and create study guides for each one separately."
}

pub fn context_too_large_message() -> &'static str {
    "This request is too large for the model's context window. Please shorten the question \
     or narrow the document scope."
}

pub fn llm_error_message() -> &'static str {
    "The model or server is unavailable right now. Please hit **Try again**. If the issue \
     persists, try later or contact support."
}
