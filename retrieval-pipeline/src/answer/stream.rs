use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use common::storage::types::chat::{ChunkReference, Citation};

use super::respond::QueryResponse;

/// Internal deltas produced by the background generation task.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Token(String),
    Done,
    Error(String),
}

/// Wire events of the SSE stream. `done` is always the final event of a
/// successful stream; errors emit a single `error` event and end.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token {
        content: String,
    },
    Keepalive,
    Done {
        citations: Vec<Citation>,
        #[serde(rename = "chunkReferences")]
        chunk_references: Vec<ChunkReference>,
    },
    Error {
        message: String,
    },
}

/// Payload attached to the terminal `done` event.
#[derive(Debug, Clone)]
pub struct DonePayload {
    pub citations: Vec<Citation>,
    pub chunk_references: Vec<ChunkReference>,
}

/// Every 10th keepalive gets logged so slow generations stay visible
/// without flooding the log.
const KEEPALIVE_LOG_EVERY: u64 = 10;

/// Bridge the generation task's delta channel onto the outbound event
/// stream. A receive timeout of `keepalive_interval` emits a keepalive so
/// upstream routers do not cut an idle connection; tokens are forwarded in
/// emission order and `done` terminates the stream.
pub fn bridge_stream(
    mut rx: mpsc::Receiver<StreamDelta>,
    done: DonePayload,
    keepalive_interval: Duration,
) -> impl Stream<Item = StreamEvent> {
    stream! {
        let mut keepalive_count: u64 = 0;

        loop {
            match tokio::time::timeout(keepalive_interval, rx.recv()).await {
                Ok(Some(StreamDelta::Token(content))) => {
                    yield StreamEvent::Token { content };
                }
                Ok(Some(StreamDelta::Done)) | Ok(None) => {
                    yield StreamEvent::Done {
                        citations: done.citations.clone(),
                        chunk_references: done.chunk_references.clone(),
                    };
                    break;
                }
                Ok(Some(StreamDelta::Error(message))) => {
                    yield StreamEvent::Error { message };
                    break;
                }
                Err(_elapsed) => {
                    keepalive_count += 1;
                    if keepalive_count % KEEPALIVE_LOG_EVERY == 1 {
                        info!(keepalive_count, "still waiting for tokens");
                    }
                    yield StreamEvent::Keepalive;
                }
            }
        }
    }
}

/// Render an already-complete response as a short event stream: terminal
/// statuses become a single error event, answers become one token plus the
/// closing `done`.
pub fn response_to_events(response: QueryResponse) -> Vec<StreamEvent> {
    if response.status.is_some() {
        return vec![StreamEvent::Error {
            message: response.message,
        }];
    }

    vec![
        StreamEvent::Token {
            content: response.message,
        },
        StreamEvent::Done {
            citations: response.citation,
            chunk_references: response.chunk_references,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::respond::ResponseStatus;
    use futures::StreamExt;

    fn done_payload() -> DonePayload {
        DonePayload {
            citations: Vec::new(),
            chunk_references: vec![ChunkReference {
                chunk_id: "c1".into(),
                display_number: 1,
                page_number: Some(2),
            }],
        }
    }

    #[tokio::test]
    async fn forwards_tokens_then_done() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamDelta::Token("Hello".into())).await.expect("send");
        tx.send(StreamDelta::Token(" world".into())).await.expect("send");
        tx.send(StreamDelta::Done).await.expect("send");
        drop(tx);

        let events: Vec<StreamEvent> =
            bridge_stream(rx, done_payload(), Duration::from_secs(1)).collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            StreamEvent::Token {
                content: "Hello".into()
            }
        );
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn emits_keepalives_while_waiting() {
        let (tx, rx) = mpsc::channel(8);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            tx.send(StreamDelta::Token("late".into())).await.expect("send");
            tx.send(StreamDelta::Done).await.expect("send");
        });

        let events: Vec<StreamEvent> =
            bridge_stream(rx, done_payload(), Duration::from_millis(30)).collect().await;
        handle.await.expect("producer");

        assert!(events.iter().any(|e| matches!(e, StreamEvent::Keepalive)));
        let last = events.last().expect("non-empty");
        assert!(matches!(last, StreamEvent::Done { .. }));
        // Keepalives never appear after the terminal event.
        let done_index = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Done { .. }))
            .expect("done present");
        assert_eq!(done_index, events.len() - 1);
    }

    #[tokio::test]
    async fn error_ends_the_stream() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamDelta::Error("model exploded".into()))
            .await
            .expect("send");
        tx.send(StreamDelta::Token("never seen".into())).await.expect("send");
        drop(tx);

        let events: Vec<StreamEvent> =
            bridge_stream(rx, done_payload(), Duration::from_secs(1)).collect().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[test]
    fn token_event_serializes_to_wire_format() {
        let event = StreamEvent::Token {
            content: "hi".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "hi");

        let keepalive = serde_json::to_value(StreamEvent::Keepalive).expect("serialize");
        assert_eq!(keepalive["type"], "keepalive");
    }

    #[test]
    fn terminal_status_becomes_single_error_event() {
        let response =
            QueryResponse::status_only("busy now", ResponseStatus::Busy, Vec::new());
        let events = response_to_events(response);

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[test]
    fn answered_response_streams_token_then_done() {
        let response = QueryResponse::answered(
            "the answer".into(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let events = response_to_events(response);

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Token { .. }));
        assert!(matches!(events[1], StreamEvent::Done { .. }));
    }
}
