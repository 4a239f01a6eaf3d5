use std::{sync::Arc, time::Duration};

use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::{
    error::AppError,
    storage::types::chat::{ChatRole, ChatTurn},
    utils::{
        config::AppConfig,
        embedding::{generate_embedding, generate_embeddings},
        rate_ledger::RateLedger,
    },
};

use crate::answer::stream::StreamDelta;

/// Depth of the token bridge between the generation task and the SSE loop.
const STREAM_CHANNEL_DEPTH: usize = 256;

/// One chat completion, assembled per route.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub user_message: String,
}

/// External calls the query pipeline makes; factored out so tests can run
/// the full flow without the network.
#[async_trait]
pub trait QueryServices: Send + Sync {
    async fn acquire_tokens(&self, tokens: u64, max_wait: Duration) -> bool;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;
    async fn complete(&self, request: CompletionRequest) -> Result<String, AppError>;
    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamDelta>, AppError>;
    async fn route_tiebreak(&self, query: &str, categories: &str) -> Result<String, AppError>;
}

pub struct OpenAiQueryServices {
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    ledger: RateLedger,
    embedding_model: String,
    embedding_dimensions: u32,
    tiebreak_model: String,
}

impl OpenAiQueryServices {
    pub fn new(
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        ledger: RateLedger,
        config: &AppConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
            tiebreak_model: config.router_tiebreak_model.clone(),
        }
    }

    fn build_messages(
        request: &CompletionRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, AppError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(
            request.history.len() + 2,
        );
        messages.push(
            ChatCompletionRequestSystemMessage::from(request.system_prompt.clone()).into(),
        );
        for turn in &request.history {
            match turn.role {
                ChatRole::User => messages
                    .push(ChatCompletionRequestUserMessage::from(turn.content.clone()).into()),
                ChatRole::Assistant => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.content.clone())
                        .build()?
                        .into(),
                ),
            }
        }
        messages.push(ChatCompletionRequestUserMessage::from(request.user_message.clone()).into());

        Ok(messages)
    }
}

#[async_trait]
impl QueryServices for OpenAiQueryServices {
    async fn acquire_tokens(&self, tokens: u64, max_wait: Duration) -> bool {
        self.ledger.try_acquire(tokens, max_wait).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        generate_embedding(
            &self.client,
            text,
            &self.embedding_model,
            self.embedding_dimensions,
        )
        .await
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        generate_embeddings(
            &self.client,
            &texts,
            &self.embedding_model,
            self.embedding_dimensions,
        )
        .await
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, AppError> {
        let messages = Self::build_messages(&request)?;
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .temperature(request.temperature)
            .max_tokens(request.max_output_tokens)
            .messages(messages)
            .build()?;

        let response = self.client.chat().create(chat_request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamDelta>, AppError> {
        let messages = Self::build_messages(&request)?;
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .temperature(request.temperature)
            .max_tokens(request.max_output_tokens)
            .stream(true)
            .messages(messages)
            .build()?;

        let mut stream = self.client.chat().create_stream(chat_request).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);

        // The generation task runs to completion even if the receiver goes
        // away; reserved tokens correspond to work actually done.
        tokio::spawn(async move {
            let mut forwarding = true;
            while let Some(result) = stream.next().await {
                match result {
                    Ok(response) => {
                        let content = response
                            .choices
                            .first()
                            .and_then(|choice| choice.delta.content.clone())
                            .unwrap_or_default();
                        if content.is_empty() || !forwarding {
                            continue;
                        }
                        if tx.send(StreamDelta::Token(content)).await.is_err() {
                            debug!("stream receiver dropped, draining remaining tokens");
                            forwarding = false;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "chat stream error");
                        let _ = tx.send(StreamDelta::Error(err.to_string())).await;
                        return;
                    }
                }
            }
            let _ = tx.send(StreamDelta::Done).await;
        });

        Ok(rx)
    }

    async fn route_tiebreak(&self, query: &str, categories: &str) -> Result<String, AppError> {
        let system = format!(
            "You are a router. Reply with ONLY the best matching category from the list below. \
             If none fit, reply 'general_qa'.\n\nAllowed categories:\n{categories}\n"
        );

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.tiebreak_model)
            .temperature(0.0)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(query.to_string()).into(),
            ])
            .build()?;

        let response = self.client.chat().create(chat_request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .ok_or(AppError::LLMParsing("Empty router response".into()))
    }
}
