use async_openai::types::CreateEmbeddingRequestArgs;
use tracing::debug;

use crate::error::AppError;

/// Generate an embedding vector for a single input text.
pub async fn generate_embedding(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    input: &str,
    model: &str,
    dimensions: u32,
) -> Result<Vec<f32>, AppError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .dimensions(dimensions)
        .input([input])
        .build()?;

    let response = client.embeddings().create(request).await?;

    let embedding: Vec<f32> = response
        .data
        .first()
        .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))?
        .embedding
        .clone();

    Ok(embedding)
}

/// Generate embeddings for a batch of texts in one request, preserving input
/// order. The embeddings endpoint may return entries out of order, so the
/// response is reordered by index.
pub async fn generate_embeddings(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    inputs: &[String],
    model: &str,
    dimensions: u32,
) -> Result<Vec<Vec<f32>>, AppError> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .dimensions(dimensions)
        .input(inputs.to_vec())
        .build()?;

    let response = client.embeddings().create(request).await?;

    if response.data.len() != inputs.len() {
        return Err(AppError::LLMParsing(format!(
            "Expected {} embeddings, received {}",
            inputs.len(),
            response.data.len()
        )));
    }

    let mut ordered: Vec<Vec<f32>> = vec![Vec::new(); inputs.len()];
    for entry in response.data {
        let index = entry.index as usize;
        let slot = ordered
            .get_mut(index)
            .ok_or_else(|| AppError::LLMParsing(format!("Embedding index {index} out of range")))?;
        *slot = entry.embedding;
    }

    debug!(count = ordered.len(), "generated embedding batch");

    Ok(ordered)
}
