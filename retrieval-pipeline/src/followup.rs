use tracing::warn;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chat::{ChunkReference, WireChunk},
            chunk::Chunk,
        },
    },
};

/// Rehydrate the previous assistant turn's references instead of running a
/// new retrieval. Display and page numbers come from the references; a
/// reference whose chunk has since disappeared keeps its slot with no text.
pub async fn rehydrate_references(
    references: &[ChunkReference],
    db: &SurrealDbClient,
) -> Result<(Vec<WireChunk>, Vec<Chunk>), AppError> {
    let mut wire_chunks = Vec::with_capacity(references.len());
    let mut hydrated = Vec::new();

    for reference in references {
        let chunk = Chunk::find_by_id(&reference.chunk_id, db).await?;
        if chunk.is_none() {
            warn!(chunk_id = %reference.chunk_id, "referenced chunk no longer exists");
        }

        wire_chunks.push(WireChunk {
            id: reference.chunk_id.clone(),
            chunk_number: reference.display_number,
            text: chunk.as_ref().map(|c| c.text.clone()),
            page_number: reference.page_number,
            doc_id: chunk.as_ref().map(|c| c.doc_id.clone()),
        });
        if let Some(chunk) = chunk {
            hydrated.push(chunk);
        }
    }

    Ok((wire_chunks, hydrated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::{ChunkProvenance, SourceType};
    use common::utils::hashing::chunk_hash;
    use uuid::Uuid;

    #[tokio::test]
    async fn rehydrates_preserving_display_and_page_numbers() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized(3).await.expect("build indexes");

        let meta = ChunkProvenance {
            user_id: "user-1".into(),
            class_id: "class-1".into(),
            doc_id: "doc-1".into(),
            file_name: "notes.pdf".into(),
            title: "Notes".into(),
            author: "Unknown".into(),
        };
        let mut chunk = Chunk::source(
            &meta,
            Some(7),
            SourceType::Pdf,
            "Referenced text.".into(),
            None,
            chunk_hash("Referenced text."),
            vec![0.1, 0.2, 0.3],
        );
        chunk.id = "X".to_string();
        Chunk::insert_batch(&[chunk], &db).await.expect("insert");

        let references = vec![ChunkReference {
            chunk_id: "X".into(),
            display_number: 1,
            page_number: Some(7),
        }];

        let (wire, hydrated) = rehydrate_references(&references, &db)
            .await
            .expect("rehydrate");

        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].id, "X");
        assert_eq!(wire[0].chunk_number, 1);
        assert_eq!(wire[0].page_number, Some(7));
        assert_eq!(wire[0].text.as_deref(), Some("Referenced text."));
        assert_eq!(hydrated.len(), 1);
    }

    #[tokio::test]
    async fn missing_chunks_keep_their_reference_slot() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let references = vec![ChunkReference {
            chunk_id: "gone".into(),
            display_number: 2,
            page_number: None,
        }];

        let (wire, hydrated) = rehydrate_references(&references, &db)
            .await
            .expect("rehydrate");

        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].text, None);
        assert!(hydrated.is_empty());
    }
}
