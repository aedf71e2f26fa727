//! Persistent vector store over PostgreSQL + pgvector
//!
//! Same trait, same semantics as the in-memory store, with the vectors in a
//! `document_embeddings` table behind an approximate ivfflat cosine index.
//! The SQL surface is fixed; interoperating implementations reproduce it
//! verbatim.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use pgvector::Vector;
use postgres::{Client, NoTls};

use crate::error::{ConversarError, Result};
use crate::retrieval::{RetrievalItem, VectorStore};

/// Embedding dimensionality of the backing column.
pub const EMBEDDING_DIM: usize = 1024;

/// Enables the vector extension.
pub const CREATE_EXTENSION_SQL: &str = "CREATE EXTENSION IF NOT EXISTS vector";

/// The document table.
pub const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS document_embeddings (
    id serial PRIMARY KEY,
    file_path text NOT NULL UNIQUE,
    file_name text NOT NULL,
    content text NOT NULL,
    embedding vector(1024),
    created_at timestamptz DEFAULT now(),
    updated_at timestamptz DEFAULT now(),
    file_hash text NOT NULL,
    file_size bigint NOT NULL,
    file_extension text,
    tags jsonb
)";

/// Approximate cosine index.
pub const CREATE_INDEX_SQL: &str = "\
CREATE INDEX IF NOT EXISTS document_embeddings_embedding_idx \
ON document_embeddings USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)";

/// Upsert keyed on the unique `file_path`.
pub const UPSERT_SQL: &str = "\
INSERT INTO document_embeddings \
(file_path, file_name, content, embedding, file_hash, file_size, file_extension, tags) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
ON CONFLICT (file_path) DO UPDATE SET \
file_name = EXCLUDED.file_name, content = EXCLUDED.content, \
embedding = EXCLUDED.embedding, file_hash = EXCLUDED.file_hash, \
file_size = EXCLUDED.file_size, file_extension = EXCLUDED.file_extension, \
tags = EXCLUDED.tags, updated_at = now()";

/// Threshold-filtered cosine top-k.
pub const TOP_K_SQL: &str = "\
SELECT file_path, content, tags, embedding, 1 - (embedding <=> $1) AS similarity \
FROM document_embeddings \
WHERE (1 - (embedding <=> $1)) > $2 ORDER BY embedding <=> $1 LIMIT $3";

/// Persistent vector store backed by PostgreSQL.
pub struct PgVectorStore {
    client: Client,
    threshold: f64,
}

impl PgVectorStore {
    /// Connect and ensure the extension, table, and index exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::RuntimeFailure`] with the driver's message
    /// on connection or DDL failure.
    pub fn connect(conn_str: &str) -> Result<Self> {
        let client = Client::connect(conn_str, NoTls)
            .map_err(|e| ConversarError::runtime(e.to_string()))?;
        let mut store = Self {
            client,
            threshold: 0.0,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Minimum similarity a row must exceed to be returned.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = f64::from(threshold);
        self
    }

    fn ensure_schema(&mut self) -> Result<()> {
        for ddl in [CREATE_EXTENSION_SQL, CREATE_TABLE_SQL, CREATE_INDEX_SQL] {
            self.client
                .batch_execute(ddl)
                .map_err(|e| ConversarError::runtime(e.to_string()))?;
        }
        Ok(())
    }
}

/// File-name component of an item id treated as a path.
fn file_name_of(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Extension component, without the dot.
fn extension_of(id: &str) -> Option<&str> {
    let name = file_name_of(id);
    name.rsplit_once('.').map(|(_, ext)| ext).filter(|e| !e.is_empty())
}

/// Stable content hash recorded alongside the row.
fn content_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl VectorStore for PgVectorStore {
    fn upsert(&mut self, item: RetrievalItem) -> Result<()> {
        if item.vector.len() != EMBEDDING_DIM {
            return Err(ConversarError::invalid_argument(format!(
                "embedding has {} dimensions, the column is vector({EMBEDDING_DIM})",
                item.vector.len()
            )));
        }
        let tags = item
            .metadata
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()));
        self.client
            .execute(
                UPSERT_SQL,
                &[
                    &item.id,
                    &file_name_of(&item.id),
                    &item.text,
                    &Vector::from(item.vector.clone()),
                    &content_hash(&item.text),
                    &(item.text.len() as i64),
                    &extension_of(&item.id),
                    &tags,
                ],
            )
            .map_err(|e| ConversarError::runtime(e.to_string()))?;
        Ok(())
    }

    fn top_k(&mut self, query: &[f32], k: usize) -> Result<Vec<(RetrievalItem, f32)>> {
        if query.len() != EMBEDDING_DIM {
            return Err(ConversarError::invalid_argument(format!(
                "query has {} dimensions, the column is vector({EMBEDDING_DIM})",
                query.len()
            )));
        }
        if query.iter().all(|&x| x == 0.0) {
            return Err(ConversarError::invalid_argument(
                "cannot rank against a zero query vector",
            ));
        }
        let rows = self
            .client
            .query(TOP_K_SQL, &[&Vector::from(query.to_vec()), &self.threshold, &(k as i64)])
            .map_err(|e| ConversarError::runtime(e.to_string()))?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("file_path");
            let text: String = row.get("content");
            let tags: Option<serde_json::Value> = row.get("tags");
            let embedding: Vector = row.get("embedding");
            let similarity: f64 = row.get("similarity");

            let mut item = RetrievalItem::new(id, embedding.to_vec(), text);
            if let Some(serde_json::Value::Object(map)) = tags {
                item = item.with_metadata(map);
            }
            hits.push((item, similarity as f32));
        }
        Ok(hits)
    }
}
