//! Retrieval stores
//!
//! Dense-vector retrieval behind one [`VectorStore`] trait: upsert items by
//! id, query the top-k by cosine similarity. [`MemoryVectorStore`] is the
//! in-process variant over an ordered sequence; the `pgvector` feature adds
//! a persistent PostgreSQL variant with identical semantics in [`pg`].
//!
//! A multi-conversation host shares one store under a single-writer policy:
//! queries during generation, upserts only between turns.

#[cfg(feature = "pgvector")]
pub mod pg;

use serde::{Deserialize, Serialize};

use crate::error::{ConversarError, Result};

/// One stored retrieval item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalItem {
    /// Stable identifier; upserting an existing id replaces in place
    pub id: String,
    /// Dense embedding vector of the store's fixed dimension
    pub vector: Vec<f32>,
    /// The text the vector embeds
    pub text: String,
    /// Optional free-form metadata
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl RetrievalItem {
    /// Create an item without metadata
    #[must_use]
    pub fn new(id: impl Into<String>, vector: Vec<f32>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vector,
            text: text.into(),
            metadata: None,
        }
    }

    /// Attach metadata
    #[must_use]
    pub fn with_metadata(
        mut self,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Vector store consumed by the retrieval-augmented orchestrator.
pub trait VectorStore {
    /// Insert the item, or replace the existing item with the same id in
    /// place.
    fn upsert(&mut self, item: RetrievalItem) -> Result<()>;

    /// The `k` most cosine-similar items to `query`, most similar first,
    /// ties broken by insertion order.
    ///
    /// Logically read-only; takes `&mut self` because persistent backends
    /// drive a connection.
    fn top_k(&mut self, query: &[f32], k: usize) -> Result<Vec<(RetrievalItem, f32)>>;
}

/// Normalize to unit length with an epsilon under the root, so a stored
/// zero vector degrades to zeros instead of dividing by zero.
fn unit(v: &[f32]) -> Vec<f32> {
    let norm = (v.iter().map(|x| x * x).sum::<f32>() + 1e-9).sqrt();
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// In-memory vector store over an ordered item sequence.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    items: Vec<RetrievalItem>,
}

impl MemoryVectorStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl VectorStore for MemoryVectorStore {
    fn upsert(&mut self, item: RetrievalItem) -> Result<()> {
        if item.vector.is_empty() {
            return Err(ConversarError::invalid_argument(
                "retrieval item has an empty vector",
            ));
        }
        if let Some(existing) = self.items.first() {
            if existing.vector.len() != item.vector.len() {
                return Err(ConversarError::invalid_argument(format!(
                    "vector dimension {} does not match the store's {}",
                    item.vector.len(),
                    existing.vector.len()
                )));
            }
        }
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(slot) => *slot = item,
            None => self.items.push(item),
        }
        Ok(())
    }

    fn top_k(&mut self, query: &[f32], k: usize) -> Result<Vec<(RetrievalItem, f32)>> {
        if query.iter().all(|&x| x == 0.0) {
            return Err(ConversarError::invalid_argument(
                "cannot rank against a zero query vector",
            ));
        }
        let query_unit = unit(query);
        let mut scored: Vec<(RetrievalItem, f32)> = self
            .items
            .iter()
            .map(|item| {
                let sim = dot(&query_unit, &unit(&item.vector));
                (item.clone(), sim)
            })
            .collect();
        // Stable sort keeps insertion order for equal similarities.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored)
    }
}
