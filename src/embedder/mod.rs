//! Embedding seam. The store only keeps the handle an embedder returns, never the
//! raw vector.
pub mod mock;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("input rejected: {0}")]
    InvalidInput(String),
}

impl From<EmbedderError> for crate::error::StoreError {
    fn from(e: EmbedderError) -> Self {
        crate::error::StoreError::Embedding(e.to_string())
    }
}

/// Where an embedded chunk's vector lives in the external vector store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingHandle {
    pub vector_id: String,
    pub model: String,
    pub dim: usize,
}

/// All implementations must be `Send + Sync` so a worker can hold them behind `Arc`.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<EmbeddingHandle, EmbedderError>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<EmbeddingHandle>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}
