use sha2::{Digest, Sha256};

use super::{Embedder, EmbedderError, EmbeddingHandle};

/// Deterministic embedder for tests and offline runs: the vector id is derived
/// from the model name and the text, so identical text maps to the same id.
pub struct MockEmbedder {
    pub model: String,
    pub dimensions: usize,
}

impl MockEmbedder {
    #[must_use]
    pub fn new(model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model: model.into(),
            dimensions,
        }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new("mock-embedder", 384)
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<EmbeddingHandle, EmbedderError> {
        if text.trim().is_empty() {
            return Err(EmbedderError::InvalidInput("empty text".into()));
        }
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();

        Ok(EmbeddingHandle {
            vector_id: hex::encode(&digest[..16]),
            model: self.model.clone(),
            dim: self.dimensions,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_embed_deterministic() {
        let embedder = MockEmbedder::default();
        let a = embedder.embed("hello").unwrap();
        let b = embedder.embed("hello").unwrap();
        assert_eq!(a, b, "same input should produce same handle");
        assert_eq!(a.dim, 384);
        assert_eq!(a.vector_id.len(), 32);
    }

    #[test]
    fn test_mock_embed_different_inputs_and_models() {
        let embedder = MockEmbedder::default();
        let a = embedder.embed("hello").unwrap();
        let b = embedder.embed("world").unwrap();
        assert_ne!(a.vector_id, b.vector_id);

        let other = MockEmbedder::new("other-model", 8).embed("hello").unwrap();
        assert_ne!(a.vector_id, other.vector_id);
        assert_eq!(other.model, "other-model");
    }

    #[test]
    fn test_mock_embed_batch_and_empty_input() {
        let embedder = MockEmbedder::new("m", 16);
        let handles = embedder.embed_batch(&["a", "b", "c"]).unwrap();
        assert_eq!(handles.len(), 3);
        assert!(embedder.embed("   ").is_err());
        assert!(embedder.embed_batch(&["a", ""]).is_err());
    }
}
