//! Local embedding backend: a thin wrapper around `fastembed::TextEmbedding`
//! used by the embedding daemon. GPU acceleration
//! and custom quantized ONNX models are out of scope here — the daemon hosts
//! exactly one pretrained model, selected by name from config.

use std::path::PathBuf;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedding error: {0}")]
    Embedding(#[from] anyhow::Error),
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

pub type Result<T> = std::result::Result<T, EmbedderError>;

fn resolve_model(name: &str) -> std::result::Result<(EmbeddingModel, usize), EmbedderError> {
    match name {
        "BAAI/bge-small-en-v1.5" | "BGESmallENV15" | "bge-small-en-v1.5" => {
            Ok((EmbeddingModel::BGESmallENV15, 384))
        }
        "BAAI/bge-base-en-v1.5" | "BGEBaseENV15" | "bge-base-en-v1.5" => {
            Ok((EmbeddingModel::BGEBaseENV15, 768))
        }
        "sentence-transformers/all-MiniLM-L6-v2" | "AllMiniLML6V2" | "all-MiniLM-L6-v2" => {
            Ok((EmbeddingModel::AllMiniLML6V2, 384))
        }
        other => Err(EmbedderError::UnknownModel(other.to_string())),
    }
}

/// Single-model embedder. The underlying ONNX session is not cheaply
/// shareable across concurrent calls, so access is serialized behind an
/// async mutex; inference itself is CPU-bound but fastembed's API is
/// synchronous, so calls should be kept off latency-sensitive paths.
pub struct LocalEmbedder {
    model: AsyncMutex<TextEmbedding>,
    dimension: usize,
    model_name: String,
}

impl LocalEmbedder {
    pub fn load(model_name: &str, cache_dir: &PathBuf) -> Result<Self> {
        let (model, dimension) = resolve_model(model_name)?;
        std::fs::create_dir_all(cache_dir).ok();

        tracing::info!(model = model_name, "loading embedding model");
        let text_embedding = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(EmbedderError::Embedding)?;

        Ok(Self {
            model: AsyncMutex::new(text_embedding),
            dimension,
            model_name: model_name.to_string(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Embeds a batch of texts, preserving input order.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self.model.lock().await;
        model.embed(texts, None).map_err(EmbedderError::Embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_aliases_to_the_same_model() {
        let (_, dim_a) = resolve_model("BAAI/bge-small-en-v1.5").unwrap();
        let (_, dim_b) = resolve_model("bge-small-en-v1.5").unwrap();
        assert_eq!(dim_a, dim_b);
        assert_eq!(dim_a, 384);
    }

    #[test]
    fn unknown_model_name_is_rejected() {
        assert!(resolve_model("not-a-real-model").is_err());
    }
}
