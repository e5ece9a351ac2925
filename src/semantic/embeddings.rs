//! Embedding generation.
//!
//! The [`Embedder`] trait is the seam between the search core and whatever
//! produces vectors:
//! - [`FastEmbedder`] wraps a fastembed model, downloaded on first use
//! - [`HashingEmbedder`] is a model-free feature-hashing embedder, used for
//!   offline setups and deterministic tests

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use crate::config::SemanticSearchConfig;

/// Model name selecting [`HashingEmbedder`]
pub const HASHING_MODEL: &str = "hashing";

/// Dimensions of the hashing embedder, same as MiniLM
pub const HASHING_DIMENSIONS: usize = 384;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Turns text into fixed-length vectors.
///
/// Implementations must be deterministic for a fixed model, and must return the
/// zero vector for blank input instead of failing.
pub trait Embedder: Send + Sync {
    /// Model name, as configured
    fn name(&self) -> &str;

    /// Length of every vector this embedder returns
    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// SHA256 of the model name, stamped into persisted indexes.
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Build the embedder selected by `config.model`.
pub fn build_embedder(
    config: &SemanticSearchConfig,
    base_path: &Path,
) -> Result<Box<dyn Embedder>, EmbeddingError> {
    if config.model.eq_ignore_ascii_case(HASHING_MODEL) {
        return Ok(Box::new(HashingEmbedder::new(HASHING_DIMENSIONS)));
    }

    let timeout = Duration::from_secs(config.download_timeout_secs);
    Ok(Box::new(FastEmbedder::new(&config.model, base_path, timeout)?))
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedder {
    /// Load `model_name`, downloading it into `<cache_dir>/models` if needed.
    ///
    /// Fails with `InitFailed` if loading takes longer than `timeout`.
    pub fn new(
        model_name: &str,
        cache_dir: &Path,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!("loading embedding model '{model_name}'");

        // the download cannot be cancelled, a timed out loader thread is left behind
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);
            let _ = tx.send(TextEmbedding::try_new(options));
        });

        let mut model = match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(|e| EmbeddingError::InitFailed(e.to_string()))?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::InitFailed(format!(
                    "model '{model_name}' did not load within {}s",
                    timeout.as_secs()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed("model loader panicked".to_string()))
            }
        };

        let dimensions = Self::detect_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" | "bgelargeenv15q" => {
                Ok(fastembed::EmbeddingModel::BGELargeENV15Q)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: hashing, all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    fn detect_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }

    fn lock_model(&self) -> Result<std::sync::MutexGuard<'_, TextEmbedding>, EmbeddingError> {
        self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })
    }
}

impl Embedder for FastEmbedder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }

        let embeddings = self
            .lock_model()?
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        // blank inputs never reach the model
        let non_blank: Vec<String> = texts
            .iter()
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect();

        let embedded: Vec<Vec<f32>> = if non_blank.is_empty() {
            vec![]
        } else {
            self.lock_model()?
                .embed(non_blank, None)
                .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
        };
        let mut embedded = embedded.into_iter();

        texts
            .iter()
            .map(|text| {
                if text.trim().is_empty() {
                    Ok(vec![0.0; self.dimensions])
                } else {
                    embedded.next().ok_or_else(|| {
                        EmbeddingError::EmbeddingFailed("Model returned too few embeddings".into())
                    })
                }
            })
            .collect()
    }
}

/// Feature-hashing embedder: word tokens and their character trigrams are
/// hashed into buckets, then the vector is L2-normalized.
///
/// Texts sharing words or word fragments land close together. There is no
/// notion of synonyms.
pub struct HashingEmbedder {
    name: String,
    dimensions: usize,
}

/// Weight of a trigram relative to a whole word
const TRIGRAM_WEIGHT: f32 = 0.5;

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            name: if dimensions == HASHING_DIMENSIONS {
                HASHING_MODEL.to_string()
            } else {
                format!("{HASHING_MODEL}-{dimensions}")
            },
            dimensions,
        }
    }

    fn bucket(&self, kind: u8, feature: &str) -> usize {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind]);
        hasher.update(feature.as_bytes());
        hasher.finalize() as usize % self.dimensions
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty());

        for token in tokens {
            vector[self.bucket(b'w', token)] += 1.0;

            let padded: Vec<char> = format!("^{token}$").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                vector[self.bucket(b't', &gram)] += TRIGRAM_WEIGHT;
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|x| *x /= norm);
        }

        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_hashing_is_deterministic() {
        let embedder = HashingEmbedder::new(HASHING_DIMENSIONS);
        let a = embedder.embed("Rust programming guide").unwrap();
        let b = embedder.embed("Rust programming guide").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HASHING_DIMENSIONS);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_hashing_blank_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        assert_eq!(embedder.embed("").unwrap(), vec![0.0; 16]);
        assert_eq!(embedder.embed("  \n\t").unwrap(), vec![0.0; 16]);
    }

    #[test]
    fn test_hashing_shared_words_are_closer() {
        let embedder = HashingEmbedder::new(HASHING_DIMENSIONS);
        let query = embedder.embed("quantum mechanics").unwrap();
        let physics = embedder.embed("quantum physics lecture notes").unwrap();
        let bread = embedder.embed("recipe for sourdough bread").unwrap();

        assert!(cosine(&query, &physics) > cosine(&query, &bread));
    }

    #[test]
    fn test_batch_matches_single() {
        let embedder = HashingEmbedder::new(32);
        let texts = vec!["one".to_string(), String::new(), "two words".to_string()];
        let batch = embedder.embed_batch(&texts).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], embedder.embed("one").unwrap());
        assert_eq!(batch[1], vec![0.0; 32]);
    }

    #[test]
    fn test_model_id_follows_name() {
        let a = HashingEmbedder::new(HASHING_DIMENSIONS);
        let b = HashingEmbedder::new(64);
        assert_eq!(a.model_id(), model_id_hash("hashing"));
        assert_ne!(a.model_id(), b.model_id());
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = FastEmbedder::new("nonexistent-model", temp_dir.path(), Duration::from_secs(1));
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_build_embedder_hashing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = SemanticSearchConfig {
            model: "hashing".to_string(),
            ..Default::default()
        };
        let embedder = build_embedder(&config, temp_dir.path()).unwrap();
        assert_eq!(embedder.dimensions(), HASHING_DIMENSIONS);
    }

    // Requires model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_fastembed_generation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = FastEmbedder::new("all-MiniLM-L6-v2", temp_dir.path(), Duration::from_secs(300))
            .unwrap();
        assert_eq!(model.dimensions(), 384);

        let embedding = model.embed("Hello, world!").unwrap();
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);

        assert_eq!(model.embed("").unwrap(), vec![0.0; 384]);
    }
}
