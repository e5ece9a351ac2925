//! Label suggestions by embedding similarity.
//!
//! Each configured label is embedded once with the same model as the
//! bookmarks; a bookmark gets every label whose cosine similarity to its vector
//! reaches the threshold.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::semantic::embeddings::{Embedder, EmbeddingError};

pub struct AutoTagger {
    labels: Vec<String>,
    threshold: f32,
    /// Normalized label vectors, computed on first use. Mutex<Option<_>>
    /// because OnceLock::get_or_try_init is unstable.
    label_vectors: Mutex<Option<Vec<Vec<f32>>>>,
}

impl AutoTagger {
    pub fn new(labels: Vec<String>, threshold: f32) -> Self {
        let mut seen = HashSet::new();
        let labels: Vec<String> = labels
            .into_iter()
            .map(|label| label.trim().to_lowercase())
            .filter(|label| !label.is_empty() && seen.insert(label.clone()))
            .collect();

        Self {
            labels,
            threshold,
            label_vectors: Mutex::new(None),
        }
    }

    /// Labels matching `vector`, most similar first.
    pub fn suggest(
        &self,
        embedder: &dyn Embedder,
        vector: &[f32],
    ) -> Result<Vec<String>, EmbeddingError> {
        let Some(vector) = normalized(vector) else {
            return Ok(vec![]);
        };

        let mut guard = self
            .label_vectors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if guard.is_none() {
            let embedded = embedder.embed_batch(&self.labels)?;
            *guard = Some(
                embedded
                    .iter()
                    .map(|v| normalized(v).unwrap_or_default())
                    .collect(),
            );
        }

        let mut scored: Vec<(f32, &String)> = guard
            .iter()
            .flatten()
            .zip(&self.labels)
            .filter(|(label_vector, _)| label_vector.len() == vector.len())
            .map(|(label_vector, label)| (dot(label_vector, &vector), label))
            .filter(|(score, _)| *score >= self.threshold)
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored.into_iter().map(|(_, label)| label.clone()).collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalized(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = dot(vector, vector).sqrt();
    if norm <= f32::EPSILON {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}
