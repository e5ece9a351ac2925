use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

/// Default semantic search model
const DEFAULT_SEMANTIC_MODEL: &str = "all-MiniLM-L6-v2";
/// Default number of semantic results
const DEFAULT_LIMIT: usize = 10;
/// Characters of combined bookmark text fed to the embedder
const DEFAULT_MAX_CONTENT_CHARS: usize = 2048;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Tombstone share that triggers compaction
const DEFAULT_COMPACT_RATIO: f32 = 0.25;
const DEFAULT_HISTORY_SIZE: usize = 20;
const DEFAULT_AUTO_TAG_THRESHOLD: f32 = 0.45;

/// Configuration for semantic search functionality
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Enable or disable semantic search
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2", or "hashing" for
    /// the offline model-free embedder)
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Number of results returned when the caller gives no limit
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Drop hits farther than this squared L2 distance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<f32>,

    /// Combined text is truncated to this many characters before embedding
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Vector index file, relative to the base directory
    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Identifier map file, relative to the base directory
    #[serde(default = "default_map_file")]
    pub map_file: String,

    /// Compact the index once tombstones exceed this share of it
    #[serde(default = "default_compact_ratio")]
    pub compact_ratio: f32,

    /// Rebuild right away when the index artifacts are missing or inconsistent
    #[serde(default = "default_true")]
    pub rebuild_on_load: bool,

    /// Download bookmark urls and embed their visible text as well
    #[serde(default)]
    pub fetch_url_text: bool,

    #[serde(default)]
    pub auto_tag: AutoTagConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutoTagConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_auto_tag_labels")]
    pub labels: Vec<String>,

    /// Minimum cosine similarity between bookmark and label
    #[serde(default = "default_auto_tag_threshold")]
    pub threshold: f32,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: DEFAULT_SEMANTIC_MODEL.to_string(),
            default_limit: DEFAULT_LIMIT,
            max_distance: None,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            index_file: default_index_file(),
            map_file: default_map_file(),
            compact_ratio: DEFAULT_COMPACT_RATIO,
            rebuild_on_load: true,
            fetch_url_text: false,
            auto_tag: AutoTagConfig::default(),
        }
    }
}

impl Default for AutoTagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            labels: default_auto_tag_labels(),
            threshold: DEFAULT_AUTO_TAG_THRESHOLD,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_semantic_model() -> String {
    DEFAULT_SEMANTIC_MODEL.to_string()
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_max_content_chars() -> usize {
    DEFAULT_MAX_CONTENT_CHARS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_index_file() -> String {
    "vectors.bin".to_string()
}

fn default_map_file() -> String {
    "vector_map.json".to_string()
}

fn default_compact_ratio() -> f32 {
    DEFAULT_COMPACT_RATIO
}

fn default_auto_tag_threshold() -> f32 {
    DEFAULT_AUTO_TAG_THRESHOLD
}

fn default_auto_tag_labels() -> Vec<String> {
    [
        "machine learning",
        "data science",
        "web development",
        "programming",
        "research paper",
        "tutorial",
        "news",
        "cooking",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    /// Number of recent searches kept
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            semantic_search: SemanticSearchConfig::default(),
            history_size: DEFAULT_HISTORY_SIZE,
            base_path: PathBuf::new(),
        }
    }
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let sem = &self.semantic_search;

        if sem.model.trim().is_empty() {
            bail!("semantic_search.model must not be empty");
        }

        if sem.default_limit == 0 {
            bail!("semantic_search.default_limit must be greater than 0");
        }

        if sem.max_content_chars == 0 {
            bail!("semantic_search.max_content_chars must be greater than 0");
        }

        if sem.download_timeout_secs == 0 {
            bail!("semantic_search.download_timeout_secs must be greater than 0");
        }

        if !(sem.compact_ratio > 0.0 && sem.compact_ratio <= 1.0) {
            bail!(
                "semantic_search.compact_ratio must be in (0.0, 1.0], got {}",
                sem.compact_ratio
            );
        }

        if let Some(max_distance) = sem.max_distance {
            if max_distance < 0.0 {
                bail!("semantic_search.max_distance must not be negative, got {max_distance}");
            }
        }

        if sem.index_file == sem.map_file {
            bail!("semantic_search.index_file and map_file must differ");
        }

        if !(-1.0..=1.0).contains(&sem.auto_tag.threshold) {
            bail!(
                "semantic_search.auto_tag.threshold must be between -1.0 and 1.0, got {}",
                sem.auto_tag.threshold
            );
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults first.
    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            log::info!("writing default config to {}", base_path.display());
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index_path(&self) -> PathBuf {
        self.base_path.join(&self.semantic_search.index_file)
    }

    pub fn map_path(&self) -> PathBuf {
        self.base_path.join(&self.semantic_search.map_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_written() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.semantic_search.model, DEFAULT_SEMANTIC_MODEL);
        assert_eq!(config.index_path(), tmp.path().join("vectors.bin"));
        assert_eq!(config.map_path(), tmp.path().join("vector_map.json"));
    }

    #[test]
    fn test_partial_config_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "semantic_search:\n  model: hashing\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.semantic_search.model, "hashing");
        assert_eq!(config.semantic_search.default_limit, DEFAULT_LIMIT);
        assert_eq!(config.history_size, DEFAULT_HISTORY_SIZE);

        // upgraded file now lists every field
        let saved = std::fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("compact_ratio"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "semantic_search:\n  compact_ratio: 0.0\n",
        )
        .unwrap();

        assert!(Config::load_with(tmp.path()).is_err());
    }
}
