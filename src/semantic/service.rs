//! Semantic search service: keeps the vector index in step with the bookmark
//! store and answers similarity queries.
//!
//! Locking discipline:
//! - text extraction and embedding run without the store lock
//! - every read or write of the index/map pair holds the lock
//! - a mutation is persisted before its lock is released, so the files on
//!   disk always match a state that was observed in memory

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::bookmarks::Bookmark;
use crate::config::{Config, SemanticSearchConfig};
use crate::semantic::embeddings::{build_embedder, Embedder, EmbeddingError};
use crate::semantic::extract::{self, FileKind};
use crate::semantic::index::IndexError;
use crate::semantic::preprocess::{content_hash, searchable_text};
use crate::semantic::storage::{VectorStorage, VectorStorageError};
use crate::semantic::store::{LoadOutcome, SearchHit, StoreStats, VectorIndexStore};
use crate::semantic::tagging::AutoTagger;
use crate::storage::{self, StorageManager};

/// Texts embedded per batch during a rebuild
const REBUILD_BATCH_SIZE: usize = 64;

/// Errors that can occur during semantic search operations.
#[derive(Debug, thiserror::Error)]
pub enum SemanticSearchError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Vector index must be rebuilt, run `smartmarks reindex`")]
    RebuildRequired,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result of indexing one saved bookmark.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    /// Embedded and stored, with any labels the auto tagger suggests
    Indexed { suggested_tags: Vec<String> },
    /// Searchable text did not change since it was last indexed
    Unchanged,
    /// No searchable text; any previous vector was removed
    Skipped,
    /// A newer save or delete of the same bookmark got there first
    Superseded,
}

pub struct SemanticSearchService {
    config: SemanticSearchConfig,
    embedder: Box<dyn Embedder>,
    store: Mutex<VectorIndexStore>,
    files: Arc<dyn StorageManager>,
    tagger: Option<AutoTagger>,
    tickets: AtomicU64,
}

impl SemanticSearchService {
    /// Load the configured model and the persisted index of `config`.
    pub fn new(
        config: &Config,
        files: Arc<dyn StorageManager>,
    ) -> Result<(Self, LoadOutcome), SemanticSearchError> {
        let sem = config.semantic_search.clone();
        log::info!("initializing semantic search with model '{}'", sem.model);

        let embedder = build_embedder(&sem, config.base_path())?;
        let storage = VectorStorage::new(config.index_path(), config.map_path());

        Ok(Self::with_embedder(sem, embedder, storage, files))
    }

    pub fn with_embedder(
        config: SemanticSearchConfig,
        embedder: Box<dyn Embedder>,
        storage: VectorStorage,
        files: Arc<dyn StorageManager>,
    ) -> (Self, LoadOutcome) {
        let (store, outcome) = VectorIndexStore::open(
            storage,
            embedder.model_id(),
            embedder.dimensions(),
            config.compact_ratio,
        );

        let tagger = config.auto_tag.enabled.then(|| {
            AutoTagger::new(config.auto_tag.labels.clone(), config.auto_tag.threshold)
        });

        let service = Self {
            config,
            embedder,
            store: Mutex::new(store),
            files,
            tagger,
            tickets: AtomicU64::new(0),
        };

        (service, outcome)
    }

    pub fn default_limit(&self) -> usize {
        self.config.default_limit
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, VectorIndexStore>, SemanticSearchError> {
        self.store
            .lock()
            .map_err(|e| SemanticSearchError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Text the bookmark is embedded from: title, description, attachment
    /// text and optionally the page behind its url.
    pub fn searchable_text(&self, bookmark: &Bookmark) -> Option<String> {
        let mut extracted: Vec<String> = bookmark
            .files
            .iter()
            .filter_map(|ident| match self.files.read(ident) {
                Ok(bytes) => {
                    let kind = FileKind::detect(storage::attachment_name(ident), &bytes);
                    Some(extract::extract_text(kind, &bytes))
                }
                Err(err) => {
                    log::warn!("bookmark {}: cannot read attachment {ident}: {err}", bookmark.id);
                    None
                }
            })
            .collect();

        if self.config.fetch_url_text {
            if let Some(url) = bookmark.url.as_deref().filter(|url| !url.is_empty()) {
                extracted.push(extract::fetch_url_text(url));
            }
        }

        searchable_text(
            &bookmark.title,
            &bookmark.description,
            &extracted,
            self.config.max_content_chars,
        )
    }

    /// Bring the index in line with a created or edited bookmark.
    pub fn on_bookmark_saved(
        &self,
        bookmark: &Bookmark,
    ) -> Result<IndexOutcome, SemanticSearchError> {
        let ticket = self.next_ticket();

        let Some(text) = self.searchable_text(bookmark) else {
            let mut store = self.lock_store()?;
            if !store.admit(bookmark.id, ticket) {
                return Ok(IndexOutcome::Superseded);
            }
            if store.remove(bookmark.id) {
                log::debug!("bookmark {} has no searchable text, removed", bookmark.id);
                store.persist()?;
            }
            return Ok(IndexOutcome::Skipped);
        };

        let hash = content_hash(&text);
        if self.lock_store()?.content_hash(bookmark.id) == Some(hash) {
            return Ok(IndexOutcome::Unchanged);
        }

        let vector = self.embedder.embed(&text)?;

        {
            let mut store = self.lock_store()?;
            if !store.admit(bookmark.id, ticket) {
                log::debug!("bookmark {}: dropping stale index update", bookmark.id);
                return Ok(IndexOutcome::Superseded);
            }
            store.upsert(bookmark.id, hash, &vector)?;
            store.persist()?;
        }

        let suggested_tags = match &self.tagger {
            Some(tagger) => tagger
                .suggest(self.embedder.as_ref(), &vector)
                .unwrap_or_else(|err| {
                    log::warn!("auto tagging failed: {err}");
                    vec![]
                }),
            None => vec![],
        };

        Ok(IndexOutcome::Indexed { suggested_tags })
    }

    /// Remove a deleted bookmark from the index. Returns whether it was indexed.
    pub fn on_bookmark_deleted(&self, id: u64) -> Result<bool, SemanticSearchError> {
        let ticket = self.next_ticket();

        let mut store = self.lock_store()?;
        if !store.admit(id, ticket) {
            return Ok(false);
        }

        let removed = store.remove(id);
        if removed {
            store.persist()?;
        }
        Ok(removed)
    }

    /// Up to `k` bookmark ids closest to `text`, best first.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, SemanticSearchError> {
        if text.trim().is_empty() || k == 0 {
            return Ok(vec![]);
        }

        if self.lock_store()?.needs_rebuild() {
            return Err(SemanticSearchError::RebuildRequired);
        }

        let vector = self.embedder.embed(text)?;

        let store = self.lock_store()?;
        if store.needs_rebuild() {
            return Err(SemanticSearchError::RebuildRequired);
        }
        let mut hits = store.search(&vector, k)?;
        drop(store);

        if let Some(max_distance) = self.config.max_distance {
            hits.retain(|hit| hit.distance <= max_distance);
        }

        Ok(hits)
    }

    /// Re-embed every bookmark and replace the index with the result.
    ///
    /// Saves and deletes that land while the embeddings are computed win over
    /// the rebuilt entries. Returns the number of indexed bookmarks.
    pub fn rebuild(
        &self,
        bookmarks: &[Bookmark],
        show_progress: bool,
    ) -> Result<usize, SemanticSearchError> {
        let ticket = self.next_ticket();

        let progress = if show_progress {
            let bar = ProgressBar::new(bookmarks.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner} {msg} [{bar:30}] {pos}/{len} ({eta})")
                    .map_err(|e| SemanticSearchError::Internal(e.to_string()))?,
            );
            bar.set_message("Indexing bookmarks");
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::hidden()
        };

        let texts: Vec<(u64, String)> = bookmarks
            .par_iter()
            .filter_map(|bookmark| {
                self.searchable_text(bookmark)
                    .map(|text| (bookmark.id, text))
            })
            .collect();

        progress.inc((bookmarks.len() - texts.len()) as u64);

        let mut entries = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(REBUILD_BATCH_SIZE) {
            let batch: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
            let vectors = self.embedder.embed_batch(&batch)?;

            for ((id, text), vector) in chunk.iter().zip(vectors) {
                entries.push((*id, content_hash(text), vector));
            }
            progress.inc(chunk.len() as u64);
        }

        let count = {
            let mut store = self.lock_store()?;
            store.rebuild(entries, ticket)?;
            store.persist()?;
            store.stats().live
        };

        progress.finish_with_message(format!("Indexed {count} bookmarks"));
        Ok(count)
    }

    /// Write pending changes to disk.
    pub fn flush(&self) -> Result<(), SemanticSearchError> {
        self.lock_store()?.persist()?;
        Ok(())
    }

    pub fn needs_rebuild(&self) -> bool {
        self.lock_store()
            .map(|store| store.needs_rebuild())
            .unwrap_or(true)
    }

    pub fn stats(&self) -> Result<StoreStats, SemanticSearchError> {
        Ok(self.lock_store()?.stats())
    }

    /// Ids of the bookmarks that currently have a vector.
    pub fn indexed_ids(&self) -> Result<Vec<u64>, SemanticSearchError> {
        Ok(self.lock_store()?.live_ids())
    }

    pub fn model_name(&self) -> &str {
        self.embedder.name()
    }
}
