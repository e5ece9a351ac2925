//! Application layer: the bookmark store, attachment storage, semantic index
//! and search history behind one set of operations.

pub mod errors;
mod pending;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::bookmarks::{self, Bookmark, BookmarkCreate, BookmarkManager, BookmarkUpdate, SearchQuery};
use crate::config::Config;
use crate::history::{HistoryEntry, SearchHistory};
use crate::semantic::{IndexOutcome, LoadOutcome, SemanticSearchService, StoreStats};
use crate::storage::{self, BackendLocal, StorageManager};

pub use errors::AppError;
use pending::PendingIndex;

const BOOKMARKS_FILE: &str = "bookmarks.csv";
const UPLOADS_DIR: &str = "uploads";

/// A file to attach to a bookmark.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

/// What happened to the semantic index after a bookmark was saved.
///
/// Index failures never undo the save itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum IndexStatus {
    Indexed,
    Unchanged,
    /// A newer change of the same bookmark was indexed instead
    Superseded,
    /// Nothing to embed, the bookmark is not searchable by meaning
    Skipped,
    Unavailable(String),
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticMatch {
    pub bookmark: Bookmark,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStats {
    pub bookmarks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<StoreStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_unavailable: Option<String>,
}

enum Semantic {
    Ready(SemanticSearchService),
    Disabled,
    /// The model could not be loaded
    Unavailable(String),
}

pub struct App {
    bmark_mgr: Arc<dyn BookmarkManager>,
    storage_mgr: Arc<dyn StorageManager>,
    semantic: Semantic,
    history: SearchHistory,
    pending: PendingIndex,
}

impl App {
    /// Open the bookmarks under `config.base_path()`.
    ///
    /// A missing or broken vector index is rebuilt right away when
    /// `rebuild_on_load` is set. A loaded index is brought up to date with
    /// the bookmarks changed while it could not follow.
    pub fn new(config: Config, show_progress: bool) -> anyhow::Result<Self> {
        let base_path = config.base_path().to_path_buf();

        let bmark_mgr: Arc<dyn BookmarkManager> = Arc::new(
            bookmarks::BackendCsv::load(base_path.join(BOOKMARKS_FILE))
                .context("failed to load bookmarks")?,
        );
        let storage_mgr: Arc<dyn StorageManager> =
            Arc::new(BackendLocal::new(base_path.join(UPLOADS_DIR))?);
        let history = SearchHistory::new(BackendLocal::new(&base_path)?, config.history_size);
        let pending = PendingIndex::new(BackendLocal::new(&base_path)?);

        let semantic = if !config.semantic_search.enabled {
            Semantic::Disabled
        } else {
            match SemanticSearchService::new(&config, storage_mgr.clone()) {
                Ok((service, outcome)) => {
                    Self::startup_sync(
                        &service,
                        outcome,
                        &config,
                        &*bmark_mgr,
                        &pending,
                        show_progress,
                    );
                    Semantic::Ready(service)
                }
                Err(err) => {
                    log::error!("semantic search unavailable: {err}");
                    Semantic::Unavailable(err.to_string())
                }
            }
        };

        Ok(Self {
            bmark_mgr,
            storage_mgr,
            semantic,
            history,
            pending,
        })
    }

    fn startup_sync(
        service: &SemanticSearchService,
        outcome: LoadOutcome,
        config: &Config,
        bmark_mgr: &dyn BookmarkManager,
        pending: &PendingIndex,
        show_progress: bool,
    ) {
        let bmarks = match bmark_mgr.all() {
            Ok(bmarks) => bmarks,
            Err(err) => {
                log::error!("failed to read bookmarks for indexing: {err}");
                return;
            }
        };

        let reason = match outcome {
            LoadOutcome::Loaded { .. } => {
                Self::reconcile(service, &bmarks, pending);
                return;
            }
            LoadOutcome::Fresh if bmarks.is_empty() => {
                clear_pending(pending);
                return;
            }
            LoadOutcome::Fresh => "no vector index on disk".to_string(),
            LoadOutcome::RebuildRequired(reason) => reason,
        };

        if !config.semantic_search.rebuild_on_load {
            log::warn!("vector index needs a rebuild ({reason}), run `smartmarks reindex`");
            return;
        }

        log::info!("rebuilding vector index: {reason}");
        match service.rebuild(&bmarks, show_progress) {
            Ok(_) => clear_pending(pending),
            Err(err) => log::error!("failed to rebuild vector index: {err}"),
        }
    }

    /// Replay what a loaded index missed: recorded pending changes, indexed
    /// ids whose bookmark is gone and bookmarks without a vector.
    fn reconcile(service: &SemanticSearchService, bmarks: &[Bookmark], pending: &PendingIndex) {
        let indexed: HashSet<u64> = match service.indexed_ids() {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) => {
                log::error!("failed to read the vector index: {err}");
                return;
            }
        };
        let known: HashMap<u64, &Bookmark> = bmarks.iter().map(|b| (b.id, b)).collect();

        let mut stale = pending.ids();
        stale.extend(indexed.iter().copied().filter(|id| !known.contains_key(id)));
        stale.extend(bmarks.iter().map(|b| b.id).filter(|id| !indexed.contains(id)));
        if stale.is_empty() {
            return;
        }

        log::info!("syncing {} bookmarks with the vector index", stale.len());
        let mut failed = vec![];
        for id in stale {
            let result = match known.get(&id) {
                Some(bmark) => service.on_bookmark_saved(bmark).map(|_| ()),
                None => service.on_bookmark_deleted(id).map(|_| ()),
            };
            if let Err(err) = result {
                log::warn!("bookmark {id}: failed to sync vector index: {err}");
                failed.push(id);
            }
        }

        if failed.is_empty() {
            clear_pending(pending);
        } else {
            for id in failed {
                defer_index(pending, id);
            }
        }
    }

    fn service(&self) -> Result<&SemanticSearchService, AppError> {
        match &self.semantic {
            Semantic::Ready(service) => Ok(service),
            Semantic::Disabled => Err(AppError::SemanticDisabled),
            Semantic::Unavailable(reason) => Err(AppError::SemanticUnavailable(reason.clone())),
        }
    }

    fn get_existing(&self, id: u64) -> Result<Bookmark, AppError> {
        self.bmark_mgr.get(id)?.ok_or(AppError::NotFound(id))
    }

    fn store_attachments(&self, attachments: Vec<Attachment>) -> Result<Vec<String>, AppError> {
        attachments
            .into_iter()
            .map(|attachment| -> Result<String, AppError> {
                let ident = storage::store_attachment(
                    self.storage_mgr.as_ref(),
                    &attachment.name,
                    &attachment.data,
                )?;
                log::debug!("stored attachment {} as {ident}", attachment.name);
                Ok(ident)
            })
            .collect()
    }

    fn delete_attachments(&self, idents: &[String]) {
        for ident in idents {
            if let Err(err) = self.storage_mgr.delete(ident) {
                log::warn!("failed to delete attachment {ident}: {err}");
            }
        }
    }

    /// Index a saved bookmark, merging any suggested tags into it.
    fn index(&self, bmark: Bookmark) -> (Bookmark, IndexStatus) {
        let service = match &self.semantic {
            Semantic::Ready(service) => service,
            Semantic::Disabled => {
                defer_index(&self.pending, bmark.id);
                return (bmark, IndexStatus::Disabled);
            }
            Semantic::Unavailable(reason) => {
                defer_index(&self.pending, bmark.id);
                return (bmark, IndexStatus::Unavailable(reason.clone()));
            }
        };

        match service.on_bookmark_saved(&bmark) {
            Ok(IndexOutcome::Indexed { suggested_tags }) => {
                let new_tags: Vec<String> = suggested_tags
                    .into_iter()
                    .filter(|tag| !bmark.tags.contains(tag))
                    .collect();

                if new_tags.is_empty() {
                    return (bmark, IndexStatus::Indexed);
                }

                log::info!("bookmark {}: adding suggested tags {new_tags:?}", bmark.id);
                let update = BookmarkUpdate {
                    append_tags: Some(new_tags),
                    ..Default::default()
                };
                match self.bmark_mgr.update(bmark.id, update) {
                    Ok(tagged) => (tagged, IndexStatus::Indexed),
                    Err(err) => {
                        log::warn!("bookmark {}: failed to add suggested tags: {err}", bmark.id);
                        (bmark, IndexStatus::Indexed)
                    }
                }
            }
            Ok(IndexOutcome::Unchanged) => (bmark, IndexStatus::Unchanged),
            Ok(IndexOutcome::Superseded) => {
                log::debug!("bookmark {}: a newer change was indexed first", bmark.id);
                (bmark, IndexStatus::Superseded)
            }
            Ok(IndexOutcome::Skipped) => (bmark, IndexStatus::Skipped),
            Err(err) => {
                log::warn!("bookmark {} saved but not indexed: {err}", bmark.id);
                defer_index(&self.pending, bmark.id);
                (bmark, IndexStatus::Unavailable(err.to_string()))
            }
        }
    }

    pub fn create(
        &self,
        mut bmark_create: BookmarkCreate,
        attachments: Vec<Attachment>,
    ) -> Result<(Bookmark, IndexStatus), AppError> {
        let idents = self.store_attachments(attachments)?;
        bmark_create.files.extend(idents.iter().cloned());

        let bmark = match self.bmark_mgr.create(bmark_create) {
            Ok(bmark) => bmark,
            Err(err) => {
                self.delete_attachments(&idents);
                return Err(err.into());
            }
        };

        Ok(self.index(bmark))
    }

    /// Apply an edit. `remove_files` may name attachments by identifier or by
    /// their original file name.
    pub fn update(
        &self,
        id: u64,
        mut bmark_update: BookmarkUpdate,
        attachments: Vec<Attachment>,
    ) -> Result<(Bookmark, IndexStatus), AppError> {
        let current = self.get_existing(id)?;

        let removed: Vec<String> = current
            .files
            .iter()
            .filter(|ident| {
                bmark_update.remove_files.iter().any(|name| {
                    name == *ident || name == storage::attachment_name(ident)
                })
            })
            .cloned()
            .collect();
        bmark_update.remove_files = removed.clone();

        let idents = self.store_attachments(attachments)?;
        bmark_update.add_files.extend(idents.iter().cloned());

        let bmark = match self.bmark_mgr.update(id, bmark_update) {
            Ok(bmark) => bmark,
            Err(err) => {
                self.delete_attachments(&idents);
                return Err(err.into());
            }
        };

        self.delete_attachments(&removed);

        Ok(self.index(bmark))
    }

    /// Delete a bookmark, its attachments and its vector.
    pub fn delete(&self, id: u64) -> Result<Bookmark, AppError> {
        let bmark = self.bmark_mgr.delete(id)?.ok_or(AppError::NotFound(id))?;

        self.delete_attachments(&bmark.files);

        match &self.semantic {
            Semantic::Ready(service) => {
                if let Err(err) = service.on_bookmark_deleted(id) {
                    log::warn!("bookmark {id} deleted but still indexed: {err}");
                    defer_index(&self.pending, id);
                }
            }
            Semantic::Disabled | Semantic::Unavailable(_) => defer_index(&self.pending, id),
        }

        Ok(bmark)
    }

    /// Fetch a bookmark for display, counting the view.
    pub fn view(&self, id: u64) -> Result<Bookmark, AppError> {
        self.get_existing(id)?;
        Ok(self.bmark_mgr.increment_views(id)?)
    }

    pub fn search(&self, query: SearchQuery) -> Result<Vec<Bookmark>, AppError> {
        Ok(self.bmark_mgr.search(query)?)
    }

    /// Bookmarks closest in meaning to `text`, best first.
    pub fn semantic_search(
        &self,
        text: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SemanticMatch>, AppError> {
        let service = self.service()?;
        let limit = limit.unwrap_or_else(|| service.default_limit());

        let hits = service.query(text, limit)?;
        let ids: Vec<u64> = hits.iter().map(|hit| hit.id).collect();
        let bmarks = self.bmark_mgr.get_many(&ids)?;

        let matches: Vec<SemanticMatch> = hits
            .into_iter()
            .zip(bmarks)
            .filter_map(|(hit, bmark)| match bmark {
                Some(bookmark) => Some(SemanticMatch {
                    bookmark,
                    distance: hit.distance,
                }),
                None => {
                    log::debug!("index returned unknown bookmark {}", hit.id);
                    None
                }
            })
            .collect();

        if let Err(err) = self.history.record(text, matches.len()) {
            log::warn!("failed to record search history: {err}");
        }

        Ok(matches)
    }

    /// Rebuild the vector index from every stored bookmark.
    pub fn reindex(&self, show_progress: bool) -> Result<usize, AppError> {
        let service = self.service()?;
        let bmarks = self.bmark_mgr.all()?;
        let count = service.rebuild(&bmarks, show_progress)?;
        clear_pending(&self.pending);
        Ok(count)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.entries()
    }

    pub fn clear_history(&self) -> Result<(), AppError> {
        Ok(self.history.clear()?)
    }

    pub fn stats(&self) -> Result<AppStats, AppError> {
        let bookmarks = self.bmark_mgr.all()?.len();

        let stats = match &self.semantic {
            Semantic::Ready(service) => AppStats {
                bookmarks,
                model: Some(service.model_name().to_string()),
                index: Some(service.stats()?),
                semantic_unavailable: None,
            },
            Semantic::Disabled => AppStats {
                bookmarks,
                model: None,
                index: None,
                semantic_unavailable: None,
            },
            Semantic::Unavailable(reason) => AppStats {
                bookmarks,
                model: None,
                index: None,
                semantic_unavailable: Some(reason.clone()),
            },
        };

        Ok(stats)
    }

    /// Persist any index changes that have not been written yet.
    pub fn flush(&self) -> Result<(), AppError> {
        if let Semantic::Ready(service) = &self.semantic {
            service.flush()?;
        }
        Ok(())
    }
}

/// Remember that the index missed a change to `id`.
fn defer_index(pending: &PendingIndex, id: u64) {
    if let Err(err) = pending.add(id) {
        log::warn!("bookmark {id}: failed to record pending index change: {err}");
    }
}

fn clear_pending(pending: &PendingIndex) {
    if let Err(err) = pending.clear() {
        log::warn!("failed to clear pending index changes: {err}");
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::error!("failed to flush vector index: {err}");
        }
    }
}
