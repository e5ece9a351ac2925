//! The vector index store: a [`VectorIndex`] and its [`IdMap`], mutated and
//! persisted as one unit.
//!
//! Deleted and replaced bookmarks are tombstoned in the map and filtered out of
//! every search. Once tombstones pass `compact_ratio` of the index the store
//! compacts itself from the vectors it already holds, so nothing is re-embedded.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::semantic::id_map::IdMap;
use crate::semantic::index::{IndexError, VectorIndex};
use crate::semantic::storage::{VectorStorage, VectorStorageError};

/// Never compact for fewer tombstones than this
const MIN_TOMBSTONES_TO_COMPACT: usize = 16;

/// A ranked search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: u64,
    /// Squared L2 distance to the query
    pub distance: f32,
}

/// What [`VectorIndexStore::load`] found on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded { live: usize, tombstones: usize },
    /// Neither artifact exists
    Fresh,
    /// Artifacts are missing, corrupt or disagree; the store is empty
    RebuildRequired(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub live: usize,
    pub tombstones: usize,
    pub dimensions: usize,
    pub needs_rebuild: bool,
}

pub struct VectorIndexStore {
    index: VectorIndex,
    map: IdMap,
    storage: VectorStorage,
    model_id: [u8; 32],
    compact_ratio: f32,
    needs_rebuild: bool,
    dirty: bool,
    /// Last mutation ticket applied per bookmark id
    applied: HashMap<u64, u64>,
}

impl VectorIndexStore {
    /// Open the store backed by `storage`, loading whatever is on disk.
    pub fn open(
        storage: VectorStorage,
        model_id: [u8; 32],
        dimensions: usize,
        compact_ratio: f32,
    ) -> (Self, LoadOutcome) {
        let mut store = Self {
            index: VectorIndex::new(dimensions),
            map: IdMap::new(),
            storage,
            model_id,
            compact_ratio,
            needs_rebuild: false,
            dirty: false,
            applied: HashMap::new(),
        };

        let outcome = store.load();
        (store, outcome)
    }

    /// Replace the in-memory state with the persisted artifacts.
    ///
    /// Never fails: on any inconsistency the store is left empty and flagged
    /// as needing a rebuild.
    pub fn load(&mut self) -> LoadOutcome {
        let dimensions = self.index.dimensions();
        self.dirty = false;

        if self.storage.is_fresh() {
            self.reset(false);
            log::info!("no vector index on disk, starting fresh");
            return LoadOutcome::Fresh;
        }

        match self.storage.load(&self.model_id, dimensions) {
            Ok((index, map)) => {
                self.index = index;
                self.map = map;
                self.needs_rebuild = false;
                log::info!(
                    "loaded {} vectors ({} tombstoned) from {}",
                    self.map.live_count(),
                    self.map.dead_count(),
                    self.storage.index_path().display()
                );
                LoadOutcome::Loaded {
                    live: self.map.live_count(),
                    tombstones: self.map.dead_count(),
                }
            }
            Err(err) => {
                match &err {
                    VectorStorageError::ModelMismatch
                    | VectorStorageError::DimensionMismatch { .. } => {
                        log::warn!("embedding model changed, index must be rebuilt: {err}");
                    }
                    _ => log::error!("vector index is unusable, rebuild required: {err}"),
                }
                self.reset(true);
                LoadOutcome::RebuildRequired(err.to_string())
            }
        }
    }

    fn reset(&mut self, needs_rebuild: bool) {
        self.index = VectorIndex::new(self.index.dimensions());
        self.map = IdMap::new();
        self.needs_rebuild = needs_rebuild;
    }

    /// Insert or replace the vector of `id`.
    ///
    /// Returns false when `id` already holds this exact content and vector.
    pub fn upsert(
        &mut self,
        id: u64,
        content_hash: u64,
        vector: &[f32],
    ) -> Result<bool, IndexError> {
        if let Some(position) = self.map.live_position(id) {
            let unchanged = self.map.content_hash(id) == Some(content_hash)
                && self.index.vector(position) == Some(vector);
            if unchanged {
                return Ok(false);
            }
        }

        // index first: if it rejects the vector the map is untouched
        let position = self.index.add(vector)?;
        let map_position = self.map.push(id, content_hash);
        debug_assert_eq!(position, map_position);

        self.dirty = true;
        self.maybe_compact();
        Ok(true)
    }

    /// Tombstone `id`. Returns false if it had no live entry.
    pub fn remove(&mut self, id: u64) -> bool {
        if self.map.tombstone(id).is_none() {
            return false;
        }

        self.dirty = true;
        self.maybe_compact();
        true
    }

    /// Up to `k` live bookmarks, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 || self.map.live_count() == 0 {
            return Ok(vec![]);
        }

        // every tombstone could rank ahead of the live hits
        let candidates = k.saturating_add(self.map.dead_count()).min(self.index.len());

        Ok(self
            .index
            .search(query, candidates)?
            .into_iter()
            .filter_map(|neighbor| {
                self.map.live_id(neighbor.position).map(|id| SearchHit {
                    id,
                    distance: neighbor.distance,
                })
            })
            .take(k)
            .collect())
    }

    /// Replace everything with `entries` of (bookmark id, content hash, vector)
    /// computed under `ticket`.
    ///
    /// Ids mutated under a newer ticket while the entries were computed keep
    /// their current state: a live vector is carried over, a removed id stays
    /// absent.
    pub fn rebuild(
        &mut self,
        entries: Vec<(u64, u64, Vec<f32>)>,
        ticket: u64,
    ) -> Result<(), IndexError> {
        let newer: BTreeSet<u64> = self
            .applied
            .iter()
            .filter(|&(_, &last)| last > ticket)
            .map(|(&id, _)| id)
            .collect();

        let mut index = VectorIndex::with_capacity(self.index.dimensions(), entries.len());
        let mut map = IdMap::new();
        let mut rebuilt = Vec::with_capacity(entries.len());

        for (id, content_hash, vector) in entries {
            if newer.contains(&id) {
                continue;
            }
            index.add(&vector)?;
            map.push(id, content_hash);
            rebuilt.push(id);
        }

        for &id in &newer {
            let current = self.map.live_position(id).and_then(|position| {
                Some((self.index.vector(position)?, self.map.content_hash(id)?))
            });
            if let Some((vector, content_hash)) = current {
                index.add(vector)?;
                map.push(id, content_hash);
            }
        }

        if !newer.is_empty() {
            log::debug!("rebuild kept the newer state of {} bookmarks", newer.len());
        }

        for id in rebuilt {
            self.applied.insert(id, ticket);
        }
        self.index = index;
        self.map = map;
        self.needs_rebuild = false;
        self.dirty = true;

        if self.map.dead_count() > 0 {
            self.compact();
        }

        log::info!("rebuilt vector index with {} entries", self.map.live_count());
        Ok(())
    }

    /// Drop tombstones by rebuilding from the live vectors.
    pub fn compact(&mut self) {
        let mut index =
            VectorIndex::with_capacity(self.index.dimensions(), self.map.live_count());
        let mut map = IdMap::new();

        for (position, id, content_hash) in self.map.live_entries() {
            let Some(vector) = self.index.vector(position) else {
                continue;
            };
            if index.add(vector).is_ok() {
                map.push(id, content_hash);
            }
        }

        log::debug!(
            "compacted vector index: {} -> {} entries",
            self.index.len(),
            index.len()
        );

        self.index = index;
        self.map = map;
        self.dirty = true;
    }

    fn maybe_compact(&mut self) {
        let dead = self.map.dead_count();
        if dead >= MIN_TOMBSTONES_TO_COMPACT
            && dead as f32 >= self.compact_ratio * self.map.len() as f32
        {
            self.compact();
        }
    }

    /// Write both artifacts if anything changed since the last load or save.
    ///
    /// While a rebuild is pending nothing is written, so the broken pair on
    /// disk keeps signalling the rebuild across restarts.
    pub fn persist(&mut self) -> Result<(), VectorStorageError> {
        if !self.dirty {
            return Ok(());
        }

        if self.needs_rebuild {
            log::debug!("vector index awaits rebuild, not persisting");
            return Ok(());
        }

        self.storage.save(&self.index, &self.map, &self.model_id)?;
        self.dirty = false;
        Ok(())
    }

    /// Record `ticket` for `id` unless a newer one was already applied.
    ///
    /// Tickets are taken before the slow work of a save or delete starts, so
    /// a mutation that lost the race to a newer one is dropped here.
    pub fn admit(&mut self, id: u64, ticket: u64) -> bool {
        match self.applied.get(&id) {
            Some(&last) if last > ticket => false,
            _ => {
                self.applied.insert(id, ticket);
                true
            }
        }
    }

    pub fn content_hash(&self, id: u64) -> Option<u64> {
        self.map.content_hash(id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.map.contains(id)
    }

    /// Ids holding a live vector.
    pub fn live_ids(&self) -> Vec<u64> {
        self.map.live_entries().map(|(_, id, _)| id).collect()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            live: self.map.live_count(),
            tombstones: self.map.dead_count(),
            dimensions: self.index.dimensions(),
            needs_rebuild: self.needs_rebuild,
        }
    }
}
