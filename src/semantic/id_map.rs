//! Identifier map: index position -> bookmark id.
//!
//! Position `i` here always describes vector `i` of the [`VectorIndex`].
//! Replaced and removed entries stay in place as tombstones until the next
//! compaction, so positions never shift underneath the index.
//!
//! [`VectorIndex`]: crate::semantic::index::VectorIndex

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct IdMap {
    ids: Vec<u64>,
    /// Content hash of the text each vector was embedded from
    hashes: Vec<u64>,
    dead: BTreeSet<usize>,
    /// bookmark id -> live position
    live: HashMap<u64, usize>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a map from its persisted parts.
    ///
    /// Rejects parts that could make a lookup go out of bounds or map one
    /// bookmark to two live vectors.
    pub fn from_parts(
        ids: Vec<u64>,
        hashes: Vec<u64>,
        dead: BTreeSet<usize>,
    ) -> Result<Self, String> {
        if ids.len() != hashes.len() {
            return Err(format!(
                "{} ids but {} content hashes",
                ids.len(),
                hashes.len()
            ));
        }

        if let Some(&last) = dead.iter().next_back() {
            if last >= ids.len() {
                return Err(format!(
                    "tombstone {last} out of range for {} entries",
                    ids.len()
                ));
            }
        }

        let mut live = HashMap::with_capacity(ids.len() - dead.len());
        for (position, id) in ids.iter().enumerate() {
            if dead.contains(&position) {
                continue;
            }
            if let Some(previous) = live.insert(*id, position) {
                return Err(format!(
                    "bookmark {id} is live at positions {previous} and {position}"
                ));
            }
        }

        Ok(Self {
            ids,
            hashes,
            dead,
            live,
        })
    }

    /// Record `id` at the next position, tombstoning its previous entry.
    /// Returns the new position.
    pub fn push(&mut self, id: u64, content_hash: u64) -> usize {
        self.tombstone(id);

        let position = self.ids.len();
        self.ids.push(id);
        self.hashes.push(content_hash);
        self.live.insert(id, position);
        position
    }

    /// Tombstone the live entry of `id`, returning its position.
    pub fn tombstone(&mut self, id: u64) -> Option<usize> {
        let position = self.live.remove(&id)?;
        self.dead.insert(position);
        Some(position)
    }

    /// Bookmark id at `position`, unless tombstoned or out of range.
    pub fn live_id(&self, position: usize) -> Option<u64> {
        if self.dead.contains(&position) {
            return None;
        }
        self.ids.get(position).copied()
    }

    pub fn live_position(&self, id: u64) -> Option<usize> {
        self.live.get(&id).copied()
    }

    pub fn content_hash(&self, id: u64) -> Option<u64> {
        self.live_position(id).map(|position| self.hashes[position])
    }

    pub fn contains(&self, id: u64) -> bool {
        self.live.contains_key(&id)
    }

    /// Live entries in position order: (position, id, content hash).
    pub fn live_entries(&self) -> impl Iterator<Item = (usize, u64, u64)> + '_ {
        self.ids
            .iter()
            .zip(&self.hashes)
            .enumerate()
            .filter(|(position, _)| !self.dead.contains(position))
            .map(|(position, (id, hash))| (position, *id, *hash))
    }

    /// Total entries, tombstones included. Equals the index length.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn hashes(&self) -> &[u64] {
        &self.hashes
    }

    pub fn dead(&self) -> &BTreeSet<usize> {
        &self.dead
    }
}
