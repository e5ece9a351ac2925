//! On-disk artifacts of the vector index store.
//!
//! Two files are always written together:
//!
//! `vectors.bin`, header (55 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - generation: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! followed by `entry_count * dimensions` little-endian f32, in position order.
//!
//! `vector_map.json` holds the identifier map for the same positions, plus
//! the same generation. A pair whose generations or counts disagree was not
//! written by the same save and is rejected.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::id_map::IdMap;
use crate::semantic::index::VectorIndex;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + dimensions(2) + entry_count(8) + generation(8) + checksum(4)
const HEADER_SIZE: usize = 55;

/// Bytes covered by the header checksum
const CHECKSUMMED: usize = HEADER_SIZE - 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identifier map is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("{0} is missing while its counterpart exists")]
    Missing(PathBuf),

    #[error("Index and identifier map are out of sync: {0}")]
    OutOfSync(String),
}

/// Serialized identifier map.
#[derive(Debug, Serialize, Deserialize)]
struct MapFile {
    version: u8,
    generation: u64,
    dimensions: u16,
    ids: Vec<u64>,
    hashes: Vec<u64>,
    dead: BTreeSet<usize>,
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
    generation: u64,
}

/// Storage manager for the index/map file pair.
pub struct VectorStorage {
    index_path: PathBuf,
    map_path: PathBuf,
}

impl VectorStorage {
    pub fn new(index_path: PathBuf, map_path: PathBuf) -> Self {
        Self {
            index_path,
            map_path,
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn map_path(&self) -> &Path {
        &self.map_path
    }

    /// True when neither artifact exists yet.
    pub fn is_fresh(&self) -> bool {
        !self.index_path.exists() && !self.map_path.exists()
    }

    /// Load both artifacts and check them against each other.
    ///
    /// Callers check [`Self::is_fresh`] first: a missing file here means its
    /// counterpart exists.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(VectorIndex, IdMap), VectorStorageError> {
        for path in [&self.index_path, &self.map_path] {
            if !path.exists() {
                return Err(VectorStorageError::Missing(path.clone()));
            }
        }

        let (header, index) = self.read_index(expected_model_id, expected_dimensions)?;
        let map_file: MapFile = serde_json::from_slice(&std::fs::read(&self.map_path)?)?;

        if map_file.version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(
                map_file.version,
                FORMAT_VERSION,
            ));
        }

        if map_file.generation != header.generation {
            return Err(VectorStorageError::OutOfSync(format!(
                "index generation {} but map generation {}",
                header.generation, map_file.generation
            )));
        }

        if map_file.dimensions != header.dimensions {
            return Err(VectorStorageError::OutOfSync(format!(
                "index has {} dimensions but map records {}",
                header.dimensions, map_file.dimensions
            )));
        }

        if map_file.ids.len() != index.len() {
            return Err(VectorStorageError::OutOfSync(format!(
                "index has {} vectors but map has {} ids",
                index.len(),
                map_file.ids.len()
            )));
        }

        let map = IdMap::from_parts(map_file.ids, map_file.hashes, map_file.dead)
            .map_err(VectorStorageError::OutOfSync)?;

        Ok((index, map))
    }

    /// Save both artifacts.
    ///
    /// Both are written to temp files and synced before either is renamed into
    /// place. Returns the generation stamped into the pair.
    pub fn save(
        &self,
        index: &VectorIndex,
        map: &IdMap,
        model_id: &[u8; 32],
    ) -> Result<u64, VectorStorageError> {
        if map.len() != index.len() {
            return Err(VectorStorageError::OutOfSync(format!(
                "refusing to save {} vectors with {} ids",
                index.len(),
                map.len()
            )));
        }

        let generation = rand::random::<u64>();
        let index_tmp = temp_path(&self.index_path);
        let map_tmp = temp_path(&self.map_path);

        let result = self
            .write_index(&index_tmp, index, model_id, generation)
            .and_then(|_| self.write_map(&map_tmp, index, map, generation));

        if let Err(err) = result {
            // Clean up temp files on error
            let _ = std::fs::remove_file(&index_tmp);
            let _ = std::fs::remove_file(&map_tmp);
            return Err(err);
        }

        std::fs::rename(&index_tmp, &self.index_path)?;
        std::fs::rename(&map_tmp, &self.map_path)?;

        Ok(generation)
    }

    fn read_index(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(Header, VectorIndex), VectorStorageError> {
        let mut bytes = Vec::new();
        File::open(&self.index_path)?.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_SIZE {
            return Err(VectorStorageError::InvalidFormat(format!(
                "file is {} bytes, shorter than the header",
                bytes.len()
            )));
        }

        let header = Self::parse_header(&bytes[..HEADER_SIZE])?;
        Self::validate_header(&header, expected_model_id, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let expected_len = (header.entry_count as usize)
            .checked_mul(dimensions * 4)
            .and_then(|body| body.checked_add(HEADER_SIZE))
            .ok_or_else(|| VectorStorageError::InvalidFormat("entry count overflows".into()))?;

        if bytes.len() != expected_len {
            return Err(VectorStorageError::InvalidFormat(format!(
                "expected {expected_len} bytes for {} vectors, file has {}",
                header.entry_count,
                bytes.len()
            )));
        }

        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);
        let floats: Vec<f32> = bytes[HEADER_SIZE..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        for vector in floats.chunks_exact(dimensions.max(1)) {
            index
                .add(vector)
                .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
        }

        Ok((header, index))
    }

    fn parse_header(header_bytes: &[u8]) -> Result<Header, VectorStorageError> {
        let version = header_bytes[0];

        // Version check first
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[CHECKSUMMED..HEADER_SIZE]));
        if stored_checksum != crc32fast::hash(&header_bytes[..CHECKSUMMED]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        Ok(Header {
            version,
            model_id,
            dimensions: u16::from_le_bytes(le_array(&header_bytes[33..35])),
            entry_count: u64::from_le_bytes(le_array(&header_bytes[35..43])),
            generation: u64::from_le_bytes(le_array(&header_bytes[43..51])),
        })
    }

    fn validate_header(
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn write_index(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
        generation: u64,
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                index.dimensions()
            ))
        })?;

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
            generation,
        };

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&Self::encode_header(&header))?;

        for vector in index.vectors() {
            for value in vector {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        sync(writer)
    }

    fn write_map(
        &self,
        path: &Path,
        index: &VectorIndex,
        map: &IdMap,
        generation: u64,
    ) -> Result<(), VectorStorageError> {
        let map_file = MapFile {
            version: FORMAT_VERSION,
            generation,
            dimensions: index.dimensions() as u16,
            ids: map.ids().to_vec(),
            hashes: map.hashes().to_vec(),
            dead: map.dead().clone(),
        };

        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &map_file)?;

        sync(writer)
    }

    fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());
        header_bytes[43..51].copy_from_slice(&header.generation.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[..CHECKSUMMED]);
        header_bytes[CHECKSUMMED..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());

        header_bytes
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn sync(mut writer: BufWriter<File>) -> Result<(), VectorStorageError> {
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn storage_in(dir: &Path) -> VectorStorage {
        VectorStorage::new(dir.join("vectors.bin"), dir.join("vector_map.json"))
    }

    fn sample() -> (VectorIndex, IdMap) {
        let mut index = VectorIndex::new(3);
        let mut map = IdMap::new();
        for (id, vector) in [(1, [1.0, 0.0, 0.0]), (2, [0.0, 1.0, 0.0]), (1, [0.0, 0.0, 1.0])] {
            index.add(&vector).unwrap();
            map.push(id, id * 100);
        }
        (index, map)
    }

    #[test]
    fn test_save_and_load_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        assert!(storage.is_fresh());

        storage
            .save(&VectorIndex::new(384), &IdMap::new(), &test_model_id())
            .unwrap();
        assert!(!storage.is_fresh());

        let (index, map) = storage.load(&test_model_id(), 384).unwrap();
        assert_eq!(index.len(), 0);
        assert_eq!(index.dimensions(), 384);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        let (index, map) = sample();

        storage.save(&index, &map, &test_model_id()).unwrap();
        let (loaded_index, loaded_map) = storage.load(&test_model_id(), 3).unwrap();

        assert_eq!(loaded_index.len(), 3);
        assert_eq!(loaded_index.vector(2), Some(&[0.0, 0.0, 1.0][..]));
        assert_eq!(loaded_map.ids(), &[1, 2, 1]);
        assert_eq!(loaded_map.live_position(1), Some(2));
        assert_eq!(loaded_map.content_hash(2), Some(200));
        assert_eq!(loaded_map.dead_count(), 1);
    }

    #[test]
    fn test_model_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        storage
            .save(&VectorIndex::new(3), &IdMap::new(), &test_model_id())
            .unwrap();

        let result = storage.load(&[0xFF; 32], 3);
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        storage
            .save(&VectorIndex::new(3), &IdMap::new(), &test_model_id())
            .unwrap();

        let result = storage.load(&test_model_id(), 384);
        assert!(matches!(result, Err(VectorStorageError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_missing_counterpart() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        let (index, map) = sample();
        storage.save(&index, &map, &test_model_id()).unwrap();

        std::fs::remove_file(storage.map_path()).unwrap();
        assert!(!storage.is_fresh());
        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::Missing(_))));
    }

    #[test]
    fn test_generation_mismatch_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        let (index, map) = sample();

        storage.save(&index, &map, &test_model_id()).unwrap();
        let stale_map = std::fs::read(storage.map_path()).unwrap();

        // a second save, then put the older map back as if a crash hit between renames
        storage.save(&index, &map, &test_model_id()).unwrap();
        std::fs::write(storage.map_path(), stale_map).unwrap();

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::OutOfSync(_))));
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        let (index, map) = sample();
        storage.save(&index, &map, &test_model_id()).unwrap();

        let bytes = std::fs::read(storage.index_path()).unwrap();
        std::fs::write(storage.index_path(), &bytes[..bytes.len() - 4]).unwrap();

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::InvalidFormat(_))));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        let (index, map) = sample();
        storage.save(&index, &map, &test_model_id()).unwrap();

        let mut bytes = std::fs::read(storage.index_path()).unwrap();
        bytes[36] ^= 0xFF;
        std::fs::write(storage.index_path(), bytes).unwrap();

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(
            tmp.path().join("missing-dir").join("vectors.bin"),
            tmp.path().join("vector_map.json"),
        );

        let result = storage.save(&VectorIndex::new(3), &IdMap::new(), &test_model_id());
        assert!(result.is_err());
        assert!(!tmp.path().join("vector_map.json.tmp").exists());
        assert!(!tmp.path().join("vector_map.json").exists());
    }

    #[test]
    fn test_refuses_to_save_mismatched_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = storage_in(tmp.path());
        let mut map = IdMap::new();
        map.push(1, 0);

        let result = storage.save(&VectorIndex::new(3), &map, &test_model_id());
        assert!(matches!(result, Err(VectorStorageError::OutOfSync(_))));
        assert!(storage.is_fresh());
    }
}
