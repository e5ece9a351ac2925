//! Semantic search over bookmark text.
//!
//! # Architecture
//!
//! - `extract`: attachment and web page text extraction
//! - `embeddings`: the [`Embedder`] trait, fastembed and hashing embedders
//! - `preprocess`: combined searchable text and its content hash
//! - `index`: exact flat L2 nearest-neighbour index
//! - `id_map`: index position -> bookmark id, with tombstones
//! - `storage`: `vectors.bin` + `vector_map.json` persistence
//! - `store`: index and map mutated and persisted as one unit
//! - `tagging`: label suggestions by embedding similarity
//! - `service`: keeps the index in step with the bookmark store

pub mod embeddings;
pub mod extract;
mod id_map;
mod index;
mod preprocess;
mod service;
mod storage;
mod store;
mod tagging;

pub use service::{IndexOutcome, SemanticSearchError, SemanticSearchService};
pub use storage::VectorStorage;
pub use store::{LoadOutcome, SearchHit, StoreStats};
