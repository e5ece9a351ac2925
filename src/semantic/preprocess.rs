//! Content preprocessing for embedding generation.
//!
//! Prepares bookmark text for embedding:
//! 1. Trim every part, drop empty ones
//! 2. Join title, description and extracted texts with a blank line
//! 3. Truncate to a character budget on a char boundary

use sha2::{Digest, Sha256};

/// Separator between the parts of a bookmark's searchable text
pub const PART_SEPARATOR: &str = "\n\n";

/// Build the text that gets embedded for a bookmark.
///
/// Returns `None` if every part is blank.
pub fn searchable_text(
    title: &str,
    description: &str,
    extracted: &[String],
    max_chars: usize,
) -> Option<String> {
    let parts: Vec<&str> = [title, description]
        .into_iter()
        .chain(extracted.iter().map(|s| s.as_str()))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        return None;
    }

    Some(truncate_content(&parts.join(PART_SEPARATOR), max_chars))
}

/// Keep at most `max_chars` characters.
fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => content[..byte_idx].trim_end().to_string(),
        None => content.to_string(),
    }
}

/// Stable hash of the embedded text, used to skip re-embedding unchanged
/// bookmarks. Must not change between releases: it is persisted.
pub fn content_hash(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
