//! Ingestion pipeline: staleness check, parse, extract, upsert, cross-reference,
//! snapshots and chunks.
pub mod chunks;
pub mod core;
pub mod xref;

pub use self::core::{CodeSyncResult, FileOutcome, Indexer};

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a text payload.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
