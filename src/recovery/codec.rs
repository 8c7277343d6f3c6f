//! Turning stored entries into ledger payloads.
//!
//! The Ledger Store only ever sees bytes. Which encoding is used is a
//! deployment choice, but it must not change under an existing chain,
//! since playback decodes old ledgers with whatever codec is
//! configured now.

use std::fmt::Debug;

use crate::errors::CodecError;
use crate::recovery::model::StoredEntry;

pub trait EntryCodec: Debug + Send + Sync {
    fn encode(&self, entry: &StoredEntry) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<StoredEntry, CodecError>;
}

/// Plain JSON. Handy when inspecting a store by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EntryCodec for JsonCodec {
    fn encode(&self, entry: &StoredEntry) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(entry)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StoredEntry, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// JSON compressed with zstd. The default.
///
/// Snapshots of large windowed states are dominated by repeated
/// window ids and field names, which compress well.
#[derive(Debug, Clone, Copy)]
pub struct ZstdJsonCodec {
    level: i32,
}

impl ZstdJsonCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdJsonCodec {
    fn default() -> Self {
        Self::new(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl EntryCodec for ZstdJsonCodec {
    fn encode(&self, entry: &StoredEntry) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(entry)?;
        Ok(zstd::stream::encode_all(json.as_slice(), self.level)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StoredEntry, CodecError> {
        let json = zstd::stream::decode_all(bytes)?;
        Ok(serde_json::from_slice(&json)?)
    }
}
