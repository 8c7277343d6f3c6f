//! Configuration settings for the ledger log.
//!
//! Everything is an explicit struct handed to
//! [`crate::recovery::LedgerLog::new`]; nothing is read from process
//! globals. All fields have defaults, so a config file only needs to
//! name what it changes.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::SlotLogError;
use crate::recovery::codec::EntryCodec;
use crate::recovery::codec::JsonCodec;
use crate::recovery::codec::ZstdJsonCodec;
use crate::recovery::store::DigestType;
use crate::recovery::store::LedgerOptions;

/// What to do when a compaction swap finds that the promoted ledger
/// is no longer the chain's tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapMismatchPolicy {
    /// Abandon this cycle and wait for the next scheduled
    /// compaction.
    NextCycle,
    /// Abandon this cycle and immediately begin a new one in the
    /// background.
    RetryImmediately,
}

impl Default for SwapMismatchPolicy {
    fn default() -> Self {
        Self::NextCycle
    }
}

/// Which [`EntryCodec`] to encode entries with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodecConfig {
    ZstdJson { level: i32 },
    Json,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::ZstdJson {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl CodecConfig {
    pub(crate) fn build(&self) -> Arc<dyn EntryCodec> {
        match self {
            Self::ZstdJson { level } => Arc::new(ZstdJsonCodec::new(*level)),
            Self::Json => Arc::new(JsonCodec),
        }
    }
}

/// Configuration settings for a [`crate::recovery::LedgerLog`].
///
/// Args:
///
///   ensemble_size, quorum_size, digest, password: Passed to the
///       Ledger Store when creating and opening ledgers.
///
///   publish_poll_ms: Time to sleep between polls of the replica
///       while waiting for a published ledger id to show up.
///
///   publish_poll_jitter_ms: Up to this much extra random sleep per
///       poll, so slots started together don't poll in lockstep.
///
///   progress_log_every: Log that we are still waiting every this
///       many polls.
///
///   read_batch_size: Entries fetched per read during playback.
///
///   swap_mismatch: See [`SwapMismatchPolicy`].
///
///   codec: See [`CodecConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerLogConfig {
    pub ensemble_size: u32,
    pub quorum_size: u32,
    pub digest: DigestType,
    pub password: String,
    pub publish_poll_ms: u64,
    pub publish_poll_jitter_ms: u64,
    pub progress_log_every: u32,
    pub read_batch_size: u64,
    pub swap_mismatch: SwapMismatchPolicy,
    pub codec: CodecConfig,
}

impl Default for LedgerLogConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 3,
            quorum_size: 3,
            digest: DigestType::default(),
            password: String::from("ledgerlog"),
            publish_poll_ms: 50,
            publish_poll_jitter_ms: 0,
            progress_log_every: 20,
            read_batch_size: 64,
            swap_mismatch: SwapMismatchPolicy::default(),
            codec: CodecConfig::default(),
        }
    }
}

impl LedgerLogConfig {
    pub fn from_json(json: &str) -> Result<Self, SlotLogError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| SlotLogError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, SlotLogError> {
        let json = std::fs::read_to_string(path)
            .map_err(|err| SlotLogError::Config(format!("unable to read {path:?}: {err}")))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), SlotLogError> {
        if self.quorum_size == 0 || self.quorum_size > self.ensemble_size {
            return Err(SlotLogError::Config(format!(
                "quorum_size must be within 1..={}, got {}",
                self.ensemble_size, self.quorum_size
            )));
        }
        if self.read_batch_size == 0 {
            return Err(SlotLogError::Config(String::from(
                "read_batch_size must be positive",
            )));
        }
        Ok(())
    }

    /// Sleep before the next replica poll.
    pub(crate) fn poll_interval(&self) -> Duration {
        let jitter = if self.publish_poll_jitter_ms > 0 {
            fastrand::u64(0..=self.publish_poll_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.publish_poll_ms + jitter)
    }

    pub(crate) fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            ensemble_size: self.ensemble_size,
            quorum_size: self.quorum_size,
            digest: self.digest,
            password: self.password.clone(),
        }
    }
}

/// Configuration for [`crate::recovery::store::SqliteLedgerStore`].
///
/// Args:
///
///   db_file (Path): SQLite file holding all ledgers of this process.
///       Created with its tables if missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    pub db_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let found = LedgerLogConfig::from_json(
            r#"{"publish_poll_ms": 5, "swap_mismatch": "retry_immediately", "codec": {"type": "json"}}"#,
        )
        .unwrap();
        let expected = LedgerLogConfig {
            publish_poll_ms: 5,
            swap_mismatch: SwapMismatchPolicy::RetryImmediately,
            codec: CodecConfig::Json,
            ..Default::default()
        };
        assert_eq!(found, expected);
    }

    #[test]
    fn bad_quorum_is_rejected() {
        let found = LedgerLogConfig::from_json(r#"{"ensemble_size": 2, "quorum_size": 3}"#);
        assert!(matches!(found, Err(SlotLogError::Config(_))));
    }

    #[test]
    fn jitter_bounds_poll_interval() {
        let config = LedgerLogConfig {
            publish_poll_ms: 10,
            publish_poll_jitter_ms: 5,
            ..Default::default()
        };
        for _ in 0..100 {
            let interval = config.poll_interval();
            assert!(interval >= Duration::from_millis(10));
            assert!(interval <= Duration::from_millis(15));
        }
    }
}
