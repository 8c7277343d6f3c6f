//! Durable checkpoint log for windowed-aggregation state.
//!
//! Each processing slot appends every state mutation to a chain of
//! ledgers before acknowledging it. On restart the slot replays the
//! chain to rebuild its windowed state, and periodically the chain's
//! prefix is compacted into a single snapshot ledger so replay cost
//! stays bounded.
//!
//! Start reading at [`recovery`]; the module docs describe the whole
//! lifecycle. [`window`] holds the aggregation functions that playback
//! applies, [`config`] the knobs.

#[macro_use]
pub(crate) mod macros;

pub mod config;
pub mod errors;
pub mod metrics;
pub mod recovery;
pub mod tracing;
pub mod webserver;
pub mod window;

pub use config::LedgerLogConfig;
pub use errors::SlotLogError;
pub use recovery::LedgerLog;
pub use recovery::LogBackend;
pub use recovery::NoOpLog;
pub use recovery::Publication;
pub use recovery::SlotEvent;
