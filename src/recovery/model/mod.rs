//! The data model for recovery.
//!
//! [`slot`] names things, [`state`] is what gets persisted and
//! rebuilt, and [`command`] is what gets sent to the replica.

#[cfg(test)]
pub(crate) mod arbitrary;
pub(crate) mod command;
pub(crate) mod slot;
pub(crate) mod state;

// Re-export so you can get the whole model at once.

pub use command::*;
pub use slot::*;
pub use state::*;
