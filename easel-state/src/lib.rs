//! Representations of easel's channel state, shared between the engine and
//! the daemon, plus the fixed-width on-disk entry codec.
//!
//! Separated out to allow for use in other utilities.
#![deny(missing_docs)]

mod entry;
mod key;

pub use entry::{ChannelEntry, ENTRY_SIZE, Fingerprint, PostKind};
pub use key::{Extension, StorageKey};

pub use easel_catalog as ec;
