//! Delayed extent-reference accounting and the transaction commit pipeline of
//! a copy-on-write tree filesystem.
//!
//! Reference changes are queued in a [`delayed_ref::DelayedRefStore`] owned by
//! the running [`Transaction`] and applied to the extent tree in batches. A
//! commit drains the queue until the extent tree, block-group records and
//! root items stop producing new work, writes every dirty tree block and
//! publishes a superblock quorum.

#![warn(missing_docs)]

pub mod config;
pub mod delayed_ref;
pub mod disk;
pub mod extent;
pub mod primitives;
pub mod roots;
pub mod space;
pub mod transaction;
pub mod types;

pub use config::{ConfigError, FsOptions};
pub use delayed_ref::{MergeOutcome, RefAction, RefNode};
pub use primitives::io::{FaultyDevice, FileDevice, FileIo, MemDevice};
pub use transaction::{calc_trans_metadata_size, Filesystem, Transaction};
pub use types::{AbortCode, FsError, Result, RootId};
