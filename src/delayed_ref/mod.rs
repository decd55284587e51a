//! Deferred, mergeable reference counting for extents.
//!
//! Every owner change of an extent is recorded as a [`RefNode`] under the
//! extent's [`RefHead`] instead of touching the extent tree immediately.
//! Comparable nodes fold together as they arrive, so by the time the commit
//! pipeline drains the [`DelayedRefStore`] each back reference sees at most one
//! net change.

mod head;
mod node;
mod store;

pub use head::{MergeOutcome, RefHead};
pub use node::{
    ExtentOp, RefAction, RefKey, RefKind, RefNode, EXTENT_FLAG_DATA, EXTENT_FLAG_FULL_BACKREF,
    EXTENT_FLAG_TREE_BLOCK,
};
pub use store::{DelayedRefStore, ReleasedExtent};
