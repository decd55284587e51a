//! Persistent side of reference accounting: the extent records the commit
//! pipeline applies delayed references to.

mod tree;

pub use tree::{ExtentItem, ExtentTree};

use crate::delayed_ref::{ExtentOp, RefNode};
use crate::space::BlockGroupKind;
use crate::types::Result;

/// Block-group accounting record stored in the extent tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockGroupItem {
    /// Logical start of the group.
    pub start: u64,
    /// Length of the group.
    pub length: u64,
    /// Bytes allocated to extents.
    pub used: u64,
    /// Allocation profile.
    pub kind: BlockGroupKind,
}

/// Operations the commit pipeline needs from the extent tree.
pub trait ExtentRefs {
    /// Current reference count of the extent at `bytenr` (zero if absent).
    fn ref_count(&self, bytenr: u64) -> u64;

    /// Applies one merged node. With `must_insert_reserved` the node creates
    /// the extent record instead of adjusting an existing one. Returns the
    /// extent's reference count afterwards; zero means the record was removed.
    fn apply_delta(&mut self, node: &RefNode, must_insert_reserved: bool) -> Result<u64>;

    /// Takes the references held by the block at `bytenr` and returns them as
    /// drops, for a block that just lost its last owner.
    fn enqueue_cascaded_drops(&mut self, bytenr: u64) -> Vec<RefNode>;

    /// Registers that the block at `parent` holds the reference `child`.
    fn record_contents(&mut self, parent: u64, child: RefNode);

    /// Moves the references held by `from` to `to`, rewriting shared
    /// references to name the new parent. Returns the moved references as
    /// they were before the move.
    fn move_contents(&mut self, from: u64, to: u64) -> Vec<RefNode>;

    /// ORs `op` into the flags of an existing extent record.
    fn update_extent_flags(&mut self, bytenr: u64, op: ExtentOp) -> Result<()>;

    /// Inserts or replaces a block-group record.
    fn update_block_group_item(&mut self, item: BlockGroupItem) -> Result<()>;
}
