use std::collections::BTreeMap;

use tracing::trace;

use super::{BlockGroupItem, ExtentRefs};
use crate::delayed_ref::{
    ExtentOp, RefAction, RefKey, RefKind, RefNode, EXTENT_FLAG_DATA, EXTENT_FLAG_TREE_BLOCK,
};
use crate::types::{FsError, Result};

/// One extent record with its back references.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtentItem {
    /// Extent length.
    pub num_bytes: u64,
    /// Total references.
    pub refs: u64,
    /// `EXTENT_FLAG_*` bits.
    pub flags: u64,
    /// Level for tree blocks.
    pub level: Option<u8>,
    backrefs: BTreeMap<RefKey, u64>,
}

impl ExtentItem {
    /// Count held by one back reference.
    pub fn backref(&self, key: RefKey) -> u64 {
        self.backrefs.get(&key).copied().unwrap_or(0)
    }

    /// Back references in item order.
    pub fn backrefs(&self) -> impl Iterator<Item = (&RefKey, &u64)> {
        self.backrefs.iter()
    }
}

/// In-memory extent tree: extent records, block-group records and the
/// child references each tree block holds.
#[derive(Debug, Default)]
pub struct ExtentTree {
    items: BTreeMap<u64, ExtentItem>,
    block_groups: BTreeMap<u64, BlockGroupItem>,
    contents: BTreeMap<u64, Vec<RefNode>>,
}

impl ExtentTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extent record at `bytenr`.
    pub fn item(&self, bytenr: u64) -> Option<&ExtentItem> {
        self.items.get(&bytenr)
    }

    /// Extent records in offset order.
    pub fn items(&self) -> impl Iterator<Item = (&u64, &ExtentItem)> {
        self.items.iter()
    }

    /// Block-group record starting at `start`.
    pub fn block_group_item(&self, start: u64) -> Option<&BlockGroupItem> {
        self.block_groups.get(&start)
    }

    /// References held by the block at `bytenr`.
    pub fn contents(&self, bytenr: u64) -> &[RefNode] {
        self.contents
            .get(&bytenr)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Forgets one reference held by `parent`. Returns false if it was not
    /// registered.
    pub fn remove_contents(&mut self, parent: u64, child: &RefNode) -> bool {
        let Some(children) = self.contents.get_mut(&parent) else {
            return false;
        };
        let key = child.key();
        let Some(pos) = children
            .iter()
            .position(|c| c.bytenr == child.bytenr && c.key() == key)
        else {
            return false;
        };
        children.remove(pos);
        if children.is_empty() {
            self.contents.remove(&parent);
        }
        true
    }

    /// Sum of the lengths of every extent record.
    pub fn bytes_referenced(&self) -> u64 {
        self.items.values().map(|item| item.num_bytes).sum()
    }

    fn insert_reserved(&mut self, node: &RefNode) -> Result<u64> {
        if self.items.contains_key(&node.bytenr) {
            return Err(FsError::consistency(format!(
                "extent record for {} already exists",
                node.bytenr
            )));
        }
        let flags = if node.is_data() {
            EXTENT_FLAG_DATA
        } else {
            EXTENT_FLAG_TREE_BLOCK
        };
        let mut item = ExtentItem {
            num_bytes: node.num_bytes,
            refs: node.ref_mod,
            flags,
            level: node.level(),
            backrefs: BTreeMap::new(),
        };
        item.backrefs.insert(node.key(), node.ref_mod);
        self.items.insert(node.bytenr, item);
        Ok(node.ref_mod)
    }
}

impl ExtentRefs for ExtentTree {
    fn ref_count(&self, bytenr: u64) -> u64 {
        self.items.get(&bytenr).map_or(0, |item| item.refs)
    }

    fn apply_delta(&mut self, node: &RefNode, must_insert_reserved: bool) -> Result<u64> {
        if matches!(node.kind, RefKind::TreeBlock { .. }) && node.ref_mod != 1 {
            return Err(FsError::consistency(format!(
                "tree block {} reference {} applied with magnitude {}",
                node.bytenr,
                node.key(),
                node.ref_mod
            )));
        }
        trace!(bytenr = node.bytenr, delta = node.signed_mod(), "extent.apply");
        match node.action {
            RefAction::Add | RefAction::AddExtent if must_insert_reserved => {
                self.insert_reserved(node)
            }
            RefAction::Add | RefAction::AddExtent => {
                let item = self.items.get_mut(&node.bytenr).ok_or_else(|| {
                    FsError::consistency(format!("reference added to missing extent {}", node.bytenr))
                })?;
                if item.num_bytes != node.num_bytes {
                    return Err(FsError::consistency(format!(
                        "extent {} length {} does not match reference length {}",
                        node.bytenr, item.num_bytes, node.num_bytes
                    )));
                }
                *item.backrefs.entry(node.key()).or_insert(0) += node.ref_mod;
                item.refs += node.ref_mod;
                Ok(item.refs)
            }
            RefAction::Drop => {
                let item = self.items.get_mut(&node.bytenr).ok_or_else(|| {
                    FsError::consistency(format!(
                        "reference dropped from missing extent {}",
                        node.bytenr
                    ))
                })?;
                let key = node.key();
                let held = item.backref(key);
                if held < node.ref_mod || item.refs < node.ref_mod {
                    return Err(FsError::consistency(format!(
                        "extent {} back reference {key} holds {held}, cannot drop {}",
                        node.bytenr, node.ref_mod
                    )));
                }
                if held == node.ref_mod {
                    item.backrefs.remove(&key);
                } else {
                    item.backrefs.insert(key, held - node.ref_mod);
                }
                item.refs -= node.ref_mod;
                let refs = item.refs;
                if refs == 0 {
                    self.items.remove(&node.bytenr);
                }
                Ok(refs)
            }
            RefAction::UpdateHeadOnly => Ok(self.ref_count(node.bytenr)),
        }
    }

    fn enqueue_cascaded_drops(&mut self, bytenr: u64) -> Vec<RefNode> {
        self.contents
            .remove(&bytenr)
            .unwrap_or_default()
            .into_iter()
            .map(|mut child| {
                child.action = RefAction::Drop;
                child.extent_op = None;
                child
            })
            .collect()
    }

    fn record_contents(&mut self, parent: u64, mut child: RefNode) {
        child.action = RefAction::Add;
        child.seq = 0;
        child.extent_op = None;
        self.contents.entry(parent).or_default().push(child);
    }

    fn move_contents(&mut self, from: u64, to: u64) -> Vec<RefNode> {
        let moved = self.contents.remove(&from).unwrap_or_default();
        if moved.is_empty() {
            return moved;
        }
        let rewritten = moved
            .iter()
            .cloned()
            .map(|mut child| {
                match &mut child.kind {
                    RefKind::TreeBlock { parent, .. } | RefKind::FileData { parent, .. } => {
                        if parent.is_some() {
                            *parent = Some(to);
                        }
                    }
                }
                child
            })
            .collect();
        self.contents.insert(to, rewritten);
        moved
    }

    fn update_extent_flags(&mut self, bytenr: u64, op: ExtentOp) -> Result<()> {
        let item = self.items.get_mut(&bytenr).ok_or_else(|| {
            FsError::consistency(format!("flag update for missing extent {bytenr}"))
        })?;
        item.flags |= op.set_flags;
        Ok(())
    }

    fn update_block_group_item(&mut self, item: BlockGroupItem) -> Result<()> {
        if item.used > item.length {
            return Err(FsError::consistency(format!(
                "block group {} uses {} of {} bytes",
                item.start, item.used, item.length
            )));
        }
        self.block_groups.insert(item.start, item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delayed_ref::EXTENT_FLAG_FULL_BACKREF;
    use crate::space::BlockGroupKind;
    use crate::types::RootId;

    const NODE: u64 = 16 * 1024;

    #[test]
    fn insert_adjust_and_free() {
        let mut tree = ExtentTree::new();
        let alloc = RefNode::tree_block(NODE, NODE, RootId(5), 0, RefAction::Add);
        assert_eq!(tree.apply_delta(&alloc, true).unwrap(), 1);
        assert!(tree.apply_delta(&alloc, true).is_err());

        let shared = RefNode::shared_tree_block(NODE, NODE, 4 * NODE, RootId(5), 0, RefAction::Add);
        assert_eq!(tree.apply_delta(&shared, false).unwrap(), 2);
        assert_eq!(tree.item(NODE).unwrap().backref(shared.key()), 1);

        let mut drop = alloc.clone();
        drop.action = RefAction::Drop;
        assert_eq!(tree.apply_delta(&drop, false).unwrap(), 1);
        assert!(tree.apply_delta(&drop, false).is_err());

        let mut drop_shared = shared;
        drop_shared.action = RefAction::Drop;
        assert_eq!(tree.apply_delta(&drop_shared, false).unwrap(), 0);
        assert!(tree.item(NODE).is_none());
    }

    #[test]
    fn tree_block_magnitude_must_be_one() {
        let mut tree = ExtentTree::new();
        let node = RefNode::tree_block(NODE, NODE, RootId(5), 0, RefAction::Add).with_ref_mod(2);
        assert!(matches!(
            tree.apply_delta(&node, true),
            Err(FsError::Consistency(_))
        ));
        let data = RefNode::file_data(NODE, 4096, RootId(5), 257, 0, RefAction::Add).with_ref_mod(2);
        assert_eq!(tree.apply_delta(&data, true).unwrap(), 2);
        assert_eq!(tree.item(NODE).unwrap().flags, EXTENT_FLAG_DATA);
    }

    #[test]
    fn contents_cascade_and_move() {
        let mut tree = ExtentTree::new();
        let child = RefNode::shared_tree_block(8 * NODE, NODE, NODE, RootId(5), 0, RefAction::Add);
        let data = RefNode::file_data(1 << 30, 4096, RootId(5), 257, 0, RefAction::Add);
        tree.record_contents(NODE, child);
        tree.record_contents(NODE, data);

        let moved = tree.move_contents(NODE, 2 * NODE);
        assert_eq!(moved.len(), 2);
        assert!(tree.contents(NODE).is_empty());
        assert_eq!(tree.contents(2 * NODE)[0].kind.parent(), Some(2 * NODE));
        assert_eq!(tree.contents(2 * NODE)[1].kind.parent(), None);

        let drops = tree.enqueue_cascaded_drops(2 * NODE);
        assert_eq!(drops.len(), 2);
        assert!(drops.iter().all(|node| node.action == RefAction::Drop));
        assert!(tree.enqueue_cascaded_drops(2 * NODE).is_empty());
    }

    #[test]
    fn flags_and_block_groups() {
        let mut tree = ExtentTree::new();
        let op = ExtentOp {
            set_flags: EXTENT_FLAG_FULL_BACKREF,
        };
        assert!(tree.update_extent_flags(NODE, op).is_err());
        let node = RefNode::tree_block(NODE, NODE, RootId(2), 0, RefAction::Add);
        tree.apply_delta(&node, true).unwrap();
        tree.update_extent_flags(NODE, op).unwrap();
        assert_eq!(
            tree.item(NODE).unwrap().flags,
            EXTENT_FLAG_TREE_BLOCK | EXTENT_FLAG_FULL_BACKREF
        );

        let item = BlockGroupItem {
            start: 1 << 20,
            length: 1 << 22,
            used: NODE,
            kind: BlockGroupKind::Metadata,
        };
        tree.update_block_group_item(item).unwrap();
        assert_eq!(tree.block_group_item(1 << 20), Some(&item));
        let overfull = BlockGroupItem {
            used: 1 << 23,
            ..item
        };
        assert!(tree.update_block_group_item(overfull).is_err());
    }
}
