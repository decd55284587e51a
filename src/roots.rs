//! Root pointers of every tree and the root items the root tree stores.

use std::collections::{BTreeMap, BTreeSet};

use crate::disk::BLOCK_HDR_LEN;
use crate::types::{FsError, Result, RootId};

const ROOT_ITEM_LEN: usize = 25;

/// Where a tree's root block lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RootItem {
    /// Root block address.
    pub bytenr: u64,
    /// Level of the root block.
    pub level: u8,
    /// Transaction that last moved the root.
    pub generation: u64,
}

/// Current and last-committed root pointers.
#[derive(Clone, Debug, Default)]
pub struct RootTree {
    roots: BTreeMap<RootId, RootItem>,
    commit_roots: BTreeMap<RootId, RootItem>,
    dirty: BTreeSet<RootId>,
}

impl RootTree {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current root of `id`.
    pub fn get(&self, id: RootId) -> Option<RootItem> {
        self.roots.get(&id).copied()
    }

    /// Root of `id` as of the last commit.
    pub fn commit_root(&self, id: RootId) -> Option<RootItem> {
        self.commit_roots.get(&id).copied()
    }

    /// Every current root.
    pub fn iter(&self) -> impl Iterator<Item = (RootId, RootItem)> + '_ {
        self.roots.iter().map(|(id, item)| (*id, *item))
    }

    /// Points `id` at a new root block. Trees whose pointer lives in a root
    /// item are queued for a root-tree update.
    pub fn set_root(&mut self, id: RootId, item: RootItem) {
        self.roots.insert(id, item);
        if id != RootId::ROOT_TREE && id != RootId::CHUNK_TREE {
            self.dirty.insert(id);
        }
    }

    /// Deletes the root of `id`; its root item is removed at the next update.
    pub fn remove(&mut self, id: RootId) -> Option<RootItem> {
        let item = self.roots.remove(&id)?;
        if id != RootId::ROOT_TREE && id != RootId::CHUNK_TREE {
            self.dirty.insert(id);
        }
        Some(item)
    }

    /// Returns true when some root item still has to be written.
    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Drains the roots whose items changed, cow-only roots first.
    pub fn take_dirty(&mut self) -> Vec<RootId> {
        let mut dirty: Vec<RootId> = std::mem::take(&mut self.dirty).into_iter().collect();
        dirty.sort_by_key(|id| (!id.is_cowonly(), *id));
        dirty
    }

    /// Forgets pending root item updates.
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Records the current roots as the committed ones.
    pub fn snapshot_commit_roots(&mut self) {
        self.commit_roots = self.roots.clone();
    }

    /// Serializes the root items stored in the root tree's root block.
    pub fn encode_items(&self, nodesize: u32) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for (id, item) in self.iter() {
            if id == RootId::ROOT_TREE || id == RootId::CHUNK_TREE {
                continue;
            }
            buf.extend_from_slice(&id.0.to_be_bytes());
            buf.extend_from_slice(&item.bytenr.to_be_bytes());
            buf.push(item.level);
            buf.extend_from_slice(&item.generation.to_be_bytes());
        }
        if BLOCK_HDR_LEN + buf.len() > nodesize as usize {
            return Err(FsError::Invalid("too many roots for one root tree block"));
        }
        Ok(buf)
    }

    /// Parses a root tree block payload written by [`encode_items`](Self::encode_items).
    pub fn decode_items(payload: &[u8]) -> Result<Vec<(RootId, RootItem)>> {
        if payload.len() % ROOT_ITEM_LEN != 0 {
            return Err(FsError::Corruption("root tree payload truncated"));
        }
        Ok(payload
            .chunks_exact(ROOT_ITEM_LEN)
            .map(|chunk| {
                let mut id = [0u8; 8];
                let mut bytenr = [0u8; 8];
                let mut generation = [0u8; 8];
                id.copy_from_slice(&chunk[0..8]);
                bytenr.copy_from_slice(&chunk[8..16]);
                generation.copy_from_slice(&chunk[17..25]);
                (
                    RootId(u64::from_be_bytes(id)),
                    RootItem {
                        bytenr: u64::from_be_bytes(bytenr),
                        level: chunk[16],
                        generation: u64::from_be_bytes(generation),
                    },
                )
            })
            .collect())
    }
}
