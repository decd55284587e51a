use std::collections::BTreeMap;

use smallvec::SmallVec;

use super::node::{fold, ExtentOp, RefAction, RefKey, RefNode};

/// Position of a node inside its head: merge identity, then sequence number.
pub(crate) type Slot = (RefKey, u64);

/// What `Record` did with a node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MergeOutcome {
    /// No comparable node existed; the node was inserted.
    Inserted,
    /// Folded into an existing comparable node that survives.
    Merged,
    /// Folded into an existing comparable node and both cancelled out.
    Cancelled,
    /// Head-only update; no node was stored.
    HeadOnly,
}

/// All pending reference changes for one extent.
#[derive(Clone, Debug)]
pub struct RefHead {
    bytenr: u64,
    num_bytes: u64,
    refs: BTreeMap<Slot, RefNode>,
    add_list: SmallVec<[Slot; 2]>,
    total_ref_mod: i64,
    ref_mod: i64,
    persisted_refs: u64,
    pub(crate) must_insert_reserved: bool,
    is_data: bool,
    is_system: bool,
    pub(crate) processing: bool,
    pub(crate) extent_op: Option<ExtentOp>,
}

impl RefHead {
    pub(crate) fn new(node: &RefNode, persisted_refs: u64) -> Self {
        Self {
            bytenr: node.bytenr,
            num_bytes: node.num_bytes,
            refs: BTreeMap::new(),
            add_list: SmallVec::new(),
            total_ref_mod: 0,
            ref_mod: 0,
            persisted_refs,
            must_insert_reserved: false,
            is_data: node.is_data(),
            is_system: node.kind.root() == crate::types::RootId::CHUNK_TREE,
            processing: false,
            extent_op: None,
        }
    }

    /// Extent start.
    pub fn bytenr(&self) -> u64 {
        self.bytenr
    }

    /// Extent length.
    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// Signed sum of every reference change folded into this head.
    pub fn total_ref_mod(&self) -> i64 {
        self.total_ref_mod
    }

    /// Signed sum of the changes not yet applied.
    pub fn ref_mod(&self) -> i64 {
        self.ref_mod
    }

    /// Reference count the extent had on disk when the head was created.
    pub fn persisted_refs(&self) -> u64 {
        self.persisted_refs
    }

    /// The extent record has not been inserted yet.
    pub fn must_insert_reserved(&self) -> bool {
        self.must_insert_reserved
    }

    /// Head tracks a data extent.
    pub fn is_data(&self) -> bool {
        self.is_data
    }

    /// Head tracks a chunk-tree block.
    pub fn is_system(&self) -> bool {
        self.is_system
    }

    /// Head is owned by a running drain.
    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// Pending flag update.
    pub fn extent_op(&self) -> Option<ExtentOp> {
        self.extent_op
    }

    /// Number of nodes held.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns true when no nodes are held.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Nodes in merge-identity order.
    pub fn refs(&self) -> impl Iterator<Item = &RefNode> {
        self.refs.values()
    }

    /// Nodes with the given identity, across sequence numbers.
    pub fn refs_for(&self, key: RefKey) -> impl Iterator<Item = &RefNode> {
        self.refs
            .range((key, 0)..=(key, u64::MAX))
            .map(|(_, node)| node)
    }

    /// Add nodes in the order they will be applied.
    pub fn additions(&self) -> impl Iterator<Item = &RefNode> {
        self.add_list.iter().filter_map(|slot| self.refs.get(slot))
    }

    /// Returns true if folding `delta` would take the extent below zero owners.
    pub(crate) fn would_underflow(&self, delta: i64) -> bool {
        self.persisted_refs as i64 + self.total_ref_mod + delta < 0
    }

    /// Folds `node` in; AddExtent must already be normalised to Add.
    ///
    /// The target is the newest comparable node at or above `lowest_seq`, so
    /// nodes a live barrier may still observe are never folded.
    pub(crate) fn add_ref(&mut self, node: RefNode, lowest_seq: Option<u64>) -> MergeOutcome {
        let delta = node.signed_mod();
        self.total_ref_mod += delta;
        self.ref_mod += delta;
        if let Some(op) = node.extent_op {
            match self.extent_op.as_mut() {
                Some(existing) => existing.absorb(op),
                None => self.extent_op = Some(op),
            }
        }
        if node.action == RefAction::UpdateHeadOnly {
            return MergeOutcome::HeadOnly;
        }

        let key = node.key();
        let floor = lowest_seq.unwrap_or(0);
        let Some((&slot, exist)) = self
            .refs
            .range_mut((key, floor)..=(key, u64::MAX))
            .next_back()
        else {
            let slot = (key, node.seq);
            if node.action == RefAction::Add {
                self.add_list.push(slot);
            }
            self.refs.insert(slot, node);
            return MergeOutcome::Inserted;
        };
        let flipped = fold(exist, node.action, node.ref_mod);
        if exist.ref_mod == 0 {
            self.remove_slot(&slot);
            return MergeOutcome::Cancelled;
        }
        if flipped {
            self.track_action(slot);
        }
        MergeOutcome::Merged
    }

    /// Folds comparable nodes whose sequence numbers are below `lowest_seq`
    /// (or all of them without a barrier). Returns the number of nodes removed.
    pub(crate) fn merge(&mut self, lowest_seq: Option<u64>) -> usize {
        let eligible = |seq: u64| lowest_seq.map_or(true, |lowest| seq < lowest);
        let slots: Vec<Slot> = self
            .refs
            .keys()
            .copied()
            .filter(|(_, seq)| eligible(*seq))
            .collect();

        let mut removed = 0;
        let mut anchor: Option<Slot> = None;
        for slot in slots {
            let target = match anchor {
                Some(a) if a.0 == slot.0 => a,
                _ => {
                    anchor = Some(slot);
                    continue;
                }
            };
            let Some(next) = self.remove_slot(&slot) else {
                continue;
            };
            removed += 1;
            let Some(exist) = self.refs.get_mut(&target) else {
                continue;
            };
            let flipped = fold(exist, next.action, next.ref_mod);
            if exist.ref_mod == 0 {
                self.remove_slot(&target);
                removed += 1;
                anchor = None;
            } else if flipped {
                self.track_action(target);
            }
        }
        removed
    }

    /// Takes the next node to apply: additions first, then identity order.
    pub(crate) fn pop_next(&mut self) -> Option<RefNode> {
        let slot = match self.add_list.first() {
            Some(slot) => *slot,
            None => *self.refs.keys().next()?,
        };
        let node = self.remove_slot(&slot)?;
        self.ref_mod -= node.signed_mod();
        Some(node)
    }

    fn remove_slot(&mut self, slot: &Slot) -> Option<RefNode> {
        let node = self.refs.remove(slot)?;
        if node.action == RefAction::Add {
            self.add_list.retain(|s| s != slot);
        }
        Some(node)
    }

    fn track_action(&mut self, slot: Slot) {
        let is_add = self
            .refs
            .get(&slot)
            .is_some_and(|node| node.action == RefAction::Add);
        if is_add {
            self.add_list.push(slot);
        } else {
            self.add_list.retain(|s| *s != slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RootId;

    fn data(action: RefAction, offset: u64, seq: u64) -> RefNode {
        let mut node = RefNode::file_data(1 << 20, 4096, RootId(5), 257, offset, action);
        node.seq = seq;
        node
    }

    #[test]
    fn additions_come_first() {
        let first = data(RefAction::Drop, 0, 0);
        let mut head = RefHead::new(&first, 3);
        head.add_ref(first, None);
        head.add_ref(data(RefAction::Add, 4096, 0), None);

        let popped = head.pop_next().unwrap();
        assert_eq!(popped.action, RefAction::Add);
        assert_eq!(head.ref_mod(), -1);
        assert_eq!(head.pop_next().unwrap().action, RefAction::Drop);
        assert_eq!(head.ref_mod(), 0);
        assert_eq!(head.total_ref_mod(), 0);
        assert!(head.pop_next().is_none());
    }

    #[test]
    fn flipped_node_leaves_addition_list() {
        let add = data(RefAction::Add, 0, 0);
        let mut head = RefHead::new(&add, 5);
        head.add_ref(add, None);
        assert_eq!(head.additions().count(), 1);
        assert_eq!(
            head.add_ref(data(RefAction::Drop, 0, 0).with_ref_mod(2), None),
            MergeOutcome::Merged
        );
        assert_eq!(head.additions().count(), 0);
        assert_eq!(head.refs().next().unwrap().action, RefAction::Drop);
    }

    #[test]
    fn merge_respects_barrier() {
        let a = data(RefAction::Add, 0, 0);
        let mut head = RefHead::new(&a, 1);
        head.add_ref(a, None);
        head.add_ref(data(RefAction::Drop, 0, 1), Some(1));
        head.add_ref(data(RefAction::Add, 0, 2), Some(2));
        assert_eq!(head.len(), 3);

        assert_eq!(head.merge(Some(1)), 0);
        assert_eq!(head.merge(Some(2)), 2);
        assert_eq!(head.len(), 1);
        let survivor = head.refs().next().unwrap();
        assert_eq!((survivor.action, survivor.seq), (RefAction::Add, 2));

        assert_eq!(head.merge(None), 0);
        assert_eq!(head.ref_mod(), 1);
    }

    #[test]
    fn later_node_folds_into_older_one_without_barrier() {
        let a = data(RefAction::Add, 0, 0);
        let mut head = RefHead::new(&a, 0);
        head.add_ref(a, None);
        assert_eq!(head.add_ref(data(RefAction::Add, 0, 1), Some(1)), MergeOutcome::Inserted);
        assert_eq!(head.add_ref(data(RefAction::Add, 0, 1), None), MergeOutcome::Merged);
        assert_eq!(head.len(), 2);
        let newest = head.refs().last().unwrap();
        assert_eq!((newest.seq, newest.ref_mod), (1, 2));
    }

    #[test]
    fn head_only_updates_absorb_flags() {
        let node = data(RefAction::Add, 0, 0);
        let mut head = RefHead::new(&node, 1);
        let update = node.clone().into_head_update(ExtentOp { set_flags: 1 });
        assert_eq!(head.add_ref(update, None), MergeOutcome::HeadOnly);
        head.add_ref(node.into_head_update(ExtentOp { set_flags: 4 }), None);
        assert!(head.is_empty());
        assert_eq!(head.extent_op(), Some(ExtentOp { set_flags: 5 }));
    }
}
