use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::head::{MergeOutcome, RefHead};
use super::node::{RefAction, RefNode};
use crate::types::{FsError, Result};

/// Extent whose reservation was given back because every reference to it
/// cancelled before the extent record was ever inserted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReleasedExtent {
    /// Extent start.
    pub bytenr: u64,
    /// Extent length.
    pub num_bytes: u64,
    /// Extent held file data.
    pub is_data: bool,
}

/// Per-transaction collection of reference heads keyed by extent start.
#[derive(Debug, Default)]
pub struct DelayedRefStore {
    heads: BTreeMap<u64, RefHead>,
    num_heads_ready: usize,
    num_entries: usize,
    run_delayed_start: u64,
    seq: u64,
    seq_holders: BTreeMap<u64, usize>,
    released: Vec<ReleasedExtent>,
}

impl DelayedRefStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one reference change.
    ///
    /// `persisted_refs` is the extent's on-disk reference count; it only
    /// matters when this creates the head, where it becomes the floor a Drop
    /// may not cross. On error the store is left unchanged.
    pub fn record(&mut self, mut node: RefNode, persisted_refs: u64) -> Result<MergeOutcome> {
        node.validate()?;
        node.seq = self.seq;
        let insert_reserved = node.action == RefAction::AddExtent;
        if insert_reserved {
            node.action = RefAction::Add;
        }
        let delta = node.signed_mod();

        if let Some(head) = self.heads.get(&node.bytenr) {
            if head.is_processing() {
                return Err(FsError::consistency(format!(
                    "extent {} recorded while its head is being run",
                    node.bytenr
                )));
            }
            if head.num_bytes() != node.num_bytes || head.is_data() != node.is_data() {
                return Err(FsError::consistency(format!(
                    "extent {} recorded with mismatched length or kind",
                    node.bytenr
                )));
            }
            if insert_reserved && (head.must_insert_reserved() || head.persisted_refs() > 0) {
                return Err(FsError::consistency(format!(
                    "extent {} allocated twice",
                    node.bytenr
                )));
            }
            if head.would_underflow(delta) {
                return Err(FsError::consistency(format!(
                    "drop of {} takes extent {} below zero references ({} on disk, {} pending)",
                    -delta,
                    node.bytenr,
                    head.persisted_refs(),
                    head.total_ref_mod()
                )));
            }
        } else {
            let persisted = if insert_reserved { 0 } else { persisted_refs };
            if insert_reserved && persisted_refs > 0 {
                return Err(FsError::consistency(format!(
                    "extent {} allocated while it has {} references",
                    node.bytenr, persisted_refs
                )));
            }
            if persisted as i64 + delta < 0 {
                return Err(FsError::consistency(format!(
                    "drop of {} takes extent {} below zero references ({} on disk)",
                    -delta, node.bytenr, persisted
                )));
            }
            if node.action == RefAction::UpdateHeadOnly && persisted == 0 {
                return Err(FsError::consistency(format!(
                    "flag update for unknown extent {}",
                    node.bytenr
                )));
            }
            self.heads
                .insert(node.bytenr, RefHead::new(&node, persisted));
            self.num_heads_ready += 1;
        }

        let bytenr = node.bytenr;
        let lowest_seq = self.lowest_seq();
        let Some(head) = self.heads.get_mut(&bytenr) else {
            return Err(FsError::consistency("head vanished during record"));
        };
        if insert_reserved {
            head.must_insert_reserved = true;
        }
        let outcome = head.add_ref(node, lowest_seq);
        match outcome {
            MergeOutcome::Inserted => self.num_entries += 1,
            MergeOutcome::Cancelled => self.num_entries -= 1,
            MergeOutcome::Merged | MergeOutcome::HeadOnly => {}
        }
        trace!(bytenr, delta, ?outcome, "delayed_ref.record");

        let drained = head.is_empty() && head.ref_mod() == 0 && head.extent_op().is_none();
        if drained {
            if let Some(head) = self.heads.remove(&bytenr) {
                self.num_heads_ready -= 1;
                if head.must_insert_reserved() {
                    debug!(bytenr, "delayed_ref.reserved_extent_cancelled");
                    self.released.push(ReleasedExtent {
                        bytenr,
                        num_bytes: head.num_bytes(),
                        is_data: head.is_data(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Looks up the head for `bytenr`.
    pub fn find_head(&self, bytenr: u64) -> Option<&RefHead> {
        self.heads.get(&bytenr)
    }

    /// Heads in offset order.
    pub fn heads(&self) -> impl Iterator<Item = &RefHead> {
        self.heads.values()
    }

    /// Picks the first non-processing head at or after the cursor, wrapping
    /// once, claims it and advances the cursor past it.
    pub fn select_next_head(&mut self) -> Option<u64> {
        let free = |(bytenr, head): (&u64, &RefHead)| (!head.is_processing()).then_some(*bytenr);
        let start = self.run_delayed_start;
        let picked = self
            .heads
            .range(start..)
            .find_map(free)
            .or_else(|| self.heads.range(..start).find_map(free))?;
        let head = self.heads.get_mut(&picked)?;
        head.processing = true;
        self.num_heads_ready -= 1;
        self.run_delayed_start = picked.saturating_add(head.num_bytes());
        Some(picked)
    }

    /// Hands a claimed head back to the ready pool.
    pub fn unselect_head(&mut self, bytenr: u64) -> Result<()> {
        let head = self.claimed_mut(bytenr)?;
        head.processing = false;
        self.num_heads_ready += 1;
        Ok(())
    }

    /// Runs the merge pass over a claimed head. Data heads holding more than
    /// `data_merge_limit` nodes are left alone. Returns the nodes removed.
    pub fn merge_head(&mut self, bytenr: u64, data_merge_limit: usize) -> Result<usize> {
        let lowest = self.lowest_seq();
        let head = self.claimed_mut(bytenr)?;
        if head.is_data() && head.len() > data_merge_limit {
            debug!(bytenr, nodes = head.len(), "delayed_ref.merge_skipped");
            return Ok(0);
        }
        let removed = head.merge(lowest);
        self.num_entries -= removed;
        Ok(removed)
    }

    /// Takes the next node of a claimed head: additions first.
    pub fn pop_ref(&mut self, bytenr: u64) -> Result<Option<RefNode>> {
        let node = self.claimed_mut(bytenr)?.pop_next();
        if node.is_some() {
            self.num_entries -= 1;
        }
        Ok(node)
    }

    /// Takes the pending flag update of a claimed head.
    pub fn take_extent_op(&mut self, bytenr: u64) -> Result<Option<super::ExtentOp>> {
        Ok(self.claimed_mut(bytenr)?.extent_op.take())
    }

    /// Clears `must_insert_reserved` once the extent record exists.
    pub fn clear_must_insert(&mut self, bytenr: u64) -> Result<()> {
        self.claimed_mut(bytenr)?.must_insert_reserved = false;
        Ok(())
    }

    /// Removes a fully applied head. Fails while it still holds nodes or
    /// outstanding modification.
    pub fn remove_head(&mut self, bytenr: u64) -> Result<RefHead> {
        let head = self
            .heads
            .get(&bytenr)
            .ok_or_else(|| FsError::consistency(format!("no delayed head for {bytenr}")))?;
        if !head.is_empty() || head.ref_mod() != 0 {
            return Err(FsError::consistency(format!(
                "head {bytenr} removed with {} nodes and {} outstanding",
                head.len(),
                head.ref_mod()
            )));
        }
        let processing = head.is_processing();
        let head = self
            .heads
            .remove(&bytenr)
            .ok_or_else(|| FsError::consistency(format!("no delayed head for {bytenr}")))?;
        if !processing {
            self.num_heads_ready -= 1;
        }
        Ok(head)
    }

    /// Starts a sequence barrier; nodes recorded from now on keep their own
    /// sequence number until the barrier is released.
    pub fn acquire_seq(&mut self) -> u64 {
        self.seq += 1;
        *self.seq_holders.entry(self.seq).or_insert(0) += 1;
        self.seq
    }

    /// Ends a barrier returned by [`acquire_seq`](Self::acquire_seq).
    pub fn release_seq(&mut self, seq: u64) -> Result<()> {
        let Some(count) = self.seq_holders.get_mut(&seq) else {
            return Err(FsError::Usage("released an unknown sequence barrier"));
        };
        *count -= 1;
        if *count == 0 {
            self.seq_holders.remove(&seq);
        }
        Ok(())
    }

    /// Lowest sequence number still held by a reader.
    pub fn lowest_seq(&self) -> Option<u64> {
        self.seq_holders.keys().next().copied()
    }

    /// Drains the list of cancelled reserved extents.
    pub fn take_released(&mut self) -> Vec<ReleasedExtent> {
        std::mem::take(&mut self.released)
    }

    /// Discards everything; returns the number of nodes dropped.
    pub fn destroy(&mut self) -> usize {
        let dropped = self.num_entries;
        self.heads.clear();
        self.num_heads_ready = 0;
        self.num_entries = 0;
        self.run_delayed_start = 0;
        self.seq_holders.clear();
        self.released.clear();
        dropped
    }

    /// Returns true when no heads remain.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Number of heads.
    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    /// Number of heads not claimed by a drain.
    pub fn num_heads_ready(&self) -> usize {
        self.num_heads_ready
    }

    /// Number of nodes across all heads.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Round-robin cursor.
    pub fn run_delayed_start(&self) -> u64 {
        self.run_delayed_start
    }

    fn claimed_mut(&mut self, bytenr: u64) -> Result<&mut RefHead> {
        match self.heads.get_mut(&bytenr) {
            Some(head) if head.is_processing() => Ok(head),
            Some(_) => Err(FsError::consistency(format!(
                "head {bytenr} used without being selected"
            ))),
            None => Err(FsError::consistency(format!("no delayed head for {bytenr}"))),
        }
    }
}
