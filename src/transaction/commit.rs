use tracing::{debug, info, warn};

use super::Transaction;
use crate::delayed_ref::RefNode;
use crate::disk::{restore_supers, write_supers, SuperBlock};
use crate::extent::ExtentRefs;
use crate::space::BlockGroupKind;
use crate::types::{FsError, Result, RootId};

impl Transaction<'_> {
    /// Applies pending references: at most `count` heads, or until the store
    /// is empty with `None`. Returns the number of heads run.
    pub fn run_delayed_refs(&mut self, count: Option<usize>) -> Result<usize> {
        self.guarded(|t| t.run_delayed_refs_inner(count))
    }

    fn run_delayed_refs_inner(&mut self, count: Option<usize>) -> Result<usize> {
        let limit = count.unwrap_or(usize::MAX);
        let mut run = 0;
        if self.refs.is_empty() {
            return Ok(0);
        }
        debug!(
            transid = self.transid,
            heads = self.refs.num_heads(),
            entries = self.refs.num_entries(),
            "trans.run_delayed_refs.start"
        );
        while !self.refs.is_empty() && run < limit {
            // Applying references rewrites the extent tree; its root must be
            // copied before any head is claimed.
            self.cow_root(RootId::EXTENT_TREE)?;
            while run < limit {
                let Some(bytenr) = self.refs.select_next_head() else {
                    break;
                };
                self.run_head(bytenr)?;
                run += 1;
            }
            if count.is_some() {
                break;
            }
        }
        debug!(
            transid = self.transid,
            run,
            remaining = self.refs.num_heads(),
            "trans.run_delayed_refs.done"
        );
        Ok(run)
    }

    fn run_head(&mut self, bytenr: u64) -> Result<()> {
        let merge_limit = self.fs.options.data_merge_limit;
        self.refs.merge_head(bytenr, merge_limit)?;
        while let Some(node) = self.refs.pop_ref(bytenr)? {
            let insert = self
                .refs
                .find_head(bytenr)
                .is_some_and(|head| head.must_insert_reserved());
            let refs = self.fs.extents.apply_delta(&node, insert)?;
            if insert {
                self.refs.clear_must_insert(bytenr)?;
                let group = self
                    .fs
                    .block_groups
                    .commit_reserved(node.bytenr, node.num_bytes)?;
                self.dirty_bgs.insert(group);
            }
            if refs == 0 {
                self.free_extent(&node)?;
            }
        }

        let never_inserted = self
            .refs
            .find_head(bytenr)
            .is_some_and(|head| head.must_insert_reserved());
        if let Some(op) = self.refs.take_extent_op(bytenr)? {
            if !never_inserted && self.fs.extents.ref_count(bytenr) > 0 {
                self.fs.extents.update_extent_flags(bytenr, op)?;
            }
        }
        let head = self.refs.remove_head(bytenr)?;
        if never_inserted {
            self.fs
                .block_groups
                .release_reserved(bytenr, head.num_bytes())?;
            if !head.is_data() {
                self.fs.buffers.clean(bytenr);
            }
        }
        Ok(())
    }

    /// Side effects of an extent losing its last reference.
    fn free_extent(&mut self, node: &RefNode) -> Result<()> {
        for drop in self.fs.extents.enqueue_cascaded_drops(node.bytenr) {
            self.record(drop)?;
        }
        let group = self
            .fs
            .block_groups
            .free_extent(node.bytenr, node.num_bytes)?;
        self.dirty_bgs.insert(group);
        if !node.is_data() {
            self.fs.buffers.clean(node.bytenr);
        }
        debug!(bytenr = node.bytenr, num_bytes = node.num_bytes, "trans.extent.freed");
        Ok(())
    }

    /// Rewrites the root items of trees whose root moved. The root tree is
    /// copied on its first update, which queues more references.
    fn commit_cowonly_roots(&mut self) -> Result<usize> {
        let dirty = self.fs.roots.take_dirty();
        if dirty.is_empty() {
            return Ok(0);
        }
        let root_tree = self.cow_root(RootId::ROOT_TREE)?;
        let payload = self.fs.roots.encode_items(self.fs.options.nodesize)?;
        self.fs
            .buffers
            .set_payload(root_tree, payload, self.transid)?;
        debug!(transid = self.transid, roots = ?dirty, "trans.commit.roots");
        Ok(dirty.len())
    }

    /// Writes the accounting record of every dirty block group into the
    /// extent tree.
    fn write_dirty_block_groups(&mut self) -> Result<usize> {
        if self.dirty_bgs.is_empty() {
            return Ok(0);
        }
        self.cow_root(RootId::EXTENT_TREE)?;
        let dirty = std::mem::take(&mut self.dirty_bgs);
        for start in &dirty {
            let item = self
                .fs
                .block_groups
                .group(*start)
                .map(|group| group.item())
                .ok_or_else(|| FsError::consistency(format!("dirty block group {start} vanished")))?;
            self.fs.extents.update_block_group_item(item)?;
        }
        Ok(dirty.len())
    }

    fn is_quiescent(&self) -> bool {
        self.refs.is_empty() && self.dirty_bgs.is_empty() && !self.fs.roots.has_dirty()
    }

    /// Makes the transaction durable and returns its generation. On failure
    /// the session is aborted and the previous generation stays the newest
    /// one on disk.
    pub fn commit(mut self) -> Result<u64> {
        self.ensure_open()?;
        match self.commit_inner() {
            Ok(generation) => Ok(generation),
            Err(err) => Err(self.abort_inner(err)),
        }
    }

    fn commit_inner(&mut self) -> Result<u64> {
        let transid = self.transid;
        info!(
            transid,
            heads = self.refs.num_heads(),
            dirty_bgs = self.dirty_bgs.len(),
            "trans.commit.start"
        );
        self.run_delayed_refs_inner(None)?;

        let max_passes = self.fs.options.max_commit_passes;
        let mut passes = 0;
        while !self.is_quiescent() {
            passes += 1;
            if passes > max_passes {
                return Err(FsError::consistency(format!(
                    "delayed references did not converge after {max_passes} commit passes"
                )));
            }
            let roots = self.commit_cowonly_roots()?;
            let groups = self.write_dirty_block_groups()?;
            let heads = self.run_delayed_refs_inner(None)?;
            debug!(transid, passes, roots, groups, heads, "trans.commit.pass");
        }

        let io = self.fs.device();
        let written = self.fs.buffers.write_dirty(io.as_ref(), transid)?;
        io.sync_all()?;

        let root = self
            .fs
            .roots
            .get(RootId::ROOT_TREE)
            .ok_or_else(|| FsError::consistency("root tree has no root"))?;
        let chunk_root = self
            .fs
            .roots
            .get(RootId::CHUNK_TREE)
            .ok_or_else(|| FsError::consistency("chunk tree has no root"))?;
        let bytes_used = [
            BlockGroupKind::Data,
            BlockGroupKind::Metadata,
            BlockGroupKind::System,
        ]
        .into_iter()
        .map(|kind| self.fs.block_groups.space_info(kind).used)
        .sum::<u64>();
        let super_block = SuperBlock {
            generation: transid,
            root: root.bytenr,
            root_level: root.level,
            chunk_root: chunk_root.bytenr,
            chunk_root_level: chunk_root.level,
            chunk_root_generation: chunk_root.generation,
            bytes_used,
            chunk_cursor: self.fs.chunks.cursor(),
            ..self.fs.super_block
        };
        if let Err(err) = write_supers(io.as_ref(), &super_block, &self.fs.mirrors) {
            restore_supers(io.as_ref(), &self.fs.super_block, &self.fs.mirrors);
            return Err(err);
        }

        self.fs.super_block = super_block;
        self.finish_extent_commit()?;
        self.fs.roots.snapshot_commit_roots();
        self.fs.last_trans_committed = transid;
        self.fs
            .block_groups
            .unreserve(BlockGroupKind::Metadata, self.reserved);
        self.reserved = 0;
        self.fs.running = false;
        self.done = true;
        info!(transid, passes, written, bytes_used, "trans.commit.done");
        Ok(transid)
    }

    /// Returns the extents pinned by this transaction to the free pool.
    fn finish_extent_commit(&mut self) -> Result<()> {
        match self.fs.block_groups.unpin_all() {
            Ok(unpinned) => {
                debug!(transid = self.transid, unpinned, "trans.unpin");
                Ok(())
            }
            Err(err) => {
                warn!(transid = self.transid, error = %err, "trans.unpin.failed");
                Err(err)
            }
        }
    }
}
