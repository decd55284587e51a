//! Filesystem sessions and transaction handles.
//!
//! A [`Filesystem`] owns the in-memory state of one mounted image. All
//! modifications go through a [`Transaction`], which mutably borrows the
//! session, so at most one handle can exist at a time. A handle ends in
//! exactly one of [`Transaction::commit`] or [`Transaction::abort`]; dropping
//! it while open aborts the session.

mod commit;
mod space;

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use tracing::{debug, error, info};

pub use space::calc_trans_metadata_size;

use crate::config::FsOptions;
use crate::delayed_ref::{DelayedRefStore, ExtentOp, MergeOutcome, RefAction, RefKind, RefNode};
use crate::disk::{mirror_offsets, BufferStore, SuperBlock, SUPER_INFO_SIZE, SUPER_MIRROR_OFFSETS};
use crate::extent::{ExtentRefs, ExtentTree};
use crate::primitives::io::FileIo;
use crate::roots::{RootItem, RootTree};
use crate::space::{BlockGroupCache, BlockGroupKind, Chunk, ChunkAllocator, DeviceChunkAllocator};
use crate::types::{AbortCode, FsError, Result, RootId};

/// Trees every filesystem is created with.
const BOOTSTRAP_TREES: [RootId; 6] = [
    RootId::ROOT_TREE,
    RootId::EXTENT_TREE,
    RootId::CHUNK_TREE,
    RootId::DEV_TREE,
    RootId::FS_TREE,
    RootId::CSUM_TREE,
];

/// One open filesystem image.
pub struct Filesystem {
    io: Arc<dyn FileIo>,
    options: FsOptions,
    fsid: u64,
    super_block: SuperBlock,
    mirrors: Vec<u64>,
    extents: ExtentTree,
    block_groups: BlockGroupCache,
    chunks: Box<dyn ChunkAllocator + Send>,
    roots: RootTree,
    buffers: BufferStore,
    pending_bgs: Vec<u64>,
    last_trans_committed: u64,
    running: bool,
    aborted: Option<(AbortCode, String)>,
}

impl Filesystem {
    /// Creates a new filesystem on `io`: carves system, metadata and data
    /// chunks, creates the bootstrap trees and commits generation 1.
    pub fn format(io: Arc<dyn FileIo>, options: FsOptions) -> Result<Self> {
        options.validate()?;
        let device_size = io.len()?;
        let mirrors = mirror_offsets(device_size, options.super_mirrors);
        if mirrors.is_empty() {
            return Err(FsError::Invalid("device too small for a superblock"));
        }
        let fsid = OsRng.next_u64();
        let chunks = DeviceChunkAllocator::new(device_size, &options);
        let super_block = SuperBlock {
            fsid,
            bytenr: 0,
            generation: 0,
            root: 0,
            root_level: 0,
            chunk_root: 0,
            chunk_root_level: 0,
            chunk_root_generation: 0,
            total_bytes: device_size,
            bytes_used: 0,
            chunk_cursor: chunks.cursor(),
            nodesize: options.nodesize,
            sectorsize: options.sectorsize,
            num_mirrors: mirrors.len() as u8,
        };
        let mut fs = Self {
            buffers: BufferStore::new(fsid, options.nodesize),
            io,
            fsid,
            super_block,
            mirrors,
            extents: ExtentTree::new(),
            block_groups: BlockGroupCache::new(),
            chunks: Box::new(chunks),
            roots: RootTree::new(),
            pending_bgs: Vec::new(),
            last_trans_committed: 0,
            running: false,
            aborted: None,
            options,
        };
        info!(fsid = %hex::encode(fsid.to_be_bytes()), device_size, "fs.format.start");

        let min_meta = u64::from(fs.options.nodesize);
        for (kind, min) in [
            (BlockGroupKind::System, min_meta),
            (BlockGroupKind::Metadata, min_meta),
            (BlockGroupKind::Data, u64::from(fs.options.sectorsize)),
        ] {
            let chunk = fs.chunks.allocate_chunk(kind, min)?;
            fs.add_chunk(chunk)?;
        }

        let mut trans = fs.start_transaction(0)?;
        for id in BOOTSTRAP_TREES {
            if let Err(err) = trans.create_tree(id) {
                return Err(trans.abort(err));
            }
        }
        let generation = trans.commit()?;
        info!(generation, "fs.format.done");
        Ok(fs)
    }

    /// Registers a chunk as a block group; it is written out by the next
    /// transaction.
    pub(crate) fn add_chunk(&mut self, chunk: Chunk) -> Result<u64> {
        let excluded: Vec<(u64, u64)> = SUPER_MIRROR_OFFSETS
            .iter()
            .map(|off| (*off, SUPER_INFO_SIZE as u64))
            .collect();
        self.block_groups
            .add_group(chunk.start, chunk.length, chunk.kind, &excluded)?;
        self.pending_bgs.push(chunk.start);
        Ok(chunk.start)
    }

    /// Opens a transaction able to modify `num_items` items. The worst-case
    /// metadata cost is reserved up front; see [`calc_trans_metadata_size`].
    pub fn start_transaction(&mut self, num_items: u64) -> Result<Transaction<'_>> {
        self.ensure_usable()?;
        if self.running {
            return Err(FsError::Usage("a transaction is already running"));
        }
        let reserved = calc_trans_metadata_size(self.options.nodesize, num_items);
        self.reserve_metadata(reserved)?;
        self.running = true;
        let transid = self.last_trans_committed + 1;
        debug!(transid, num_items, reserved, "trans.start");
        let mut trans = Transaction {
            fs: self,
            transid,
            refs: DelayedRefStore::new(),
            dirty_bgs: BTreeSet::new(),
            reserved,
            in_chunk_alloc: false,
            done: false,
        };
        if let Err(err) = trans.adopt_pending_block_groups() {
            return Err(trans.abort(err));
        }
        Ok(trans)
    }

    /// Fails with the sticky abort error once the session has aborted.
    pub fn ensure_usable(&self) -> Result<()> {
        match &self.aborted {
            Some((code, reason)) => Err(FsError::Aborted {
                code: *code,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn set_aborted(&mut self, err: &FsError) {
        if self.aborted.is_none() {
            self.aborted = Some((err.code(), err.to_string()));
        }
    }

    /// Code of the error that aborted the session.
    pub fn abort_code(&self) -> Option<AbortCode> {
        self.aborted.as_ref().map(|(code, _)| *code)
    }

    /// Last committed generation.
    pub fn generation(&self) -> u64 {
        self.last_trans_committed
    }

    /// Returns true while a handle is open (or was leaked).
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Filesystem id.
    pub fn fsid(&self) -> u64 {
        self.fsid
    }

    /// Options the session runs with.
    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// Superblock of the last committed generation.
    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    /// Mirror offsets written at each commit.
    pub fn mirrors(&self) -> &[u64] {
        &self.mirrors
    }

    /// Extent records.
    pub fn extents(&self) -> &ExtentTree {
        &self.extents
    }

    /// Block groups and reservations.
    pub fn block_groups(&self) -> &BlockGroupCache {
        &self.block_groups
    }

    /// Tree roots.
    pub fn roots(&self) -> &RootTree {
        &self.roots
    }

    /// Cached tree blocks.
    pub fn buffers(&self) -> &BufferStore {
        &self.buffers
    }

    /// Backing device.
    pub fn device(&self) -> Arc<dyn FileIo> {
        Arc::clone(&self.io)
    }
}

/// Exclusive handle on a running transaction.
pub struct Transaction<'fs> {
    fs: &'fs mut Filesystem,
    transid: u64,
    refs: DelayedRefStore,
    dirty_bgs: BTreeSet<u64>,
    reserved: u64,
    in_chunk_alloc: bool,
    done: bool,
}

impl<'fs> Transaction<'fs> {
    /// Generation this transaction will commit as.
    pub fn transid(&self) -> u64 {
        self.transid
    }

    /// Pending reference changes.
    pub fn delayed_refs(&self) -> &DelayedRefStore {
        &self.refs
    }

    /// Block groups whose accounting must be written before commit.
    pub fn dirty_block_groups(&self) -> impl Iterator<Item = u64> + '_ {
        self.dirty_bgs.iter().copied()
    }

    /// Metadata reservation not yet consumed by allocations.
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved
    }

    /// Read access to the session.
    pub fn fs(&self) -> &Filesystem {
        &*self.fs
    }

    fn ensure_open(&self) -> Result<()> {
        self.fs.ensure_usable()
    }

    /// Runs `op`; a failure aborts the transaction.
    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        match op(self) {
            Ok(value) => Ok(value),
            Err(err @ FsError::Invalid(_)) => Err(err),
            Err(err) => Err(self.abort_inner(err)),
        }
    }

    fn adopt_pending_block_groups(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.fs.pending_bgs);
        if pending.is_empty() {
            return Ok(());
        }
        self.dirty_bgs.extend(pending);
        if self.fs.roots.get(RootId::CHUNK_TREE).is_some() {
            self.cow_root(RootId::CHUNK_TREE)?;
            self.cow_root(RootId::DEV_TREE)?;
        }
        Ok(())
    }

    /// Records one reference change; the merged outcome is returned.
    pub fn add_delayed_ref(&mut self, node: RefNode) -> Result<MergeOutcome> {
        self.guarded(|t| t.record(node))
    }

    fn record(&mut self, node: RefNode) -> Result<MergeOutcome> {
        let persisted = self.fs.extents.ref_count(node.bytenr);
        let outcome = self.refs.record(node, persisted)?;
        self.release_cancelled()?;
        Ok(outcome)
    }

    /// Pins extents whose reservation was given back because every
    /// reference to them cancelled.
    fn release_cancelled(&mut self) -> Result<()> {
        for released in self.refs.take_released() {
            self.fs
                .block_groups
                .release_reserved(released.bytenr, released.num_bytes)?;
            if !released.is_data {
                self.fs.buffers.clean(released.bytenr);
            }
            debug!(bytenr = released.bytenr, "trans.extent.released");
        }
        Ok(())
    }

    fn alloc_bytes(&mut self, kind: BlockGroupKind, len: u64, align: u64) -> Result<u64> {
        if let Some(bytenr) = self.fs.block_groups.alloc(kind, len, align) {
            return Ok(bytenr);
        }
        if kind == BlockGroupKind::System || self.in_chunk_alloc {
            return Err(FsError::NoSpace {
                needed: len,
                available: 0,
            });
        }
        self.alloc_chunk_inner(kind, len)?;
        self.fs
            .block_groups
            .alloc(kind, len, align)
            .ok_or(FsError::NoSpace {
                needed: len,
                available: 0,
            })
    }

    fn alloc_tree_block_inner(&mut self, owner: RootId, level: u8, parent: Option<u64>) -> Result<u64> {
        let nodesize = u64::from(self.fs.options.nodesize);
        let kind = if owner == RootId::CHUNK_TREE {
            BlockGroupKind::System
        } else {
            BlockGroupKind::Metadata
        };
        let bytenr = self.alloc_bytes(kind, nodesize, nodesize)?;
        if kind == BlockGroupKind::Metadata {
            let used = self.reserved.min(nodesize);
            self.reserved -= used;
            self.fs.block_groups.unreserve(BlockGroupKind::Metadata, used);
        }
        let node = RefNode::tree_block(bytenr, nodesize, owner, level, RefAction::AddExtent);
        self.record(node.clone())?;
        if let Some(parent) = parent {
            self.fs.extents.record_contents(parent, node);
        }
        self.fs.buffers.create(bytenr, owner, level, self.transid);
        Ok(bytenr)
    }

    /// Allocates a tree block owned by `owner`. With `parent` the block is
    /// registered as one of the parent's children, so freeing the parent
    /// drops it too.
    pub fn alloc_tree_block(&mut self, owner: RootId, level: u8, parent: Option<u64>) -> Result<u64> {
        self.guarded(|t| t.alloc_tree_block_inner(owner, level, parent))
    }

    /// Allocates a data extent of `len` bytes referenced by the file extent
    /// item of (`root`, `inode`, `offset`) stored in `leaf`.
    pub fn alloc_data_extent(
        &mut self,
        leaf: u64,
        root: RootId,
        inode: u64,
        offset: u64,
        len: u64,
    ) -> Result<u64> {
        self.guarded(|t| {
            let sectorsize = u64::from(t.fs.options.sectorsize);
            if len == 0 {
                return Err(FsError::Invalid("zero-length data extent"));
            }
            let len = len.div_ceil(sectorsize) * sectorsize;
            let bytenr = t.alloc_bytes(BlockGroupKind::Data, len, sectorsize)?;
            let node = RefNode::file_data(bytenr, len, root, inode, offset, RefAction::AddExtent);
            t.record(node.clone())?;
            t.fs.extents.record_contents(leaf, node);
            Ok(bytenr)
        })
    }

    /// Adds `node` as a reference held by the block at `parent`.
    pub fn link_ref(&mut self, parent: u64, mut node: RefNode) -> Result<MergeOutcome> {
        node.action = RefAction::Add;
        self.guarded(|t| {
            let outcome = t.record(node.clone())?;
            t.fs.extents.record_contents(parent, node);
            Ok(outcome)
        })
    }

    /// Drops the reference `node` held by the block at `parent`.
    pub fn unlink_ref(&mut self, parent: u64, mut node: RefNode) -> Result<MergeOutcome> {
        node.action = RefAction::Drop;
        self.guarded(|t| {
            let outcome = t.record(node.clone())?;
            if !t.fs.extents.remove_contents(parent, &node) {
                return Err(FsError::consistency(format!(
                    "block {parent} holds no reference to {}",
                    node.bytenr
                )));
            }
            Ok(outcome)
        })
    }

    /// Drops the owner reference `owner` holds on the tree block at `bytenr`.
    pub fn free_tree_block(&mut self, bytenr: u64, owner: RootId, level: u8) -> Result<MergeOutcome> {
        let nodesize = u64::from(self.fs.options.nodesize);
        self.add_delayed_ref(RefNode::tree_block(bytenr, nodesize, owner, level, RefAction::Drop))
    }

    /// Sets extent record flags once the extent's head runs.
    pub fn set_extent_flags(
        &mut self,
        bytenr: u64,
        num_bytes: u64,
        is_data: bool,
        flags: u64,
    ) -> Result<MergeOutcome> {
        let template = if is_data {
            RefNode::file_data(bytenr, num_bytes, RootId::FS_TREE, 0, 0, RefAction::Add)
        } else {
            RefNode::tree_block(bytenr, num_bytes, RootId::EXTENT_TREE, 0, RefAction::Add)
        };
        self.add_delayed_ref(template.into_head_update(ExtentOp { set_flags: flags }))
    }

    /// Replaces the item bytes of a tree block allocated or copied in this
    /// transaction.
    pub fn write_block(&mut self, bytenr: u64, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.fs.buffers.set_payload(bytenr, payload, self.transid)
    }

    fn create_tree_inner(&mut self, id: RootId) -> Result<u64> {
        if self.fs.roots.get(id).is_some() {
            return Err(FsError::Usage("tree already exists"));
        }
        let bytenr = self.alloc_tree_block_inner(id, 0, None)?;
        self.fs.roots.set_root(
            id,
            RootItem {
                bytenr,
                level: 0,
                generation: self.transid,
            },
        );
        info!(root = %id, bytenr, "trans.tree.created");
        Ok(bytenr)
    }

    /// Creates an empty tree `id` with a fresh root block.
    pub fn create_tree(&mut self, id: RootId) -> Result<u64> {
        self.guarded(|t| t.create_tree_inner(id))
    }

    /// Deletes tree `id`: its root block loses its owner and everything
    /// reachable only through it is freed when the references run.
    pub fn drop_tree(&mut self, id: RootId) -> Result<()> {
        self.guarded(|t| {
            if matches!(id, RootId::ROOT_TREE | RootId::EXTENT_TREE | RootId::CHUNK_TREE) {
                return Err(FsError::Usage("core trees cannot be dropped"));
            }
            let item = t
                .fs
                .roots
                .remove(id)
                .ok_or(FsError::Usage("dropped tree does not exist"))?;
            let nodesize = u64::from(t.fs.options.nodesize);
            t.record(RefNode::tree_block(
                item.bytenr,
                nodesize,
                id,
                item.level,
                RefAction::Drop,
            ))?;
            info!(root = %id, bytenr = item.bytenr, "trans.tree.dropped");
            Ok(())
        })
    }

    pub(crate) fn cow_root(&mut self, id: RootId) -> Result<u64> {
        let item = self
            .fs
            .roots
            .get(id)
            .ok_or_else(|| FsError::consistency(format!("tree {id} has no root")))?;
        if item.generation == self.transid {
            return Ok(item.bytenr);
        }
        let old = item.bytenr;
        let new = self.alloc_tree_block_inner(id, item.level, None)?;
        let nodesize = u64::from(self.fs.options.nodesize);
        self.record(RefNode::tree_block(old, nodesize, id, item.level, RefAction::Drop))?;
        self.fs.buffers.copy_payload(old, new)?;
        for child in self.fs.extents.move_contents(old, new) {
            if child.kind.parent().is_none() {
                continue;
            }
            let mut moved = child.clone();
            let (RefKind::TreeBlock { parent, .. } | RefKind::FileData { parent, .. }) =
                &mut moved.kind;
            *parent = Some(new);
            moved.action = RefAction::Add;
            self.record(moved)?;
            let mut stale = child;
            stale.action = RefAction::Drop;
            self.record(stale)?;
        }
        self.fs.roots.set_root(
            id,
            RootItem {
                bytenr: new,
                level: item.level,
                generation: self.transid,
            },
        );
        debug!(root = %id, old, new, "trans.cow_root");
        Ok(new)
    }

    /// Copies the root block of `id` on its first modification in this
    /// transaction; later calls return the same block.
    pub fn cow_tree_root(&mut self, id: RootId) -> Result<u64> {
        self.guarded(|t| t.cow_root(id))
    }

    fn alloc_chunk_inner(&mut self, kind: BlockGroupKind, min_bytes: u64) -> Result<Chunk> {
        let chunk = self.fs.chunks.allocate_chunk(kind, min_bytes)?;
        self.fs.add_chunk(chunk)?;
        self.in_chunk_alloc = true;
        let adopted = self.adopt_pending_block_groups();
        self.in_chunk_alloc = false;
        adopted?;
        Ok(chunk)
    }

    /// Allocates a new chunk and block group of `kind`.
    pub fn alloc_chunk(&mut self, kind: BlockGroupKind, min_bytes: u64) -> Result<Chunk> {
        self.guarded(|t| t.alloc_chunk_inner(kind, min_bytes))
    }

    /// Queues a block group's accounting record for writing.
    pub fn mark_block_group_dirty(&mut self, start: u64) -> Result<()> {
        self.ensure_open()?;
        if self.fs.block_groups.group(start).is_none() {
            return Err(FsError::Invalid("unknown block group"));
        }
        self.dirty_bgs.insert(start);
        Ok(())
    }

    /// Holds back merging of references recorded from now on, as a backref
    /// walker needs.
    pub fn acquire_ref_seq(&mut self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.refs.acquire_seq())
    }

    /// Releases a barrier from [`acquire_ref_seq`](Self::acquire_ref_seq).
    pub fn release_ref_seq(&mut self, seq: u64) -> Result<()> {
        self.ensure_open()?;
        self.refs.release_seq(seq)
    }

    /// Ends the transaction without committing; the session is aborted with
    /// `err`, which is returned.
    pub fn abort(mut self, err: FsError) -> FsError {
        self.abort_inner(err)
    }

    fn abort_inner(&mut self, err: FsError) -> FsError {
        if self.done {
            return err;
        }
        self.fs.set_aborted(&err);
        let discarded = self.fs.buffers.discard_dirty();
        let dropped = self.refs.destroy();
        self.dirty_bgs.clear();
        self.fs.roots.clear_dirty();
        self.fs
            .block_groups
            .unreserve(BlockGroupKind::Metadata, self.reserved);
        self.reserved = 0;
        self.fs.running = false;
        self.done = true;
        error!(
            transid = self.transid,
            code = %err.code(),
            discarded,
            dropped,
            error = %err,
            "trans.abort"
        );
        err
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            error!(transid = self.transid, "trans.dropped_while_open");
            self.abort_inner(FsError::Usage(
                "transaction handle dropped without commit or abort",
            ));
        }
    }
}
