use std::sync::{Arc, Once};

use cowfs::delayed_ref::{MergeOutcome, RefKey, EXTENT_FLAG_FULL_BACKREF, EXTENT_FLAG_TREE_BLOCK};
use cowfs::disk::probe;
use cowfs::roots::RootTree;
use cowfs::space::BlockGroupKind;
use cowfs::{AbortCode, Filesystem, FsError, FsOptions, MemDevice, RefAction, RefNode, RootId};
use tracing_subscriber::EnvFilter;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const NODE: u64 = 16 * KIB;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cowfs=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn small_options() -> FsOptions {
    FsOptions::default()
        .system_chunk_size(MIB)
        .metadata_chunk_size(8 * MIB)
        .data_chunk_size(8 * MIB)
}

fn mkfs_with(size: u64, options: FsOptions) -> (MemDevice, Filesystem) {
    init_tracing();
    let dev = MemDevice::new(size);
    let fs = Filesystem::format(Arc::new(dev.clone()), options).unwrap();
    (dev, fs)
}

fn mkfs() -> (MemDevice, Filesystem) {
    mkfs_with(32 * MIB, small_options())
}

#[test]
fn format_commits_the_first_generation() {
    let (dev, fs) = mkfs();
    assert_eq!(fs.generation(), 1);
    assert_eq!(fs.super_block().generation, 1);
    assert!(!fs.is_running());
    assert_eq!(fs.buffers().dirty_count(), 0);
    assert!(!fs.roots().has_dirty());

    for id in [
        RootId::ROOT_TREE,
        RootId::EXTENT_TREE,
        RootId::CHUNK_TREE,
        RootId::DEV_TREE,
        RootId::FS_TREE,
        RootId::CSUM_TREE,
    ] {
        let root = fs.roots().get(id).unwrap();
        let item = fs.extents().item(root.bytenr).unwrap();
        assert_eq!(item.refs, 1, "root of tree {id}");
        assert_eq!(item.flags, EXTENT_FLAG_TREE_BLOCK);
        assert_eq!(fs.roots().commit_root(id), Some(root));
    }
    let chunk_root = fs.roots().get(RootId::CHUNK_TREE).unwrap().bytenr;
    let system = fs.block_groups().group_containing(chunk_root).unwrap();
    assert_eq!(system.kind, BlockGroupKind::System);

    for group in fs.block_groups().groups() {
        let item = fs.extents().block_group_item(group.start).unwrap();
        assert_eq!(item.used, group.used);
        assert_eq!(group.reserved, 0);
        assert_eq!(group.pinned, 0);
    }
    assert_eq!(
        fs.super_block().bytes_used,
        fs.extents().bytes_referenced()
    );

    let found = probe(&dev).unwrap();
    assert_eq!(found.super_block.generation, 1);
    assert_eq!(found.super_block.fsid, fs.fsid());
    assert_eq!(found.root.owner, RootId::ROOT_TREE);
    assert_eq!(
        found.super_block.root,
        fs.roots().get(RootId::ROOT_TREE).unwrap().bytenr
    );
}

#[test]
fn commit_drains_every_reference() {
    let (_dev, mut fs) = mkfs();
    let mut trans = fs.start_transaction(2).unwrap();
    let leaf = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let data = trans
        .alloc_data_extent(leaf, RootId::FS_TREE, 257, 0, 10_000)
        .unwrap();
    assert!(trans.delayed_refs().num_heads() >= 3);

    trans.run_delayed_refs(None).unwrap();
    assert!(trans.delayed_refs().is_empty());
    assert_eq!(trans.delayed_refs().num_entries(), 0);

    assert_eq!(trans.commit().unwrap(), 2);
    assert_eq!(fs.generation(), 2);
    assert_eq!(fs.buffers().dirty_count(), 0);
    assert!(!fs.roots().has_dirty());

    let item = fs.extents().item(data).unwrap();
    assert_eq!(item.num_bytes, 12 * KIB);
    assert_eq!(item.refs, 1);
    assert_eq!(
        item.backref(RefKey::ExtentData {
            root: RootId::FS_TREE,
            inode: 257,
            offset: 0
        }),
        1
    );
    for group in fs.block_groups().groups() {
        assert_eq!(fs.extents().block_group_item(group.start).unwrap().used, group.used);
    }
}

#[test]
fn bounded_runs_take_heads_round_robin() {
    let (_dev, mut fs) = mkfs();
    let mut trans = fs.start_transaction(3).unwrap();
    for _ in 0..3 {
        trans.alloc_tree_block(RootId::FS_TREE, 0, None).unwrap();
    }
    assert_eq!(trans.delayed_refs().num_heads(), 3);

    // The extent root is copied first, which queues two more heads.
    assert_eq!(trans.run_delayed_refs(Some(2)).unwrap(), 2);
    assert_eq!(trans.delayed_refs().num_heads(), 3);
    assert!(trans.delayed_refs().run_delayed_start() > 0);

    assert_eq!(trans.run_delayed_refs(None).unwrap(), 3);
    assert!(trans.delayed_refs().is_empty());
    trans.commit().unwrap();
}

#[test]
fn dropping_a_tree_cascades_to_its_children() {
    let (_dev, mut fs) = mkfs();

    let mut trans = fs.start_transaction(3).unwrap();
    let leaf = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let child = trans
        .alloc_tree_block(RootId::FS_TREE, 0, Some(leaf))
        .unwrap();
    let data = trans
        .alloc_data_extent(leaf, RootId::FS_TREE, 257, 0, 8 * KIB)
        .unwrap();
    trans.commit().unwrap();
    assert_eq!(fs.extents().contents(leaf).len(), 2);
    assert!(fs.extents().item(child).is_some());

    let mut trans = fs.start_transaction(1).unwrap();
    trans.drop_tree(RootId::FS_TREE).unwrap();
    trans.commit().unwrap();

    for bytenr in [leaf, child, data] {
        assert!(fs.extents().item(bytenr).is_none(), "extent {bytenr} survived");
        let group = fs.block_groups().group_containing(bytenr).unwrap();
        assert!(group.is_free(bytenr, 8 * KIB));
    }
    assert!(fs.extents().contents(leaf).is_empty());
    assert!(fs.roots().get(RootId::FS_TREE).is_none());
    assert_eq!(fs.block_groups().pinned_extents().count(), 0);

    let root_tree = fs.roots().get(RootId::ROOT_TREE).unwrap();
    let payload = &fs.buffers().get(root_tree.bytenr).unwrap().payload;
    let items = RootTree::decode_items(payload).unwrap();
    assert!(items.iter().all(|(id, _)| *id != RootId::FS_TREE));
}

#[test]
fn core_trees_cannot_be_dropped() {
    let (_dev, mut fs) = mkfs();
    let mut trans = fs.start_transaction(0).unwrap();
    let err = trans.drop_tree(RootId::EXTENT_TREE).unwrap_err();
    assert!(matches!(err, FsError::Usage(_)));
    drop(trans);
    assert_eq!(fs.abort_code(), Some(AbortCode::Usage));
}

#[test]
fn cowonly_root_updates_converge() {
    let (dev, mut fs) = mkfs();
    let mut trans = fs.start_transaction(2).unwrap();
    let csum = trans.cow_tree_root(RootId::CSUM_TREE).unwrap();
    assert_eq!(trans.cow_tree_root(RootId::CSUM_TREE).unwrap(), csum);
    trans.cow_tree_root(RootId::DEV_TREE).unwrap();
    trans.commit().unwrap();

    for id in [
        RootId::ROOT_TREE,
        RootId::EXTENT_TREE,
        RootId::DEV_TREE,
        RootId::CSUM_TREE,
    ] {
        let root = fs.roots().get(id).unwrap();
        assert_eq!(root.generation, 2, "tree {id}");
        assert_eq!(fs.roots().commit_root(id), Some(root));
    }
    assert_eq!(fs.roots().get(RootId::FS_TREE).unwrap().generation, 1);

    let root_tree = fs.roots().get(RootId::ROOT_TREE).unwrap();
    let payload = &fs.buffers().get(root_tree.bytenr).unwrap().payload;
    let items = RootTree::decode_items(payload).unwrap();
    for (id, item) in items {
        assert_eq!(fs.roots().get(id), Some(item));
    }

    let found = probe(&dev).unwrap();
    assert_eq!(found.super_block.generation, 2);
    assert_eq!(found.super_block.root, root_tree.bytenr);
    assert_eq!(found.root.generation, 2);
}

#[test]
fn exceeding_the_pass_bound_aborts() {
    let (_dev, mut fs) = mkfs_with(32 * MIB, small_options().max_commit_passes(1));
    let mut trans = fs.start_transaction(1).unwrap();
    trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let err = trans.commit().unwrap_err();
    assert!(matches!(err, FsError::Consistency(_)));
    assert_eq!(fs.abort_code(), Some(AbortCode::Consistency));
    assert_eq!(fs.generation(), 1);
    assert!(!fs.is_running());
}

#[test]
fn flag_updates_apply_at_head_completion() {
    let (_dev, mut fs) = mkfs();
    let csum = fs.roots().get(RootId::CSUM_TREE).unwrap().bytenr;

    let mut trans = fs.start_transaction(1).unwrap();
    let leaf = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let outcome = trans
        .set_extent_flags(leaf, NODE, false, EXTENT_FLAG_FULL_BACKREF)
        .unwrap();
    assert_eq!(outcome, MergeOutcome::HeadOnly);
    trans
        .set_extent_flags(csum, NODE, false, EXTENT_FLAG_FULL_BACKREF)
        .unwrap();
    assert!(trans.delayed_refs().find_head(csum).unwrap().is_empty());
    trans.commit().unwrap();

    for bytenr in [leaf, csum] {
        let item = fs.extents().item(bytenr).unwrap();
        assert_eq!(item.flags, EXTENT_FLAG_TREE_BLOCK | EXTENT_FLAG_FULL_BACKREF);
        assert_eq!(item.refs, 1);
    }
}

#[test]
fn freed_extents_stay_pinned_until_commit() {
    let (_dev, mut fs) = mkfs();
    let old = fs.roots().get(RootId::FS_TREE).unwrap().bytenr;

    let mut trans = fs.start_transaction(1).unwrap();
    trans.cow_tree_root(RootId::FS_TREE).unwrap();
    trans.run_delayed_refs(None).unwrap();
    assert!(trans
        .fs()
        .block_groups()
        .pinned_extents()
        .any(|(bytenr, len)| bytenr == old && len == NODE));
    let group = trans.fs().block_groups().group_containing(old).unwrap();
    assert!(!group.is_free(old, NODE));
    assert!(group.pinned >= NODE);
    trans.commit().unwrap();

    assert_eq!(fs.block_groups().pinned_extents().count(), 0);
    let group = fs.block_groups().group_containing(old).unwrap();
    assert!(group.is_free(old, NODE));
    assert_eq!(group.pinned, 0);
}

#[test]
fn cancelled_allocation_returns_its_space() {
    let (_dev, mut fs) = mkfs();
    let mut trans = fs.start_transaction(1).unwrap();
    let block = trans.alloc_tree_block(RootId::FS_TREE, 0, None).unwrap();
    assert!(trans.fs().buffers().is_dirty(block));
    let outcome = trans.free_tree_block(block, RootId::FS_TREE, 0).unwrap();
    assert_eq!(outcome, MergeOutcome::Cancelled);
    assert!(trans.delayed_refs().find_head(block).is_none());
    assert!(trans.fs().buffers().get(block).is_none());
    assert!(trans
        .fs()
        .block_groups()
        .pinned_extents()
        .any(|(bytenr, _)| bytenr == block));
    trans.commit().unwrap();

    assert!(fs.extents().item(block).is_none());
    let group = fs.block_groups().group_containing(block).unwrap();
    assert!(group.is_free(block, NODE));
}

#[test]
fn shared_references_follow_their_parent() {
    let (_dev, mut fs) = mkfs();

    let mut trans = fs.start_transaction(2).unwrap();
    let leaf = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let data = trans
        .alloc_data_extent(leaf, RootId::FS_TREE, 257, 0, 4 * KIB)
        .unwrap();
    trans.commit().unwrap();

    let mut trans = fs.start_transaction(2).unwrap();
    let leaf2 = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let shared = RefNode::shared_file_data(data, 4 * KIB, leaf2, RootId::FS_TREE, 258, 0, RefAction::Add);
    trans.link_ref(leaf2, shared).unwrap();
    trans.commit().unwrap();
    let item = fs.extents().item(data).unwrap();
    assert_eq!(item.refs, 2);
    assert_eq!(item.backref(RefKey::SharedData { parent: leaf2 }), 1);

    let mut trans = fs.start_transaction(2).unwrap();
    let leaf3 = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    trans.commit().unwrap();
    let item = fs.extents().item(data).unwrap();
    assert_eq!(item.refs, 2);
    assert_eq!(item.backref(RefKey::SharedData { parent: leaf2 }), 0);
    assert_eq!(item.backref(RefKey::SharedData { parent: leaf3 }), 1);

    let mut trans = fs.start_transaction(2).unwrap();
    let leaf4 = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let stale = RefNode::shared_file_data(data, 4 * KIB, leaf4, RootId::FS_TREE, 258, 0, RefAction::Drop);
    trans.unlink_ref(leaf4, stale).unwrap();
    trans.commit().unwrap();
    let item = fs.extents().item(data).unwrap();
    assert_eq!(item.refs, 1);
    assert_eq!(item.backrefs().count(), 1);
}

/// Device just big enough for the format chunks, with a metadata chunk
/// that leaves less than one item's reservation free.
fn tight_options() -> FsOptions {
    FsOptions::default()
        .system_chunk_size(MIB)
        .metadata_chunk_size(128 * KIB)
        .data_chunk_size(MIB)
}

#[test]
fn admission_fails_without_metadata_space() {
    let (_dev, mut fs) = mkfs_with(
        4 * MIB,
        tight_options().data_chunk_size(1024 * MIB),
    );
    let available = fs
        .block_groups()
        .space_info(BlockGroupKind::Metadata)
        .available();
    assert!(available < cowfs::calc_trans_metadata_size(fs.options().nodesize, 1));

    match fs.start_transaction(1) {
        Err(FsError::NoSpace { needed, .. }) => assert_eq!(needed, 256 * KIB),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("transaction admitted without space"),
    }
    assert!(!fs.is_running());
    assert_eq!(fs.abort_code(), None);
    assert_eq!(
        fs.block_groups().space_info(BlockGroupKind::Metadata).may_use,
        0
    );

    let trans = fs.start_transaction(0).unwrap();
    assert_eq!(trans.commit().unwrap(), 2);
}

#[test]
fn admission_grows_a_metadata_chunk_once() {
    let (_dev, mut fs) = mkfs_with(16 * MIB, tight_options());
    let before = fs.block_groups().space_info(BlockGroupKind::Metadata).total;
    let groups = fs.block_groups().groups().count();

    let trans = fs.start_transaction(1).unwrap();
    assert_eq!(trans.reserved_bytes(), 256 * KIB - NODE);
    assert!(trans.dirty_block_groups().count() >= 1);
    trans.commit().unwrap();

    assert_eq!(fs.block_groups().groups().count(), groups + 1);
    let info = fs.block_groups().space_info(BlockGroupKind::Metadata);
    assert!(info.total >= before + 256 * KIB);
    assert_eq!(info.may_use, 0);
    for group in fs.block_groups().groups() {
        assert!(fs.extents().block_group_item(group.start).is_some());
    }
    let end = fs
        .block_groups()
        .groups()
        .map(|group| group.start + group.length)
        .max()
        .unwrap();
    assert_eq!(fs.super_block().chunk_cursor, end);
}

#[test]
fn oversized_item_count_is_refused_cleanly() {
    let (_dev, mut fs) = mkfs();
    let chunk_cursor = fs.super_block().chunk_cursor;
    match fs.start_transaction(u64::MAX) {
        Err(FsError::NoSpace { needed, .. }) => assert_eq!(needed, u64::MAX),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("transaction admitted without space"),
    };
    assert!(!fs.is_running());
    assert_eq!(fs.abort_code(), None);
    assert_eq!(
        fs.block_groups().space_info(BlockGroupKind::Metadata).may_use,
        0
    );
    assert_eq!(fs.super_block().chunk_cursor, chunk_cursor);

    let trans = fs.start_transaction(1).unwrap();
    assert_eq!(trans.commit().unwrap(), 2);
}

#[test]
fn leaked_handle_blocks_the_next_transaction() {
    let (_dev, mut fs) = mkfs();
    let trans = fs.start_transaction(0).unwrap();
    std::mem::forget(trans);
    assert!(fs.is_running());
    match fs.start_transaction(0) {
        Err(err) => assert_eq!(err.code(), AbortCode::Usage),
        Ok(_) => panic!("second handle admitted"),
    };
}

#[test]
fn dropped_handle_aborts_the_session() {
    let (_dev, mut fs) = mkfs();
    {
        let mut trans = fs.start_transaction(1).unwrap();
        trans.cow_tree_root(RootId::FS_TREE).unwrap();
    }
    assert_eq!(fs.abort_code(), Some(AbortCode::Usage));
    assert!(!fs.is_running());
    assert_eq!(fs.buffers().dirty_count(), 0);
    assert_eq!(fs.generation(), 1);
    assert_eq!(
        fs.block_groups().space_info(BlockGroupKind::Metadata).may_use,
        0
    );
}

#[test]
fn aborted_session_rejects_work() {
    let (_dev, mut fs) = mkfs();
    let mut trans = fs.start_transaction(1).unwrap();
    let err = trans
        .set_extent_flags(1 << 40, NODE, false, EXTENT_FLAG_FULL_BACKREF)
        .unwrap_err();
    assert!(matches!(err, FsError::Consistency(_)));
    assert!(trans.delayed_refs().is_empty());

    let err = trans.alloc_tree_block(RootId::FS_TREE, 0, None).unwrap_err();
    assert!(matches!(
        err,
        FsError::Aborted {
            code: AbortCode::Consistency,
            ..
        }
    ));
    assert_eq!(err.errno(), 30);
    let err = trans.commit().unwrap_err();
    assert_eq!(err.code(), AbortCode::Consistency);

    let err = fs.start_transaction(0).err().unwrap();
    assert!(matches!(err, FsError::Aborted { .. }));
    assert_eq!(fs.abort_code(), Some(AbortCode::Consistency));
}

#[test]
fn invalid_arguments_do_not_abort() {
    let (_dev, mut fs) = mkfs();
    let mut trans = fs.start_transaction(1).unwrap();
    let leaf = trans.cow_tree_root(RootId::FS_TREE).unwrap();
    let err = trans
        .alloc_data_extent(leaf, RootId::FS_TREE, 257, 0, 0)
        .unwrap_err();
    assert!(matches!(err, FsError::Invalid(_)));
    let zero = RefNode::tree_block(leaf, NODE, RootId::FS_TREE, 0, RefAction::Add).with_ref_mod(0);
    assert!(matches!(trans.add_delayed_ref(zero), Err(FsError::Invalid(_))));
    assert!(trans.mark_block_group_dirty(3).is_err());
    trans.commit().unwrap();
    assert_eq!(fs.abort_code(), None);
}

#[test]
fn format_rejects_bad_options() {
    let dev = MemDevice::new(32 * MIB);
    let err = Filesystem::format(Arc::new(dev), small_options().nodesize(12 * 1024))
        .err()
        .unwrap();
    assert_eq!(err.code(), AbortCode::Invalid);
}
