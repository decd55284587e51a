//! On-device formats: tree blocks, dirty-buffer writeback and superblocks.

mod buffer;
mod super_block;

pub use buffer::{read_block, BlockHeader, BufferStore, ExtentBuffer, BLOCK_HDR_LEN, BLOCK_MAGIC};
pub use super_block::{
    mirror_offsets, quorum, read_latest, restore_supers, write_supers, SuperBlock, SUPER_INFO_SIZE,
    SUPER_MAGIC, SUPER_MIRROR_OFFSETS,
};

use tracing::info;

use crate::primitives::io::FileIo;
use crate::types::{FsError, Result, RootId};

/// What a read-only inspection of an image found.
#[derive(Clone, Debug)]
pub struct Probe {
    /// Newest valid superblock.
    pub super_block: SuperBlock,
    /// Header of the root tree's root block.
    pub root: BlockHeader,
    /// Header of the chunk tree's root block.
    pub chunk_root: BlockHeader,
}

/// Loads the newest superblock and verifies the root blocks it points at.
pub fn probe(io: &dyn FileIo) -> Result<Probe> {
    let super_block = read_latest(io)?;
    let (root, _) = read_block(io, super_block.root, super_block.fsid, super_block.nodesize)?;
    let (chunk_root, _) = read_block(
        io,
        super_block.chunk_root,
        super_block.fsid,
        super_block.nodesize,
    )?;
    if root.owner != RootId::ROOT_TREE || chunk_root.owner != RootId::CHUNK_TREE {
        return Err(FsError::Corruption("superblock root points at a foreign tree"));
    }
    if root.generation > super_block.generation
        || chunk_root.generation > super_block.generation
    {
        return Err(FsError::Corruption("root block newer than its superblock"));
    }
    info!(
        generation = super_block.generation,
        root = super_block.root,
        chunk_root = super_block.chunk_root,
        "disk.probe"
    );
    Ok(Probe {
        super_block,
        root,
        chunk_root,
    })
}
