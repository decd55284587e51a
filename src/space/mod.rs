//! Block groups, free space and chunk allocation.

mod block_group;
mod chunk;
mod free_space;

use std::fmt;

pub use block_group::{BlockGroup, BlockGroupCache};
pub use chunk::{Chunk, ChunkAllocator, DeviceChunkAllocator, RESERVED_PREFIX};
pub use free_space::FreeSpace;

/// Allocation profile of a block group.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BlockGroupKind {
    /// File data.
    Data,
    /// Tree blocks of every tree except the chunk tree.
    Metadata,
    /// Chunk tree blocks.
    System,
}

impl BlockGroupKind {
    /// On-disk type flag.
    pub fn flags(self) -> u64 {
        match self {
            BlockGroupKind::Data => 1 << 0,
            BlockGroupKind::System => 1 << 1,
            BlockGroupKind::Metadata => 1 << 2,
        }
    }

    /// Inverse of [`flags`](Self::flags).
    pub fn from_flags(flags: u64) -> Option<Self> {
        match flags {
            1 => Some(BlockGroupKind::Data),
            2 => Some(BlockGroupKind::System),
            4 => Some(BlockGroupKind::Metadata),
            _ => None,
        }
    }
}

impl fmt::Display for BlockGroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockGroupKind::Data => "data",
            BlockGroupKind::Metadata => "metadata",
            BlockGroupKind::System => "system",
        })
    }
}

/// Space accounting summed over every group of one profile.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpaceInfo {
    /// Profile.
    pub kind: BlockGroupKind,
    /// Bytes in all groups.
    pub total: u64,
    /// Bytes owned by extent records.
    pub used: u64,
    /// Bytes allocated but not yet recorded.
    pub reserved: u64,
    /// Bytes freed this transaction.
    pub pinned: u64,
    /// Bytes promised to running transactions.
    pub may_use: u64,
    /// Bytes held by superblock copies.
    pub bytes_super: u64,
}

impl Default for SpaceInfo {
    fn default() -> Self {
        Self {
            kind: BlockGroupKind::Metadata,
            total: 0,
            used: 0,
            reserved: 0,
            pinned: 0,
            may_use: 0,
            bytes_super: 0,
        }
    }
}

impl SpaceInfo {
    /// Bytes a new reservation can still claim.
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(
            self.used + self.reserved + self.pinned + self.may_use + self.bytes_super,
        )
    }
}
