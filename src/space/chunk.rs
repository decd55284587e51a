use tracing::info;

use super::BlockGroupKind;
use crate::config::FsOptions;
use crate::types::{FsError, Result};

/// Bytes at the start of every device that are never handed out.
pub const RESERVED_PREFIX: u64 = 1024 * 1024;

/// Range handed out by a [`ChunkAllocator`]; logical and physical addresses
/// are identical on a single device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// Start offset.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// Profile the chunk backs.
    pub kind: BlockGroupKind,
}

/// Source of new chunks for block groups.
pub trait ChunkAllocator {
    /// Hands out a chunk of at least `min_bytes` for `kind`.
    fn allocate_chunk(&mut self, kind: BlockGroupKind, min_bytes: u64) -> Result<Chunk>;

    /// Hands out a metadata chunk of at least `min_bytes`.
    fn allocate_metadata_chunk(&mut self, min_bytes: u64) -> Result<Chunk> {
        self.allocate_chunk(BlockGroupKind::Metadata, min_bytes)
    }

    /// Offset the next chunk would start at.
    fn cursor(&self) -> u64;
}

/// Linear allocator that carves chunks from the device front to back.
#[derive(Clone, Debug)]
pub struct DeviceChunkAllocator {
    cursor: u64,
    device_size: u64,
    align: u64,
    system_size: u64,
    metadata_size: u64,
    data_size: u64,
}

impl DeviceChunkAllocator {
    /// Starts allocating right after the reserved prefix.
    pub fn new(device_size: u64, options: &FsOptions) -> Self {
        Self::resume(RESERVED_PREFIX, device_size, options)
    }

    /// Continues from a cursor persisted in the superblock.
    pub fn resume(cursor: u64, device_size: u64, options: &FsOptions) -> Self {
        Self {
            cursor,
            device_size,
            align: u64::from(options.nodesize).max(u64::from(options.sectorsize)),
            system_size: options.system_chunk_size,
            metadata_size: options.metadata_chunk_size,
            data_size: options.data_chunk_size,
        }
    }

    /// Bytes still unallocated on the device.
    pub fn remaining(&self) -> u64 {
        self.device_size.saturating_sub(self.cursor)
    }

    fn preferred(&self, kind: BlockGroupKind) -> u64 {
        match kind {
            BlockGroupKind::System => self.system_size,
            BlockGroupKind::Metadata => self.metadata_size,
            BlockGroupKind::Data => self.data_size,
        }
    }
}

impl ChunkAllocator for DeviceChunkAllocator {
    fn allocate_chunk(&mut self, kind: BlockGroupKind, min_bytes: u64) -> Result<Chunk> {
        let usable = self.remaining() / self.align * self.align;
        let Some(min_bytes) = min_bytes.max(1).div_ceil(self.align).checked_mul(self.align) else {
            return Err(FsError::NoSpace {
                needed: min_bytes,
                available: usable,
            });
        };
        let length = self.preferred(kind).max(min_bytes).min(usable);
        if length < min_bytes || length == 0 {
            return Err(FsError::NoSpace {
                needed: min_bytes,
                available: usable,
            });
        }
        let chunk = Chunk {
            start: self.cursor,
            length,
            kind,
        };
        self.cursor += length;
        info!(start = chunk.start, length, %kind, "space.chunk.allocated");
        Ok(chunk)
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    #[test]
    fn chunks_shrink_to_fit_then_run_out() {
        let options = FsOptions::default()
            .metadata_chunk_size(8 * MIB)
            .data_chunk_size(8 * MIB);
        let mut alloc = DeviceChunkAllocator::new(12 * MIB, &options);
        let first = alloc.allocate_metadata_chunk(1).unwrap();
        assert_eq!((first.start, first.length), (MIB, 8 * MIB));

        let second = alloc.allocate_chunk(BlockGroupKind::Data, 4096).unwrap();
        assert_eq!((second.start, second.length), (9 * MIB, 3 * MIB));

        let err = alloc.allocate_metadata_chunk(16384).unwrap_err();
        assert!(matches!(err, FsError::NoSpace { available: 0, .. }));
        assert_eq!(alloc.cursor(), 12 * MIB);
    }

    #[test]
    fn minimum_larger_than_preferred_wins() {
        let options = FsOptions::default().metadata_chunk_size(MIB);
        let mut alloc = DeviceChunkAllocator::resume(4 * MIB, 64 * MIB, &options);
        let chunk = alloc.allocate_metadata_chunk(3 * MIB).unwrap();
        assert_eq!((chunk.start, chunk.length), (4 * MIB, 3 * MIB));
    }

    #[test]
    fn unrepresentable_minimum_is_no_space() {
        let options = FsOptions::default();
        let mut alloc = DeviceChunkAllocator::new(64 * MIB, &options);
        let before = alloc.cursor();
        let err = alloc.allocate_metadata_chunk(u64::MAX).unwrap_err();
        assert!(matches!(err, FsError::NoSpace { needed: u64::MAX, .. }));
        assert_eq!(alloc.cursor(), before);
    }
}
