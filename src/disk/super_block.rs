use std::ops::Range;

use tracing::{debug, warn};

use super::buffer::{be_u32, be_u64};
use crate::primitives::io::FileIo;
use crate::types::{super_crc32, FsError, Result};

/// Magic identifying a superblock copy.
pub const SUPER_MAGIC: [u8; 8] = *b"_COWFSM1";
/// Bytes occupied by each superblock copy.
pub const SUPER_INFO_SIZE: usize = 4096;
/// Offsets of the primary copy and its mirrors.
pub const SUPER_MIRROR_OFFSETS: [u64; 3] = [64 * 1024, 64 * 1024 * 1024, 256 << 30];

const SB_CSUM: Range<usize> = 0..4;
const SB_MAGIC: Range<usize> = 4..12;
const SB_FSID: Range<usize> = 12..20;
const SB_BYTENR: Range<usize> = 20..28;
const SB_GENERATION: Range<usize> = 28..36;
const SB_ROOT: Range<usize> = 36..44;
const SB_CHUNK_ROOT: Range<usize> = 44..52;
const SB_CHUNK_ROOT_GENERATION: Range<usize> = 52..60;
const SB_TOTAL_BYTES: Range<usize> = 60..68;
const SB_BYTES_USED: Range<usize> = 68..76;
const SB_CHUNK_CURSOR: Range<usize> = 76..84;
const SB_NODESIZE: Range<usize> = 84..88;
const SB_SECTORSIZE: Range<usize> = 88..92;
const SB_ROOT_LEVEL: usize = 92;
const SB_CHUNK_ROOT_LEVEL: usize = 93;
const SB_NUM_MIRRORS: usize = 94;

/// Durable entry point of the filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SuperBlock {
    /// Filesystem id.
    pub fsid: u64,
    /// Offset of this copy; rewritten per mirror.
    pub bytenr: u64,
    /// Last committed transaction.
    pub generation: u64,
    /// Root block of the root tree.
    pub root: u64,
    /// Level of the root tree's root block.
    pub root_level: u8,
    /// Root block of the chunk tree.
    pub chunk_root: u64,
    /// Level of the chunk tree's root block.
    pub chunk_root_level: u8,
    /// Transaction that last moved the chunk root.
    pub chunk_root_generation: u64,
    /// Device size.
    pub total_bytes: u64,
    /// Bytes owned by extent records.
    pub bytes_used: u64,
    /// Next chunk allocation offset.
    pub chunk_cursor: u64,
    /// Tree block size.
    pub nodesize: u32,
    /// Data sector size.
    pub sectorsize: u32,
    /// Number of copies written per commit.
    pub num_mirrors: u8,
}

impl SuperBlock {
    /// Serializes one copy.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SUPER_INFO_SIZE];
        buf[SB_MAGIC].copy_from_slice(&SUPER_MAGIC);
        buf[SB_FSID].copy_from_slice(&self.fsid.to_be_bytes());
        buf[SB_BYTENR].copy_from_slice(&self.bytenr.to_be_bytes());
        buf[SB_GENERATION].copy_from_slice(&self.generation.to_be_bytes());
        buf[SB_ROOT].copy_from_slice(&self.root.to_be_bytes());
        buf[SB_CHUNK_ROOT].copy_from_slice(&self.chunk_root.to_be_bytes());
        buf[SB_CHUNK_ROOT_GENERATION].copy_from_slice(&self.chunk_root_generation.to_be_bytes());
        buf[SB_TOTAL_BYTES].copy_from_slice(&self.total_bytes.to_be_bytes());
        buf[SB_BYTES_USED].copy_from_slice(&self.bytes_used.to_be_bytes());
        buf[SB_CHUNK_CURSOR].copy_from_slice(&self.chunk_cursor.to_be_bytes());
        buf[SB_NODESIZE].copy_from_slice(&self.nodesize.to_be_bytes());
        buf[SB_SECTORSIZE].copy_from_slice(&self.sectorsize.to_be_bytes());
        buf[SB_ROOT_LEVEL] = self.root_level;
        buf[SB_CHUNK_ROOT_LEVEL] = self.chunk_root_level;
        buf[SB_NUM_MIRRORS] = self.num_mirrors;
        let crc = super_crc32(&buf[SB_CSUM.end..]);
        buf[SB_CSUM].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses and verifies one copy.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPER_INFO_SIZE {
            return Err(FsError::Corruption("superblock truncated"));
        }
        let buf = &buf[..SUPER_INFO_SIZE];
        if buf[SB_MAGIC] != SUPER_MAGIC {
            return Err(FsError::Corruption("invalid superblock magic"));
        }
        if be_u32(buf, SB_CSUM) != super_crc32(&buf[SB_CSUM.end..]) {
            return Err(FsError::Corruption("superblock checksum mismatch"));
        }
        let sb = Self {
            fsid: be_u64(buf, SB_FSID),
            bytenr: be_u64(buf, SB_BYTENR),
            generation: be_u64(buf, SB_GENERATION),
            root: be_u64(buf, SB_ROOT),
            root_level: buf[SB_ROOT_LEVEL],
            chunk_root: be_u64(buf, SB_CHUNK_ROOT),
            chunk_root_level: buf[SB_CHUNK_ROOT_LEVEL],
            chunk_root_generation: be_u64(buf, SB_CHUNK_ROOT_GENERATION),
            total_bytes: be_u64(buf, SB_TOTAL_BYTES),
            bytes_used: be_u64(buf, SB_BYTES_USED),
            chunk_cursor: be_u64(buf, SB_CHUNK_CURSOR),
            nodesize: be_u32(buf, SB_NODESIZE),
            sectorsize: be_u32(buf, SB_SECTORSIZE),
            num_mirrors: buf[SB_NUM_MIRRORS],
        };
        if !sb.nodesize.is_power_of_two() || !sb.sectorsize.is_power_of_two() {
            return Err(FsError::Corruption("superblock block sizes invalid"));
        }
        Ok(sb)
    }
}

/// Mirror offsets that fit on a device of `device_size` bytes, capped at
/// `wanted` copies.
pub fn mirror_offsets(device_size: u64, wanted: u32) -> Vec<u64> {
    SUPER_MIRROR_OFFSETS
        .iter()
        .copied()
        .filter(|off| off + SUPER_INFO_SIZE as u64 <= device_size)
        .take(wanted as usize)
        .collect()
}

/// Copies needed for a publish to count.
pub fn quorum(copies: usize) -> usize {
    copies / 2 + 1
}

/// Writes `sb` to every mirror and syncs. Succeeds only when a quorum of
/// copies reached stable storage.
pub fn write_supers(io: &dyn FileIo, sb: &SuperBlock, mirrors: &[u64]) -> Result<usize> {
    let required = quorum(mirrors.len());
    let mut written = 0;
    for &offset in mirrors {
        let copy = SuperBlock {
            bytenr: offset,
            ..*sb
        };
        match io.write_at(offset, &copy.encode()) {
            Ok(()) => written += 1,
            Err(err) => warn!(offset, error = %err, "disk.super.mirror_failed"),
        }
    }
    if written < required {
        return Err(FsError::PublishFailed { written, required });
    }
    if let Err(err) = io.sync_all() {
        warn!(error = %err, "disk.super.sync_failed");
        return Err(FsError::PublishFailed {
            written: 0,
            required,
        });
    }
    debug!(generation = sb.generation, written, "disk.super.published");
    Ok(written)
}

/// Puts `previous` back on every mirror after a failed publish so no copy
/// keeps the generation that did not reach quorum. Best effort: returns the
/// number of mirrors rewritten.
pub fn restore_supers(io: &dyn FileIo, previous: &SuperBlock, mirrors: &[u64]) -> usize {
    let mut restored = 0;
    for &offset in mirrors {
        let copy = SuperBlock {
            bytenr: offset,
            ..*previous
        };
        match io.write_at(offset, &copy.encode()) {
            Ok(()) => restored += 1,
            Err(err) => warn!(offset, error = %err, "disk.super.restore_failed"),
        }
    }
    if let Err(err) = io.sync_all() {
        warn!(error = %err, "disk.super.restore_sync_failed");
    }
    debug!(generation = previous.generation, restored, "disk.super.restored");
    restored
}

/// Reads every mirror and returns the valid copy with the highest generation.
pub fn read_latest(io: &dyn FileIo) -> Result<SuperBlock> {
    let device_size = io.len()?;
    let mut best: Option<SuperBlock> = None;
    for offset in mirror_offsets(device_size, SUPER_MIRROR_OFFSETS.len() as u32) {
        let mut buf = vec![0u8; SUPER_INFO_SIZE];
        io.read_at(offset, &mut buf)?;
        match SuperBlock::decode(&buf) {
            Ok(sb) if sb.bytenr == offset => {
                if best.map_or(true, |b| sb.generation > b.generation) {
                    best = Some(sb);
                }
            }
            Ok(_) => debug!(offset, "disk.super.misplaced_copy"),
            Err(err) => debug!(offset, error = %err, "disk.super.invalid_copy"),
        }
    }
    best.ok_or(FsError::Corruption("no valid superblock"))
}
