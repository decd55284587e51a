use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::ops::Range;

use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{block_crc32, FsError, Result, RootId};

/// Magic stamped into every tree block.
pub const BLOCK_MAGIC: [u8; 4] = *b"CFTB";
/// Bytes of header in front of each tree block's payload.
pub const BLOCK_HDR_LEN: usize = 48;

const HDR_CSUM: Range<usize> = 0..4;
const HDR_MAGIC: Range<usize> = 4..8;
const HDR_FSID: Range<usize> = 8..16;
const HDR_BYTENR: Range<usize> = 16..24;
const HDR_GENERATION: Range<usize> = 24..32;
const HDR_OWNER: Range<usize> = 32..40;
const HDR_LEVEL: usize = 40;
const HDR_RESERVED: Range<usize> = 41..44;
const HDR_PAYLOAD_LEN: Range<usize> = 44..48;

pub(crate) fn be_u64(buf: &[u8], range: Range<usize>) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[range]);
    u64::from_be_bytes(bytes)
}

pub(crate) fn be_u32(buf: &[u8], range: Range<usize>) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[range]);
    u32::from_be_bytes(bytes)
}

/// Decoded tree-block header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Filesystem the block belongs to.
    pub fsid: u64,
    /// Logical address the block was written for.
    pub bytenr: u64,
    /// Transaction that last wrote the block.
    pub generation: u64,
    /// Tree that owns the block.
    pub owner: RootId,
    /// Level in its tree.
    pub level: u8,
    /// Stored checksum.
    pub csum: u32,
}

/// In-memory copy of one tree block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtentBuffer {
    /// Logical address.
    pub bytenr: u64,
    /// Owning tree.
    pub owner: RootId,
    /// Level in its tree.
    pub level: u8,
    /// Transaction that last dirtied the block.
    pub generation: u64,
    /// Opaque item bytes.
    pub payload: Vec<u8>,
}

impl ExtentBuffer {
    /// Serializes the block into `nodesize` bytes with a checksum bound to
    /// its address and `fsid`.
    pub fn encode(&self, fsid: u64, nodesize: u32) -> Result<Vec<u8>> {
        let nodesize = nodesize as usize;
        if BLOCK_HDR_LEN + self.payload.len() > nodesize {
            return Err(FsError::Invalid("tree block payload exceeds nodesize"));
        }
        let mut buf = vec![0u8; nodesize];
        buf[HDR_MAGIC].copy_from_slice(&BLOCK_MAGIC);
        buf[HDR_FSID].copy_from_slice(&fsid.to_be_bytes());
        buf[HDR_BYTENR].copy_from_slice(&self.bytenr.to_be_bytes());
        buf[HDR_GENERATION].copy_from_slice(&self.generation.to_be_bytes());
        buf[HDR_OWNER].copy_from_slice(&self.owner.0.to_be_bytes());
        buf[HDR_LEVEL] = self.level;
        buf[HDR_PAYLOAD_LEN].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf[BLOCK_HDR_LEN..BLOCK_HDR_LEN + self.payload.len()].copy_from_slice(&self.payload);
        let crc = block_crc32(self.bytenr, fsid, &buf[HDR_CSUM.end..]);
        buf[HDR_CSUM].copy_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Parses and verifies a block read from `bytenr`.
    pub fn decode(buf: &[u8], bytenr: u64, fsid: u64) -> Result<(BlockHeader, Self)> {
        if buf.len() < BLOCK_HDR_LEN {
            return Err(FsError::Corruption("tree block truncated"));
        }
        if buf[HDR_MAGIC] != BLOCK_MAGIC {
            return Err(FsError::Corruption("invalid tree block magic"));
        }
        if buf[HDR_RESERVED].iter().any(|b| *b != 0) {
            return Err(FsError::Corruption("tree block reserved bytes not zero"));
        }
        let csum = be_u32(buf, HDR_CSUM);
        if csum != block_crc32(bytenr, fsid, &buf[HDR_CSUM.end..]) {
            return Err(FsError::Corruption("tree block checksum mismatch"));
        }
        let header = BlockHeader {
            fsid: be_u64(buf, HDR_FSID),
            bytenr: be_u64(buf, HDR_BYTENR),
            generation: be_u64(buf, HDR_GENERATION),
            owner: RootId(be_u64(buf, HDR_OWNER)),
            level: buf[HDR_LEVEL],
            csum,
        };
        if header.bytenr != bytenr || header.fsid != fsid {
            return Err(FsError::Corruption("tree block written for another location"));
        }
        let payload_len = be_u32(buf, HDR_PAYLOAD_LEN) as usize;
        let payload = buf
            .get(BLOCK_HDR_LEN..BLOCK_HDR_LEN + payload_len)
            .ok_or(FsError::Corruption("tree block payload length out of range"))?
            .to_vec();
        Ok((
            header,
            Self {
                bytenr,
                owner: header.owner,
                level: header.level,
                generation: header.generation,
                payload,
            },
        ))
    }
}

/// Reads and verifies the tree block at `bytenr`.
pub fn read_block(
    io: &dyn FileIo,
    bytenr: u64,
    fsid: u64,
    nodesize: u32,
) -> Result<(BlockHeader, ExtentBuffer)> {
    let mut buf = vec![0u8; nodesize as usize];
    match io.read_at(bytenr, &mut buf) {
        Ok(()) => {}
        Err(FsError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(FsError::Corruption("tree block past end of device"));
        }
        Err(err) => return Err(err),
    }
    ExtentBuffer::decode(&buf, bytenr, fsid)
}

/// Cached tree blocks and the set written at the next commit.
#[derive(Debug)]
pub struct BufferStore {
    fsid: u64,
    nodesize: u32,
    buffers: BTreeMap<u64, ExtentBuffer>,
    dirty: BTreeSet<u64>,
}

impl BufferStore {
    /// Creates an empty store for blocks of `nodesize` bytes.
    pub fn new(fsid: u64, nodesize: u32) -> Self {
        Self {
            fsid,
            nodesize,
            buffers: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Creates a fresh dirty block.
    pub fn create(&mut self, bytenr: u64, owner: RootId, level: u8, generation: u64) {
        self.buffers.insert(
            bytenr,
            ExtentBuffer {
                bytenr,
                owner,
                level,
                generation,
                payload: Vec::new(),
            },
        );
        self.dirty.insert(bytenr);
    }

    /// Copies the payload of `from` into `to`, which must already exist.
    pub fn copy_payload(&mut self, from: u64, to: u64) -> Result<()> {
        let payload = self
            .buffers
            .get(&from)
            .map(|buf| buf.payload.clone())
            .unwrap_or_default();
        let target = self
            .buffers
            .get_mut(&to)
            .ok_or(FsError::Usage("copy into an unknown tree block"))?;
        target.payload = payload;
        self.dirty.insert(to);
        Ok(())
    }

    /// Replaces a block's payload and dirties it.
    pub fn set_payload(&mut self, bytenr: u64, payload: Vec<u8>, generation: u64) -> Result<()> {
        if BLOCK_HDR_LEN + payload.len() > self.nodesize as usize {
            return Err(FsError::Invalid("tree block payload exceeds nodesize"));
        }
        let buffer = self
            .buffers
            .get_mut(&bytenr)
            .ok_or(FsError::Usage("write to an unknown tree block"))?;
        buffer.payload = payload;
        buffer.generation = generation;
        self.dirty.insert(bytenr);
        Ok(())
    }

    /// Forgets a freed block; it will not be written.
    pub fn clean(&mut self, bytenr: u64) -> bool {
        self.buffers.remove(&bytenr);
        self.dirty.remove(&bytenr)
    }

    /// Cached block at `bytenr`.
    pub fn get(&self, bytenr: u64) -> Option<&ExtentBuffer> {
        self.buffers.get(&bytenr)
    }

    /// Returns true if `bytenr` will be written at the next commit.
    pub fn is_dirty(&self, bytenr: u64) -> bool {
        self.dirty.contains(&bytenr)
    }

    /// Number of dirty blocks.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Writes every dirty block in increasing offset order, stamping
    /// `generation`. A block is marked clean only after its write returned;
    /// on failure the remaining blocks stay dirty.
    pub fn write_dirty(&mut self, io: &dyn FileIo, generation: u64) -> Result<usize> {
        let mut written = 0;
        while let Some(bytenr) = self.dirty.first().copied() {
            let buffer = self
                .buffers
                .get_mut(&bytenr)
                .ok_or_else(|| FsError::consistency(format!("dirty block {bytenr} not cached")))?;
            buffer.generation = generation;
            let block = buffer.encode(self.fsid, self.nodesize)?;
            if let Err(err) = io.write_at(bytenr, &block) {
                warn!(bytenr, written, error = %err, "disk.write_dirty.failed");
                return Err(err);
            }
            self.dirty.remove(&bytenr);
            written += 1;
        }
        debug!(generation, written, "disk.write_dirty.done");
        Ok(written)
    }

    /// Drops every dirty block without writing it.
    pub fn discard_dirty(&mut self) -> usize {
        let dirty = std::mem::take(&mut self.dirty);
        for bytenr in &dirty {
            self.buffers.remove(bytenr);
        }
        dirty.len()
    }
}
