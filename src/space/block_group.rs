use std::collections::BTreeMap;

use tracing::debug;

use super::free_space::FreeSpace;
use super::{BlockGroupKind, SpaceInfo};
use crate::extent::BlockGroupItem;
use crate::types::{FsError, Result};

/// One chunk's worth of allocatable space.
#[derive(Clone, Debug)]
pub struct BlockGroup {
    /// Logical start.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// Allocation profile.
    pub kind: BlockGroupKind,
    /// Bytes owned by extent records.
    pub used: u64,
    /// Bytes allocated whose extent record is not inserted yet.
    pub reserved: u64,
    /// Bytes freed in the running transaction, reusable after commit.
    pub pinned: u64,
    /// Bytes held back for superblock copies.
    pub bytes_super: u64,
    free: FreeSpace,
}

impl BlockGroup {
    /// Free bytes in this group.
    pub fn free_bytes(&self) -> u64 {
        self.free.total()
    }

    /// Returns true when `bytenr` falls inside the group.
    pub fn contains(&self, bytenr: u64) -> bool {
        bytenr >= self.start && bytenr < self.start + self.length
    }

    /// Returns true when `[bytenr, bytenr + len)` is free.
    pub fn is_free(&self, bytenr: u64, len: u64) -> bool {
        self.free.contains(bytenr, len)
    }

    /// Persistent accounting record for this group.
    pub fn item(&self) -> BlockGroupItem {
        BlockGroupItem {
            start: self.start,
            length: self.length,
            used: self.used,
            kind: self.kind,
        }
    }
}

/// Every block group of the filesystem plus per-profile reservations.
#[derive(Debug, Default)]
pub struct BlockGroupCache {
    groups: BTreeMap<u64, BlockGroup>,
    pinned: BTreeMap<u64, u64>,
    may_use: BTreeMap<BlockGroupKind, u64>,
}

impl BlockGroupCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group, removing `excluded` ranges (superblock copies) from its
    /// free space.
    pub fn add_group(
        &mut self,
        start: u64,
        length: u64,
        kind: BlockGroupKind,
        excluded: &[(u64, u64)],
    ) -> Result<()> {
        if length == 0 {
            return Err(FsError::Invalid("empty block group"));
        }
        let overlaps = self
            .groups
            .values()
            .any(|g| start < g.start + g.length && g.start < start + length);
        if overlaps {
            return Err(FsError::consistency(format!(
                "block group {start}+{length} overlaps an existing group"
            )));
        }
        let mut free = FreeSpace::with_range(start, length);
        let before = free.total();
        for &(ex_start, ex_len) in excluded {
            free.remove(ex_start, ex_len);
        }
        let bytes_super = before - free.total();
        debug!(start, length, %kind, bytes_super, "space.block_group.add");
        self.groups.insert(
            start,
            BlockGroup {
                start,
                length,
                kind,
                used: 0,
                reserved: 0,
                pinned: 0,
                bytes_super,
                free,
            },
        );
        Ok(())
    }

    /// Group starting at `start`.
    pub fn group(&self, start: u64) -> Option<&BlockGroup> {
        self.groups.get(&start)
    }

    /// Groups in offset order.
    pub fn groups(&self) -> impl Iterator<Item = &BlockGroup> {
        self.groups.values()
    }

    /// Group holding `bytenr`.
    pub fn group_containing(&self, bytenr: u64) -> Option<&BlockGroup> {
        self.groups
            .range(..=bytenr)
            .next_back()
            .map(|(_, g)| g)
            .filter(|g| g.contains(bytenr))
    }

    fn group_containing_mut(&mut self, bytenr: u64, len: u64) -> Result<&mut BlockGroup> {
        self.groups
            .range_mut(..=bytenr)
            .next_back()
            .map(|(_, g)| g)
            .filter(|g| bytenr + len <= g.start + g.length)
            .ok_or_else(|| {
                FsError::consistency(format!("extent {bytenr}+{len} is outside every block group"))
            })
    }

    /// First-fit allocation of `len` bytes in a `kind` group. The bytes
    /// become reserved until [`commit_reserved`](Self::commit_reserved).
    pub fn alloc(&mut self, kind: BlockGroupKind, len: u64, align: u64) -> Option<u64> {
        self.groups
            .values_mut()
            .filter(|g| g.kind == kind)
            .find_map(|g| {
                let bytenr = g.free.take_first_fit(len, align)?;
                g.reserved += len;
                Some(bytenr)
            })
    }

    /// Moves reserved bytes to used once the extent record exists. Returns
    /// the start of the owning group.
    pub fn commit_reserved(&mut self, bytenr: u64, len: u64) -> Result<u64> {
        let group = self.group_containing_mut(bytenr, len)?;
        if group.reserved < len {
            return Err(FsError::consistency(format!(
                "extent {bytenr} inserted without a reservation"
            )));
        }
        group.reserved -= len;
        group.used += len;
        Ok(group.start)
    }

    /// Pins a reserved extent that never got an extent record.
    pub fn release_reserved(&mut self, bytenr: u64, len: u64) -> Result<u64> {
        let group = self.group_containing_mut(bytenr, len)?;
        if group.reserved < len {
            return Err(FsError::consistency(format!(
                "released extent {bytenr} was not reserved"
            )));
        }
        group.reserved -= len;
        group.pinned += len;
        let start = group.start;
        self.pinned.insert(bytenr, len);
        Ok(start)
    }

    /// Moves a freed extent's bytes from used to pinned. Returns the start of
    /// the owning group.
    pub fn free_extent(&mut self, bytenr: u64, len: u64) -> Result<u64> {
        let group = self.group_containing_mut(bytenr, len)?;
        if group.used < len {
            return Err(FsError::consistency(format!(
                "block group {} frees {len} bytes but uses {}",
                group.start, group.used
            )));
        }
        group.used -= len;
        group.pinned += len;
        let start = group.start;
        self.pinned.insert(bytenr, len);
        Ok(start)
    }

    /// Returns every pinned extent to its group's free space.
    pub fn unpin_all(&mut self) -> Result<u64> {
        let pinned = std::mem::take(&mut self.pinned);
        let mut total = 0;
        for (bytenr, len) in pinned {
            let group = self.group_containing_mut(bytenr, len)?;
            group.pinned -= len;
            group.free.add(bytenr, len);
            total += len;
        }
        Ok(total)
    }

    /// Pinned extents awaiting commit.
    pub fn pinned_extents(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.pinned.iter().map(|(b, l)| (*b, *l))
    }

    /// Adds `bytes` to the outstanding reservations of `kind`.
    pub fn reserve(&mut self, kind: BlockGroupKind, bytes: u64) {
        *self.may_use.entry(kind).or_insert(0) += bytes;
    }

    /// Gives back up to `bytes` of `kind` reservations.
    pub fn unreserve(&mut self, kind: BlockGroupKind, bytes: u64) {
        let may_use = self.may_use.entry(kind).or_insert(0);
        *may_use = may_use.saturating_sub(bytes);
    }

    /// Aggregated accounting for one profile.
    pub fn space_info(&self, kind: BlockGroupKind) -> SpaceInfo {
        let mut info = SpaceInfo {
            kind,
            may_use: self.may_use.get(&kind).copied().unwrap_or(0),
            ..SpaceInfo::default()
        };
        for group in self.groups.values().filter(|g| g.kind == kind) {
            info.total += group.length;
            info.used += group.used;
            info.reserved += group.reserved;
            info.pinned += group.pinned;
            info.bytes_super += group.bytes_super;
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn balanced(group: &BlockGroup) -> bool {
        group.used + group.reserved + group.pinned + group.bytes_super + group.free_bytes()
            == group.length
    }

    #[test]
    fn lifecycle_keeps_group_balanced() {
        let mut cache = BlockGroupCache::new();
        cache
            .add_group(MIB, 4 * MIB, BlockGroupKind::Metadata, &[(MIB, 4096)])
            .unwrap();
        let group = cache.group(MIB).unwrap();
        assert_eq!(group.bytes_super, 4096);
        assert!(balanced(group));

        let bytenr = cache.alloc(BlockGroupKind::Metadata, 16384, 16384).unwrap();
        assert_eq!(bytenr, MIB + 16384);
        assert!(cache.alloc(BlockGroupKind::Data, 4096, 4096).is_none());
        cache.commit_reserved(bytenr, 16384).unwrap();
        assert_eq!(cache.group(MIB).unwrap().used, 16384);

        cache.free_extent(bytenr, 16384).unwrap();
        let group = cache.group(MIB).unwrap();
        assert_eq!((group.used, group.pinned), (0, 16384));
        assert!(!group.is_free(bytenr, 16384));
        assert!(balanced(group));

        assert_eq!(cache.unpin_all().unwrap(), 16384);
        let group = cache.group(MIB).unwrap();
        assert!(group.is_free(bytenr, 16384));
        assert!(balanced(group));
    }

    #[test]
    fn space_info_subtracts_reservations() {
        let mut cache = BlockGroupCache::new();
        cache
            .add_group(MIB, 2 * MIB, BlockGroupKind::Metadata, &[])
            .unwrap();
        cache.reserve(BlockGroupKind::Metadata, MIB);
        let bytenr = cache.alloc(BlockGroupKind::Metadata, 16384, 16384).unwrap();
        let info = cache.space_info(BlockGroupKind::Metadata);
        assert_eq!(info.available(), MIB - 16384);

        cache.release_reserved(bytenr, 16384).unwrap();
        cache.unreserve(BlockGroupKind::Metadata, 2 * MIB);
        let info = cache.space_info(BlockGroupKind::Metadata);
        assert_eq!((info.pinned, info.may_use), (16384, 0));
        assert!(cache.commit_reserved(bytenr, 16384).is_err());
    }

    #[test]
    fn overlapping_groups_are_rejected() {
        let mut cache = BlockGroupCache::new();
        cache.add_group(MIB, MIB, BlockGroupKind::Data, &[]).unwrap();
        assert!(cache
            .add_group(MIB + 4096, MIB, BlockGroupKind::Data, &[])
            .is_err());
        assert!(cache.group_containing(2 * MIB - 1).is_some());
        assert!(cache.group_containing(2 * MIB).is_none());
    }
}
