use tracing::{debug, warn};

use super::Filesystem;
use crate::disk::SUPER_INFO_SIZE;
use crate::space::BlockGroupKind;
use crate::types::{FsError, Result, MAX_LEVEL};

/// Worst-case metadata bytes a transaction touching `num_items` items can
/// dirty: every level of the tree, twice over for splits.
pub fn calc_trans_metadata_size(nodesize: u32, num_items: u64) -> u64 {
    u64::from(nodesize)
        .saturating_mul(MAX_LEVEL)
        .saturating_mul(2)
        .saturating_mul(num_items)
}

impl Filesystem {
    /// Reserves `bytes` of metadata space for a new transaction. When the
    /// existing groups cannot cover it one metadata chunk is allocated and
    /// the check retried once. Nothing is reserved on failure.
    pub(crate) fn reserve_metadata(&mut self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let available = self
            .block_groups
            .space_info(BlockGroupKind::Metadata)
            .available();
        if available < bytes {
            debug!(needed = bytes, available, "trans.reserve.grow");
            let slack = SUPER_INFO_SIZE as u64 * self.mirrors.len() as u64;
            let chunk = match self.chunks.allocate_metadata_chunk(bytes.saturating_add(slack)) {
                Ok(chunk) => chunk,
                Err(FsError::NoSpace { .. }) => {
                    warn!(needed = bytes, available, "trans.reserve.no_space");
                    return Err(FsError::NoSpace {
                        needed: bytes,
                        available,
                    });
                }
                Err(err) => return Err(err),
            };
            self.add_chunk(chunk)?;
            let available = self
                .block_groups
                .space_info(BlockGroupKind::Metadata)
                .available();
            if available < bytes {
                warn!(needed = bytes, available, "trans.reserve.no_space");
                return Err(FsError::NoSpace {
                    needed: bytes,
                    available,
                });
            }
        }
        self.block_groups.reserve(BlockGroupKind::Metadata, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_cost_scales_with_items() {
        assert_eq!(calc_trans_metadata_size(16384, 0), 0);
        assert_eq!(calc_trans_metadata_size(16384, 1), 16384 * 8 * 2);
        assert_eq!(calc_trans_metadata_size(4096, 3), 4096 * 8 * 2 * 3);
        assert_eq!(calc_trans_metadata_size(65536, u64::MAX), u64::MAX);
    }
}
