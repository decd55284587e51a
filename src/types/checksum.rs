#![forbid(unsafe_code)]

/// Checksum of a tree block, bound to its logical address and the filesystem
/// id so a block copied to the wrong place or image never validates.
pub fn block_crc32(bytenr: u64, fsid: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytenr.to_be_bytes());
    hasher.update(&fsid.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum of a superblock copy body (everything after the checksum field).
pub fn super_crc32(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_crc32_changes_with_components() {
        let payload = vec![0u8; 16];
        let crc_a = block_crc32(1, 2, &payload);
        assert_eq!(crc_a, block_crc32(1, 2, &payload));

        let mut different = payload.clone();
        different[0] = 1;
        assert_ne!(crc_a, block_crc32(1, 2, &different));
        assert_ne!(crc_a, block_crc32(3, 2, &payload));
        assert_ne!(crc_a, block_crc32(1, 3, &payload));
    }

    #[test]
    fn super_crc32_detects_flip() {
        let mut body = vec![7u8; 64];
        let before = super_crc32(&body);
        body[10] ^= 0x80;
        assert_ne!(before, super_crc32(&body));
    }
}
