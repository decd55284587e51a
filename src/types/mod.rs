//! Shared identifiers, constants and the crate-wide error type.
#![forbid(unsafe_code)]

use std::fmt;

mod checksum;

pub use checksum::{block_crc32, super_crc32};

/// Deepest tree a single modification can touch.
pub const MAX_LEVEL: u64 = 8;

/// Objectid of a tree as stored in its root item key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RootId(pub u64);

impl RootId {
    /// Tree of root items; its own root pointer lives in the superblock.
    pub const ROOT_TREE: RootId = RootId(1);
    /// Extent-reference tree.
    pub const EXTENT_TREE: RootId = RootId(2);
    /// Chunk tree; its root pointer lives in the superblock.
    pub const CHUNK_TREE: RootId = RootId(3);
    /// Device extent tree.
    pub const DEV_TREE: RootId = RootId(4);
    /// Default subvolume.
    pub const FS_TREE: RootId = RootId(5);
    /// Data checksum tree.
    pub const CSUM_TREE: RootId = RootId(7);
    /// First objectid handed to user-created subvolumes.
    pub const FIRST_FREE: RootId = RootId(256);

    /// Returns true for subvolume trees whose blocks may be shared.
    pub fn is_fs_tree(self) -> bool {
        self == RootId::FS_TREE || self.0 >= RootId::FIRST_FREE.0
    }

    /// Returns true for trees that are never shared and only need a root
    /// pointer update when their root block moves.
    pub fn is_cowonly(self) -> bool {
        matches!(
            self,
            RootId::EXTENT_TREE | RootId::DEV_TREE | RootId::CSUM_TREE
        )
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error classification that survives as the sticky abort code of a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AbortCode {
    /// Metadata space could not be reserved.
    NoSpace,
    /// Reference bookkeeping contradicted itself.
    Consistency,
    /// A device read, write or sync failed.
    Io,
    /// The API was driven in an order it does not allow.
    Usage,
    /// On-disk bytes failed validation.
    Corruption,
    /// A caller supplied an argument outside the accepted domain.
    Invalid,
}

impl AbortCode {
    /// Returns the errno value the userspace tools report for this code.
    pub fn errno(self) -> i32 {
        match self {
            AbortCode::NoSpace => 28,
            AbortCode::Consistency => 117,
            AbortCode::Io => 5,
            AbortCode::Usage | AbortCode::Invalid => 22,
            AbortCode::Corruption => 117,
        }
    }

    /// Returns a stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            AbortCode::NoSpace => "no-space",
            AbortCode::Consistency => "consistency",
            AbortCode::Io => "io",
            AbortCode::Usage => "usage",
            AbortCode::Corruption => "corruption",
            AbortCode::Invalid => "invalid",
        }
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the reference engine, the commit pipeline and its
/// collaborators.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    /// Underlying device error.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Admission control or an allocator ran out of space.
    #[error("no space: need {needed} bytes, {available} available")]
    NoSpace {
        /// Bytes requested.
        needed: u64,
        /// Bytes that could be found.
        available: u64,
    },
    /// Reference accounting contract violated.
    #[error("consistency fault: {0}")]
    Consistency(String),
    /// API misuse.
    #[error("usage fault: {0}")]
    Usage(&'static str),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Options rejected while loading or validating.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// Fewer superblock copies than the quorum reached stable storage.
    #[error("superblock publish failed: {written} of {required} required copies written")]
    PublishFailed {
        /// Copies written successfully.
        written: usize,
        /// Copies needed for quorum.
        required: usize,
    },
    /// The session was aborted earlier and rejects further work.
    #[error("filesystem aborted ({code}): {reason}")]
    Aborted {
        /// Code of the first error that aborted the session.
        code: AbortCode,
        /// Rendered message of that error.
        reason: String,
    },
}

impl FsError {
    /// Builds a consistency fault from any message.
    pub fn consistency(msg: impl Into<String>) -> Self {
        FsError::Consistency(msg.into())
    }

    /// Classifies this error.
    pub fn code(&self) -> AbortCode {
        match self {
            FsError::Io(_) | FsError::PublishFailed { .. } => AbortCode::Io,
            FsError::NoSpace { .. } => AbortCode::NoSpace,
            FsError::Consistency(_) => AbortCode::Consistency,
            FsError::Usage(_) => AbortCode::Usage,
            FsError::Corruption(_) => AbortCode::Corruption,
            FsError::Invalid(_) | FsError::Config(_) => AbortCode::Invalid,
            FsError::Aborted { code, .. } => *code,
        }
    }

    /// Errno reported to users; an aborted session is read-only.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Aborted { .. } => 30,
            other => other.code().errno(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_classification() {
        assert!(RootId::EXTENT_TREE.is_cowonly());
        assert!(!RootId::ROOT_TREE.is_cowonly());
        assert!(!RootId::FS_TREE.is_cowonly());
        assert!(RootId::FS_TREE.is_fs_tree());
        assert!(RootId(300).is_fs_tree());
        assert!(!RootId::CSUM_TREE.is_fs_tree());
    }

    #[test]
    fn aborted_reports_read_only() {
        let err = FsError::Aborted {
            code: AbortCode::Io,
            reason: "IO: boom".into(),
        };
        assert_eq!(err.code(), AbortCode::Io);
        assert_eq!(err.errno(), 30);
        assert_eq!(
            FsError::NoSpace {
                needed: 1,
                available: 0
            }
            .errno(),
            28
        );
    }
}
