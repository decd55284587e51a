use std::fmt;

use crate::types::{FsError, Result, RootId};

/// Extent record flag: the extent holds file data.
pub const EXTENT_FLAG_DATA: u64 = 1 << 0;
/// Extent record flag: the extent is a tree block.
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;
/// Extent record flag: every back reference is keyed by parent block.
pub const EXTENT_FLAG_FULL_BACKREF: u64 = 1 << 8;

/// What a reference node does to its back reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RefAction {
    /// Gain `ref_mod` references.
    Add,
    /// Lose `ref_mod` references.
    Drop,
    /// First reference to a freshly allocated extent; inserts the extent record.
    AddExtent,
    /// Touches only the head (flag updates); no reference change.
    UpdateHeadOnly,
}

impl RefAction {
    /// Returns true for actions that increase the reference count.
    pub fn is_add(self) -> bool {
        matches!(self, RefAction::Add | RefAction::AddExtent)
    }
}

/// Identity of the owner a reference node speaks for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RefKind {
    /// Reference from a tree to one of its blocks.
    TreeBlock {
        /// Tree owning the block.
        root: RootId,
        /// Level of the referenced block.
        level: u8,
        /// Parent block for shared (full backref) references.
        parent: Option<u64>,
    },
    /// Reference from a file extent item to a data extent.
    FileData {
        /// Subvolume owning the file.
        root: RootId,
        /// Inode number of the file.
        inode: u64,
        /// File offset the extent is mapped at.
        offset: u64,
        /// Leaf holding the file extent item for shared references.
        parent: Option<u64>,
    },
}

impl RefKind {
    /// Owning root of this reference.
    pub fn root(&self) -> RootId {
        match self {
            RefKind::TreeBlock { root, .. } | RefKind::FileData { root, .. } => *root,
        }
    }

    /// Parent block for shared references.
    pub fn parent(&self) -> Option<u64> {
        match self {
            RefKind::TreeBlock { parent, .. } | RefKind::FileData { parent, .. } => *parent,
        }
    }

    /// Returns true for file-data references.
    pub fn is_data(&self) -> bool {
        matches!(self, RefKind::FileData { .. })
    }
}

/// Back-reference identity two nodes must share to be merged. Ordering follows
/// the on-disk back-reference item ordering.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RefKey {
    /// Tree block referenced by root.
    TreeBlock {
        /// Owning root.
        root: RootId,
    },
    /// Data extent referenced by (root, inode, offset).
    ExtentData {
        /// Owning root.
        root: RootId,
        /// Inode number.
        inode: u64,
        /// File offset.
        offset: u64,
    },
    /// Tree block referenced by parent block.
    SharedBlock {
        /// Parent block bytenr.
        parent: u64,
    },
    /// Data extent referenced by parent leaf.
    SharedData {
        /// Parent leaf bytenr.
        parent: u64,
    },
}

impl RefKey {
    /// Returns true for data back references.
    pub fn is_data(&self) -> bool {
        matches!(self, RefKey::ExtentData { .. } | RefKey::SharedData { .. })
    }
}

impl From<&RefKind> for RefKey {
    fn from(kind: &RefKind) -> Self {
        match *kind {
            RefKind::TreeBlock {
                parent: Some(parent),
                ..
            } => RefKey::SharedBlock { parent },
            RefKind::TreeBlock { root, .. } => RefKey::TreeBlock { root },
            RefKind::FileData {
                parent: Some(parent),
                ..
            } => RefKey::SharedData { parent },
            RefKind::FileData {
                root,
                inode,
                offset,
                ..
            } => RefKey::ExtentData {
                root,
                inode,
                offset,
            },
        }
    }
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKey::TreeBlock { root } => write!(f, "tree root {root}"),
            RefKey::ExtentData {
                root,
                inode,
                offset,
            } => write!(f, "data root {root} ino {inode} off {offset}"),
            RefKey::SharedBlock { parent } => write!(f, "shared tree parent {parent}"),
            RefKey::SharedData { parent } => write!(f, "shared data parent {parent}"),
        }
    }
}

/// Head-level update applied to the extent record once the head completes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ExtentOp {
    /// Flags OR-ed into the extent record.
    pub set_flags: u64,
}

impl ExtentOp {
    /// Folds a later update into this one.
    pub fn absorb(&mut self, other: ExtentOp) {
        self.set_flags |= other.set_flags;
    }
}

/// One delayed delta against a single back reference of an extent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefNode {
    /// Extent start.
    pub bytenr: u64,
    /// Extent length.
    pub num_bytes: u64,
    /// Owner identity.
    pub kind: RefKind,
    /// Direction of the delta.
    pub action: RefAction,
    /// Magnitude of the delta; the sign comes from `action`.
    pub ref_mod: u64,
    /// Sequence number assigned by the store when recorded.
    pub seq: u64,
    /// Optional flag update carried to the head.
    pub extent_op: Option<ExtentOp>,
}

impl RefNode {
    /// Reference from `root` to the tree block at `bytenr`.
    pub fn tree_block(
        bytenr: u64,
        num_bytes: u64,
        root: RootId,
        level: u8,
        action: RefAction,
    ) -> Self {
        Self::new(
            bytenr,
            num_bytes,
            RefKind::TreeBlock {
                root,
                level,
                parent: None,
            },
            action,
        )
    }

    /// Reference from block `parent` to the tree block at `bytenr`.
    pub fn shared_tree_block(
        bytenr: u64,
        num_bytes: u64,
        parent: u64,
        root: RootId,
        level: u8,
        action: RefAction,
    ) -> Self {
        Self::new(
            bytenr,
            num_bytes,
            RefKind::TreeBlock {
                root,
                level,
                parent: Some(parent),
            },
            action,
        )
    }

    /// Reference from a file extent item of (`root`, `inode`, `offset`).
    pub fn file_data(
        bytenr: u64,
        num_bytes: u64,
        root: RootId,
        inode: u64,
        offset: u64,
        action: RefAction,
    ) -> Self {
        Self::new(
            bytenr,
            num_bytes,
            RefKind::FileData {
                root,
                inode,
                offset,
                parent: None,
            },
            action,
        )
    }

    /// Reference from the file extent item stored in leaf `parent`.
    pub fn shared_file_data(
        bytenr: u64,
        num_bytes: u64,
        parent: u64,
        root: RootId,
        inode: u64,
        offset: u64,
        action: RefAction,
    ) -> Self {
        Self::new(
            bytenr,
            num_bytes,
            RefKind::FileData {
                root,
                inode,
                offset,
                parent: Some(parent),
            },
            action,
        )
    }

    fn new(bytenr: u64, num_bytes: u64, kind: RefKind, action: RefAction) -> Self {
        let ref_mod = if action == RefAction::UpdateHeadOnly { 0 } else { 1 };
        Self {
            bytenr,
            num_bytes,
            kind,
            action,
            ref_mod,
            seq: 0,
            extent_op: None,
        }
    }

    /// Sets the magnitude.
    pub fn with_ref_mod(mut self, ref_mod: u64) -> Self {
        self.ref_mod = ref_mod;
        self
    }

    /// Attaches a head-level flag update.
    pub fn with_extent_op(mut self, op: ExtentOp) -> Self {
        self.extent_op = Some(op);
        self
    }

    /// Turns this node into a head-only update carrying `op`.
    pub fn into_head_update(mut self, op: ExtentOp) -> Self {
        self.action = RefAction::UpdateHeadOnly;
        self.ref_mod = 0;
        self.extent_op = Some(op);
        self
    }

    /// Merge identity, ignoring the sequence number.
    pub fn key(&self) -> RefKey {
        RefKey::from(&self.kind)
    }

    /// Returns true for file-data references.
    pub fn is_data(&self) -> bool {
        self.kind.is_data()
    }

    /// Tree level for tree-block references.
    pub fn level(&self) -> Option<u8> {
        match self.kind {
            RefKind::TreeBlock { level, .. } => Some(level),
            RefKind::FileData { .. } => None,
        }
    }

    /// Magnitude with the action's sign applied.
    pub fn signed_mod(&self) -> i64 {
        let magnitude = self.ref_mod as i64;
        match self.action {
            RefAction::Add | RefAction::AddExtent => magnitude,
            RefAction::Drop => -magnitude,
            RefAction::UpdateHeadOnly => 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.num_bytes == 0 {
            return Err(FsError::Invalid("reference to zero-length extent"));
        }
        match self.action {
            RefAction::UpdateHeadOnly if self.extent_op.is_none() => {
                Err(FsError::Invalid("head update without an extent op"))
            }
            RefAction::UpdateHeadOnly => Ok(()),
            _ if self.ref_mod == 0 => Err(FsError::Invalid("reference delta of zero")),
            _ if self.ref_mod > i64::MAX as u64 => {
                Err(FsError::Invalid("reference delta out of range"))
            }
            _ => Ok(()),
        }
    }
}

/// Folds a delta of `action`/`ref_mod` into `exist`. When the incoming delta
/// outweighs an opposed existing one, `exist` takes over the incoming action
/// with the remainder. Returns true if `exist` changed action.
pub(crate) fn fold(exist: &mut RefNode, action: RefAction, ref_mod: u64) -> bool {
    if exist.action == action {
        exist.ref_mod += ref_mod;
        false
    } else if exist.ref_mod < ref_mod {
        exist.action = action;
        exist.ref_mod = ref_mod - exist.ref_mod;
        true
    } else {
        exist.ref_mod -= ref_mod;
        false
    }
}
