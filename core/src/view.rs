use core::fmt;
use std::collections::BTreeMap;

use parking_lot::RwLock;
use winter_utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable};

use crate::{AddressSpace, TreeId};

// VIEW ID
// ================================================================================================

/// The distributed identifier of a logical view. Globally unique and stable
/// across address spaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId(u64);

impl ViewId {
    pub const fn new(did: u64) -> Self {
        Self(did)
    }

    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ViewId {
    fn from(did: u64) -> Self {
        Self(did)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view{}", self.0)
    }
}

impl Serializable for ViewId {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u64(self.0);
    }
}

impl Deserializable for ViewId {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self(source.read_u64()?))
    }
}

// LOGICAL VIEW
// ================================================================================================

/// The kind of data a view exposes on its instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// A plain materialized view of instance data.
    Materialized,
    /// A reduction buffer applying the given reduction operator.
    Reduction { redop: u32 },
    /// A deferred fill value.
    Fill,
}

/// The kind of memory holding the backing instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    #[default]
    System,
    Framebuffer,
    ZeroCopy,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system memory"),
            Self::Framebuffer => write!(f, "framebuffer memory"),
            Self::ZeroCopy => write!(f, "zero-copy memory"),
        }
    }
}

/// A handle identifying a field view on a physical instance within a region
/// tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LogicalView {
    pub id: ViewId,
    pub kind: ViewKind,
    pub tree_id: TreeId,
    /// Address space owning the backing instance.
    pub owner_space: AddressSpace,
    pub memory: MemoryKind,
}

impl LogicalView {
    pub fn is_reduction(&self) -> bool {
        matches!(self.kind, ViewKind::Reduction { .. })
    }
}

impl fmt::Display for LogicalView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} on {})", self.id, self.tree_id, self.owner_space)
    }
}

// VIEW REGISTRY
// ================================================================================================

/// Process-local registry resolving view handles to their descriptions.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: RwLock<BTreeMap<ViewId, LogicalView>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, view: LogicalView) -> ViewId {
        self.views.write().insert(view.id, view);
        view.id
    }

    pub fn get(&self, id: ViewId) -> Option<LogicalView> {
        self.views.read().get(&id).copied()
    }

    /// Resolves a view that is expected to be registered.
    pub fn expect(&self, id: ViewId) -> LogicalView {
        self.get(id).unwrap_or_else(|| panic!("unregistered view {id}"))
    }
}
