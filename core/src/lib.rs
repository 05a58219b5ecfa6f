//! Core data model for the Phalanx runtime.
//!
//! This crate holds the substrate that the trace engine (and the rest of the
//! runtime) is built on:
//!
//! - [`Event`]s, [`UserEvent`]s, and phase [`Barrier`]s, resolved by the
//!   in-memory [`EventFabric`],
//! - [`FieldMask`]s and [`FieldMaskSet`]s for reasoning about sets of fields,
//! - interned index-space expressions managed by an [`ExpressionForest`],
//! - [`LogicalView`]s identifying field views on physical instances,
//! - handle newtypes for address spaces, shards, processors, and region trees.

mod domain;
mod event;
mod expr;
mod field;
mod ids;
mod view;

// RE-EXPORTS
// ================================================================================================

pub use domain::DomainPoint;
pub use event::{Barrier, Event, EventFabric, UserEvent};
pub use expr::{ExprId, ExpressionForest, IntervalSet, Region};
pub use field::{FieldMask, FieldMaskSet, FieldSet, MAX_FIELDS};
pub use ids::{AddressSpace, ProcessorId, ShardId, TreeId};
pub use view::{LogicalView, MemoryKind, ViewId, ViewKind, ViewRegistry};

/// Binary serialization support, re-exported from `winter-utils` so dependents
/// use a single set of traits for packing and unpacking wire-visible types.
pub mod serde {
    pub use winter_utils::{
        ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable, SliceReader,
    };
}
