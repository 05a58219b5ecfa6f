//! Physical trace capture, optimization, and replay for the Phalanx runtime.
//!
//! A *trace* is a repeating window of task-graph activity. On its first
//! execution the runtime records both the logical inter-operation dependences
//! ([`DynamicTrace`]) and the low-level event DAG the mapped operations
//! produce ([`PhysicalTemplate`]). Later executions skip dependence analysis,
//! mapping, and version analysis entirely: a cached template whose
//! [`TraceConditionSet`]s still hold over current equivalence-set state is
//! replayed as a precomputed graph of events, copies, fills, and task
//! completions.
//!
//! The main pieces, bottom up:
//!
//! - [`TraceViewSet`] — the field/expression/view algebra used to reason
//!   about what a trace touches,
//! - [`TraceConditionSet`] — the pre/anti/post conditions deciding whether a
//!   template is replayable and how its results are stamped back,
//! - [`PhysicalTemplate`] — the instruction-stream recorder, optimizer, and
//!   replayer,
//! - [`ShardedPhysicalTemplate`] — the control-replicated extension tying
//!   per-shard event graphs together with phase barriers,
//! - [`DynamicTrace`] / [`StaticTrace`] / [`PhysicalTrace`] — the trace
//!   containers and the bounded template cache.

mod condition;
mod config;
mod context;
mod errors;
mod issue;
mod logical;
mod op;
mod physical;
mod sharded;
mod template;
mod version;
mod view_set;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// RE-EXPORTS
// ================================================================================================

pub use condition::TraceConditionSet;
pub use config::{TraceConfig, TraceConfigError};
pub use context::TraceContext;
pub use errors::{RejectionReason, Replayable, TraceError};
pub use issue::{AcrossExecutor, CopyField, IssueEngine};
pub use logical::{
    AliasedChildren, DependenceRecord, DynamicTrace, OpInfo, StaticDependence, StaticTrace,
    TraceId, TraceState,
};
pub use op::{
    Coherence, DependenceType, GenerationId, MapperOutput, Memoizable, OpRef, Operation,
    OperationKind, Privilege, RegionUsage, Reservation, TraceLocalId, UniqueOpId,
    check_dependence,
};
pub use physical::PhysicalTrace;
pub use sharded::{
    LocalShardGroup, ShardExchange, ShardMapping, ShardedPhysicalTemplate, TemplateUpdate,
};
pub use template::{Instruction, PhysicalTemplate, Slot};
pub use version::{
    CapturedConditions, EquivalenceSetId, VersionEngine, VersionEngineRef, VersionSubscriber,
};
pub use view_set::{ExprViews, FailedPrecondition, TraceViewSet};
