use phalanx_core::serde::DeserializationError;

use crate::op::{OperationKind, TraceLocalId, UniqueOpId};

// TRACE ERROR
// ================================================================================================

/// Fatal errors surfaced to the application.
///
/// Trace violations mean the application issued a different operation stream
/// on a replay pass than the one that was recorded; there is no recovery.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error(
        "trace {trace_id} violation: operation {index} was recorded as a {expected} but '{name}' \
         (uid {uid}) is a {actual}"
    )]
    OperationKindMismatch {
        trace_id: u64,
        index: usize,
        expected: OperationKind,
        actual: OperationKind,
        name: String,
        uid: UniqueOpId,
    },
    #[error(
        "trace {trace_id} violation: operation {index} '{name}' (uid {uid}) was recorded with \
         {expected} region requirements but was issued with {actual}"
    )]
    RequirementCountMismatch {
        trace_id: u64,
        index: usize,
        expected: usize,
        actual: usize,
        name: String,
        uid: UniqueOpId,
    },
    #[error(
        "trace {trace_id} violation: {recorded} operations were recorded but only {issued} were \
         issued before the trace completed"
    )]
    IncompleteReplay { trace_id: u64, recorded: usize, issued: usize },
    #[error(
        "invalid memoization request: {kind} operation {tlid} (uid {uid}) does not match the \
         recorded template entry"
    )]
    InvalidMemoization { kind: OperationKind, tlid: TraceLocalId, uid: UniqueOpId },
    #[error("trace {trace_id} is static and cannot record new dependences")]
    StaticTraceImmutable { trace_id: u64 },
    #[error("malformed template update message")]
    MalformedUpdate(#[from] DeserializationError),
}

// REPLAYABILITY
// ================================================================================================

/// The outcome of a template's replayability check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replayable {
    Replayable,
    NotReplayable(RejectionReason),
}

impl Replayable {
    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Replayable)
    }

    /// Combines the verdicts of two shards: a template replays only if every
    /// shard agrees.
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Replayable, other) => other,
            (this, _) => this,
        }
    }
}

/// Why a captured template was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RejectionReason {
    #[error("blocking call observed during recording")]
    BlockingCall,
    #[error("task {tlid} used a virtual mapping")]
    VirtualMapping { tlid: TraceLocalId },
    #[error("precondition not subsumed by postconditions: {description}")]
    PreconditionNotSubsumed { description: String },
    #[error("postcondition anti-dependent on anticonditions: {description}")]
    PostconditionAntiDependent { description: String },
    #[error("rejected by remote shard")]
    RemoteShardVeto,
}
