use core::fmt;

use phalanx_core::{Event, EventFabric, ExprId, FieldMask, ViewId};

use crate::op::Reservation;

// COPY FIELD
// ================================================================================================

/// One side of a copy or fill: the fields of a view participating in the
/// transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyField {
    pub view: ViewId,
    pub fields: FieldMask,
}

impl CopyField {
    pub fn new(view: ViewId, fields: FieldMask) -> Self {
        Self { view, fields }
    }
}

impl fmt::Display for CopyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.view, self.fields)
    }
}

// ISSUE ENGINE
// ================================================================================================

/// The seam to the low-level data movement layer.
///
/// Templates re-issue recorded copies and fills through this interface at
/// replay; the returned event is the completion of the issued operation.
pub trait IssueEngine: Send + Sync + fmt::Debug {
    fn issue_copy(
        &self,
        expr: ExprId,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        reservations: &[Reservation],
        precondition: Event,
    ) -> Event;

    fn issue_fill(
        &self,
        expr: ExprId,
        dst_fields: &[CopyField],
        value: &[u8],
        precondition: Event,
    ) -> Event;
}

// ACROSS EXECUTOR
// ================================================================================================

/// Executor for a gather/scatter copy between region trees.
///
/// The executor owns the indirection state; the template only re-triggers it
/// with the four recorded preconditions. When every traced user of the
/// indirection fields is read-only, the executor is told the preimages are
/// trace-immutable and may skip recomputing them on replay.
pub trait AcrossExecutor: Send + Sync + fmt::Debug {
    fn execute(
        &self,
        fabric: &EventFabric,
        copy_precondition: Event,
        collective_precondition: Event,
        src_indirect_precondition: Event,
        dst_indirect_precondition: Event,
    ) -> Event;

    fn set_trace_immutable(&self, immutable: bool);
}
