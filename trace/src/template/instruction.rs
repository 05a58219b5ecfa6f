use core::fmt;
use std::sync::Arc;

use phalanx_core::{Barrier, ExprId};
use smallvec::SmallVec;

use crate::{
    issue::{AcrossExecutor, CopyField},
    op::{Reservation, TraceLocalId},
};

/// Index of an event slot within a template.
pub type Slot = usize;

// INSTRUCTION
// ================================================================================================

/// One opcode of the template VM.
///
/// Each instruction that produces an event writes it into its `lhs` slot;
/// operand slots always name events produced earlier in the stream (or
/// frontier and crossing slots filled before the slices launch).
#[derive(Clone, Debug)]
pub enum Instruction {
    /// Writes the trace's fence completion into the slot. Always at slot 0.
    AssignFenceCompletion { lhs: Slot },
    /// Binds the owner memoizable's completion event to the slot, replaying
    /// its mapping output first.
    GetTermEvent { lhs: Slot, owner: TraceLocalId, fence: bool },
    /// Allocates a fresh user-triggerable event into the slot.
    CreateUserEvent { lhs: Slot, owner: TraceLocalId },
    /// Triggers the user event at `lhs` with the event at `rhs`.
    TriggerEvent { lhs: Slot, rhs: Slot, owner: TraceLocalId },
    /// Merges the events at the `rhs` slots into the `lhs` slot.
    MergeEvent { lhs: Slot, rhs: SmallVec<[Slot; 4]>, owner: TraceLocalId },
    /// Re-issues a recorded copy.
    IssueCopy {
        lhs: Slot,
        owner: TraceLocalId,
        expr: ExprId,
        src_fields: Vec<CopyField>,
        dst_fields: Vec<CopyField>,
        reservations: Vec<Reservation>,
        precondition: Slot,
    },
    /// Re-issues a recorded fill.
    IssueFill {
        lhs: Slot,
        owner: TraceLocalId,
        expr: ExprId,
        dst_fields: Vec<CopyField>,
        value: Vec<u8>,
        precondition: Slot,
    },
    /// Re-triggers a recorded gather/scatter executor.
    IssueAcross {
        lhs: Slot,
        owner: TraceLocalId,
        executor: Arc<dyn AcrossExecutor>,
        copy_precondition: Slot,
        collective_precondition: Option<Slot>,
        src_indirect_precondition: Option<Slot>,
        dst_indirect_precondition: Option<Slot>,
    },
    /// Asks the owner memoizable for its current sync precondition.
    SetOpSyncEvent { lhs: Slot, owner: TraceLocalId },
    /// Pushes the event at `rhs` into the owner as its effects
    /// postcondition.
    SetEffects { owner: TraceLocalId, rhs: Slot },
    /// Signals the owner that replay completed; its execution waits on the
    /// event at `rhs`.
    CompleteReplay { owner: TraceLocalId, rhs: Slot },
    /// Arrives on a phase barrier with the event at `rhs` as precondition;
    /// the slot receives the barrier's current phase.
    BarrierArrival {
        lhs: Slot,
        rhs: Slot,
        barrier: Barrier,
        arrival_count: u32,
        /// Collective arrivals get their barrier value supplied per replay by
        /// the application and are not advanced by the template.
        collective: bool,
    },
    /// Binds the current phase of a subscribed barrier to the slot and
    /// advances the subscription.
    BarrierAdvance { lhs: Slot, barrier: Barrier },
}

impl Instruction {
    /// The slot this instruction writes, if any.
    pub fn lhs(&self) -> Option<Slot> {
        match self {
            Self::AssignFenceCompletion { lhs }
            | Self::GetTermEvent { lhs, .. }
            | Self::CreateUserEvent { lhs, .. }
            | Self::TriggerEvent { lhs, .. }
            | Self::MergeEvent { lhs, .. }
            | Self::IssueCopy { lhs, .. }
            | Self::IssueFill { lhs, .. }
            | Self::IssueAcross { lhs, .. }
            | Self::SetOpSyncEvent { lhs, .. }
            | Self::BarrierArrival { lhs, .. }
            | Self::BarrierAdvance { lhs, .. } => Some(*lhs),
            Self::SetEffects { .. } | Self::CompleteReplay { .. } => None,
        }
    }

    /// The slots this instruction reads.
    pub fn inputs(&self) -> SmallVec<[Slot; 4]> {
        match self {
            Self::AssignFenceCompletion { .. }
            | Self::GetTermEvent { .. }
            | Self::CreateUserEvent { .. }
            | Self::SetOpSyncEvent { .. }
            | Self::BarrierAdvance { .. } => SmallVec::new(),
            Self::TriggerEvent { rhs, .. }
            | Self::SetEffects { rhs, .. }
            | Self::CompleteReplay { rhs, .. }
            | Self::BarrierArrival { rhs, .. } => smallvec::smallvec![*rhs],
            Self::MergeEvent { rhs, .. } => rhs.clone(),
            Self::IssueCopy { precondition, .. } | Self::IssueFill { precondition, .. } => {
                smallvec::smallvec![*precondition]
            },
            Self::IssueAcross {
                copy_precondition,
                collective_precondition,
                src_indirect_precondition,
                dst_indirect_precondition,
                ..
            } => {
                let mut inputs = smallvec::smallvec![*copy_precondition];
                inputs.extend(collective_precondition.iter().copied());
                inputs.extend(src_indirect_precondition.iter().copied());
                inputs.extend(dst_indirect_precondition.iter().copied());
                inputs
            },
        }
    }

    /// Applies `remap` to every slot this instruction names.
    pub fn remap_slots(&mut self, mut remap: impl FnMut(Slot) -> Slot) {
        match self {
            Self::AssignFenceCompletion { lhs }
            | Self::GetTermEvent { lhs, .. }
            | Self::CreateUserEvent { lhs, .. }
            | Self::SetOpSyncEvent { lhs, .. }
            | Self::BarrierAdvance { lhs, .. } => *lhs = remap(*lhs),
            Self::TriggerEvent { lhs, rhs, .. } | Self::BarrierArrival { lhs, rhs, .. } => {
                *lhs = remap(*lhs);
                *rhs = remap(*rhs);
            },
            Self::SetEffects { rhs, .. } | Self::CompleteReplay { rhs, .. } => *rhs = remap(*rhs),
            Self::MergeEvent { lhs, rhs, .. } => {
                *lhs = remap(*lhs);
                for slot in rhs.iter_mut() {
                    *slot = remap(*slot);
                }
                rhs.sort_unstable();
                rhs.dedup();
            },
            Self::IssueCopy { lhs, precondition, .. }
            | Self::IssueFill { lhs, precondition, .. } => {
                *lhs = remap(*lhs);
                *precondition = remap(*precondition);
            },
            Self::IssueAcross {
                lhs,
                copy_precondition,
                collective_precondition,
                src_indirect_precondition,
                dst_indirect_precondition,
                ..
            } => {
                *lhs = remap(*lhs);
                *copy_precondition = remap(*copy_precondition);
                for pre in [
                    collective_precondition,
                    src_indirect_precondition,
                    dst_indirect_precondition,
                ]
                .into_iter()
                .flatten()
                {
                    *pre = remap(*pre);
                }
            },
        }
    }

    /// The slots whose generating instructions must execute before this one.
    ///
    /// This is `inputs()` plus, for `TriggerEvent`, the triggered user-event
    /// slot: the trigger reads the handle its `CreateUserEvent` produced.
    pub fn dependencies(&self) -> SmallVec<[Slot; 4]> {
        let mut deps = self.inputs();
        if let Self::TriggerEvent { lhs, .. } = self {
            deps.push(*lhs);
        }
        deps
    }

    /// The operation this instruction belongs to, when it has one.
    pub fn owner(&self) -> Option<TraceLocalId> {
        match self {
            Self::AssignFenceCompletion { .. }
            | Self::BarrierArrival { .. }
            | Self::BarrierAdvance { .. } => None,
            Self::GetTermEvent { owner, .. }
            | Self::CreateUserEvent { owner, .. }
            | Self::TriggerEvent { owner, .. }
            | Self::MergeEvent { owner, .. }
            | Self::IssueCopy { owner, .. }
            | Self::IssueFill { owner, .. }
            | Self::IssueAcross { owner, .. }
            | Self::SetOpSyncEvent { owner, .. }
            | Self::SetEffects { owner, .. }
            | Self::CompleteReplay { owner, .. } => Some(*owner),
        }
    }

    /// Whether this instruction has effects beyond its own slot, making it a
    /// root for dead-code elimination.
    pub fn is_effectful(&self) -> bool {
        matches!(
            self,
            Self::GetTermEvent { .. }
                | Self::IssueCopy { .. }
                | Self::IssueFill { .. }
                | Self::IssueAcross { .. }
                | Self::SetEffects { .. }
                | Self::CompleteReplay { .. }
                | Self::TriggerEvent { .. }
                | Self::BarrierArrival { .. }
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AssignFenceCompletion { lhs } => {
                write!(f, "events[{lhs}] = fence_completion")
            },
            Self::GetTermEvent { lhs, owner, fence } => {
                write!(f, "events[{lhs}] = term({owner}){}", if *fence { " [fence]" } else { "" })
            },
            Self::CreateUserEvent { lhs, owner } => {
                write!(f, "events[{lhs}] = user_event({owner})")
            },
            Self::TriggerEvent { lhs, rhs, .. } => {
                write!(f, "trigger(events[{lhs}], events[{rhs}])")
            },
            Self::MergeEvent { lhs, rhs, .. } => {
                use itertools::Itertools;
                let operands =
                    rhs.iter().format_with(", ", |slot, f| f(&format_args!("events[{slot}]")));
                write!(f, "events[{lhs}] = merge({operands})")
            },
            Self::IssueCopy { lhs, expr, src_fields, dst_fields, precondition, .. } => {
                write!(f, "events[{lhs}] = copy({expr}, src ")?;
                fmt_fields(f, src_fields)?;
                write!(f, ", dst ")?;
                fmt_fields(f, dst_fields)?;
                write!(f, ", pre events[{precondition}])")
            },
            Self::IssueFill { lhs, expr, dst_fields, precondition, .. } => {
                write!(f, "events[{lhs}] = fill({expr}, dst ")?;
                fmt_fields(f, dst_fields)?;
                write!(f, ", pre events[{precondition}])")
            },
            Self::IssueAcross { lhs, copy_precondition, .. } => {
                write!(f, "events[{lhs}] = across(pre events[{copy_precondition}])")
            },
            Self::SetOpSyncEvent { lhs, owner } => {
                write!(f, "events[{lhs}] = sync_precondition({owner})")
            },
            Self::SetEffects { owner, rhs } => {
                write!(f, "set_effects({owner}, events[{rhs}])")
            },
            Self::CompleteReplay { owner, rhs } => {
                write!(f, "complete_replay({owner}, events[{rhs}])")
            },
            Self::BarrierArrival { lhs, rhs, barrier, arrival_count, collective } => {
                write!(
                    f,
                    "events[{lhs}] = arrive({barrier}, count {arrival_count}, pre events[{rhs}]){}",
                    if *collective { " [collective]" } else { "" }
                )
            },
            Self::BarrierAdvance { lhs, barrier } => {
                write!(f, "events[{lhs}] = advance({barrier})")
            },
        }
    }
}

fn fmt_fields(f: &mut fmt::Formatter<'_>, fields: &[CopyField]) -> fmt::Result {
    write!(f, "[")?;
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{field}")?;
    }
    write!(f, "]")
}
