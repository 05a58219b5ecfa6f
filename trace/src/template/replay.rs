//! Template replay: instruction execution over the persistent event frame.
//!
//! Slices execute concurrently on scoped threads. Every slot a slice reads is
//! either produced earlier in the same slice or pre-filled by
//! `perform_replay` before the slices launch (the fence slot, frontier slots,
//! and crossing events), so slices never observe each other's in-flight
//! writes.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use phalanx_core::{Event, EventFabric, UserEvent};
use tracing::{instrument, trace};

use super::{Instruction, PhysicalTemplate, Slot};
use crate::{
    errors::TraceError,
    issue::IssueEngine,
    op::{MapperOutput, Memoizable, Reservation, TraceLocalId},
};

// REPLAY FRAME
// ================================================================================================

/// The per-template event storage replay slices write into.
///
/// Slot values persist across iterations: recurrent replays read the previous
/// iteration's frontier values out of the same frame.
pub(crate) struct ReplayFrame {
    events: Vec<AtomicU64>,
    user_events: Vec<AtomicU64>,
}

impl ReplayFrame {
    pub fn new(slots: usize) -> Self {
        Self {
            events: (0..slots).map(|_| AtomicU64::new(0)).collect(),
            user_events: (0..slots).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn get(&self, slot: Slot) -> Event {
        Event::from_id(self.events[slot].load(Ordering::Acquire))
    }

    pub fn set(&self, slot: Slot, event: Event) {
        self.events[slot].store(event.id(), Ordering::Release);
    }

    pub fn get_user(&self, slot: Slot) -> UserEvent {
        UserEvent::from_event(Event::from_id(self.user_events[slot].load(Ordering::Acquire)))
    }

    pub fn set_user(&self, slot: Slot, user: UserEvent) {
        self.user_events[slot].store(user.event().id(), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

// REPLAY CONTEXT
// ================================================================================================

/// Everything an executing slice needs, shared immutably across slices.
pub(crate) struct ReplayContext<'a> {
    pub frame: &'a ReplayFrame,
    pub fabric: &'a EventFabric,
    pub issuer: &'a dyn IssueEngine,
    pub operations: &'a BTreeMap<TraceLocalId, Arc<dyn Memoizable>>,
    pub mappings: &'a BTreeMap<TraceLocalId, MapperOutput>,
    pub reservations: &'a BTreeMap<TraceLocalId, Vec<Reservation>>,
    pub fence_completion: Event,
}

impl ReplayContext<'_> {
    fn memo(&self, owner: &TraceLocalId) -> &Arc<dyn Memoizable> {
        // registration is validated against memo_entries before replay begins
        self.operations.get(owner).expect("replay operation was validated at registration")
    }
}

// INSTRUCTION EXECUTION
// ================================================================================================

impl Instruction {
    pub(crate) fn execute(&mut self, ctx: &ReplayContext<'_>) {
        match self {
            Self::AssignFenceCompletion { lhs } => {
                ctx.frame.set(*lhs, ctx.fence_completion);
            },
            Self::GetTermEvent { lhs, owner, .. } => {
                let memo = ctx.memo(owner);
                static EMPTY_RESERVATIONS: Vec<Reservation> = Vec::new();
                let mapping = ctx.mappings.get(owner);
                let reservations =
                    ctx.reservations.get(owner).unwrap_or(&EMPTY_RESERVATIONS);
                if let Some(mapping) = mapping {
                    memo.replay_mapping_output(mapping, reservations);
                }
                ctx.frame.set(*lhs, memo.completion_event());
            },
            Self::CreateUserEvent { lhs, .. } => {
                let user = ctx.fabric.create_user_event();
                ctx.frame.set_user(*lhs, user);
                ctx.frame.set(*lhs, user.event());
            },
            Self::TriggerEvent { lhs, rhs, .. } => {
                ctx.fabric.trigger(ctx.frame.get_user(*lhs), ctx.frame.get(*rhs));
            },
            Self::MergeEvent { lhs, rhs, .. } => {
                let inputs: Vec<Event> = rhs.iter().map(|slot| ctx.frame.get(*slot)).collect();
                ctx.frame.set(*lhs, ctx.fabric.merge(&inputs));
            },
            Self::IssueCopy { lhs, expr, src_fields, dst_fields, reservations, precondition, .. } => {
                let completion = ctx.issuer.issue_copy(
                    *expr,
                    src_fields,
                    dst_fields,
                    reservations,
                    ctx.frame.get(*precondition),
                );
                ctx.frame.set(*lhs, completion);
            },
            Self::IssueFill { lhs, expr, dst_fields, value, precondition, .. } => {
                let completion =
                    ctx.issuer.issue_fill(*expr, dst_fields, value, ctx.frame.get(*precondition));
                ctx.frame.set(*lhs, completion);
            },
            Self::IssueAcross {
                lhs,
                executor,
                copy_precondition,
                collective_precondition,
                src_indirect_precondition,
                dst_indirect_precondition,
                ..
            } => {
                let get = |slot: &Option<Slot>| {
                    slot.map(|s| ctx.frame.get(s)).unwrap_or(Event::NONE)
                };
                let completion = executor.execute(
                    ctx.fabric,
                    ctx.frame.get(*copy_precondition),
                    get(collective_precondition),
                    get(src_indirect_precondition),
                    get(dst_indirect_precondition),
                );
                ctx.frame.set(*lhs, completion);
            },
            Self::SetOpSyncEvent { lhs, owner } => {
                let sync = ctx.memo(owner).compute_sync_precondition(ctx.fabric);
                ctx.frame.set(*lhs, sync);
            },
            Self::SetEffects { owner, rhs } => {
                ctx.memo(owner).set_effects_postcondition(ctx.frame.get(*rhs));
            },
            Self::CompleteReplay { owner, rhs } => {
                ctx.memo(owner).complete_replay(ctx.frame.get(*rhs));
            },
            Self::BarrierArrival { lhs, rhs, barrier, arrival_count, collective } => {
                ctx.fabric.arrive(*barrier, *arrival_count, ctx.frame.get(*rhs));
                ctx.frame.set(*lhs, ctx.fabric.barrier_phase(*barrier));
                if !*collective {
                    barrier.advance();
                }
            },
            Self::BarrierAdvance { lhs, barrier } => {
                ctx.frame.set(*lhs, ctx.fabric.barrier_phase(*barrier));
                barrier.advance();
            },
        }
    }
}

// TEMPLATE REPLAY DRIVER
// ================================================================================================

impl PhysicalTemplate {
    /// Queues a replay of this template. `completion` is the fence event the
    /// replay hangs off; a recurrent replay instead carries the previous
    /// iteration's frontier values forward.
    ///
    /// If a deferred transitive-reduction result is ready, it is finalized
    /// here, followed by a copy-propagation cleanup.
    pub fn initialize_replay(&self, completion: Event, recurrent: bool) {
        if let Some(reduction) = self.pending_reduction.lock().take() {
            if let Some(worker) = self.reduction_worker.lock().take() {
                let _ = worker.join();
            }
            let mut inner = self.inner.lock();
            inner.apply_reduction_sliced(reduction);
            inner.propagate_copies_sliced();
        }
        let mut inner = self.inner.lock();
        inner.pending_replays.push_back((completion, recurrent));
        inner.operations.push_back(BTreeMap::new());
    }

    /// Executes the next queued replay across the template's slices.
    #[instrument(level = "debug", skip(self), fields(template = self.template_id()))]
    pub fn perform_replay(&self) -> Result<(), TraceError> {
        let (frame, mut slices, operations, mappings, reservations, fence_completion);
        {
            let mut inner = self.inner.lock();
            let (completion, recurrent) = inner
                .pending_replays
                .pop_front()
                .expect("perform_replay without initialize_replay");

            let slot_count = inner.events.len();
            let new_frame =
                inner.frame.get_or_insert_with(|| Arc::new(ReplayFrame::new(slot_count))).clone();
            debug_assert_eq!(new_frame.len(), slot_count);

            if recurrent {
                // carry the previous iteration's frontier values forward;
                // sources and destinations are disjoint slot sets
                let carried: Vec<(Slot, Event)> = inner
                    .frontiers
                    .iter()
                    .map(|(src, dst)| (*dst, new_frame.get(*src)))
                    .collect();
                for (dst, event) in carried {
                    new_frame.set(dst, event);
                }
            } else {
                new_frame.set(0, completion);
                for dst in inner.frontiers.values() {
                    new_frame.set(*dst, completion);
                }
                // cross-shard frontier slots also start at the fence; later
                // iterations bind barrier phases into them instead
                for slot in &inner.external_frontier_slots {
                    new_frame.set(*slot, completion);
                }
            }
            let fence = if recurrent { new_frame.get(0) } else { completion };

            // crossing events are materialized fresh each iteration
            for slot in inner.crossing_events.keys().copied().collect::<Vec<_>>() {
                let user = self.ctx.fabric.create_user_event();
                new_frame.set_user(slot, user);
                new_frame.set(slot, user.event());
            }

            let replay_operations = inner.operations.front().cloned().unwrap_or_default();
            for (tlid, (_, kind)) in inner.memo_entries.iter() {
                if !replay_operations.contains_key(tlid) {
                    return Err(TraceError::InvalidMemoization {
                        kind: *kind,
                        tlid: *tlid,
                        uid: 0,
                    });
                }
            }

            frame = new_frame;
            slices = std::mem::take(&mut inner.slices);
            operations = replay_operations;
            mappings = inner.cached_mappings.clone();
            reservations = inner.cached_reservations.clone();
            fence_completion = fence;
            inner.replay_count += 1;
        }

        let ctx = ReplayContext {
            frame: frame.as_ref(),
            fabric: &self.ctx.fabric,
            issuer: self.ctx.issuer.as_ref(),
            operations: &operations,
            mappings: &mappings,
            reservations: &reservations,
            fence_completion,
        };
        std::thread::scope(|scope| {
            for slice in slices.iter_mut() {
                let ctx = &ctx;
                scope.spawn(move || {
                    for instruction in slice.iter_mut() {
                        instruction.execute(ctx);
                    }
                });
            }
        });
        trace!(instructions = slices.iter().map(Vec::len).sum::<usize>(), "replay slices done");

        self.inner.lock().slices = slices;
        Ok(())
    }

    /// The replay queued at the head of the line, if any.
    pub(crate) fn peek_pending_replay(&self) -> Option<(Event, bool)> {
        self.inner.lock().pending_replays.front().copied()
    }

    /// Binds an externally produced event (e.g. a cross-shard barrier phase)
    /// into a frame slot before the slices launch.
    pub(crate) fn set_frame_slot(&self, slot: Slot, event: Event) {
        let mut inner = self.inner.lock();
        let slot_count = inner.events.len();
        let frame = inner.frame.get_or_insert_with(|| Arc::new(ReplayFrame::new(slot_count)));
        frame.set(slot, event);
    }

    /// Gathers the replay's postcondition events (the last users of every
    /// view plus the trailing fence) and retires the replay's operation map.
    pub fn finish_replay(&self) -> Event {
        let mut inner = self.inner.lock();
        let Some(frame) = inner.frame.clone() else {
            return Event::NONE;
        };
        let mut post_events: Vec<Event> = Vec::new();
        for slot in &inner.local_user_slots {
            post_events.push(frame.get(*slot));
        }
        if let Some(fence) = inner.last_fence {
            post_events.push(frame.get(fence));
        }
        inner.operations.pop_front();
        drop(inner);
        self.ctx.fabric.merge(&post_events)
    }
}
