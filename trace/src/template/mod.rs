use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use phalanx_core::{Event, ExprId, FieldMask, Region, ShardId, UserEvent, ViewId};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::{
    condition::TraceConditionSet,
    context::TraceContext,
    errors::{RejectionReason, Replayable, TraceError},
    issue::{AcrossExecutor, CopyField},
    op::{
        MapperOutput, Memoizable, OperationKind, RegionUsage, Reservation, TraceLocalId,
        UniqueOpId, check_dependence,
    },
    view_set::FailedPrecondition,
};

mod instruction;
mod optimize;
mod replay;

#[cfg(test)]
mod tests;

pub use instruction::{Instruction, Slot};
pub(crate) use replay::ReplayFrame;

// VIEW USERS
// ================================================================================================

/// One recorded access to a view: the usage, the slot whose event signals the
/// access's completion, the sub-expression touched, and the fields.
///
/// Users are stored unpruned on the view's owner shard; last-user queries
/// filter by the recording order (the owning operation's context index, which
/// control replication keeps identical across shards) and by dominance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ViewUser {
    pub usage: RegionUsage,
    pub slot: Slot,
    pub expr: ExprId,
    pub mask: FieldMask,
    /// Shard the user's slot numbering belongs to.
    pub shard: ShardId,
    /// Position of the owning operation in the trace window.
    pub order: u64,
}

/// Last-user lookup result: slots local to the requesting shard plus phase
/// barriers standing in for users on other shards.
#[derive(Clone, Debug, Default)]
pub(crate) struct LastUsers {
    pub slots: BTreeSet<Slot>,
    pub barriers: Vec<phalanx_core::Barrier>,
}

impl LastUsers {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.barriers.is_empty()
    }
}

/// Routes last-user queries during fence elision. The local router answers
/// from this template's tables; the sharded router forwards queries to each
/// view's owner shard and realizes cross-shard edges as barriers.
pub(crate) trait UserRouter {
    fn local_shard(&self) -> ShardId;

    /// The last users of `view` that conflict with an access of `usage` over
    /// `(expr, mask)`. With `before`, only users recorded strictly earlier in
    /// the trace window are considered; without it, the end-of-trace state is
    /// queried.
    fn find_users(
        &self,
        inner: &mut TemplateInner,
        view: ViewId,
        usage: RegionUsage,
        expr: ExprId,
        mask: FieldMask,
        before: Option<u64>,
    ) -> LastUsers;

    /// Whether every traced user of the view's fields is read-only, across
    /// all shards that recorded one.
    fn all_users_read_only(
        &self,
        inner: &mut TemplateInner,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
    ) -> bool;

    /// Called when a cross-iteration frontier barrier from a peer shard is
    /// bound to a local external slot, so the sharded replay can fill and
    /// refresh it.
    fn note_remote_frontier(&self, _barrier: phalanx_core::Barrier, _slot: Slot) {}
}

/// The single-shard router: all users live in this template's tables.
pub(crate) struct LocalRouter {
    pub forest: Arc<phalanx_core::ExpressionForest>,
}

impl UserRouter for LocalRouter {
    fn local_shard(&self) -> ShardId {
        ShardId::new(0)
    }

    fn find_users(
        &self,
        inner: &mut TemplateInner,
        view: ViewId,
        usage: RegionUsage,
        expr: ExprId,
        mask: FieldMask,
        before: Option<u64>,
    ) -> LastUsers {
        let mut users = LastUsers::default();
        users.slots = inner
            .last_users(&self.forest, view, usage, expr, mask, before)
            .into_iter()
            .map(|user| user.slot)
            .collect();
        users
    }

    fn all_users_read_only(
        &self,
        inner: &mut TemplateInner,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
    ) -> bool {
        inner.local_users_read_only(view, expr, mask)
    }
}

// RECORDING-SIDE VIEW TABLES
// ================================================================================================

/// A view access recorded against an operation, consumed by fence elision.
#[derive(Clone, Debug)]
pub(crate) struct OpViewRecord {
    pub view: ViewId,
    pub expr: ExprId,
    pub usage: RegionUsage,
    pub mask: FieldMask,
}

/// The views a recorded copy or fill reads and writes.
#[derive(Clone, Debug, Default)]
pub(crate) struct CopyViewRecord {
    pub expr: ExprId,
    pub srcs: Vec<(ViewId, FieldMask)>,
    pub dsts: Vec<(ViewId, FieldMask)>,
}

/// An indirection-field access of a gather/scatter copy.
#[derive(Clone, Debug)]
pub(crate) struct IndirectViewRecord {
    pub view: ViewId,
    pub expr: ExprId,
    pub mask: FieldMask,
}

/// Bookkeeping for a cross-slice crossing event.
#[derive(Clone, Debug)]
pub(crate) struct CrossingInfo {
    /// Slot whose value the crossing re-publishes.
    pub source: Slot,
    /// Number of operand references redirected to the crossing.
    pub refs: usize,
}

/// A transitive-reduction result computed on a background worker, applied by
/// the next replay.
#[derive(Debug, Default)]
pub(crate) struct PendingReduction {
    pub merges: Vec<(Slot, SmallVec<[Slot; 4]>)>,
}

// TEMPLATE STATE
// ================================================================================================

pub(crate) struct TemplateInner {
    /// Event recorded (or bound at replay) per slot. Slot 0 is the fence
    /// completion.
    pub events: Vec<Event>,
    /// Recording-time reverse map from event to owning slot.
    pub event_map: BTreeMap<Event, Slot>,
    /// Recording-time user events per slot.
    pub user_events: BTreeMap<Slot, UserEvent>,
    /// Instruction stream; emptied into `slices` by parallel-replay
    /// preparation.
    pub instructions: Vec<Instruction>,
    /// Recurrence map: on cyclic replay, slot `dst` receives the previous
    /// iteration's value of slot `src`.
    pub frontiers: BTreeMap<Slot, Slot>,
    /// Slots bound outside the instruction stream: cross-shard frontier
    /// barriers fill them per replay (the fence completion on the first
    /// iteration).
    pub external_frontier_slots: BTreeSet<Slot>,
    /// Recorded operation fingerprints: trace-local id to (term slot, kind).
    pub memo_entries: BTreeMap<TraceLocalId, (Slot, OperationKind)>,
    /// One map per in-flight replay: the live operations standing in for the
    /// recorded ones.
    pub operations: VecDeque<BTreeMap<TraceLocalId, Arc<dyn Memoizable>>>,
    pub pending_replays: VecDeque<(Event, bool)>,
    /// Replayability conditions, one per region the trace touched.
    pub conditions: Vec<Arc<TraceConditionSet>>,
    pub cached_mappings: BTreeMap<TraceLocalId, MapperOutput>,
    pub cached_premappings: BTreeMap<TraceLocalId, MapperOutput>,
    pub cached_reservations: BTreeMap<TraceLocalId, Vec<Reservation>>,

    // recording-side view tables, consumed by fence elision
    pub op_views: BTreeMap<TraceLocalId, Vec<OpViewRecord>>,
    pub copy_views: BTreeMap<Slot, CopyViewRecord>,
    pub src_indirect_views: BTreeMap<Slot, Vec<IndirectViewRecord>>,
    pub dst_indirect_views: BTreeMap<Slot, Vec<IndirectViewRecord>>,
    /// Gather/scatter executors whose preimage mutability is decided at
    /// finalization.
    pub across_copies: Vec<(Slot, Arc<dyn AcrossExecutor>)>,

    /// Authoritative view-user state for views this shard owns, fed at
    /// record time (under control replication, by peer shards too).
    pub view_users: BTreeMap<ViewId, Vec<ViewUser>>,
    /// Slots of every user this shard itself recorded, regardless of which
    /// shard owns the view. These carry the replay's postconditions.
    pub local_user_slots: BTreeSet<Slot>,
    /// Local slots a peer shard consumes as last users.
    pub remote_consumed_slots: BTreeSet<Slot>,
    /// Shard this template records for.
    pub local_shard: ShardId,
    /// Regions touched by the trace with the fields accessed, one condition
    /// set each.
    pub trace_regions: BTreeMap<Region, FieldMask>,
    pub last_fence: Option<Slot>,

    // replay partitioning
    pub slices: Vec<Vec<Instruction>>,
    pub slice_tasks: Vec<Vec<TraceLocalId>>,
    pub crossing_events: BTreeMap<Slot, CrossingInfo>,

    pub replay_count: u64,
    pub frame: Option<Arc<ReplayFrame>>,

    // capture state
    pub recording: bool,
    pub replayable: Option<Replayable>,
    pub virtual_mapping: Option<TraceLocalId>,
    pub owner_shards: BTreeMap<TraceLocalId, ShardId>,
    pub local_spaces: BTreeMap<TraceLocalId, ExprId>,
    pub sharding_functions: BTreeMap<TraceLocalId, u32>,
}

impl TemplateInner {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            event_map: BTreeMap::new(),
            user_events: BTreeMap::new(),
            instructions: Vec::new(),
            frontiers: BTreeMap::new(),
            external_frontier_slots: BTreeSet::new(),
            memo_entries: BTreeMap::new(),
            operations: VecDeque::new(),
            pending_replays: VecDeque::new(),
            conditions: Vec::new(),
            cached_mappings: BTreeMap::new(),
            cached_premappings: BTreeMap::new(),
            cached_reservations: BTreeMap::new(),
            op_views: BTreeMap::new(),
            copy_views: BTreeMap::new(),
            src_indirect_views: BTreeMap::new(),
            dst_indirect_views: BTreeMap::new(),
            across_copies: Vec::new(),
            view_users: BTreeMap::new(),
            local_user_slots: BTreeSet::new(),
            remote_consumed_slots: BTreeSet::new(),
            local_shard: ShardId::new(0),
            trace_regions: BTreeMap::new(),
            last_fence: None,
            slices: Vec::new(),
            slice_tasks: Vec::new(),
            crossing_events: BTreeMap::new(),
            replay_count: 0,
            frame: None,
            recording: true,
            replayable: None,
            virtual_mapping: None,
            owner_shards: BTreeMap::new(),
            local_spaces: BTreeMap::new(),
            sharding_functions: BTreeMap::new(),
        }
    }

    /// Binds a new slot to `event`.
    pub(crate) fn alloc_slot(&mut self, event: Event) -> Slot {
        let slot = self.events.len();
        self.events.push(event);
        if event.exists() {
            self.event_map.entry(event).or_insert(slot);
        }
        slot
    }

    pub(crate) fn find_event_slot(&self, event: Event) -> Option<Slot> {
        self.event_map.get(&event).copied()
    }

    /// Maps an operand event to a slot: unknown events fold to the fence
    /// completion at slot 0, which dominates everything recorded before the
    /// trace.
    pub(crate) fn operand_slot(&self, event: Event) -> Slot {
        if !event.exists() {
            return 0;
        }
        self.find_event_slot(event).unwrap_or(0)
    }

    /// Installs a user into the owner-side table for `view`.
    pub(crate) fn add_view_user(
        &mut self,
        view: ViewId,
        usage: RegionUsage,
        slot: Slot,
        expr: ExprId,
        mask: FieldMask,
        shard: ShardId,
        order: u64,
    ) {
        self.view_users
            .entry(view)
            .or_default()
            .push(ViewUser { usage, slot, expr, mask, shard, order });
    }

    /// The last users of `view` conflicting with an access of `usage` over
    /// `(expr, mask)`.
    ///
    /// Candidates are users recorded strictly before `before` (or all of
    /// them, for the end-of-trace state) whose fields and points overlap the
    /// query and whose usage conflicts. A candidate is dropped when a later
    /// candidate dominates it: waiting on the later one already orders the
    /// earlier one.
    pub(crate) fn last_users(
        &self,
        forest: &phalanx_core::ExpressionForest,
        view: ViewId,
        usage: RegionUsage,
        expr: ExprId,
        mask: FieldMask,
        before: Option<u64>,
    ) -> Vec<ViewUser> {
        let Some(users) = self.view_users.get(&view) else {
            return Vec::new();
        };
        let candidates: Vec<&ViewUser> = users
            .iter()
            .filter(|user| before.is_none_or(|order| user.order < order))
            .filter(|user| user.mask.overlaps(&mask))
            .filter(|user| !forest.is_empty(forest.intersect(user.expr, expr)))
            .filter(|user| check_dependence(&user.usage, &usage).is_dependence())
            .collect();
        let mut last: Vec<ViewUser> = Vec::new();
        'outer: for (i, user) in candidates.iter().enumerate() {
            for (j, later) in candidates.iter().enumerate() {
                if i == j || later.order <= user.order {
                    continue;
                }
                let fields_covered = later.mask.contains(&(user.mask & mask));
                let points_covered = {
                    let shared = forest.intersect(user.expr, expr);
                    forest.volume(forest.intersect(later.expr, shared)) == forest.volume(shared)
                };
                if fields_covered
                    && points_covered
                    && check_dependence(&user.usage, &later.usage).is_dependence()
                {
                    continue 'outer;
                }
            }
            last.push((*user).clone());
        }
        last
    }

    pub(crate) fn local_users_read_only(
        &self,
        view: ViewId,
        _expr: ExprId,
        mask: FieldMask,
    ) -> bool {
        match self.view_users.get(&view) {
            Some(users) => users
                .iter()
                .filter(|user| user.mask.overlaps(&mask))
                .all(|user| user.usage.privilege.is_read_only()),
            None => true,
        }
    }

    /// Total instruction count across the stream or, post-slicing, the
    /// slices.
    pub(crate) fn instruction_count(&self) -> usize {
        if self.slices.is_empty() {
            self.instructions.len()
        } else {
            self.slices.iter().map(Vec::len).sum()
        }
    }

    /// Runs `f` over every instruction, wherever it currently lives.
    pub(crate) fn for_each_instruction(&self, mut f: impl FnMut(&Instruction)) {
        if self.slices.is_empty() {
            self.instructions.iter().for_each(&mut f);
        } else {
            for slice in &self.slices {
                slice.iter().for_each(&mut f);
            }
        }
    }
}

impl std::fmt::Debug for TemplateInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateInner")
            .field("events", &self.events.len())
            .field("instructions", &self.instruction_count())
            .field("recording", &self.recording)
            .field("replay_count", &self.replay_count)
            .finish()
    }
}

// PHYSICAL TEMPLATE
// ================================================================================================

static NEXT_TEMPLATE_ID: AtomicU64 = AtomicU64::new(1);

/// One captured instance of a physical trace: an instruction stream whose
/// execution reproduces the effects of one iteration of the trace.
///
/// A template is recorded while the trace runs for the first time, optimized
/// into a minimal replayable DAG at capture completion, checked against
/// current equivalence-set state on every later trace entry, and replayed in
/// parallel slices when it matches.
pub struct PhysicalTemplate {
    pub(crate) ctx: Arc<TraceContext>,
    template_id: u64,
    pub(crate) inner: Mutex<TemplateInner>,
    /// Single-writer/single-reader handoff from the background reduction
    /// worker to the next replay.
    pub(crate) pending_reduction: Arc<Mutex<Option<PendingReduction>>>,
    pub(crate) reduction_worker: Mutex<Option<JoinHandle<()>>>,
    /// Event that must trigger before the template may be deleted.
    deletion_precondition: Mutex<Option<Event>>,
}

impl PhysicalTemplate {
    /// Starts recording a new template whose slot 0 is bound to the trace's
    /// fence completion.
    pub fn new(ctx: Arc<TraceContext>, fence_completion: Event) -> Arc<Self> {
        let mut inner = TemplateInner::new();
        let fence_slot = inner.alloc_slot(fence_completion);
        debug_assert_eq!(fence_slot, 0);
        inner.instructions.push(Instruction::AssignFenceCompletion { lhs: fence_slot });
        Arc::new(Self {
            ctx,
            template_id: NEXT_TEMPLATE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(inner),
            pending_reduction: Arc::new(Mutex::new(None)),
            reduction_worker: Mutex::new(None),
            deletion_precondition: Mutex::new(None),
        })
    }

    pub fn template_id(&self) -> u64 {
        self.template_id
    }

    /// Tags the template with the shard it records for (control replication
    /// only).
    pub(crate) fn set_local_shard(&self, shard: ShardId) {
        self.inner.lock().local_shard = shard;
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().recording
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self.inner.lock().replayable, Some(Replayable::Replayable))
    }

    pub fn replay_count(&self) -> u64 {
        self.inner.lock().replay_count
    }

    /// Number of live instructions, for introspection and tests.
    pub fn instruction_count(&self) -> usize {
        self.inner.lock().instruction_count()
    }

    /// Number of condition sets, one per region the trace touched.
    pub fn condition_count(&self) -> usize {
        self.inner.lock().conditions.len()
    }

    // RECORDING
    // --------------------------------------------------------------------------------------------

    /// Records the completion event of a memoizable operation, fingerprinting
    /// it for replay validation. Fence operations additionally become the
    /// template's trailing fence.
    pub fn record_get_term_event(&self, memo: &Arc<dyn Memoizable>, kind: OperationKind) {
        let tlid = memo.trace_local_id();
        let term = memo.completion_event();
        let mut inner = self.lock_recording();
        let slot = inner.alloc_slot(term);
        let fence = matches!(kind, OperationKind::Fence);
        inner.instructions.push(Instruction::GetTermEvent { lhs: slot, owner: tlid, fence });
        inner.memo_entries.insert(tlid, (slot, kind));
        if fence {
            inner.last_fence = Some(slot);
        }
    }

    /// Records the creation of a user event.
    pub fn record_create_user_event(&self, user: UserEvent, owner: TraceLocalId) {
        let mut inner = self.lock_recording();
        let slot = inner.alloc_slot(user.event());
        inner.user_events.insert(slot, user);
        inner.instructions.push(Instruction::CreateUserEvent { lhs: slot, owner });
    }

    /// Records triggering `user` with `precondition`.
    pub fn record_trigger_event(
        &self,
        user: UserEvent,
        precondition: Event,
        owner: TraceLocalId,
    ) {
        let mut inner = self.lock_recording();
        let lhs = inner
            .find_event_slot(user.event())
            .expect("triggered user event was never recorded");
        let rhs = inner.operand_slot(precondition);
        inner.instructions.push(Instruction::TriggerEvent { lhs, rhs, owner });
    }

    /// Records a merge. `lhs` is the runtime's merged event; if the merge
    /// collapsed to one of its inputs (or to no event at all), the result is
    /// renamed through a fresh user event so the template owns a canonical
    /// slot for it.
    pub fn record_merge_events(&self, lhs: &mut Event, rhs: &[Event], owner: TraceLocalId) {
        let mut inner = self.lock_recording();
        let mut rhs_slots: SmallVec<[Slot; 4]> =
            rhs.iter().map(|event| inner.operand_slot(*event)).collect();
        rhs_slots.sort_unstable();
        rhs_slots.dedup();
        if rhs_slots.is_empty() {
            rhs_slots.push(0);
        }
        if !lhs.exists() || inner.event_map.contains_key(lhs) {
            let rename = self.ctx.fabric.create_user_event();
            self.ctx.fabric.trigger(rename, *lhs);
            *lhs = rename.event();
        }
        let slot = inner.alloc_slot(*lhs);
        inner.instructions.push(Instruction::MergeEvent { lhs: slot, rhs: rhs_slots, owner });
    }

    /// Records a copy issued by `owner`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_issue_copy(
        &self,
        owner: TraceLocalId,
        lhs: &mut Event,
        expr: ExprId,
        src_fields: Vec<CopyField>,
        dst_fields: Vec<CopyField>,
        reservations: Vec<Reservation>,
        precondition: Event,
    ) {
        let mut inner = self.lock_recording();
        let pre = inner.operand_slot(precondition);
        self.ensure_result_event(&mut inner, lhs);
        let slot = inner.alloc_slot(*lhs);
        inner.instructions.push(Instruction::IssueCopy {
            lhs: slot,
            owner,
            expr,
            src_fields,
            dst_fields,
            reservations,
            precondition: pre,
        });
    }

    /// Records a fill issued by `owner`.
    pub fn record_issue_fill(
        &self,
        owner: TraceLocalId,
        lhs: &mut Event,
        expr: ExprId,
        dst_fields: Vec<CopyField>,
        value: Vec<u8>,
        precondition: Event,
    ) {
        let mut inner = self.lock_recording();
        let pre = inner.operand_slot(precondition);
        self.ensure_result_event(&mut inner, lhs);
        let slot = inner.alloc_slot(*lhs);
        inner.instructions.push(Instruction::IssueFill {
            lhs: slot,
            owner,
            expr,
            dst_fields,
            value,
            precondition: pre,
        });
    }

    /// Records a gather/scatter copy with its four preconditions.
    #[allow(clippy::too_many_arguments)]
    pub fn record_issue_across(
        &self,
        owner: TraceLocalId,
        lhs: &mut Event,
        executor: Arc<dyn AcrossExecutor>,
        copy_precondition: Event,
        collective_precondition: Option<Event>,
        src_indirect_precondition: Option<Event>,
        dst_indirect_precondition: Option<Event>,
    ) {
        let mut inner = self.lock_recording();
        let copy_pre = inner.operand_slot(copy_precondition);
        let collective = collective_precondition.map(|e| inner.operand_slot(e));
        let src_pre = src_indirect_precondition.map(|e| inner.operand_slot(e));
        let dst_pre = dst_indirect_precondition.map(|e| inner.operand_slot(e));
        self.ensure_result_event(&mut inner, lhs);
        let slot = inner.alloc_slot(*lhs);
        inner.across_copies.push((slot, executor.clone()));
        inner.instructions.push(Instruction::IssueAcross {
            lhs: slot,
            owner,
            executor,
            copy_precondition: copy_pre,
            collective_precondition: collective,
            src_indirect_precondition: src_pre,
            dst_indirect_precondition: dst_pre,
        });
    }

    /// Records the owner's synchronization precondition.
    pub fn record_set_op_sync_event(&self, lhs: &mut Event, owner: TraceLocalId) {
        let mut inner = self.lock_recording();
        self.ensure_result_event(&mut inner, lhs);
        let slot = inner.alloc_slot(*lhs);
        inner.instructions.push(Instruction::SetOpSyncEvent { lhs: slot, owner });
    }

    /// Records the owner's effects postcondition.
    pub fn record_set_effects(&self, owner: TraceLocalId, effects: Event) {
        let mut inner = self.lock_recording();
        let rhs = inner.operand_slot(effects);
        let _ = inner.alloc_slot(Event::NONE);
        inner.instructions.push(Instruction::SetEffects { owner, rhs });
    }

    /// Records the completion of the owner's replay.
    pub fn record_complete_replay(&self, owner: TraceLocalId, precondition: Event) {
        let mut inner = self.lock_recording();
        let rhs = inner.operand_slot(precondition);
        let _ = inner.alloc_slot(Event::NONE);
        inner.instructions.push(Instruction::CompleteReplay { owner, rhs });
    }

    /// Records one region access of an operation, feeding fence elision and
    /// the condition capture. The access completes at the operation's term
    /// event, which becomes its view-user slot.
    #[allow(clippy::too_many_arguments)]
    pub fn record_op_view(
        &self,
        owner: TraceLocalId,
        view: ViewId,
        region: Region,
        expr: ExprId,
        usage: RegionUsage,
        mask: FieldMask,
    ) {
        let slot = self.record_op_view_tables(owner, view, region, expr, usage, mask);
        let mut inner = self.inner.lock();
        let shard = inner.local_shard;
        inner.add_view_user(view, usage, slot, expr, mask, shard, owner.context_index);
    }

    /// The table half of [`Self::record_op_view`]: everything except the
    /// owner-side user installation (which control replication routes to the
    /// view's owner shard). Returns the access's user slot.
    pub(crate) fn record_op_view_tables(
        &self,
        owner: TraceLocalId,
        view: ViewId,
        region: Region,
        expr: ExprId,
        usage: RegionUsage,
        mask: FieldMask,
    ) -> Slot {
        let mut inner = self.lock_recording();
        inner
            .op_views
            .entry(owner)
            .or_default()
            .push(OpViewRecord { view, expr, usage, mask });
        *inner.trace_regions.entry(region).or_insert(FieldMask::EMPTY) |= mask;
        let slot = inner.memo_entries.get(&owner).map(|(slot, _)| *slot).unwrap_or(0);
        inner.local_user_slots.insert(slot);
        slot
    }

    /// Records the views a copy reads and writes.
    #[allow(clippy::too_many_arguments)]
    pub fn record_copy_views(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        region: Region,
        expr: ExprId,
        srcs: Vec<(ViewId, FieldMask)>,
        dsts: Vec<(ViewId, FieldMask)>,
    ) {
        let slot = self.record_copy_view_tables(lhs, region, &srcs, &dsts, expr);
        let mut inner = self.inner.lock();
        let shard = inner.local_shard;
        for (view, mask) in srcs {
            inner.add_view_user(
                view,
                RegionUsage::read_only(),
                slot,
                expr,
                mask,
                shard,
                owner.context_index,
            );
        }
        for (view, mask) in dsts {
            inner.add_view_user(
                view,
                RegionUsage::read_write(),
                slot,
                expr,
                mask,
                shard,
                owner.context_index,
            );
        }
    }

    /// The table half of [`Self::record_copy_views`]. Returns the copy's
    /// user slot.
    pub(crate) fn record_copy_view_tables(
        &self,
        lhs: Event,
        region: Region,
        srcs: &[(ViewId, FieldMask)],
        dsts: &[(ViewId, FieldMask)],
        expr: ExprId,
    ) -> Slot {
        let mut inner = self.lock_recording();
        let slot = inner.operand_slot(lhs);
        let mut combined = FieldMask::EMPTY;
        for (_, mask) in srcs.iter().chain(dsts.iter()) {
            combined |= *mask;
        }
        *inner.trace_regions.entry(region).or_insert(FieldMask::EMPTY) |= combined;
        let record = inner.copy_views.entry(slot).or_default();
        record.expr = expr;
        record.srcs.extend_from_slice(srcs);
        record.dsts.extend_from_slice(dsts);
        inner.local_user_slots.insert(slot);
        slot
    }

    /// Records the views a fill writes.
    pub fn record_fill_views(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        region: Region,
        expr: ExprId,
        dsts: Vec<(ViewId, FieldMask)>,
    ) {
        self.record_copy_views(owner, lhs, region, expr, Vec::new(), dsts);
    }

    /// Records the indirection fields of a gather/scatter copy.
    pub fn record_indirect_views(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        src_indirect: Vec<(ViewId, ExprId, FieldMask)>,
        dst_indirect: Vec<(ViewId, ExprId, FieldMask)>,
    ) {
        let mut inner = self.lock_recording();
        let slot = inner.operand_slot(lhs);
        let shard = inner.local_shard;
        for (view, expr, mask) in src_indirect.iter().chain(dst_indirect.iter()) {
            inner.add_view_user(
                *view,
                RegionUsage::read_only(),
                slot,
                *expr,
                *mask,
                shard,
                owner.context_index,
            );
        }
        inner.src_indirect_views.entry(slot).or_default().extend(
            src_indirect.into_iter().map(|(view, expr, mask)| IndirectViewRecord {
                view,
                expr,
                mask,
            }),
        );
        inner.dst_indirect_views.entry(slot).or_default().extend(
            dst_indirect.into_iter().map(|(view, expr, mask)| IndirectViewRecord {
                view,
                expr,
                mask,
            }),
        );
    }

    /// Caches the mapper's decisions for an operation.
    pub fn record_mapper_output(&self, memo: &Arc<dyn Memoizable>, output: MapperOutput) {
        let tlid = memo.trace_local_id();
        let mut inner = self.lock_recording();
        if output.virtual_mapping {
            inner.virtual_mapping.get_or_insert(tlid);
        }
        inner.cached_mappings.insert(tlid, output);
    }

    pub fn get_mapper_output(&self, tlid: TraceLocalId) -> Option<MapperOutput> {
        self.inner.lock().cached_mappings.get(&tlid).cloned()
    }

    /// Caches premapping decisions of an index operation.
    pub fn record_premap_output(&self, tlid: TraceLocalId, output: MapperOutput) {
        self.lock_recording().cached_premappings.insert(tlid, output);
    }

    pub fn get_premap_output(&self, tlid: TraceLocalId) -> Option<MapperOutput> {
        self.inner.lock().cached_premappings.get(&tlid).cloned()
    }

    /// Caches the reservations a task must reacquire on replay.
    pub fn record_reservations(&self, tlid: TraceLocalId, reservations: Vec<Reservation>) {
        self.lock_recording().cached_reservations.insert(tlid, reservations);
    }

    pub fn get_task_reservations(&self, tlid: TraceLocalId) -> Vec<Reservation> {
        self.inner.lock().cached_reservations.get(&tlid).cloned().unwrap_or_default()
    }

    /// Records the shard owning an index point (control replication only).
    pub fn record_owner_shard(&self, tlid: TraceLocalId, shard: ShardId) {
        self.lock_recording().owner_shards.insert(tlid, shard);
    }

    /// Records the local index space of an index operation.
    pub fn record_local_space(&self, tlid: TraceLocalId, expr: ExprId) {
        self.lock_recording().local_spaces.insert(tlid, expr);
    }

    /// Records the sharding function an index operation used.
    pub fn record_sharding_function(&self, tlid: TraceLocalId, function_id: u32) {
        self.lock_recording().sharding_functions.insert(tlid, function_id);
    }

    fn ensure_result_event(&self, inner: &mut TemplateInner, lhs: &mut Event) {
        if !lhs.exists() || inner.event_map.contains_key(lhs) {
            let rename = self.ctx.fabric.create_user_event();
            self.ctx.fabric.trigger(rename, *lhs);
            *lhs = rename.event();
        }
    }

    fn lock_recording(&self) -> parking_lot::MutexGuard<'_, TemplateInner> {
        let inner = self.inner.lock();
        debug_assert!(inner.recording, "template {} is not recording", self.template_id);
        inner
    }

    // FINALIZATION
    // --------------------------------------------------------------------------------------------

    /// Completes the capture: captures replayability conditions, decides
    /// replayability, and (for replayable templates) runs the optimization
    /// pipeline.
    pub fn finalize(self: &Arc<Self>, blocking_call_observed: bool) -> Replayable {
        let router = LocalRouter { forest: self.ctx.forest.clone() };
        self.finalize_with_router(blocking_call_observed, &router)
    }

    pub(crate) fn finalize_with_router(
        self: &Arc<Self>,
        blocking_call_observed: bool,
        router: &dyn UserRouter,
    ) -> Replayable {
        self.capture_conditions();
        let replayable = self.check_replayable(blocking_call_observed);
        {
            let mut inner = self.inner.lock();
            inner.recording = false;
            inner.replayable = Some(replayable.clone());
        }
        if replayable.is_replayable() {
            self.optimize(router);
        }
        if self.ctx.config.dump_templates() {
            self.dump(&replayable);
        }
        replayable
    }

    pub(crate) fn capture_conditions(&self) {
        let trace_regions = {
            let inner = self.inner.lock();
            inner.trace_regions.clone()
        };
        let mut conditions = Vec::with_capacity(trace_regions.len());
        for (region, mask) in trace_regions {
            conditions.push(TraceConditionSet::capture(
                self.ctx.forest.clone(),
                self.ctx.versions.clone(),
                region,
                mask,
            ));
        }
        self.inner.lock().conditions = conditions;
    }

    /// The local replayability decision.
    pub(crate) fn check_replayable(&self, blocking_call_observed: bool) -> Replayable {
        if blocking_call_observed {
            return Replayable::NotReplayable(RejectionReason::BlockingCall);
        }
        let inner = self.inner.lock();
        if let Some(tlid) = inner.virtual_mapping {
            return Replayable::NotReplayable(RejectionReason::VirtualMapping { tlid });
        }
        for condition in &inner.conditions {
            if let Err(reason) = condition.check_idempotence() {
                return Replayable::NotReplayable(reason);
            }
        }
        Replayable::Replayable
    }

    /// The replay frame's current value of a slot.
    pub(crate) fn slot_event(&self, slot: Slot) -> Event {
        let inner = self.inner.lock();
        match &inner.frame {
            Some(frame) => frame.get(slot),
            None => Event::NONE,
        }
    }

    pub(crate) fn dump(&self, replayable: &Replayable) {
        let inner = self.inner.lock();
        debug!(template = self.template_id, ?replayable, "template capture complete");
        inner.for_each_instruction(|instruction| debug!("  {instruction}"));
    }

    // PRECONDITIONS AND POSTCONDITIONS
    // --------------------------------------------------------------------------------------------

    /// Tests every condition set against current equivalence-set state.
    pub fn check_preconditions(&self) -> Result<(), FailedPrecondition> {
        let conditions = self.inner.lock().conditions.clone();
        for condition in &conditions {
            condition.test_require()?;
        }
        Ok(())
    }

    /// Stamps every condition set's postconditions into the equivalence
    /// sets. Used both after replay and by summary operations when a trace is
    /// invalidated mid-flight.
    pub fn apply_postconditions(&self) {
        let conditions = self.inner.lock().conditions.clone();
        for condition in &conditions {
            condition.ensure();
        }
    }

    /// Issues the postcondition stamps outside replay, on behalf of a
    /// summary operation.
    pub fn issue_summary_operations(&self) {
        self.apply_postconditions();
    }

    // REPLAY REGISTRATION
    // --------------------------------------------------------------------------------------------

    /// Registers a live operation standing in for a recorded one on the
    /// newest in-flight replay.
    pub fn register_replay_operation(
        &self,
        memo: Arc<dyn Memoizable>,
        kind: OperationKind,
        uid: UniqueOpId,
    ) -> Result<(), TraceError> {
        let tlid = memo.trace_local_id();
        let mut inner = self.inner.lock();
        match inner.memo_entries.get(&tlid) {
            Some((_, recorded_kind)) if *recorded_kind == kind => {},
            _ => return Err(TraceError::InvalidMemoization { kind, tlid, uid }),
        }
        if inner.operations.is_empty() {
            inner.operations.push_back(BTreeMap::new());
        }
        inner
            .operations
            .back_mut()
            .expect("just ensured non-empty")
            .insert(tlid, memo);
        Ok(())
    }

    // DELETION
    // --------------------------------------------------------------------------------------------

    /// Defers deletion of this template until `precondition` has triggered
    /// and the background reduction worker (if any) has finished.
    pub fn defer_template_deletion(&self, precondition: Event) {
        *self.deletion_precondition.lock() = Some(precondition);
    }

    /// The event the owner must wait on before dropping the template.
    pub fn completion_for_deletion(&self) -> Event {
        self.deletion_precondition.lock().unwrap_or_default()
    }

    /// Whether the template can be deleted now.
    pub fn ready_for_deletion(&self) -> bool {
        let precondition = self.completion_for_deletion();
        let worker_done = self.reduction_worker.lock().is_none();
        self.ctx.fabric.has_triggered(precondition)
            && worker_done
            && self.inner.lock().operations.is_empty()
    }
}

impl Drop for PhysicalTemplate {
    fn drop(&mut self) {
        // the background reduction worker borrows nothing from the template,
        // but joining here preserves the deletion contract
        if let Some(worker) = self.reduction_worker.get_mut().take() {
            let _ = worker.join();
        }
        let precondition = *self.deletion_precondition.get_mut();
        if let Some(precondition) = precondition
            && !self.ctx.fabric.has_triggered(precondition)
        {
            warn!(template = self.template_id, "template deleted before completion precondition");
        }
    }
}

impl std::fmt::Debug for PhysicalTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalTemplate")
            .field("template_id", &self.template_id)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}
