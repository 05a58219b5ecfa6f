//! Control-replicated templates.
//!
//! Every shard records and replays the same trace but owns a disjoint slice
//! of the view-user state: each view is owned by exactly one shard, computed
//! deterministically from the backing instance's owner space and the view's
//! region tree. Cross-shard event dependences are realized as phase-barrier
//! arrival/advance instruction pairs, refreshed cooperatively when the
//! barrier generations run out.

use core::fmt;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use phalanx_core::{
    AddressSpace, Barrier, Event, FieldMask, IntervalSet, Region, ShardId, TreeId, ViewId,
    serde::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable,
        SliceReader},
};
use tracing::{debug, warn};

use crate::{
    context::TraceContext,
    errors::{RejectionReason, Replayable, TraceError},
    op::{RegionUsage, TraceLocalId},
    template::{Instruction, LastUsers, PhysicalTemplate, Slot, UserRouter},
};

// SHARD MAPPING
// ================================================================================================

/// Where each shard of a control-replicated execution lives.
#[derive(Clone, Debug)]
pub struct ShardMapping {
    shards_by_space: BTreeMap<AddressSpace, Vec<ShardId>>,
    all: Vec<ShardId>,
}

impl ShardMapping {
    pub fn new(shards_by_space: BTreeMap<AddressSpace, Vec<ShardId>>) -> Self {
        let mut all: Vec<ShardId> = shards_by_space.values().flatten().copied().collect();
        all.sort_unstable();
        all.dedup();
        assert!(!all.is_empty(), "a shard mapping needs at least one shard");
        Self { shards_by_space, all }
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.all
    }

    pub fn total_shards(&self) -> usize {
        self.all.len()
    }

    /// The shard owning a view: chosen among the shards resident on the
    /// instance's owner space (all shards when none live there), indexed by
    /// the view's region tree. A pure function of its inputs.
    pub fn owner_shard(&self, owner_space: AddressSpace, tree_id: TreeId) -> ShardId {
        let shards = match self.shards_by_space.get(&owner_space) {
            Some(shards) if !shards.is_empty() => shards,
            _ => &self.all,
        };
        shards[tree_id.id() as usize % shards.len()]
    }
}

// SHARD EXCHANGE
// ================================================================================================

/// Transport between the shards of one template. Payloads are serialized
/// [`TemplateUpdate`] values.
pub trait ShardExchange: Send + Sync + fmt::Debug {
    /// Fire-and-forget delivery.
    fn send_update(&self, to: ShardId, payload: Vec<u8>);

    /// Round-trip request; blocks until the peer answers.
    fn query(&self, to: ShardId, payload: Vec<u8>) -> Vec<u8>;
}

// WIRE PROTOCOL
// ================================================================================================

/// The sharded template update protocol. Expressions travel by value so each
/// shard can re-intern them into its own forest.
#[derive(Clone, Debug, PartialEq)]
pub enum TemplateUpdate {
    /// Install a user in the view's table on its owner shard.
    UpdateViewUser {
        view: ViewId,
        expr: IntervalSet,
        usage: RegionUsage,
        user_slot: u64,
        mask: FieldMask,
        source_shard: ShardId,
        order: u64,
    },
    /// Tell a shard that peers consume these local slots as last users.
    UpdateLastUser { slots: Vec<u64> },
    /// Ask a view's owner for the last users of `(view, expr, mask)`.
    FindLastUsersRequest {
        view: ViewId,
        expr: IntervalSet,
        usage: RegionUsage,
        mask: FieldMask,
        requester: ShardId,
        before: Option<u64>,
    },
    /// Requester-local slots plus frontier barriers standing in for users on
    /// other shards.
    FindLastUsersResponse { slots: Vec<u64>, barriers: Vec<Barrier> },
    /// Ask a shard to allocate frontier barriers for these local slots.
    FindFrontierRequest { requester: ShardId, slots: Vec<u64> },
    FindFrontierResponse { barriers: Vec<Barrier> },
    /// Ask the shard owning `event` to publish it through a barrier.
    FindEventRequest { event: Event, requester: ShardId },
    FindEventResponse { barrier: Option<Barrier> },
    /// Cooperative indirection-immutability check.
    ReadOnlyUsersRequest { view: ViewId, expr: IntervalSet, mask: FieldMask },
    ReadOnlyUsersResponse { read_only: bool },
    /// Replacement barriers for arrivals the receiver advances.
    TemplateBarrierRefresh { updates: Vec<(Event, Barrier)> },
    /// Replacement barriers for frontiers the receiver subscribed to.
    FrontierBarrierRefresh { updates: Vec<(Barrier, Barrier)> },
}

impl Serializable for TemplateUpdate {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        match self {
            Self::UpdateViewUser { view, expr, usage, user_slot, mask, source_shard, order } => {
                target.write_u8(0);
                view.write_into(target);
                expr.write_into(target);
                usage.write_into(target);
                target.write_u64(*user_slot);
                mask.write_into(target);
                source_shard.write_into(target);
                target.write_u64(*order);
            },
            Self::UpdateLastUser { slots } => {
                target.write_u8(1);
                write_u64_list(target, slots);
            },
            Self::FindLastUsersRequest { view, expr, usage, mask, requester, before } => {
                target.write_u8(2);
                view.write_into(target);
                expr.write_into(target);
                usage.write_into(target);
                mask.write_into(target);
                requester.write_into(target);
                target.write_bool(before.is_some());
                target.write_u64(before.unwrap_or(0));
            },
            Self::FindLastUsersResponse { slots, barriers } => {
                target.write_u8(3);
                write_u64_list(target, slots);
                write_barrier_list(target, barriers);
            },
            Self::FindFrontierRequest { requester, slots } => {
                target.write_u8(4);
                requester.write_into(target);
                write_u64_list(target, slots);
            },
            Self::FindFrontierResponse { barriers } => {
                target.write_u8(5);
                write_barrier_list(target, barriers);
            },
            Self::FindEventRequest { event, requester } => {
                target.write_u8(6);
                event.write_into(target);
                requester.write_into(target);
            },
            Self::FindEventResponse { barrier } => {
                target.write_u8(7);
                target.write_bool(barrier.is_some());
                barrier.unwrap_or(Barrier::NONE).write_into(target);
            },
            Self::ReadOnlyUsersRequest { view, expr, mask } => {
                target.write_u8(8);
                view.write_into(target);
                expr.write_into(target);
                mask.write_into(target);
            },
            Self::ReadOnlyUsersResponse { read_only } => {
                target.write_u8(9);
                target.write_bool(*read_only);
            },
            Self::TemplateBarrierRefresh { updates } => {
                target.write_u8(10);
                target.write_u32(updates.len() as u32);
                for (event, barrier) in updates {
                    event.write_into(target);
                    barrier.write_into(target);
                }
            },
            Self::FrontierBarrierRefresh { updates } => {
                target.write_u8(11);
                target.write_u32(updates.len() as u32);
                for (old, new) in updates {
                    old.write_into(target);
                    new.write_into(target);
                }
            },
        }
    }
}

impl Deserializable for TemplateUpdate {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(match source.read_u8()? {
            0 => Self::UpdateViewUser {
                view: ViewId::read_from(source)?,
                expr: IntervalSet::read_from(source)?,
                usage: RegionUsage::read_from(source)?,
                user_slot: source.read_u64()?,
                mask: FieldMask::read_from(source)?,
                source_shard: ShardId::read_from(source)?,
                order: source.read_u64()?,
            },
            1 => Self::UpdateLastUser { slots: read_u64_list(source)? },
            2 => Self::FindLastUsersRequest {
                view: ViewId::read_from(source)?,
                expr: IntervalSet::read_from(source)?,
                usage: RegionUsage::read_from(source)?,
                mask: FieldMask::read_from(source)?,
                requester: ShardId::read_from(source)?,
                before: {
                    let present = source.read_bool()?;
                    let value = source.read_u64()?;
                    present.then_some(value)
                },
            },
            3 => Self::FindLastUsersResponse {
                slots: read_u64_list(source)?,
                barriers: read_barrier_list(source)?,
            },
            4 => Self::FindFrontierRequest {
                requester: ShardId::read_from(source)?,
                slots: read_u64_list(source)?,
            },
            5 => Self::FindFrontierResponse { barriers: read_barrier_list(source)? },
            6 => Self::FindEventRequest {
                event: Event::read_from(source)?,
                requester: ShardId::read_from(source)?,
            },
            7 => Self::FindEventResponse {
                barrier: {
                    let present = source.read_bool()?;
                    let barrier = Barrier::read_from(source)?;
                    present.then_some(barrier)
                },
            },
            8 => Self::ReadOnlyUsersRequest {
                view: ViewId::read_from(source)?,
                expr: IntervalSet::read_from(source)?,
                mask: FieldMask::read_from(source)?,
            },
            9 => Self::ReadOnlyUsersResponse { read_only: source.read_bool()? },
            10 => Self::TemplateBarrierRefresh {
                updates: {
                    let len = source.read_u32()? as usize;
                    let mut updates = Vec::with_capacity(len);
                    for _ in 0..len {
                        updates.push((Event::read_from(source)?, Barrier::read_from(source)?));
                    }
                    updates
                },
            },
            11 => Self::FrontierBarrierRefresh {
                updates: {
                    let len = source.read_u32()? as usize;
                    let mut updates = Vec::with_capacity(len);
                    for _ in 0..len {
                        updates.push((Barrier::read_from(source)?, Barrier::read_from(source)?));
                    }
                    updates
                },
            },
            other => {
                return Err(DeserializationError::InvalidValue(format!(
                    "unknown template update kind {other}"
                )));
            },
        })
    }
}

fn write_u64_list<W: ByteWriter>(target: &mut W, values: &[u64]) {
    target.write_u32(values.len() as u32);
    for value in values {
        target.write_u64(*value);
    }
}

fn read_u64_list<R: ByteReader>(source: &mut R) -> Result<Vec<u64>, DeserializationError> {
    let len = source.read_u32()? as usize;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(source.read_u64()?);
    }
    Ok(values)
}

fn write_barrier_list<W: ByteWriter>(target: &mut W, barriers: &[Barrier]) {
    target.write_u32(barriers.len() as u32);
    for barrier in barriers {
        barrier.write_into(target);
    }
}

fn read_barrier_list<R: ByteReader>(source: &mut R) -> Result<Vec<Barrier>, DeserializationError> {
    let len = source.read_u32()? as usize;
    let mut barriers = Vec::with_capacity(len);
    for _ in 0..len {
        barriers.push(Barrier::read_from(source)?);
    }
    Ok(barriers)
}

// SHARDED PHYSICAL TEMPLATE
// ================================================================================================

#[derive(Debug, Default)]
struct ShardedState {
    /// Barriers this shard arrives on to publish its frontier slots, with
    /// the consumer shards subscribed to each.
    local_frontiers: BTreeMap<Slot, (Barrier, Vec<ShardId>)>,
    /// Incoming frontier barriers bound to local advance slots.
    remote_frontiers: Vec<(Barrier, Slot)>,
    /// Arrivals this shard owns on behalf of peer event requests:
    /// event id to (barrier, requesting shard).
    remote_arrivals: BTreeMap<u64, (Barrier, ShardId)>,
    /// Advances installed for events requested from peers: event id to
    /// barrier.
    local_advances: BTreeMap<u64, Barrier>,
    /// Collective reduction points: (index, round) to barrier uid.
    collective_barriers: BTreeMap<(u32, u32), u64>,
    /// Barrier-refresh rounds completed.
    refresh_rounds: u64,
    /// Incoming refresh messages, buffered until the round synchronizes:
    /// consumed advance instructions swap at the next `initialize_replay`,
    /// frontier subscriptions at the following `finish_replay`.
    pending_refresh_barriers: Vec<(Event, Barrier)>,
    pending_refresh_frontiers: Vec<(Barrier, Barrier)>,
    /// Frontier swaps applied to instructions but not yet to the
    /// subscription list (the current iteration still consumes the old
    /// generation).
    deferred_frontier_refresh: Vec<(Barrier, Barrier)>,
}

/// A physical template participating in a control-replicated trace.
///
/// Wraps the single-shard template, routing view users to owner shards at
/// record time and realizing cross-shard event edges as barrier pairs.
pub struct ShardedPhysicalTemplate {
    template: Arc<PhysicalTemplate>,
    ctx: Arc<TraceContext>,
    shard: ShardId,
    mapping: Arc<ShardMapping>,
    exchange: Arc<dyn ShardExchange>,
    state: Mutex<ShardedState>,
}

impl ShardedPhysicalTemplate {
    pub fn new(
        ctx: Arc<TraceContext>,
        fence_completion: Event,
        shard: ShardId,
        mapping: Arc<ShardMapping>,
        exchange: Arc<dyn ShardExchange>,
    ) -> Arc<Self> {
        let template = PhysicalTemplate::new(ctx.clone(), fence_completion);
        template.set_local_shard(shard);
        Arc::new(Self {
            template,
            ctx,
            shard,
            mapping,
            exchange,
            state: Mutex::new(ShardedState::default()),
        })
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// The wrapped single-shard template; recording calls with no sharded
    /// behavior delegate straight to it.
    pub fn template(&self) -> &Arc<PhysicalTemplate> {
        &self.template
    }

    fn owner_of_view(&self, view: ViewId) -> ShardId {
        let view = self.ctx.views.expect(view);
        self.mapping.owner_shard(view.owner_space, view.tree_id)
    }

    // RECORDING OVERRIDES
    // --------------------------------------------------------------------------------------------

    /// Records one region access, routing the view user to its owner shard.
    #[allow(clippy::too_many_arguments)]
    pub fn record_op_view(
        &self,
        owner: TraceLocalId,
        view: ViewId,
        region: Region,
        expr: phalanx_core::ExprId,
        usage: RegionUsage,
        mask: FieldMask,
    ) {
        let slot =
            self.template.record_op_view_tables(owner, view, region, expr, usage, mask);
        self.route_user(view, usage, slot, expr, mask, owner.context_index);
    }

    /// Records the views a copy reads and writes, routing each user to its
    /// owner shard.
    #[allow(clippy::too_many_arguments)]
    pub fn record_copy_views(
        &self,
        owner: TraceLocalId,
        lhs: Event,
        region: Region,
        expr: phalanx_core::ExprId,
        srcs: Vec<(ViewId, FieldMask)>,
        dsts: Vec<(ViewId, FieldMask)>,
    ) {
        let slot = self.template.record_copy_view_tables(lhs, region, &srcs, &dsts, expr);
        for (view, mask) in srcs {
            self.route_user(view, RegionUsage::read_only(), slot, expr, mask, owner.context_index);
        }
        for (view, mask) in dsts {
            self.route_user(view, RegionUsage::read_write(), slot, expr, mask, owner.context_index);
        }
    }

    fn route_user(
        &self,
        view: ViewId,
        usage: RegionUsage,
        slot: Slot,
        expr: phalanx_core::ExprId,
        mask: FieldMask,
        order: u64,
    ) {
        let owner = self.owner_of_view(view);
        if owner == self.shard {
            let mut inner = self.template.inner.lock();
            inner.add_view_user(view, usage, slot, expr, mask, self.shard, order);
        } else {
            let update = TemplateUpdate::UpdateViewUser {
                view,
                expr: self.ctx.forest.get(expr),
                usage,
                user_slot: slot as u64,
                mask,
                source_shard: self.shard,
                order,
            };
            self.exchange.send_update(owner, update.to_bytes());
        }
    }

    /// Records a merge, first publishing any operand events owned by peer
    /// shards through barrier pairs so every downstream reference is local.
    pub fn record_merge_events(&self, lhs: &mut Event, rhs: &[Event], owner: TraceLocalId) {
        for event in rhs {
            if !event.exists() {
                continue;
            }
            if self.template.inner.lock().find_event_slot(*event).is_some() {
                continue;
            }
            self.request_remote_shard_event(*event);
        }
        self.template.record_merge_events(lhs, rhs, owner);
    }

    /// Asks peers for an event this shard has no slot for; the owner answers
    /// with a barrier it arrives on, and a local advance slot is bound to it.
    fn request_remote_shard_event(&self, event: Event) {
        let request = TemplateUpdate::FindEventRequest { event, requester: self.shard };
        for peer in self.mapping.shards() {
            if *peer == self.shard {
                continue;
            }
            let response = self.exchange.query(*peer, request.to_bytes());
            let Ok(TemplateUpdate::FindEventResponse { barrier: Some(barrier) }) =
                TemplateUpdate::read_from(&mut SliceReader::new(&response))
            else {
                continue;
            };
            let mut inner = self.template.inner.lock();
            let slot = inner.alloc_slot(event);
            inner.instructions.push(Instruction::BarrierAdvance { lhs: slot, barrier });
            self.state.lock().local_advances.insert(event.id(), barrier);
            return;
        }
        // no shard owns the event; it is external and the fence covers it
        debug!(%event, "event has no owning shard");
    }

    /// Records a collective-reduction barrier arrival. The application
    /// supplies the concrete barrier per replay through
    /// [`Self::prepare_collective_barrier_replay`].
    pub fn record_collective_barrier(
        &self,
        key: (u32, u32),
        barrier: Barrier,
        arrival_count: u32,
        precondition: Event,
    ) {
        let mut inner = self.template.inner.lock();
        let rhs = inner.operand_slot(precondition);
        let slot = inner.alloc_slot(Event::NONE);
        inner.instructions.push(Instruction::BarrierArrival {
            lhs: slot,
            rhs,
            barrier,
            arrival_count,
            collective: true,
        });
        drop(inner);
        self.state.lock().collective_barriers.insert(key, barrier.uid());
    }

    /// Overwrites the barrier of the collective arrival recorded under `key`
    /// before the next replay executes it.
    pub fn prepare_collective_barrier_replay(&self, key: (u32, u32), barrier: Barrier) {
        let mut state = self.state.lock();
        let Some(uid) = state.collective_barriers.get(&key).copied() else {
            warn!(?key, "no collective barrier recorded under this key");
            return;
        };
        drop(state);
        self.replace_barriers(&[(uid, barrier)]);
        self.state.lock().collective_barriers.insert(key, barrier.uid());
    }

    // CAPTURE
    // --------------------------------------------------------------------------------------------

    /// First half of capture completion: captures conditions and computes
    /// this shard's local replayability verdict. The verdicts of all shards
    /// are then exchanged and fed to [`Self::complete_capture`].
    pub fn check_replayable_local(&self, blocking_call_observed: bool) -> Replayable {
        self.template.capture_conditions();
        self.template.check_replayable(blocking_call_observed)
    }

    /// Second half of capture completion: applies the exchanged verdict (a
    /// template replays only when every shard agreed) and optimizes.
    pub fn complete_capture(self: &Arc<Self>, local: Replayable, all_agree: bool) -> Replayable {
        let verdict = if !all_agree && local.is_replayable() {
            Replayable::NotReplayable(RejectionReason::RemoteShardVeto)
        } else {
            local
        };
        {
            let mut inner = self.template.inner.lock();
            inner.recording = false;
            inner.replayable = Some(verdict.clone());
        }
        if verdict.is_replayable() {
            let router = ShardedRouter { sharded: self.as_ref() };
            self.template.optimize(&router);
        }
        if self.ctx.config.dump_templates() {
            self.template.dump(&verdict);
        }
        verdict
    }

    // REPLAY
    // --------------------------------------------------------------------------------------------

    /// Refreshes this shard's barriers when the replay counter is about to
    /// exhaust their generations. The refresh round is collective: the
    /// controller must run it on every shard before any shard initializes
    /// the next replay. Returns whether a refresh ran.
    pub fn maybe_refresh_barriers(&self) -> bool {
        let max_generations = self.ctx.config.max_barrier_generations() as u64;
        let rounds = self.state.lock().refresh_rounds;
        if self.template.replay_count() + 1 >= max_generations * (rounds + 1) {
            self.refresh_barriers();
            true
        } else {
            false
        }
    }

    /// Queues a replay, applying any buffered barrier refreshes to the
    /// instruction stream first.
    pub fn initialize_replay(&self, completion: Event, recurrent: bool) {
        let (barriers, frontiers) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.pending_refresh_barriers),
                std::mem::take(&mut state.pending_refresh_frontiers),
            )
        };
        for (event, fresh) in barriers {
            self.apply_template_barrier_refresh(event, fresh);
        }
        if !frontiers.is_empty() {
            // advance instructions swap now; the subscription list swaps
            // after this iteration consumed the old barrier's last phase
            let replacements: Vec<(u64, Barrier)> =
                frontiers.iter().map(|(old, fresh)| (old.uid(), *fresh)).collect();
            self.replace_barriers(&replacements);
            self.state.lock().deferred_frontier_refresh.extend(frontiers);
        }
        self.template.initialize_replay(completion, recurrent);
    }

    /// Executes the queued replay, first binding the peers' frontier phases
    /// into their external slots on recurrent iterations.
    pub fn perform_replay(&self) -> Result<(), TraceError> {
        if let Some((_, recurrent)) = self.template.peek_pending_replay()
            && recurrent
        {
            let fills: Vec<(Slot, Event)> = {
                let mut state = self.state.lock();
                state
                    .remote_frontiers
                    .iter_mut()
                    .map(|(barrier, slot)| {
                        let phase = self.ctx.fabric.barrier_phase(*barrier);
                        barrier.advance();
                        (*slot, phase)
                    })
                    .collect()
            };
            for (slot, phase) in fills {
                self.template.set_frame_slot(slot, phase);
            }
        }
        self.template.perform_replay()
    }

    /// Completes the replay and publishes this shard's frontier slots by
    /// arriving on their barriers.
    pub fn finish_replay(&self) -> Event {
        let completion = self.template.finish_replay();
        let arrivals: Vec<(Slot, Barrier)> = {
            let mut state = self.state.lock();
            state
                .local_frontiers
                .iter_mut()
                .map(|(slot, (barrier, _))| {
                    let current = *barrier;
                    barrier.advance();
                    (*slot, current)
                })
                .collect()
        };
        for (slot, barrier) in arrivals {
            let event = self.template.slot_event(slot);
            self.ctx.fabric.arrive(barrier, 1, event);
        }
        // deferred frontier swaps take effect for the next iteration
        let mut state = self.state.lock();
        let deferred = std::mem::take(&mut state.deferred_frontier_refresh);
        for (old, fresh) in deferred {
            for (barrier, _) in state.remote_frontiers.iter_mut() {
                if barrier.uid() == old.uid() {
                    *barrier = fresh;
                }
            }
        }
        completion
    }

    // BARRIER REFRESH
    // --------------------------------------------------------------------------------------------

    /// Allocates replacement barriers for everything this shard produces and
    /// broadcasts the mapping to the subscribed shards.
    pub fn refresh_barriers(&self) {
        let max_generations = self.ctx.config.max_barrier_generations();
        let mut state = self.state.lock();

        // arrivals owned for peer event requests
        let mut per_requester: BTreeMap<ShardId, Vec<(Event, Barrier)>> = BTreeMap::new();
        let mut replacements: Vec<(u64, Barrier)> = Vec::new();
        for (event_id, (barrier, requester)) in state.remote_arrivals.iter_mut() {
            let fresh = self.ctx.fabric.create_barrier(1, max_generations);
            replacements.push((barrier.uid(), fresh));
            per_requester
                .entry(*requester)
                .or_default()
                .push((Event::from_id(*event_id), fresh));
            *barrier = fresh;
        }

        // frontier barriers peers subscribed to
        let mut per_subscriber: BTreeMap<ShardId, Vec<(Barrier, Barrier)>> = BTreeMap::new();
        for (_, (barrier, subscribers)) in state.local_frontiers.iter_mut() {
            let fresh = self.ctx.fabric.create_barrier(1, max_generations);
            for subscriber in subscribers.iter() {
                per_subscriber.entry(*subscriber).or_default().push((*barrier, fresh));
            }
            *barrier = fresh;
        }
        state.refresh_rounds += 1;
        drop(state);

        self.replace_barriers(&replacements);
        for (requester, updates) in per_requester {
            let update = TemplateUpdate::TemplateBarrierRefresh { updates };
            self.exchange.send_update(requester, update.to_bytes());
        }
        for (subscriber, updates) in per_subscriber {
            let update = TemplateUpdate::FrontierBarrierRefresh { updates };
            self.exchange.send_update(subscriber, update.to_bytes());
        }
        debug!(shard = %self.shard, "refreshed template barriers");
    }

    /// Swaps barriers in the instruction stream by uid, resetting their
    /// generation cursors.
    fn replace_barriers(&self, replacements: &[(u64, Barrier)]) {
        if replacements.is_empty() {
            return;
        }
        let map: BTreeMap<u64, Barrier> =
            replacements.iter().map(|(uid, fresh)| (*uid, *fresh)).collect();
        let mut inner = self.template.inner.lock();
        let mut rewrite = |instruction: &mut Instruction| match instruction {
            Instruction::BarrierArrival { barrier, .. }
            | Instruction::BarrierAdvance { barrier, .. } => {
                if let Some(fresh) = map.get(&barrier.uid()) {
                    *barrier = *fresh;
                }
            },
            _ => {},
        };
        for instruction in inner.instructions.iter_mut() {
            rewrite(instruction);
        }
        for slice in inner.slices.iter_mut() {
            for instruction in slice.iter_mut() {
                rewrite(instruction);
            }
        }
    }

    fn apply_template_barrier_refresh(&self, event: Event, fresh: Barrier) {
        let old = {
            let mut state = self.state.lock();
            let Some(old) = state.local_advances.insert(event.id(), fresh) else {
                warn!(%event, "barrier refresh for an unknown event");
                return;
            };
            old
        };
        self.replace_barriers(&[(old.uid(), fresh)]);
    }

    // MESSAGE HANDLERS
    // --------------------------------------------------------------------------------------------

    /// Applies a fire-and-forget update from a peer shard.
    pub fn handle_update(&self, payload: &[u8]) {
        let update = match TemplateUpdate::read_from(&mut SliceReader::new(payload)) {
            Ok(update) => update,
            Err(error) => {
                warn!(%error, "dropping malformed template update");
                return;
            },
        };
        match update {
            TemplateUpdate::UpdateViewUser {
                view,
                expr,
                usage,
                user_slot,
                mask,
                source_shard,
                order,
            } => {
                let expr = self.ctx.forest.intern(expr);
                let mut inner = self.template.inner.lock();
                inner.add_view_user(view, usage, user_slot as Slot, expr, mask, source_shard, order);
            },
            TemplateUpdate::UpdateLastUser { slots } => {
                let mut inner = self.template.inner.lock();
                inner.remote_consumed_slots.extend(slots.iter().map(|slot| *slot as Slot));
            },
            TemplateUpdate::TemplateBarrierRefresh { updates } => {
                self.state.lock().pending_refresh_barriers.extend(updates);
            },
            TemplateUpdate::FrontierBarrierRefresh { updates } => {
                self.state.lock().pending_refresh_frontiers.extend(updates);
            },
            other => warn!(?other, "unexpected one-way template update"),
        }
    }

    /// Answers a round-trip query from a peer shard.
    pub fn handle_query(&self, payload: &[u8]) -> Vec<u8> {
        let request = match TemplateUpdate::read_from(&mut SliceReader::new(payload)) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, "dropping malformed template query");
                return Vec::new();
            },
        };
        let response = match request {
            TemplateUpdate::FindLastUsersRequest { view, expr, usage, mask, requester, before } => {
                let expr = self.ctx.forest.intern(expr);
                let users = {
                    let inner = self.template.inner.lock();
                    inner.last_users(&self.ctx.forest, view, usage, expr, mask, before)
                };
                let mut slots: Vec<u64> = Vec::new();
                let mut by_shard: BTreeMap<ShardId, Vec<u64>> = BTreeMap::new();
                for user in users {
                    if user.shard == requester {
                        slots.push(user.slot as u64);
                    } else {
                        by_shard.entry(user.shard).or_default().push(user.slot as u64);
                    }
                }
                let mut barriers = Vec::new();
                for (shard, shard_slots) in by_shard {
                    if shard == self.shard {
                        barriers.extend(self.allocate_local_frontiers(&shard_slots, requester));
                    } else {
                        barriers.extend(self.request_remote_frontiers(shard, shard_slots, requester));
                    }
                }
                TemplateUpdate::FindLastUsersResponse { slots, barriers }
            },
            TemplateUpdate::FindFrontierRequest { requester, slots } => {
                TemplateUpdate::FindFrontierResponse {
                    barriers: self.allocate_local_frontiers(&slots, requester),
                }
            },
            TemplateUpdate::FindEventRequest { event, requester } => {
                TemplateUpdate::FindEventResponse { barrier: self.publish_event(event, requester) }
            },
            TemplateUpdate::ReadOnlyUsersRequest { view, expr, mask } => {
                let expr = self.ctx.forest.intern(expr);
                let inner = self.template.inner.lock();
                TemplateUpdate::ReadOnlyUsersResponse {
                    read_only: inner.local_users_read_only(view, expr, mask),
                }
            },
            other => {
                warn!(?other, "unexpected template query");
                return Vec::new();
            },
        };
        response.to_bytes()
    }

    /// Allocates (or reuses) frontier barriers for local slots a peer
    /// consumes.
    fn allocate_local_frontiers(&self, slots: &[u64], requester: ShardId) -> Vec<Barrier> {
        let max_generations = self.ctx.config.max_barrier_generations();
        {
            let mut inner = self.template.inner.lock();
            inner.remote_consumed_slots.extend(slots.iter().map(|slot| *slot as Slot));
        }
        let mut state = self.state.lock();
        let mut barriers = Vec::with_capacity(slots.len());
        for slot in slots {
            let (barrier, subscribers) = state
                .local_frontiers
                .entry(*slot as Slot)
                .or_insert_with(|| {
                    (self.ctx.fabric.create_barrier(1, max_generations), Vec::new())
                });
            if !subscribers.contains(&requester) {
                subscribers.push(requester);
            }
            barriers.push(*barrier);
        }
        barriers
    }

    /// Forwards a frontier request to the shard owning the consuming slots.
    fn request_remote_frontiers(
        &self,
        shard: ShardId,
        slots: Vec<u64>,
        requester: ShardId,
    ) -> Vec<Barrier> {
        self.exchange.send_update(
            shard,
            TemplateUpdate::UpdateLastUser { slots: slots.clone() }.to_bytes(),
        );
        let request = TemplateUpdate::FindFrontierRequest { requester, slots };
        let response = self.exchange.query(shard, request.to_bytes());
        match TemplateUpdate::read_from(&mut SliceReader::new(&response)) {
            Ok(TemplateUpdate::FindFrontierResponse { barriers }) => barriers,
            _ => Vec::new(),
        }
    }

    /// Publishes a locally-recorded event through a barrier arrival for a
    /// requesting peer.
    fn publish_event(&self, event: Event, requester: ShardId) -> Option<Barrier> {
        let mut inner = self.template.inner.lock();
        let rhs = inner.find_event_slot(event)?;
        if let Some((barrier, _)) = self.state.lock().remote_arrivals.get(&event.id()) {
            return Some(*barrier);
        }
        let barrier = self.ctx.fabric.create_barrier(1, self.ctx.config.max_barrier_generations());
        let slot = inner.alloc_slot(Event::NONE);
        inner.instructions.push(Instruction::BarrierArrival {
            lhs: slot,
            rhs,
            barrier,
            arrival_count: 1,
            collective: false,
        });
        drop(inner);
        self.state.lock().remote_arrivals.insert(event.id(), (barrier, requester));
        Some(barrier)
    }

    pub fn local_frontier_barriers(&self) -> Vec<(Slot, Barrier)> {
        self.state
            .lock()
            .local_frontiers
            .iter()
            .map(|(slot, (barrier, _))| (*slot, *barrier))
            .collect()
    }

    pub fn remote_frontier_barriers(&self) -> Vec<(Barrier, Slot)> {
        self.state.lock().remote_frontiers.clone()
    }
}

impl fmt::Debug for ShardedPhysicalTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedPhysicalTemplate")
            .field("shard", &self.shard)
            .field("template", &self.template)
            .finish()
    }
}

// SHARDED ROUTER
// ================================================================================================

/// Last-user routing during a sharded template's fence elision.
struct ShardedRouter<'a> {
    sharded: &'a ShardedPhysicalTemplate,
}

impl UserRouter for ShardedRouter<'_> {
    fn local_shard(&self) -> ShardId {
        self.sharded.shard
    }

    fn find_users(
        &self,
        inner: &mut crate::template::TemplateInner,
        view: ViewId,
        usage: RegionUsage,
        expr: phalanx_core::ExprId,
        mask: FieldMask,
        before: Option<u64>,
    ) -> LastUsers {
        let sharded = self.sharded;
        let owner = sharded.owner_of_view(view);
        let mut result = LastUsers::default();
        if owner == sharded.shard {
            let users = inner.last_users(&sharded.ctx.forest, view, usage, expr, mask, before);
            let mut by_shard: BTreeMap<ShardId, Vec<u64>> = BTreeMap::new();
            for user in users {
                if user.shard == sharded.shard {
                    result.slots.insert(user.slot);
                } else {
                    by_shard.entry(user.shard).or_default().push(user.slot as u64);
                }
            }
            for (shard, slots) in by_shard {
                result
                    .barriers
                    .extend(sharded.request_remote_frontiers(shard, slots, sharded.shard));
            }
        } else {
            let request = TemplateUpdate::FindLastUsersRequest {
                view,
                expr: sharded.ctx.forest.get(expr),
                usage,
                mask,
                requester: sharded.shard,
                before,
            };
            let response = sharded.exchange.query(owner, request.to_bytes());
            if let Ok(TemplateUpdate::FindLastUsersResponse { slots, barriers }) =
                TemplateUpdate::read_from(&mut SliceReader::new(&response))
            {
                result.slots.extend(slots.iter().map(|slot| *slot as Slot));
                result.barriers.extend(barriers);
            }
        }
        result
    }

    fn all_users_read_only(
        &self,
        inner: &mut crate::template::TemplateInner,
        view: ViewId,
        expr: phalanx_core::ExprId,
        mask: FieldMask,
    ) -> bool {
        let sharded = self.sharded;
        let owner = sharded.owner_of_view(view);
        if owner == sharded.shard {
            inner.local_users_read_only(view, expr, mask)
        } else {
            let request = TemplateUpdate::ReadOnlyUsersRequest {
                view,
                expr: sharded.ctx.forest.get(expr),
                mask,
            };
            let response = sharded.exchange.query(owner, request.to_bytes());
            matches!(
                TemplateUpdate::read_from(&mut SliceReader::new(&response)),
                Ok(TemplateUpdate::ReadOnlyUsersResponse { read_only: true })
            )
        }
    }

    fn note_remote_frontier(&self, barrier: Barrier, slot: Slot) {
        self.sharded.state.lock().remote_frontiers.push((barrier, slot));
    }
}

// LOCAL SHARD GROUP
// ================================================================================================

/// An in-process shard transport: every shard's template lives in the same
/// address space, and messages are delivered synchronously through the
/// serialized wire format.
#[derive(Default)]
pub struct LocalShardGroup {
    members: RwLock<BTreeMap<ShardId, Weak<ShardedPhysicalTemplate>>>,
    votes: Mutex<BTreeMap<ShardId, bool>>,
}

impl LocalShardGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, template: &Arc<ShardedPhysicalTemplate>) {
        self.members.write().insert(template.shard(), Arc::downgrade(template));
    }

    /// Posts one shard's local replayability verdict.
    pub fn post_replayable(&self, shard: ShardId, replayable: bool) {
        self.votes.lock().insert(shard, replayable);
    }

    /// Resolves the exchange: the template is replayable only if every shard
    /// that voted agreed. Clears the votes for the next capture.
    pub fn resolve_replayable(&self) -> bool {
        let mut votes = self.votes.lock();
        let all = votes.values().all(|vote| *vote);
        votes.clear();
        all
    }

    fn member(&self, shard: ShardId) -> Option<Arc<ShardedPhysicalTemplate>> {
        self.members.read().get(&shard).and_then(Weak::upgrade)
    }
}

impl ShardExchange for LocalShardGroup {
    fn send_update(&self, to: ShardId, payload: Vec<u8>) {
        match self.member(to) {
            Some(template) => template.handle_update(&payload),
            None => warn!(%to, "dropping update for unregistered shard"),
        }
    }

    fn query(&self, to: ShardId, payload: Vec<u8>) -> Vec<u8> {
        match self.member(to) {
            Some(template) => template.handle_query(&payload),
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for LocalShardGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalShardGroup")
            .field("members", &self.members.read().len())
            .finish()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn owner_shard_is_deterministic() {
        let mapping = ShardMapping::new(BTreeMap::from([
            (AddressSpace::new(0), vec![ShardId::new(0), ShardId::new(1)]),
            (AddressSpace::new(1), vec![ShardId::new(2)]),
        ]));
        // a pure function of (owner_space, tree_id, mapping)
        for tree in 0..8u32 {
            let a = mapping.owner_shard(AddressSpace::new(0), TreeId::new(tree));
            let b = mapping.owner_shard(AddressSpace::new(0), TreeId::new(tree));
            assert_eq!(a, b);
        }
        assert_eq!(
            mapping.owner_shard(AddressSpace::new(0), TreeId::new(0)),
            ShardId::new(0)
        );
        assert_eq!(
            mapping.owner_shard(AddressSpace::new(0), TreeId::new(1)),
            ShardId::new(1)
        );
        assert_eq!(
            mapping.owner_shard(AddressSpace::new(1), TreeId::new(7)),
            ShardId::new(2)
        );
        // spaces hosting no shard fall back to the full shard list
        assert_eq!(
            mapping.owner_shard(AddressSpace::new(9), TreeId::new(2)),
            ShardId::new(2)
        );
    }

    #[test]
    fn update_round_trips_through_the_wire() {
        let updates = vec![
            TemplateUpdate::UpdateViewUser {
                view: ViewId::new(7),
                expr: IntervalSet::interval(0, 64),
                usage: RegionUsage::read_write(),
                user_slot: 11,
                mask: FieldMask::from_bits(&[0, 5]),
                source_shard: ShardId::new(1),
                order: 3,
            },
            TemplateUpdate::UpdateLastUser { slots: vec![1, 2, 3] },
            TemplateUpdate::FindLastUsersResponse {
                slots: vec![9],
                barriers: vec![Barrier::NONE],
            },
            TemplateUpdate::FindEventResponse { barrier: None },
            TemplateUpdate::FrontierBarrierRefresh {
                updates: vec![(Barrier::NONE, Barrier::NONE)],
            },
        ];
        for update in updates {
            let bytes = update.to_bytes();
            let decoded = TemplateUpdate::read_from(&mut SliceReader::new(&bytes)).unwrap();
            assert_eq!(update, decoded);
        }
    }
}
