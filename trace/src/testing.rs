//! Test fixtures: mock operations, a recorded version-state engine, and a
//! logging issue engine. Exposed through the `testing` feature so
//! integration tests can drive the full capture/replay pipeline without a
//! real runtime behind it.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use phalanx_core::{
    AddressSpace, Event, EventFabric, ExprId, ExpressionForest, FieldMask, FieldMaskSet,
    IntervalSet, LogicalView, MemoryKind, ProcessorId, Region, TreeId, ViewId, ViewKind,
    ViewRegistry,
};

use crate::{
    config::TraceConfig,
    context::TraceContext,
    issue::{AcrossExecutor, CopyField, IssueEngine},
    op::{
        GenerationId, MapperOutput, Memoizable, OpRef, Operation, OperationKind, Privilege,
        RegionUsage, Reservation, TraceLocalId, UniqueOpId,
    },
    version::{
        CapturedConditions, EquivalenceSetId, VersionEngine, VersionSubscriber,
    },
    view_set::{FailedPrecondition, TraceViewSet},
};

// TEST OPERATION
// ================================================================================================

/// A mock operation that is also its own memoizable: completion is a user
/// event triggered once the replayed precondition fires, which is how a real
/// task behaves after `complete_replay`.
#[derive(Debug)]
pub struct TestOperation {
    fabric: Arc<EventFabric>,
    kind: OperationKind,
    uid: UniqueOpId,
    generation: AtomicU64,
    name: String,
    region_count: usize,
    target: Mutex<ProcessorId>,
    tlid: Mutex<TraceLocalId>,
    completion: Mutex<Option<phalanx_core::UserEvent>>,
    replayed_mapping: Mutex<Option<MapperOutput>>,
    effects: Mutex<Event>,
    registered_dependences: Mutex<Vec<(UniqueOpId, GenerationId)>>,
    mapping_references: AtomicU64,
    self_ref: Mutex<Weak<TestOperation>>,
}

impl TestOperation {
    pub fn new(
        fabric: Arc<EventFabric>,
        kind: OperationKind,
        uid: UniqueOpId,
        name: impl Into<String>,
        region_count: usize,
    ) -> Arc<Self> {
        let op = Arc::new(Self {
            fabric,
            kind,
            uid,
            generation: AtomicU64::new(1),
            name: name.into(),
            region_count,
            target: Mutex::new(ProcessorId::new(uid)),
            tlid: Mutex::new(TraceLocalId::default()),
            completion: Mutex::new(None),
            replayed_mapping: Mutex::new(None),
            effects: Mutex::new(Event::NONE),
            registered_dependences: Mutex::new(Vec::new()),
            mapping_references: AtomicU64::new(0),
            self_ref: Mutex::new(Weak::new()),
        });
        *op.self_ref.lock() = Arc::downgrade(&op);
        op
    }

    pub fn set_target(&self, target: ProcessorId) {
        *self.target.lock() = target;
    }

    pub fn op_ref(self: &Arc<Self>) -> OpRef {
        OpRef::new(self.clone() as Arc<dyn Operation>)
    }

    /// Starts a fresh execution: the completion event for this run.
    pub fn begin_execution(&self) -> Event {
        let user = self.fabric.create_user_event();
        *self.completion.lock() = Some(user);
        user.event()
    }

    /// Marks the operation's work done in a recording pass.
    pub fn finish_execution(&self) {
        if let Some(user) = self.completion.lock().take() {
            self.fabric.trigger(user, Event::NONE);
        }
    }

    pub fn replayed_mapping(&self) -> Option<MapperOutput> {
        self.replayed_mapping.lock().clone()
    }

    pub fn effects_postcondition(&self) -> Event {
        *self.effects.lock()
    }

    pub fn registered_dependences(&self) -> Vec<(UniqueOpId, GenerationId)> {
        self.registered_dependences.lock().clone()
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

impl Operation for TestOperation {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn unique_id(&self) -> UniqueOpId {
        self.uid
    }

    fn generation(&self) -> GenerationId {
        self.generation.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn region_count(&self) -> usize {
        self.region_count
    }

    fn is_memoizing(&self) -> bool {
        true
    }

    fn as_memoizable(&self) -> Option<Arc<dyn Memoizable>> {
        self.self_ref.lock().upgrade().map(|op| op as Arc<dyn Memoizable>)
    }

    fn set_trace_local_id(&self, tlid: TraceLocalId) {
        *self.tlid.lock() = tlid;
    }

    fn add_mapping_reference(&self, _generation: GenerationId) {
        self.mapping_references.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_mapping_reference(&self, _generation: GenerationId) {
        self.mapping_references.fetch_sub(1, Ordering::Relaxed);
    }

    fn register_dependence(&self, target: &OpRef) -> bool {
        self.registered_dependences.lock().push(target.key());
        target.is_current()
    }

    fn register_region_dependence(
        &self,
        _own_idx: usize,
        target: &OpRef,
        _target_idx: usize,
        _dtype: crate::op::DependenceType,
        _validates: bool,
        _mask: &FieldMask,
    ) -> bool {
        self.registered_dependences.lock().push(target.key());
        target.is_current()
    }
}

impl Memoizable for TestOperation {
    fn trace_local_id(&self) -> TraceLocalId {
        *self.tlid.lock()
    }

    fn completion_event(&self) -> Event {
        self.completion.lock().map(|user| user.event()).unwrap_or(Event::NONE)
    }

    fn replay_mapping_output(&self, output: &MapperOutput, _reservations: &[Reservation]) {
        *self.replayed_mapping.lock() = Some(output.clone());
        // a replayed execution gets a fresh completion event
        let user = self.fabric.create_user_event();
        *self.completion.lock() = Some(user);
    }

    fn compute_sync_precondition(&self, _fabric: &EventFabric) -> Event {
        Event::NONE
    }

    fn set_effects_postcondition(&self, effects: Event) {
        *self.effects.lock() = effects;
    }

    fn complete_replay(&self, precondition: Event) {
        // the operation's execution begins once its replayed precondition
        // fires, and completion follows immediately in this mock
        if let Some(user) = *self.completion.lock() {
            self.fabric.trigger(user, precondition);
        }
    }

    fn target_processor(&self) -> ProcessorId {
        *self.target.lock()
    }
}

// RECORDED VERSION ENGINE
// ================================================================================================

/// An in-memory equivalence-set engine.
///
/// Tracks the valid views per region and, while a recording is active,
/// accumulates the pre/anti/post view sets the capture hands back: reads of
/// data the trace did not itself produce become preconditions, writes become
/// postconditions, and discarding writes become anticonditions.
#[derive(Debug)]
pub struct RecordedVersionEngine {
    forest: Arc<ExpressionForest>,
    inner: Mutex<EngineInner>,
}

#[derive(Debug, Default)]
struct EngineInner {
    next_set: u64,
    sets: BTreeMap<EquivalenceSetId, EqSetState>,
    by_region: BTreeMap<Region, EquivalenceSetId>,
    recording: bool,
}

struct EqSetState {
    region: Region,
    valid: TraceViewSet,
    preconditions: TraceViewSet,
    anticonditions: TraceViewSet,
    postconditions: TraceViewSet,
    subscribers: Vec<(u64, Weak<dyn VersionSubscriber>)>,
}

impl std::fmt::Debug for EqSetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EqSetState").field("region", &self.region).finish()
    }
}

impl RecordedVersionEngine {
    pub fn new(forest: Arc<ExpressionForest>) -> Arc<Self> {
        Arc::new(Self { forest, inner: Mutex::new(EngineInner::default()) })
    }

    /// Starts accumulating trace conditions.
    pub fn begin_recording(&self) {
        let mut inner = self.inner.lock();
        inner.recording = true;
        let forest = self.forest.clone();
        for state in inner.sets.values_mut() {
            state.preconditions = TraceViewSet::new(forest.clone(), state.region);
            state.anticonditions = TraceViewSet::new(forest.clone(), state.region);
            state.postconditions = TraceViewSet::new(forest.clone(), state.region);
        }
    }

    pub fn end_recording(&self) {
        self.inner.lock().recording = false;
    }

    /// Models one region access of a mapped operation: updates validity and,
    /// during recording, the accumulated conditions.
    pub fn update_valid_views(
        &self,
        region: Region,
        view: ViewId,
        expr: ExprId,
        usage: RegionUsage,
        mask: FieldMask,
    ) {
        let mut inner = self.inner.lock();
        let set = self.set_for(&mut inner, region);
        let recording = inner.recording;
        let state = inner.sets.get_mut(&set).expect("just resolved");
        match usage.privilege {
            Privilege::NoAccess => {},
            Privilege::ReadOnly => {
                if recording {
                    // only data the trace did not itself produce is a
                    // precondition
                    let (non_dominated, _) = state.postconditions.dominates(view, expr, mask);
                    for (nd_expr, nd_mask) in non_dominated.iter() {
                        state.preconditions.insert(view, *nd_expr, *nd_mask);
                    }
                }
            },
            Privilege::ReadWrite | Privilege::Reduce(_) => {
                if recording {
                    state.postconditions.invalidate_all_but(view, expr, mask);
                    state.postconditions.insert(view, expr, mask);
                }
                state.valid.invalidate_all_but(view, expr, mask);
                state.valid.insert(view, expr, mask);
            },
            Privilege::WriteDiscard => {
                if recording {
                    state.anticonditions.insert(view, expr, mask);
                    state.postconditions.invalidate_all_but(view, expr, mask);
                    state.postconditions.insert(view, expr, mask);
                }
                state.valid.invalidate_all_but(view, expr, mask);
                state.valid.insert(view, expr, mask);
            },
        }
    }

    /// Marks a view valid without touching the recorded conditions, for
    /// setting up pre-trace state.
    pub fn seed_valid_view(&self, region: Region, view: ViewId, expr: ExprId, mask: FieldMask) {
        let mut inner = self.inner.lock();
        let set = self.set_for(&mut inner, region);
        inner.sets.get_mut(&set).expect("just resolved").valid.insert(view, expr, mask);
    }

    /// Invalidates fields of a region's equivalence set, notifying
    /// subscribers the way an upstream operation would.
    pub fn invalidate_region(&self, region: Region, view: ViewId, expr: ExprId, mask: FieldMask) {
        let (set, subscribers) = {
            let mut inner = self.inner.lock();
            let set = self.set_for(&mut inner, region);
            let state = inner.sets.get_mut(&set).expect("just resolved");
            state.valid.invalidate(view, expr, mask);
            (set, state.subscribers.clone())
        };
        for (_, subscriber) in subscribers {
            if let Some(subscriber) = subscriber.upgrade() {
                subscriber.invalidate_equivalence_set(set, &mask);
            }
        }
    }

    fn set_for(&self, inner: &mut EngineInner, region: Region) -> EquivalenceSetId {
        if let Some(set) = inner.by_region.get(&region) {
            return *set;
        }
        inner.next_set += 1;
        let set = EquivalenceSetId::new(inner.next_set);
        inner.by_region.insert(region, set);
        inner.sets.insert(set, EqSetState {
            region,
            valid: TraceViewSet::new(self.forest.clone(), region),
            preconditions: TraceViewSet::new(self.forest.clone(), region),
            anticonditions: TraceViewSet::new(self.forest.clone(), region),
            postconditions: TraceViewSet::new(self.forest.clone(), region),
            subscribers: Vec::new(),
        });
        set
    }

    fn restrict(&self, set: &TraceViewSet, mask: &FieldMask) -> TraceViewSet {
        let mut restricted = TraceViewSet::new(self.forest.clone(), set.region());
        for (view, entries) in set.iter() {
            for (expr, entry_mask) in entries.iter() {
                let overlap = *entry_mask & *mask;
                if !overlap.is_empty() {
                    restricted.insert(*view, *expr, overlap);
                }
            }
        }
        restricted
    }
}

impl VersionEngine for RecordedVersionEngine {
    fn compute_equivalence_sets(
        &self,
        region: Region,
        mask: &FieldMask,
    ) -> Vec<(EquivalenceSetId, FieldMask)> {
        let mut inner = self.inner.lock();
        vec![(self.set_for(&mut inner, region), *mask)]
    }

    fn capture_trace_conditions(
        &self,
        set: EquivalenceSetId,
        mask: &FieldMask,
    ) -> CapturedConditions {
        let inner = self.inner.lock();
        let state = inner.sets.get(&set).expect("unknown equivalence set");
        CapturedConditions {
            preconditions: self.restrict(&state.preconditions, mask),
            anticonditions: self.restrict(&state.anticonditions, mask),
            postconditions: self.restrict(&state.postconditions, mask),
        }
    }

    fn find_invalid_views(
        &self,
        set: EquivalenceSetId,
        expr: ExprId,
        views: &FieldMaskSet<ViewId>,
    ) -> Option<FailedPrecondition> {
        let inner = self.inner.lock();
        let state = inner.sets.get(&set)?;
        for (view, mask) in views.iter() {
            let (non_dominated, _) = state.valid.dominates(*view, expr, *mask);
            if let Some((nd_expr, nd_mask)) = non_dominated.iter().next() {
                return Some(FailedPrecondition { view: *view, expr: *nd_expr, mask: *nd_mask });
            }
        }
        None
    }

    fn find_antivalid_views(
        &self,
        set: EquivalenceSetId,
        expr: ExprId,
        views: &FieldMaskSet<ViewId>,
    ) -> Option<FailedPrecondition> {
        let inner = self.inner.lock();
        let state = inner.sets.get(&set)?;
        for (view, mask) in views.iter() {
            let (_, dominated) = state.valid.dominates(*view, expr, *mask);
            if let Some((d_expr, d_mask)) = dominated.iter().next() {
                return Some(FailedPrecondition { view: *view, expr: *d_expr, mask: *d_mask });
            }
        }
        None
    }

    fn overwrite(&self, set: EquivalenceSetId, expr: ExprId, views: &FieldMaskSet<ViewId>) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.sets.get_mut(&set) else {
            return;
        };
        let total = views.valid_mask();
        let existing: Vec<ViewId> = state.valid.iter().map(|(view, _)| *view).collect();
        for view in existing {
            state.valid.invalidate(view, expr, total);
        }
        for (view, mask) in views.iter() {
            state.valid.insert(*view, expr, *mask);
        }
    }

    fn subscribe(&self, set: EquivalenceSetId, subscriber: Weak<dyn VersionSubscriber>) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.sets.get_mut(&set) {
            let id = subscriber.upgrade().map(|s| s.subscriber_id()).unwrap_or(0);
            if !state.subscribers.iter().any(|(existing, _)| *existing == id) {
                state.subscribers.push((id, subscriber));
            }
        }
    }

    fn unsubscribe(&self, set: EquivalenceSetId, subscriber_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.sets.get_mut(&set) {
            state.subscribers.retain(|(id, _)| *id != subscriber_id);
        }
    }
}

// RECORDING ISSUE ENGINE
// ================================================================================================

/// One data movement operation issued through the engine.
#[derive(Clone, Debug)]
pub enum IssuedOp {
    Copy { expr: ExprId, srcs: Vec<CopyField>, dsts: Vec<CopyField>, completion: Event },
    Fill { expr: ExprId, dsts: Vec<CopyField>, completion: Event },
}

/// An issue engine that logs every copy and fill; completions are user
/// events triggered by the issue's precondition, like a zero-latency DMA.
#[derive(Debug)]
pub struct RecordingIssueEngine {
    fabric: Arc<EventFabric>,
    log: Mutex<Vec<IssuedOp>>,
}

impl RecordingIssueEngine {
    pub fn new(fabric: Arc<EventFabric>) -> Arc<Self> {
        Arc::new(Self { fabric, log: Mutex::new(Vec::new()) })
    }

    pub fn issued(&self) -> Vec<IssuedOp> {
        self.log.lock().clone()
    }

    pub fn issued_count(&self) -> usize {
        self.log.lock().len()
    }
}

impl IssueEngine for RecordingIssueEngine {
    fn issue_copy(
        &self,
        expr: ExprId,
        src_fields: &[CopyField],
        dst_fields: &[CopyField],
        _reservations: &[Reservation],
        precondition: Event,
    ) -> Event {
        let user = self.fabric.create_user_event();
        self.fabric.trigger(user, precondition);
        self.log.lock().push(IssuedOp::Copy {
            expr,
            srcs: src_fields.to_vec(),
            dsts: dst_fields.to_vec(),
            completion: user.event(),
        });
        user.event()
    }

    fn issue_fill(
        &self,
        expr: ExprId,
        dst_fields: &[CopyField],
        _value: &[u8],
        precondition: Event,
    ) -> Event {
        let user = self.fabric.create_user_event();
        self.fabric.trigger(user, precondition);
        self.log.lock().push(IssuedOp::Fill {
            expr,
            dsts: dst_fields.to_vec(),
            completion: user.event(),
        });
        user.event()
    }
}

// TEST ACROSS EXECUTOR
// ================================================================================================

/// A gather/scatter executor that completes as soon as its preconditions do
/// and remembers the immutability verdict the capture hands it.
#[derive(Debug)]
pub struct TestAcrossExecutor {
    immutable: Mutex<Option<bool>>,
    executions: AtomicU64,
}

impl TestAcrossExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { immutable: Mutex::new(None), executions: AtomicU64::new(0) })
    }

    /// The immutability verdict, once the capture decided one.
    pub fn trace_immutable(&self) -> Option<bool> {
        *self.immutable.lock()
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

impl AcrossExecutor for TestAcrossExecutor {
    fn execute(
        &self,
        fabric: &EventFabric,
        copy_precondition: Event,
        collective_precondition: Event,
        src_indirect_precondition: Event,
        dst_indirect_precondition: Event,
    ) -> Event {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let user = fabric.create_user_event();
        let precondition = fabric.merge(&[
            copy_precondition,
            collective_precondition,
            src_indirect_precondition,
            dst_indirect_precondition,
        ]);
        fabric.trigger(user, precondition);
        user.event()
    }

    fn set_trace_immutable(&self, immutable: bool) {
        *self.immutable.lock() = Some(immutable);
    }
}

// HARNESS
// ================================================================================================

/// A ready-to-use bundle of collaborators for trace tests.
pub struct TestHarness {
    pub ctx: Arc<TraceContext>,
    pub fabric: Arc<EventFabric>,
    pub forest: Arc<ExpressionForest>,
    pub views: Arc<ViewRegistry>,
    pub engine: Arc<RecordedVersionEngine>,
    pub issuer: Arc<RecordingIssueEngine>,
    next_view: AtomicU64,
}

impl TestHarness {
    pub fn new(config: TraceConfig) -> Self {
        let fabric = Arc::new(EventFabric::new());
        let forest = Arc::new(ExpressionForest::new());
        let views = Arc::new(ViewRegistry::new());
        let engine = RecordedVersionEngine::new(forest.clone());
        let issuer = RecordingIssueEngine::new(fabric.clone());
        let ctx = Arc::new(TraceContext {
            fabric: fabric.clone(),
            forest: forest.clone(),
            views: views.clone(),
            versions: engine.clone(),
            issuer: issuer.clone(),
            config,
        });
        Self { ctx, fabric, forest, views, engine, issuer, next_view: AtomicU64::new(1) }
    }

    /// A region over `[0, extent)` in the given tree.
    pub fn region(&self, tree: u32, extent: u64) -> Region {
        Region::new(TreeId::new(tree), self.forest.intern(IntervalSet::interval(0, extent)))
    }

    /// Registers a materialized view on the given tree.
    pub fn view(&self, tree: u32, owner_space: u32) -> ViewId {
        let id = ViewId::new(self.next_view.fetch_add(1, Ordering::Relaxed));
        self.views.register(LogicalView {
            id,
            kind: ViewKind::Materialized,
            tree_id: TreeId::new(tree),
            owner_space: AddressSpace::new(owner_space),
            memory: MemoryKind::System,
        });
        id
    }
}
