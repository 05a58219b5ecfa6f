use std::collections::BTreeMap;

use phalanx_core::FieldMask;
use tracing::trace;

use crate::{
    errors::TraceError,
    op::{DependenceType, GenerationId, OpRef, OperationKind, UniqueOpId},
    physical::PhysicalTrace,
};

/// Application-chosen identifier of a trace.
pub type TraceId = u64;

// DEPENDENCE RECORD
// ================================================================================================

/// One recorded inter-operation dependence.
///
/// `operation_idx` names the earlier operation by its index in the trace
/// window; `prev_idx`/`next_idx` name the region requirements on the target
/// and source respectively, with −1 denoting a whole-operation dependence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependenceRecord {
    pub operation_idx: i32,
    pub prev_idx: i32,
    pub next_idx: i32,
    pub validates: bool,
    pub dtype: DependenceType,
    pub dependent_mask: FieldMask,
}

impl DependenceRecord {
    pub fn whole_operation(operation_idx: usize) -> Self {
        Self {
            operation_idx: operation_idx as i32,
            prev_idx: -1,
            next_idx: -1,
            validates: false,
            dtype: DependenceType::TrueDependence,
            dependent_mask: FieldMask::EMPTY,
        }
    }

    /// Folds `other` into this record when they describe the same dependence
    /// edge, unioning the field masks. Returns false (and leaves both
    /// untouched) otherwise.
    pub fn merge(&mut self, other: &Self) -> bool {
        if self.operation_idx != other.operation_idx
            || self.prev_idx != other.prev_idx
            || self.next_idx != other.next_idx
            || self.validates != other.validates
            || self.dtype != other.dtype
        {
            return false;
        }
        self.dependent_mask |= other.dependent_mask;
        true
    }
}

/// A caller-supplied dependence for a static trace: the `previous_offset`th
/// operation before this one, at the given requirement indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticDependence {
    pub previous_offset: usize,
    pub previous_req_index: i32,
    pub next_req_index: i32,
    pub validates: bool,
    pub dtype: DependenceType,
    pub dependent_mask: FieldMask,
}

// TRACE STATE
// ================================================================================================

/// What the current trace pass is doing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraceState {
    /// Replaying recorded logical dependences with no physical template.
    #[default]
    LogicalOnly,
    /// First pass: recording dependences (and possibly a physical template).
    Recording,
    /// A physical template carries the dependences; only structure is
    /// validated.
    Replaying,
}

/// Structural fingerprint of one recorded operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpInfo {
    pub kind: OperationKind,
    pub region_count: usize,
}

/// An aliased-child record on one region requirement of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasedChildren {
    pub req_index: usize,
    pub mask: FieldMask,
}

// DYNAMIC TRACE
// ================================================================================================

type OpKey = (UniqueOpId, GenerationId);

/// A trace whose dependences are recorded from the dependence analysis on
/// the first pass and re-registered on every later pass.
#[derive(Debug)]
pub struct DynamicTrace {
    tid: TraceId,
    state: TraceState,
    fixed: bool,
    /// Operations of the active pass, in issue order.
    operations: Vec<OpRef>,
    op_indices: BTreeMap<OpKey, usize>,
    /// One bucket of records per recorded operation.
    dependences: Vec<Vec<DependenceRecord>>,
    /// Records attached to internal operations, folded into their creator's
    /// bucket (at the creator index and requirement index captured here) when
    /// the trace is fixed.
    internal_dependences: BTreeMap<OpKey, (usize, usize, Vec<DependenceRecord>)>,
    op_info: Vec<OpInfo>,
    /// Operations still at the tail of the recorded DAG, for the trailing
    /// fence.
    frontiers: BTreeMap<OpKey, OpRef>,
    aliased_children: Vec<Vec<AliasedChildren>>,
    physical: Option<PhysicalTrace>,
    blocking_call_observed: bool,
    has_intermediate_ops: bool,
}

impl DynamicTrace {
    pub fn new(tid: TraceId) -> Self {
        Self {
            tid,
            state: TraceState::Recording,
            fixed: false,
            operations: Vec::new(),
            op_indices: BTreeMap::new(),
            dependences: Vec::new(),
            internal_dependences: BTreeMap::new(),
            op_info: Vec::new(),
            frontiers: BTreeMap::new(),
            aliased_children: Vec::new(),
            physical: None,
            blocking_call_observed: false,
            has_intermediate_ops: false,
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, TraceState::Recording)
    }

    pub fn has_physical_trace(&self) -> bool {
        self.physical.is_some()
    }

    /// Installs physical tracing for this trace.
    pub fn set_physical_trace(&mut self, physical: PhysicalTrace) {
        debug_assert!(self.physical.is_none());
        self.physical = Some(physical);
    }

    pub fn physical_trace(&mut self) -> Option<&mut PhysicalTrace> {
        self.physical.as_mut()
    }

    pub fn blocking_call_observed(&self) -> bool {
        self.blocking_call_observed
    }

    /// Notes that the application made a blocking runtime call inside the
    /// trace; the capture will be rejected at finalization.
    pub fn record_blocking_call(&mut self) {
        self.blocking_call_observed = true;
    }

    pub fn has_intermediate_ops(&self) -> bool {
        self.has_intermediate_ops
    }

    pub fn set_intermediate_ops(&mut self) {
        self.has_intermediate_ops = true;
    }

    /// Starts a new pass over the trace window.
    pub fn begin_pass(&mut self, physical_replay: bool) {
        self.state = if !self.fixed {
            TraceState::Recording
        } else if physical_replay {
            TraceState::Replaying
        } else {
            TraceState::LogicalOnly
        };
        self.operations.clear();
        self.op_indices.clear();
        self.frontiers.clear();
    }

    /// Registers the next operation of the pass.
    ///
    /// While recording, this appends the operation and opens its dependence
    /// bucket. On later passes the operation's kind and requirement count are
    /// validated against the recorded fingerprint, and (outside physical
    /// replay) the recorded dependences are re-registered on it.
    pub fn register_operation(&mut self, op: OpRef) -> Result<(), TraceError> {
        if op.op.is_internal() {
            // internal operations never occupy a window position
            return Ok(());
        }
        let index = self.operations.len();
        op.op.set_trace_local_id((index as u64).into());
        op.op.add_mapping_reference(op.generation);
        self.op_indices.insert(op.key(), index);
        match self.state {
            TraceState::Recording => {
                self.operations.push(op.clone());
                self.dependences.push(Vec::new());
                self.aliased_children.push(Vec::new());
                self.op_info.push(OpInfo {
                    kind: op.op.kind(),
                    region_count: op.op.region_count(),
                });
                self.frontiers.insert(op.key(), op);
            },
            TraceState::LogicalOnly | TraceState::Replaying => {
                let Some(info) = self.op_info.get(index) else {
                    return Err(TraceError::IncompleteReplay {
                        trace_id: self.tid,
                        recorded: self.dependences.len(),
                        issued: index + 1,
                    });
                };
                if info.kind != op.op.kind() {
                    return Err(TraceError::OperationKindMismatch {
                        trace_id: self.tid,
                        index,
                        expected: info.kind,
                        actual: op.op.kind(),
                        name: op.op.name().to_string(),
                        uid: op.op.unique_id(),
                    });
                }
                if info.region_count != op.op.region_count() {
                    return Err(TraceError::RequirementCountMismatch {
                        trace_id: self.tid,
                        index,
                        expected: info.region_count,
                        actual: op.op.region_count(),
                        name: op.op.name().to_string(),
                        uid: op.op.unique_id(),
                    });
                }
                self.operations.push(op.clone());
                self.frontiers.insert(op.key(), op.clone());
                if matches!(self.state, TraceState::LogicalOnly) {
                    self.replay_dependences(index, &op);
                } else {
                    // the template carries the dependences; only prune the
                    // frontier set the trailing fence will consume
                    for record in &self.dependences[index] {
                        if record.dtype.is_dependence()
                            && let Some(target) = self.operations.get(record.operation_idx as usize)
                        {
                            let key = target.key();
                            self.frontiers.remove(&key);
                        }
                    }
                }
            },
        }
        Ok(())
    }

    fn replay_dependences(&mut self, index: usize, op: &OpRef) {
        let records = self.dependences[index].clone();
        for record in records {
            if !record.dtype.is_dependence() {
                // no-dependence records exist for logging only
                continue;
            }
            let target = match self.operations.get(record.operation_idx as usize) {
                Some(target) => target.clone(),
                None => continue,
            };
            let registered = if record.prev_idx < 0 || record.next_idx < 0 {
                op.op.register_dependence(&target)
            } else {
                op.op.register_region_dependence(
                    record.next_idx as usize,
                    &target,
                    record.prev_idx as usize,
                    record.dtype,
                    record.validates,
                    &record.dependent_mask,
                )
            };
            if registered {
                self.frontiers.remove(&target.key());
            }
        }
    }

    /// Records a whole-operation dependence of `source` on `target`.
    /// Pairs whose target lies outside the trace window are ignored.
    pub fn record_dependence(&mut self, target: &OpRef, source: &OpRef) {
        debug_assert!(self.is_recording());
        let Some(target_idx) = self.resolve_target(target) else {
            return;
        };
        let record = DependenceRecord::whole_operation(target_idx);
        self.frontiers.remove(&target.key());
        self.push_record(source, record);
    }

    /// Records a dependence between requirement `target_idx` of `target` and
    /// requirement `source_idx` of `source`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_region_dependence(
        &mut self,
        target: &OpRef,
        target_idx: usize,
        source: &OpRef,
        source_idx: usize,
        dtype: DependenceType,
        validates: bool,
        dependent_mask: FieldMask,
    ) {
        debug_assert!(self.is_recording());
        let Some(target_op_idx) = self.resolve_target(target) else {
            return;
        };
        let record = DependenceRecord {
            operation_idx: target_op_idx as i32,
            prev_idx: target_idx as i32,
            next_idx: source_idx as i32,
            validates,
            dtype,
            dependent_mask,
        };
        if dtype.is_dependence() {
            self.frontiers.remove(&target.key());
        }
        self.push_record(source, record);
    }

    /// Records that dependence analysis proved two requirements independent.
    /// Skipped at replay but kept for logging.
    pub fn record_no_dependence(
        &mut self,
        target: &OpRef,
        target_idx: usize,
        source: &OpRef,
        source_idx: usize,
        dependent_mask: FieldMask,
    ) {
        debug_assert!(self.is_recording());
        debug_assert!(!dependent_mask.is_empty());
        let Some(target_op_idx) = self.resolve_target(target) else {
            return;
        };
        let record = DependenceRecord {
            operation_idx: target_op_idx as i32,
            prev_idx: target_idx as i32,
            next_idx: source_idx as i32,
            validates: false,
            dtype: DependenceType::NoDependence,
            dependent_mask,
        };
        self.push_record(source, record);
    }

    /// Records aliased children on a requirement of the most recently
    /// registered operation.
    pub fn record_aliased_children(&mut self, req_index: usize, mask: FieldMask) {
        debug_assert!(self.is_recording());
        if let Some(children) = self.aliased_children.last_mut() {
            children.push(AliasedChildren { req_index, mask });
        }
    }

    /// Opens an internal operation's record bucket, remembering the creator
    /// position and requirement index the records fold into when the trace is
    /// fixed.
    pub fn record_internal_operation(&mut self, internal: &OpRef, creator: &OpRef) {
        debug_assert!(internal.op.is_internal());
        if let Some(creator_idx) = self.op_indices.get(&creator.key()) {
            self.internal_dependences.insert(
                internal.key(),
                (*creator_idx, internal.op.internal_index(), Vec::new()),
            );
        }
    }

    fn resolve_target(&self, target: &OpRef) -> Option<usize> {
        if target.op.is_internal() {
            // dependences on internal operations attach to their creator
            return self
                .internal_dependences
                .get(&target.key())
                .map(|(creator_idx, _, _)| *creator_idx);
        }
        self.op_indices.get(&target.key()).copied()
    }

    fn push_record(&mut self, source: &OpRef, record: DependenceRecord) {
        let bucket = if source.op.is_internal() {
            match self.internal_dependences.get_mut(&source.key()) {
                Some((_, _, bucket)) => bucket,
                None => return,
            }
        } else {
            match self.op_indices.get(&source.key()) {
                Some(index) => &mut self.dependences[*index],
                None => return,
            }
        };
        if !bucket.iter_mut().any(|existing| existing.merge(&record)) {
            bucket.push(record);
        }
    }

    /// Ends the recording pass: folds internal records into their creators'
    /// buckets (promoting no-dependence records so they replay) and freezes
    /// the trace structure.
    pub fn fix_trace(&mut self) {
        debug_assert!(!self.fixed);
        let internal = std::mem::take(&mut self.internal_dependences);
        for (_, (creator_idx, internal_index, records)) in internal {
            if creator_idx >= self.dependences.len() {
                continue;
            }
            for mut record in records {
                // internal operations replay their proven-independent edges
                // as true dependences
                if !record.dtype.is_dependence() {
                    record.dtype = DependenceType::TrueDependence;
                }
                record.next_idx = internal_index as i32;
                if record.operation_idx as usize >= creator_idx {
                    continue;
                }
                let bucket = &mut self.dependences[creator_idx];
                if !bucket.iter_mut().any(|existing| existing.merge(&record)) {
                    bucket.push(record);
                }
            }
        }
        self.fixed = true;
        trace!(trace = self.tid, operations = self.dependences.len(), "trace fixed");
    }

    /// Completes a pass at the trailing fence.
    ///
    /// Verifies the pass issued every recorded operation, hands the fence a
    /// mapping dependence on each frontier operation, and clears the pass
    /// tables.
    pub fn end_trace(&mut self, fence: &OpRef) -> Result<(), TraceError> {
        if self.fixed && self.operations.len() < self.dependences.len() {
            return Err(TraceError::IncompleteReplay {
                trace_id: self.tid,
                recorded: self.dependences.len(),
                issued: self.operations.len(),
            });
        }
        for frontier in self.frontiers.values() {
            fence.op.register_dependence(frontier);
        }
        for op in &self.operations {
            op.op.remove_mapping_reference(op.generation);
        }
        self.operations.clear();
        self.op_indices.clear();
        self.frontiers.clear();
        Ok(())
    }

    /// Number of operations recorded in the trace window.
    pub fn recorded_operations(&self) -> usize {
        self.dependences.len()
    }

    /// The recorded dependence bucket of operation `index`.
    pub fn dependences(&self, index: usize) -> &[DependenceRecord] {
        &self.dependences[index]
    }

    pub fn aliased_children_of(&self, index: usize) -> &[AliasedChildren] {
        &self.aliased_children[index]
    }
}

// STATIC TRACE
// ================================================================================================

/// A trace whose dependences are supplied by the application up front
/// instead of being recorded from dependence analysis.
#[derive(Debug)]
pub struct StaticTrace {
    tid: TraceId,
    /// Static dependences grouped by the issuing operation's window index.
    dependences_by_index: BTreeMap<usize, Vec<StaticDependence>>,
    operations: Vec<OpRef>,
    frontiers: BTreeMap<OpKey, OpRef>,
}

impl StaticTrace {
    /// Builds the trace from `(operation index, dependences)` pairs.
    pub fn new(tid: TraceId, dependences: Vec<(usize, StaticDependence)>) -> Self {
        let mut dependences_by_index: BTreeMap<usize, Vec<StaticDependence>> = BTreeMap::new();
        for (index, dependence) in dependences {
            dependences_by_index.entry(index).or_default().push(dependence);
        }
        Self { tid, dependences_by_index, operations: Vec::new(), frontiers: BTreeMap::new() }
    }

    pub fn trace_id(&self) -> TraceId {
        self.tid
    }

    pub fn begin_pass(&mut self) {
        self.operations.clear();
        self.frontiers.clear();
    }

    /// Registers the next operation and immediately applies its static
    /// dependences; static traces replay the same edges every pass.
    pub fn register_operation(&mut self, op: OpRef) -> Result<(), TraceError> {
        let index = self.operations.len();
        op.op.set_trace_local_id((index as u64).into());
        self.operations.push(op.clone());
        self.frontiers.insert(op.key(), op.clone());
        if let Some(dependences) = self.dependences_by_index.get(&index).cloned() {
            for dependence in dependences {
                let Some(target_index) = index.checked_sub(dependence.previous_offset) else {
                    continue;
                };
                let target = self.operations[target_index].clone();
                let registered = if dependence.previous_req_index < 0
                    || dependence.next_req_index < 0
                {
                    op.op.register_dependence(&target)
                } else {
                    op.op.register_region_dependence(
                        dependence.next_req_index as usize,
                        &target,
                        dependence.previous_req_index as usize,
                        dependence.dtype,
                        dependence.validates,
                        &dependence.dependent_mask,
                    )
                };
                if registered {
                    self.frontiers.remove(&target.key());
                }
            }
        }
        Ok(())
    }

    /// Static traces never memoize, so there is nothing to log per pass.
    pub fn perform_logging(&self) {}

    pub fn end_trace(&mut self, fence: &OpRef) -> Result<(), TraceError> {
        for frontier in self.frontiers.values() {
            fence.op.register_dependence(frontier);
        }
        self.operations.clear();
        self.frontiers.clear();
        Ok(())
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn record(op: i32, prev: i32, next: i32, dtype: DependenceType, bits: &[usize]) -> DependenceRecord {
        DependenceRecord {
            operation_idx: op,
            prev_idx: prev,
            next_idx: next,
            validates: false,
            dtype,
            dependent_mask: FieldMask::from_bits(bits),
        }
    }

    #[test]
    fn merge_unions_masks_on_matching_edges() {
        let mut a = record(0, 1, 2, DependenceType::TrueDependence, &[0]);
        let b = record(0, 1, 2, DependenceType::TrueDependence, &[3]);
        assert!(a.merge(&b));
        assert_eq!(a.dependent_mask, FieldMask::from_bits(&[0, 3]));

        let c = record(0, 1, 2, DependenceType::AntiDependence, &[4]);
        assert!(!a.merge(&c));
        assert_eq!(a.dependent_mask, FieldMask::from_bits(&[0, 3]));
    }

    proptest! {
        #[test]
        fn merge_is_commutative_and_idempotent(
            bits_a in proptest::collection::vec(0usize..64, 0..4),
            bits_b in proptest::collection::vec(0usize..64, 0..4),
        ) {
            let base = record(1, 0, 0, DependenceType::TrueDependence, &[]);
            let mut a = DependenceRecord { dependent_mask: FieldMask::from_bits(&bits_a), ..base.clone() };
            let b = DependenceRecord { dependent_mask: FieldMask::from_bits(&bits_b), ..base.clone() };

            let mut ab = a.clone();
            prop_assert!(ab.merge(&b));
            let mut ba = b.clone();
            prop_assert!(ba.merge(&a));
            prop_assert_eq!(&ab, &ba);

            // idempotent
            prop_assert!(a.merge(&a.clone()));
            let expected = DependenceRecord { dependent_mask: FieldMask::from_bits(&bits_a), ..base };
            prop_assert_eq!(a, expected);
        }
    }
}
