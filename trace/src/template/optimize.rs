//! The template optimization pipeline.
//!
//! Run at capture completion, in order: fence elision, merge propagation,
//! transitive reduction (optionally on a background worker), copy
//! propagation, dead-code elimination, parallel-replay slicing, and
//! complete-replay reordering. Each pass preserves the reachability of the
//! recorded event DAG while shrinking it.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use phalanx_core::Event;
use smallvec::SmallVec;
use tracing::debug;

use super::{
    CrossingInfo, Instruction, LastUsers, PendingReduction, PhysicalTemplate, Slot, TemplateInner,
    UserRouter,
};
use crate::op::{RegionUsage, TraceLocalId};

// CONSUMER/PRODUCER EXTRACTION
// ================================================================================================

/// One view access an instruction performs, extracted from the recorded view
/// tables.
#[derive(Clone, Debug)]
struct ViewAccess {
    view: phalanx_core::ViewId,
    expr: phalanx_core::ExprId,
    usage: RegionUsage,
    mask: phalanx_core::FieldMask,
}

/// Which precondition operand of an instruction a group of accesses guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PreconditionKind {
    Main,
    SrcIndirect,
    DstIndirect,
}

impl TemplateInner {
    /// Maps each produced slot to the index of its generating instruction.
    pub(crate) fn generator_map(&self) -> BTreeMap<Slot, usize> {
        let mut gen_map = BTreeMap::new();
        for (idx, instruction) in self.instructions.iter().enumerate() {
            if let Some(lhs) = instruction.lhs() {
                gen_map.entry(lhs).or_insert(idx);
            }
        }
        gen_map
    }

    /// The view accesses guarding each precondition operand of the
    /// instruction at `idx`, plus the slot whose event the accesses complete
    /// at (the producer side).
    fn view_accesses(&self, idx: usize) -> Vec<(PreconditionKind, Vec<ViewAccess>, Slot)> {
        let mut groups = Vec::new();
        match &self.instructions[idx] {
            Instruction::IssueCopy { lhs, .. }
            | Instruction::IssueFill { lhs, .. }
            | Instruction::IssueAcross { lhs, .. } => {
                if let Some(record) = self.copy_views.get(lhs) {
                    let mut accesses = Vec::new();
                    for (view, mask) in &record.srcs {
                        accesses.push(ViewAccess {
                            view: *view,
                            expr: record.expr,
                            usage: RegionUsage::read_only(),
                            mask: *mask,
                        });
                    }
                    for (view, mask) in &record.dsts {
                        accesses.push(ViewAccess {
                            view: *view,
                            expr: record.expr,
                            usage: RegionUsage::read_write(),
                            mask: *mask,
                        });
                    }
                    groups.push((PreconditionKind::Main, accesses, *lhs));
                }
                if let Some(records) = self.src_indirect_views.get(lhs) {
                    let accesses = records
                        .iter()
                        .map(|r| ViewAccess {
                            view: r.view,
                            expr: r.expr,
                            usage: RegionUsage::read_only(),
                            mask: r.mask,
                        })
                        .collect();
                    groups.push((PreconditionKind::SrcIndirect, accesses, *lhs));
                }
                if let Some(records) = self.dst_indirect_views.get(lhs) {
                    let accesses = records
                        .iter()
                        .map(|r| ViewAccess {
                            view: r.view,
                            expr: r.expr,
                            usage: RegionUsage::read_only(),
                            mask: r.mask,
                        })
                        .collect();
                    groups.push((PreconditionKind::DstIndirect, accesses, *lhs));
                }
            },
            Instruction::CompleteReplay { owner, .. } => {
                if let Some(records) = self.op_views.get(owner) {
                    let accesses = records
                        .iter()
                        .map(|r| ViewAccess {
                            view: r.view,
                            expr: r.expr,
                            usage: r.usage,
                            mask: r.mask,
                        })
                        .collect();
                    // the operation's accesses complete at its term event
                    let slot = self.memo_entries.get(owner).map(|(slot, _)| *slot).unwrap_or(0);
                    groups.push((PreconditionKind::Main, accesses, slot));
                }
            },
            _ => {},
        }
        groups
    }
}

// FENCE ELISION
// ================================================================================================

impl TemplateInner {
    /// Replaces recorded fence preconditions with merges of the last users of
    /// each instruction's operand views. Accesses with no conflicting user
    /// earlier in the window depend on the previous iteration instead: their
    /// end-of-trace sources become frontier slots carried across replays.
    pub(crate) fn elide_fences(&mut self, router: &dyn UserRouter) {
        let mut gen_map = self.generator_map();
        let recorded = self.instructions.len();
        // consumers whose views had no in-trace producer yet
        let mut cross_iteration: Vec<(usize, PreconditionKind, Vec<ViewAccess>)> = Vec::new();

        for idx in 0..recorded {
            let order = self.instructions[idx].owner().map(|o| o.context_index);
            let groups = self.view_accesses(idx);
            for (kind, accesses, _) in groups {
                let mut users = LastUsers::default();
                for access in &accesses {
                    let found = router.find_users(
                        self,
                        access.view,
                        access.usage,
                        access.expr,
                        access.mask,
                        Some(order.unwrap_or(0)),
                    );
                    users.slots.extend(found.slots);
                    users.barriers.extend(found.barriers);
                }
                users.barriers.sort_unstable_by_key(|b| b.uid());
                users.barriers.dedup_by_key(|b| b.uid());
                if users.is_empty() {
                    cross_iteration.push((idx, kind, accesses));
                } else {
                    let slots = self.resolve_user_slots(users, &mut gen_map);
                    self.substitute_precondition(idx, kind, slots, &mut gen_map);
                }
            }
        }

        // second phase: wire cross-iteration edges through frontier slots
        for (idx, kind, accesses) in cross_iteration {
            let mut users = LastUsers::default();
            for access in &accesses {
                let found = router.find_users(
                    self,
                    access.view,
                    access.usage,
                    access.expr,
                    access.mask,
                    None,
                );
                users.slots.extend(found.slots);
                users.barriers.extend(found.barriers);
            }
            users.barriers.sort_unstable_by_key(|b| b.uid());
            users.barriers.dedup_by_key(|b| b.uid());
            if users.is_empty() {
                // the data comes from before the trace; the fence covers it
                continue;
            }
            let mut frontier_slots = BTreeSet::new();
            for src in users.slots {
                frontier_slots.insert(self.frontier_for(src));
            }
            for barrier in users.barriers {
                // cross-iteration values from a peer shard arrive through a
                // barrier whose phase is bound into the slot before the
                // slices launch
                let slot = self.alloc_slot(Event::NONE);
                self.external_frontier_slots.insert(slot);
                router.note_remote_frontier(barrier, slot);
                frontier_slots.insert(slot);
            }
            self.substitute_precondition(idx, kind, frontier_slots, &mut gen_map);
        }
    }

    /// Converts a last-user set into precondition slots, realizing remote
    /// barriers as advance instructions that track the producer's per-replay
    /// arrivals.
    fn resolve_user_slots(
        &mut self,
        users: LastUsers,
        gen_map: &mut BTreeMap<Slot, usize>,
    ) -> BTreeSet<Slot> {
        let mut slots = users.slots;
        for barrier in users.barriers {
            let slot = self.advance_slot(barrier, gen_map);
            slots.insert(slot);
        }
        slots
    }

    /// Appends a `BarrierAdvance` bound to a fresh slot.
    fn advance_slot(&mut self, barrier: phalanx_core::Barrier, gen_map: &mut BTreeMap<Slot, usize>) -> Slot {
        let slot = self.alloc_slot(Event::NONE);
        gen_map.insert(slot, self.instructions.len());
        self.instructions.push(Instruction::BarrierAdvance { lhs: slot, barrier });
        slot
    }

    /// The frontier destination slot carrying `src` across iterations.
    pub(crate) fn frontier_for(&mut self, src: Slot) -> Slot {
        if let Some(dst) = self.frontiers.get(&src) {
            return *dst;
        }
        let dst = self.alloc_slot(Event::NONE);
        self.frontiers.insert(src, dst);
        dst
    }

    /// Rewires the given precondition operand of `instructions[idx]` to wait
    /// on `slots` instead of the recorded fence. If the current precondition
    /// is already a merge, the slots are unioned into it; otherwise a new
    /// merge slot is appended.
    fn substitute_precondition(
        &mut self,
        idx: usize,
        kind: PreconditionKind,
        slots: BTreeSet<Slot>,
        gen_map: &mut BTreeMap<Slot, usize>,
    ) {
        if slots.is_empty() {
            return;
        }
        let current = match (&self.instructions[idx], kind) {
            (Instruction::IssueCopy { precondition, .. }, PreconditionKind::Main)
            | (Instruction::IssueFill { precondition, .. }, PreconditionKind::Main) => {
                Some(*precondition)
            },
            (Instruction::IssueAcross { copy_precondition, .. }, PreconditionKind::Main) => {
                Some(*copy_precondition)
            },
            (
                Instruction::IssueAcross { src_indirect_precondition, .. },
                PreconditionKind::SrcIndirect,
            ) => *src_indirect_precondition,
            (
                Instruction::IssueAcross { dst_indirect_precondition, .. },
                PreconditionKind::DstIndirect,
            ) => *dst_indirect_precondition,
            (Instruction::CompleteReplay { rhs, .. }, PreconditionKind::Main) => Some(*rhs),
            _ => None,
        };

        // union into an existing merge when the recorded precondition is one
        if let Some(pre) = current
            && let Some(gen_idx) = gen_map.get(&pre)
            && let Instruction::MergeEvent { rhs, .. } = &mut self.instructions[*gen_idx]
        {
            rhs.extend(slots);
            rhs.sort_unstable();
            rhs.dedup();
            return;
        }

        // only the fence precondition is elided; any other recorded
        // precondition (e.g. an op sync event) is carried into the merge
        let mut slots = slots;
        if let Some(pre) = current
            && pre != 0
        {
            slots.insert(pre);
        }

        let owner = self.instructions[idx].owner().unwrap_or_default();
        let merge_slot = self.alloc_slot(Event::NONE);
        gen_map.insert(merge_slot, self.instructions.len());
        self.instructions.push(Instruction::MergeEvent {
            lhs: merge_slot,
            rhs: slots.iter().copied().collect(),
            owner,
        });
        let new_pre = merge_slot;

        match (&mut self.instructions[idx], kind) {
            (Instruction::IssueCopy { precondition, .. }, PreconditionKind::Main)
            | (Instruction::IssueFill { precondition, .. }, PreconditionKind::Main) => {
                *precondition = new_pre;
            },
            (Instruction::IssueAcross { copy_precondition, .. }, PreconditionKind::Main) => {
                *copy_precondition = new_pre;
            },
            (
                Instruction::IssueAcross { src_indirect_precondition, .. },
                PreconditionKind::SrcIndirect,
            ) => *src_indirect_precondition = Some(new_pre),
            (
                Instruction::IssueAcross { dst_indirect_precondition, .. },
                PreconditionKind::DstIndirect,
            ) => *dst_indirect_precondition = Some(new_pre),
            (Instruction::CompleteReplay { rhs, .. }, PreconditionKind::Main) => *rhs = new_pre,
            _ => {},
        }
    }

    /// Decides, per gather/scatter executor, whether its indirection
    /// preimages are immutable over the trace.
    pub(crate) fn record_across_immutability(&mut self, router: &dyn UserRouter) {
        let across = std::mem::take(&mut self.across_copies);
        for (slot, executor) in across {
            let mut records = Vec::new();
            if let Some(srcs) = self.src_indirect_views.get(&slot) {
                records.extend(srcs.clone());
            }
            if let Some(dsts) = self.dst_indirect_views.get(&slot) {
                records.extend(dsts.clone());
            }
            let immutable = records
                .iter()
                .all(|r| router.all_users_read_only(self, r.view, r.expr, r.mask));
            executor.set_trace_immutable(immutable);
        }
    }
}

// TOPOLOGICAL REORDERING
// ================================================================================================

impl TemplateInner {
    /// Restores the producer-before-consumer property fence elision breaks by
    /// appending merges after the instructions that consume them. Stable:
    /// among ready instructions, recorded order wins.
    pub(crate) fn reorder_topologically(&mut self) {
        let gen_map = self.generator_map();
        let n = self.instructions.len();
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for (idx, instruction) in self.instructions.iter().enumerate() {
            for dep in instruction.dependencies() {
                if let Some(producer) = gen_map.get(&dep).copied()
                    && producer != idx
                {
                    succs[producer].push(idx);
                    indegree[idx] += 1;
                }
            }
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        let mut order: Vec<usize> = Vec::with_capacity(n);
        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for succ in &succs[idx] {
                indegree[*succ] -= 1;
                if indegree[*succ] == 0 {
                    ready.insert(*succ);
                }
            }
        }
        debug_assert_eq!(order.len(), n, "instruction stream has a dependence cycle");
        let mut instructions = std::mem::take(&mut self.instructions);
        let mut reordered = Vec::with_capacity(n);
        for idx in order {
            reordered.push(std::mem::replace(
                &mut instructions[idx],
                Instruction::AssignFenceCompletion { lhs: 0 },
            ));
        }
        self.instructions = reordered;
    }
}

// MERGE PROPAGATION
// ================================================================================================

impl TemplateInner {
    /// Coalesces nested merges and prunes merges nothing references.
    pub(crate) fn propagate_merges(&mut self) {
        let gen_map = self.generator_map();
        // expand merge operands that are themselves merges
        let mut expanded: BTreeMap<Slot, SmallVec<[Slot; 4]>> = BTreeMap::new();
        let merge_indices: Vec<usize> = self
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, Instruction::MergeEvent { .. }))
            .map(|(idx, _)| idx)
            .collect();
        for idx in &merge_indices {
            let (lhs, rhs) = match &self.instructions[*idx] {
                Instruction::MergeEvent { lhs, rhs, .. } => (*lhs, rhs.clone()),
                _ => unreachable!(),
            };
            let mut flat: SmallVec<[Slot; 4]> = SmallVec::new();
            for slot in rhs {
                match expanded.get(&slot) {
                    Some(nested) => flat.extend(nested.iter().copied()),
                    None => flat.push(slot),
                }
            }
            flat.sort_unstable();
            flat.dedup();
            flat.retain(|s| *s != lhs);
            if flat.is_empty() {
                // a merge of nothing waits on the fence
                flat.push(0);
            }
            expanded.insert(lhs, flat.clone());
            if let Instruction::MergeEvent { rhs, .. } = &mut self.instructions[*idx] {
                *rhs = flat;
            }
        }

        // keep non-merges unconditionally; keep merges reachable from them
        let mut keep = vec![false; self.instructions.len()];
        let mut worklist: Vec<usize> = Vec::new();
        for (idx, instruction) in self.instructions.iter().enumerate() {
            if !matches!(instruction, Instruction::MergeEvent { .. }) {
                keep[idx] = true;
                worklist.push(idx);
            }
        }
        while let Some(idx) = worklist.pop() {
            for input in self.instructions[idx].inputs() {
                if let Some(gen_idx) = gen_map.get(&input)
                    && !keep[*gen_idx]
                {
                    keep[*gen_idx] = true;
                    worklist.push(*gen_idx);
                }
            }
        }
        self.compact(&keep);
    }
}

// TRANSITIVE REDUCTION
// ================================================================================================

/// A snapshot of the event DAG sufficient to reduce merge operands off the
/// template lock.
#[derive(Clone, Debug)]
pub(crate) struct GraphSnapshot {
    slot_count: usize,
    /// `(lhs, inputs, is_merge)` per instruction producing a slot.
    nodes: Vec<(Slot, SmallVec<[Slot; 4]>, bool)>,
}

impl TemplateInner {
    pub(crate) fn graph_snapshot(&self) -> GraphSnapshot {
        let mut nodes = Vec::new();
        self.for_each_instruction(|instruction| {
            if let Some(lhs) = instruction.lhs() {
                nodes.push((
                    lhs,
                    instruction.inputs(),
                    matches!(instruction, Instruction::MergeEvent { .. }),
                ));
            }
        });
        GraphSnapshot { slot_count: self.events.len(), nodes }
    }

    /// Applies a reduction result to the pre-slicing instruction stream.
    pub(crate) fn apply_reduction(&mut self, reduction: PendingReduction) {
        let gen_map = self.generator_map();
        for (lhs, new_rhs) in reduction.merges {
            if let Some(idx) = gen_map.get(&lhs)
                && let Instruction::MergeEvent { rhs, .. } = &mut self.instructions[*idx]
            {
                *rhs = new_rhs;
            }
        }
    }

    /// Applies a deferred reduction result to the sliced stream, retiring
    /// crossings the reduction proved redundant.
    pub(crate) fn apply_reduction_sliced(&mut self, reduction: PendingReduction) {
        let targets: BTreeMap<Slot, SmallVec<[Slot; 4]>> = reduction.merges.into_iter().collect();
        let mut dropped: Vec<Slot> = Vec::new();
        for slice in self.slices.iter_mut() {
            for instruction in slice.iter_mut() {
                if let Instruction::MergeEvent { lhs, rhs, .. } = instruction
                    && let Some(new_rhs) = targets.get(lhs)
                {
                    for slot in rhs.iter() {
                        if !new_rhs.contains(slot) {
                            dropped.push(*slot);
                        }
                    }
                    *rhs = new_rhs.clone();
                }
            }
        }
        // release crossings whose last reference the reduction removed
        let mut dead_crossings: BTreeSet<Slot> = BTreeSet::new();
        for slot in dropped {
            if let Some(info) = self.crossing_events.get_mut(&slot) {
                info.refs = info.refs.saturating_sub(1);
                if info.refs == 0 {
                    dead_crossings.insert(slot);
                }
            }
        }
        if !dead_crossings.is_empty() {
            for slot in &dead_crossings {
                self.crossing_events.remove(slot);
            }
            for slice in self.slices.iter_mut() {
                slice.retain(|instruction| match instruction {
                    Instruction::TriggerEvent { lhs, .. } => !dead_crossings.contains(lhs),
                    _ => true,
                });
            }
        }
    }
}

/// Computes the minimal merge operand sets that preserve reachability, using
/// a topological order, a greedy chain decomposition, and per-node chain
/// frontiers.
pub(crate) fn compute_transitive_reduction(snapshot: &GraphSnapshot) -> PendingReduction {
    let n = snapshot.slot_count;
    // adjacency: incoming edges per produced slot
    let mut preds: Vec<SmallVec<[Slot; 4]>> = vec![SmallVec::new(); n];
    let mut succs: Vec<SmallVec<[Slot; 4]>> = vec![SmallVec::new(); n];
    let mut is_merge = vec![false; n];
    for (lhs, inputs, merge) in &snapshot.nodes {
        is_merge[*lhs] = *merge;
        for input in inputs {
            preds[*lhs].push(*input);
            succs[*input].push(*lhs);
        }
    }

    // Kahn topological order over the event dependence graph
    let mut indegree: Vec<usize> = preds.iter().map(SmallVec::len).collect();
    let mut order: Vec<Slot> = Vec::with_capacity(n);
    let mut ready: Vec<Slot> = (0..n).filter(|s| indegree[*s] == 0).collect();
    while let Some(slot) = ready.pop() {
        order.push(slot);
        for succ in &succs[slot] {
            indegree[*succ] -= 1;
            if indegree[*succ] == 0 {
                ready.push(*succ);
            }
        }
    }
    debug_assert_eq!(order.len(), n, "event graph has a cycle");
    let mut topo_pos = vec![0usize; n];
    for (pos, slot) in order.iter().enumerate() {
        topo_pos[*slot] = pos;
    }

    // greedy chain decomposition: extend a chain whose tip is a predecessor
    let mut chain_of = vec![usize::MAX; n];
    let mut pos_in_chain = vec![0usize; n];
    let mut chain_tips: Vec<Slot> = Vec::new();
    for slot in &order {
        let mut assigned = false;
        for pred in &preds[*slot] {
            let chain = chain_of[*pred];
            if chain != usize::MAX && chain_tips[chain] == *pred {
                chain_of[*slot] = chain;
                pos_in_chain[*slot] = pos_in_chain[*pred] + 1;
                chain_tips[chain] = *slot;
                assigned = true;
                break;
            }
        }
        if !assigned {
            chain_of[*slot] = chain_tips.len();
            pos_in_chain[*slot] = 0;
            chain_tips.push(*slot);
        }
    }
    let num_chains = chain_tips.len();

    // per-node chain frontiers: deepest position on each chain that reaches
    // the node
    const UNREACHED: i64 = -1;
    let mut frontier: Vec<Vec<i64>> = vec![vec![UNREACHED; num_chains]; n];
    let mut reduced = PendingReduction::default();
    for slot in &order {
        let mut mine = vec![UNREACHED; num_chains];
        if is_merge[*slot] {
            // visit predecessors deepest-first so covered ones are dropped
            let mut inputs: Vec<Slot> = preds[*slot].iter().copied().collect();
            inputs.sort_unstable_by_key(|p| std::cmp::Reverse(topo_pos[*p]));
            let mut kept: SmallVec<[Slot; 4]> = SmallVec::new();
            for pred in inputs {
                let chain = chain_of[pred];
                if mine[chain] >= pos_in_chain[pred] as i64 {
                    continue;
                }
                kept.push(pred);
                absorb(&mut mine, &frontier[pred]);
                mine[chain] = mine[chain].max(pos_in_chain[pred] as i64);
            }
            kept.sort_unstable();
            reduced.merges.push((*slot, kept));
        } else {
            for pred in &preds[*slot] {
                absorb(&mut mine, &frontier[*pred]);
                let chain = chain_of[*pred];
                mine[chain] = mine[chain].max(pos_in_chain[*pred] as i64);
            }
        }
        frontier[*slot] = mine;
    }
    reduced
}

fn absorb(mine: &mut [i64], other: &[i64]) {
    for (a, b) in mine.iter_mut().zip(other.iter()) {
        *a = (*a).max(*b);
    }
}

// COPY PROPAGATION
// ================================================================================================

impl TemplateInner {
    /// Collapses single-input merges by substituting their operand for every
    /// downstream reference.
    pub(crate) fn propagate_copies(&mut self) {
        let mut resolve: BTreeMap<Slot, Slot> = BTreeMap::new();
        for instruction in &self.instructions {
            if let Instruction::MergeEvent { lhs, rhs, .. } = instruction
                && rhs.len() == 1
                && rhs[0] != *lhs
            {
                resolve.insert(*lhs, rhs[0]);
            }
        }
        if resolve.is_empty() {
            return;
        }
        let chase = |slot: Slot| {
            let mut current = slot;
            while let Some(next) = resolve.get(&current) {
                current = *next;
            }
            current
        };
        let mut keep = Vec::with_capacity(self.instructions.len());
        for instruction in self.instructions.iter_mut() {
            let dead = matches!(instruction, Instruction::MergeEvent { lhs, .. } if resolve.contains_key(lhs));
            keep.push(!dead);
            if !dead {
                instruction.remap_slots(chase);
            }
        }
        let remapped: BTreeMap<Slot, Slot> =
            self.frontiers.iter().map(|(src, dst)| (chase(*src), *dst)).collect();
        self.frontiers = remapped;
        self.compact(&keep);
    }

    /// Slice-aware variant used after a deferred reduction lands.
    pub(crate) fn propagate_copies_sliced(&mut self) {
        let mut resolve: BTreeMap<Slot, Slot> = BTreeMap::new();
        self.for_each_instruction(|instruction| {
            if let Instruction::MergeEvent { lhs, rhs, .. } = instruction
                && rhs.len() == 1
                && rhs[0] != *lhs
            {
                resolve.insert(*lhs, rhs[0]);
            }
        });
        if resolve.is_empty() {
            return;
        }
        let chase = |slot: Slot| {
            let mut current = slot;
            while let Some(next) = resolve.get(&current) {
                current = *next;
            }
            current
        };
        for slice in self.slices.iter_mut() {
            slice.retain(|instruction| {
                !matches!(instruction, Instruction::MergeEvent { lhs, .. } if resolve.contains_key(lhs))
            });
            for instruction in slice.iter_mut() {
                instruction.remap_slots(chase);
            }
        }
        for info in self.crossing_events.values_mut() {
            info.source = chase(info.source);
        }
    }
}

// DEAD CODE ELIMINATION
// ================================================================================================

impl TemplateInner {
    /// Retains only instructions whose outputs feed an effect, a frontier, or
    /// a postcondition slot.
    pub(crate) fn eliminate_dead_code(&mut self) {
        let gen_map = self.generator_map();
        let mut keep = vec![false; self.instructions.len()];
        let mut live_slots: BTreeSet<Slot> = BTreeSet::new();
        let mut worklist: Vec<usize> = Vec::new();

        for (idx, instruction) in self.instructions.iter().enumerate() {
            let root = instruction.is_effectful()
                || matches!(instruction, Instruction::AssignFenceCompletion { .. });
            if root {
                keep[idx] = true;
                worklist.push(idx);
            }
        }
        // frontier sources, postcondition slots, and slots peers consume
        // stay live
        let mut seeds: BTreeSet<Slot> = self.frontiers.keys().copied().collect();
        seeds.extend(self.local_user_slots.iter().copied());
        seeds.extend(self.remote_consumed_slots.iter().copied());
        seeds.extend(self.last_fence);
        for slot in seeds {
            if live_slots.insert(slot)
                && let Some(idx) = gen_map.get(&slot)
                && !keep[*idx]
            {
                keep[*idx] = true;
                worklist.push(*idx);
            }
        }

        while let Some(idx) = worklist.pop() {
            for dep in self.instructions[idx].dependencies() {
                if live_slots.insert(dep)
                    && let Some(gen_idx) = gen_map.get(&dep)
                    && !keep[*gen_idx]
                {
                    keep[*gen_idx] = true;
                    worklist.push(*gen_idx);
                }
            }
        }
        self.compact(&keep);
    }

    /// Drops unkept instructions. Slot numbering is stable across the whole
    /// optimization pipeline: peer shards hold references to this shard's
    /// slots, so renumbering would invalidate them.
    pub(crate) fn compact(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.instructions.len());
        let mut kept = Vec::with_capacity(keep.iter().filter(|k| **k).count());
        for (instruction, keep) in self.instructions.iter_mut().zip(keep.iter()) {
            if *keep {
                kept.push(std::mem::replace(
                    instruction,
                    Instruction::AssignFenceCompletion { lhs: 0 },
                ));
            }
        }
        self.instructions = kept;
    }
}

// PARALLEL REPLAY PREPARATION
// ================================================================================================

impl TemplateInner {
    /// Partitions the instruction stream into `parallelism` slices and
    /// triangulates cross-slice operand references through crossing events.
    pub(crate) fn prepare_parallel_replay(&mut self, parallelism: usize) {
        let instructions = std::mem::take(&mut self.instructions);
        self.slice_tasks = vec![Vec::new(); parallelism];
        if parallelism == 1 {
            for instruction in &instructions {
                if let Instruction::GetTermEvent { owner, .. } = instruction {
                    self.slice_tasks[0].push(*owner);
                }
            }
            self.slices = vec![instructions];
            return;
        }

        // tasks with pairwise-distinct target processors partition by
        // processor id; everything else round-robins
        let tasks: Vec<(TraceLocalId, Option<u64>)> = self
            .memo_entries
            .iter()
            .filter(|(_, (_, kind))| matches!(kind, crate::op::OperationKind::Task))
            .map(|(tlid, _)| {
                let proc = self
                    .cached_mappings
                    .get(tlid)
                    .and_then(|m| m.primary_target())
                    .map(|p| p.id());
                (*tlid, proc)
            })
            .collect();
        let distinct = {
            let procs: BTreeSet<u64> = tasks.iter().filter_map(|(_, p)| *p).collect();
            procs.len() == tasks.len()
        };
        let mut owner_slice: BTreeMap<TraceLocalId, usize> = BTreeMap::new();
        for (index, (tlid, proc)) in tasks.iter().enumerate() {
            let slice = match (distinct, proc) {
                (true, Some(proc)) => (*proc as usize) % parallelism,
                _ => index % parallelism,
            };
            owner_slice.insert(*tlid, slice);
            self.slice_tasks[slice].push(*tlid);
        }

        // assign every instruction to a slice
        let mut round_robin = 0usize;
        let mut assignment: Vec<usize> = Vec::with_capacity(instructions.len());
        let mut producer_slice: BTreeMap<Slot, usize> = BTreeMap::new();
        for instruction in &instructions {
            let slice = if matches!(instruction, Instruction::AssignFenceCompletion { .. }) {
                0
            } else {
                match instruction.owner().and_then(|owner| owner_slice.get(&owner)) {
                    Some(slice) => *slice,
                    None => {
                        let slice = round_robin % parallelism;
                        round_robin += 1;
                        // non-task owners keep their whole instruction group
                        // together
                        if let Some(owner) = instruction.owner() {
                            owner_slice.insert(owner, slice);
                        }
                        slice
                    },
                }
            };
            assignment.push(slice);
            if let Some(lhs) = instruction.lhs() {
                producer_slice.insert(lhs, slice);
            }
        }

        // slots filled by perform_replay before slices launch never need a
        // crossing
        let prefilled: BTreeSet<Slot> = {
            let mut set: BTreeSet<Slot> = self.frontiers.values().copied().collect();
            set.extend(self.external_frontier_slots.iter().copied());
            set.insert(0);
            set
        };

        let mut slices: Vec<Vec<Instruction>> = vec![Vec::new(); parallelism];
        let mut positions: BTreeMap<Slot, (usize, usize)> = BTreeMap::new();
        let mut crossing_of: BTreeMap<Slot, Slot> = BTreeMap::new();
        let mut pending_triggers: Vec<(usize, usize, Instruction)> = Vec::new();

        for (instruction, slice_idx) in instructions.into_iter().zip(assignment.iter()) {
            let mut instruction = instruction;
            let my_slice = *slice_idx;
            let inputs = instruction.inputs();
            for input in inputs {
                if prefilled.contains(&input) {
                    continue;
                }
                let Some(produced_in) = producer_slice.get(&input).copied() else {
                    continue;
                };
                if produced_in == my_slice {
                    continue;
                }
                let crossing = match crossing_of.get(&input) {
                    Some(crossing) => *crossing,
                    None => {
                        let crossing = self.alloc_slot(Event::NONE);
                        crossing_of.insert(input, crossing);
                        self.crossing_events
                            .insert(crossing, CrossingInfo { source: input, refs: 0 });
                        let (pslice, ppos) = positions
                            .get(&input)
                            .copied()
                            .expect("producer already placed");
                        let owner = TraceLocalId::default();
                        pending_triggers.push((
                            pslice,
                            ppos,
                            Instruction::TriggerEvent { lhs: crossing, rhs: input, owner },
                        ));
                        crossing
                    },
                };
                self.crossing_events
                    .get_mut(&crossing)
                    .expect("just inserted")
                    .refs += 1;
                instruction.remap_slots(|slot| if slot == input { crossing } else { slot });
            }
            if let Some(lhs) = instruction.lhs() {
                positions.insert(lhs, (my_slice, slices[my_slice].len()));
            }
            slices[my_slice].push(instruction);
        }

        // splice crossing triggers in right after their producers
        pending_triggers.sort_by_key(|(slice, pos, _)| (*slice, *pos));
        for (slice, pos, trigger) in pending_triggers.into_iter().rev() {
            slices[slice].insert(pos + 1, trigger);
        }
        self.slices = slices;
    }

    /// Moves every `CompleteReplay` to the end of its slice so it fires
    /// after the effectful instructions of the same task.
    pub(crate) fn push_complete_replays(&mut self) {
        for slice in self.slices.iter_mut() {
            let mut complete: Vec<Instruction> = Vec::new();
            slice.retain_mut(|instruction| {
                if matches!(instruction, Instruction::CompleteReplay { .. }) {
                    complete.push(std::mem::replace(
                        instruction,
                        Instruction::AssignFenceCompletion { lhs: 0 },
                    ));
                    false
                } else {
                    true
                }
            });
            slice.append(&mut complete);
        }
    }
}

// PIPELINE DRIVER
// ================================================================================================

impl PhysicalTemplate {
    /// Runs the optimization pipeline over a freshly captured recording.
    pub(crate) fn optimize(self: &Arc<Self>, router: &dyn UserRouter) {
        let mut inner = self.inner.lock();
        inner.user_events.clear();
        inner.elide_fences(router);
        inner.record_across_immutability(router);
        inner.reorder_topologically();
        inner.propagate_merges();
        let background = self.ctx.config.background_reduction();
        if !background {
            let reduction = compute_transitive_reduction(&inner.graph_snapshot());
            inner.apply_reduction(reduction);
        }
        inner.propagate_copies();
        inner.eliminate_dead_code();
        inner.prepare_parallel_replay(self.ctx.config.replay_parallelism());
        inner.push_complete_replays();
        debug!(
            template = self.template_id(),
            instructions = inner.instruction_count(),
            slices = inner.slices.len(),
            frontiers = inner.frontiers.len(),
            "template optimized"
        );
        // recording-side tables are consumed
        inner.op_views.clear();
        inner.copy_views.clear();
        inner.src_indirect_views.clear();
        inner.dst_indirect_views.clear();

        if background {
            let snapshot = inner.graph_snapshot();
            drop(inner);
            let result = Arc::clone(&self.pending_reduction);
            let worker = std::thread::spawn(move || {
                let reduction = compute_transitive_reduction(&snapshot);
                *result.lock() = Some(reduction);
            });
            *self.reduction_worker.lock() = Some(worker);
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn merge_node(lhs: Slot, rhs: &[Slot]) -> (Slot, SmallVec<[Slot; 4]>, bool) {
        (lhs, rhs.iter().copied().collect(), true)
    }

    fn chain_node(lhs: Slot, input: Slot) -> (Slot, SmallVec<[Slot; 4]>, bool) {
        (lhs, smallvec::smallvec![input], false)
    }

    /// Reachability of a slot set under the original edges.
    fn reachable(snapshot: &GraphSnapshot, from: Slot) -> BTreeSet<Slot> {
        let mut out = BTreeSet::new();
        let mut work = vec![from];
        while let Some(slot) = work.pop() {
            for (lhs, inputs, _) in &snapshot.nodes {
                if inputs.contains(&slot) && out.insert(*lhs) {
                    work.push(*lhs);
                }
            }
        }
        out
    }

    #[test]
    fn reduction_drops_redundant_diamond_edge() {
        // 0 -> 1 -> 2, and a merge at 3 waiting on {0, 2}: the edge from 0 is
        // implied by the path through 2
        let snapshot = GraphSnapshot {
            slot_count: 4,
            nodes: vec![chain_node(1, 0), chain_node(2, 1), merge_node(3, &[0, 2])],
        };
        let reduced = compute_transitive_reduction(&snapshot);
        let expected: Vec<(Slot, SmallVec<[Slot; 4]>)> = vec![(3, smallvec::smallvec![2])];
        assert_eq!(reduced.merges, expected);
    }

    #[test]
    fn reduction_keeps_independent_edges() {
        // two independent chains joined by a merge: nothing is redundant
        let snapshot = GraphSnapshot {
            slot_count: 5,
            nodes: vec![chain_node(2, 0), chain_node(3, 1), merge_node(4, &[2, 3])],
        };
        let reduced = compute_transitive_reduction(&snapshot);
        assert_eq!(reduced.merges.len(), 1);
        let (lhs, rhs) = &reduced.merges[0];
        assert_eq!(*lhs, 4);
        assert_eq!(rhs.as_slice(), &[2, 3]);
    }

    #[test]
    fn reduction_preserves_reachability() {
        // a denser graph: every slot reachable before must stay reachable
        let snapshot = GraphSnapshot {
            slot_count: 7,
            nodes: vec![
                chain_node(1, 0),
                chain_node(2, 1),
                merge_node(3, &[0, 1, 2]),
                merge_node(4, &[1, 3]),
                merge_node(5, &[0, 2, 4]),
                chain_node(6, 5),
            ],
        };
        let reduced = compute_transitive_reduction(&snapshot);

        // rebuild the graph with reduced merge operands
        let mut nodes = snapshot.nodes.clone();
        for (lhs, new_rhs) in &reduced.merges {
            for (node_lhs, inputs, is_merge) in nodes.iter_mut() {
                if *is_merge && node_lhs == lhs {
                    *inputs = new_rhs.clone();
                }
            }
        }
        let after = GraphSnapshot { slot_count: snapshot.slot_count, nodes };

        for slot in 0..snapshot.slot_count {
            assert_eq!(
                reachable(&snapshot, slot),
                reachable(&after, slot),
                "reachability from slot {slot} changed"
            );
        }
    }
}
