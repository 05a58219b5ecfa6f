use std::sync::Arc;

use phalanx_core::{Event, FieldMask};
use pretty_assertions::assert_eq;

use super::*;
use crate::{
    config::TraceConfig,
    issue::CopyField,
    op::{MapperOutput, Operation, OperationKind, RegionUsage},
    testing::{TestAcrossExecutor, TestHarness, TestOperation},
};

fn harness() -> TestHarness {
    TestHarness::new(TraceConfig::new())
}

/// Records `count` memoizing tasks, each writing its own view on its own
/// region, and returns the operations.
fn record_tasks(
    h: &TestHarness,
    template: &Arc<PhysicalTemplate>,
    count: usize,
) -> Vec<Arc<TestOperation>> {
    let mask = FieldMask::single(0);
    let mut ops = Vec::new();
    for i in 0..count {
        let op = TestOperation::new(
            h.fabric.clone(),
            OperationKind::Task,
            100 + i as u64,
            format!("task{i}"),
            1,
        );
        op.set_trace_local_id((i as u64).into());
        let memo = op.as_memoizable().expect("test op is memoizable");
        op.begin_execution();
        template.record_get_term_event(&memo, OperationKind::Task);
        template.record_mapper_output(&memo, MapperOutput {
            chosen_variant: 1,
            target_procs: vec![phalanx_core::ProcessorId::new(i as u64)],
            physical_instances: Vec::new(),
            virtual_mapping: false,
        });
        let region = h.region(i as u32, 100);
        let view = h.view(i as u32, 0);
        let tlid = memo.trace_local_id();
        template.record_op_view(tlid, view, region, region.expr, RegionUsage::read_write(), mask);
        h.engine.update_valid_views(region, view, region.expr, RegionUsage::read_write(), mask);
        let mut sync = Event::NONE;
        template.record_set_op_sync_event(&mut sync, tlid);
        template.record_complete_replay(tlid, sync);
        op.finish_execution();
        ops.push(op);
    }
    ops
}

#[test]
fn straight_line_capture_is_replayable() {
    let h = harness();
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();
    let _ops = record_tasks(&h, &template, 3);
    h.engine.end_recording();

    let verdict = template.finalize(false);
    assert!(verdict.is_replayable(), "verdict: {verdict:?}");

    // fence + 3 x (term, sync, complete) plus the elision merges
    assert!(template.instruction_count() >= 7, "{}", template.instruction_count());
    assert_eq!(template.condition_count(), 3);
    // conditions hold immediately after capture
    assert!(template.check_preconditions().is_ok());
}

#[test]
fn blocking_call_rejects_the_capture() {
    let h = harness();
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();
    let _ops = record_tasks(&h, &template, 1);
    h.engine.end_recording();

    let verdict = template.finalize(true);
    assert_eq!(
        verdict,
        crate::errors::Replayable::NotReplayable(crate::errors::RejectionReason::BlockingCall)
    );
}

#[test]
fn virtual_mapping_rejects_the_capture() {
    let h = harness();
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();
    let op = TestOperation::new(h.fabric.clone(), OperationKind::Task, 7, "virtual", 1);
    op.set_trace_local_id(0u64.into());
    let memo = op.as_memoizable().expect("memoizable");
    op.begin_execution();
    template.record_get_term_event(&memo, OperationKind::Task);
    template.record_mapper_output(&memo, MapperOutput {
        virtual_mapping: true,
        ..Default::default()
    });
    let region = h.region(0, 10);
    let view = h.view(0, 0);
    template.record_op_view(
        memo.trace_local_id(),
        view,
        region,
        region.expr,
        RegionUsage::read_write(),
        FieldMask::single(0),
    );
    op.finish_execution();
    h.engine.end_recording();

    let verdict = template.finalize(false);
    assert!(matches!(
        verdict,
        crate::errors::Replayable::NotReplayable(
            crate::errors::RejectionReason::VirtualMapping { .. }
        )
    ));
}

#[test]
fn fence_elision_collapses_a_fence_only_chain() {
    let h = harness();
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());

    let region = h.region(0, 100);
    let staging = h.view(0, 0);
    let result = h.view(0, 0);
    let source = h.view(0, 0);
    let mask = FieldMask::single(0);

    // C1 writes `staging`; C2 reads it. Both record the trace fence as their
    // only precondition.
    let mut c1 = Event::NONE;
    template.record_issue_copy(
        0u64.into(),
        &mut c1,
        region.expr,
        vec![CopyField::new(source, mask)],
        vec![CopyField::new(staging, mask)],
        Vec::new(),
        fence.event(),
    );
    template.record_copy_views(
        0u64.into(),
        c1,
        region,
        region.expr,
        vec![(source, mask)],
        vec![(staging, mask)],
    );
    let mut c2 = Event::NONE;
    template.record_issue_copy(
        1u64.into(),
        &mut c2,
        region.expr,
        vec![CopyField::new(staging, mask)],
        vec![CopyField::new(result, mask)],
        Vec::new(),
        fence.event(),
    );
    template.record_copy_views(
        1u64.into(),
        c2,
        region,
        region.expr,
        vec![(staging, mask)],
        vec![(result, mask)],
    );

    let c1_slot = {
        let inner = template.inner.lock();
        inner.find_event_slot(c1).expect("c1 has a slot")
    };
    {
        let mut inner = template.inner.lock();
        let router = LocalRouter { forest: h.forest.clone() };
        inner.elide_fences(&router);

        // C2's precondition now references a merge over {C1}, not the fence
        let gen_map = inner.generator_map();
        let c2_slot = inner.find_event_slot(c2).expect("c2 has a slot");
        let c2_instr = gen_map[&c2_slot];
        let Instruction::IssueCopy { precondition, .. } = &inner.instructions[c2_instr] else {
            panic!("expected c2 to be a copy");
        };
        let Instruction::MergeEvent { rhs, .. } = &inner.instructions[gen_map[precondition]] else {
            panic!("expected an elided merge precondition");
        };
        assert_eq!(rhs.as_slice(), &[c1_slot]);
    }
}

#[test]
fn optimization_reaches_a_minimal_stream() {
    let h = harness();
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();
    let _ops = record_tasks(&h, &template, 2);
    h.engine.end_recording();
    assert!(template.finalize(false).is_replayable());

    let inner = template.inner.lock();
    let mut stream: Vec<Instruction> = Vec::new();
    inner.for_each_instruction(|instruction| stream.push(instruction.clone()));

    // every merge has operands and none nests another merge
    let merge_slots: std::collections::BTreeSet<Slot> = stream
        .iter()
        .filter_map(|i| match i {
            Instruction::MergeEvent { lhs, .. } => Some(*lhs),
            _ => None,
        })
        .collect();
    for instruction in &stream {
        if let Instruction::MergeEvent { lhs, rhs, .. } = instruction {
            assert!(!rhs.is_empty());
            assert!(!rhs.contains(lhs), "self-referential merge");
            for slot in rhs {
                assert!(!merge_slots.contains(slot), "nested merge survived propagation");
            }
        }
    }
    // every referenced slot has a producer or is pre-filled
    let produced: std::collections::BTreeSet<Slot> =
        stream.iter().filter_map(Instruction::lhs).collect();
    let prefilled: std::collections::BTreeSet<Slot> = inner
        .frontiers
        .values()
        .copied()
        .chain(std::iter::once(0))
        .collect();
    for instruction in &stream {
        for input in instruction.inputs() {
            assert!(
                prefilled.contains(&input) || produced.contains(&input),
                "slot {input} has no producer"
            );
        }
    }
}

#[test]
fn parallel_preparation_inserts_crossings() {
    let h = TestHarness::new(
        TraceConfig::new().with_replay_parallelism(2).expect("valid parallelism"),
    );
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();

    // two tasks on distinct processors touching the same view: task 1
    // depends on task 0 across the slice boundary
    let mask = FieldMask::single(0);
    let region = h.region(0, 64);
    let view = h.view(0, 0);
    for i in 0..2u64 {
        let op = TestOperation::new(
            h.fabric.clone(),
            OperationKind::Task,
            200 + i,
            format!("worker{i}"),
            1,
        );
        op.set_trace_local_id(i.into());
        let memo = op.as_memoizable().expect("memoizable");
        op.begin_execution();
        template.record_get_term_event(&memo, OperationKind::Task);
        template.record_mapper_output(&memo, MapperOutput {
            chosen_variant: 0,
            target_procs: vec![phalanx_core::ProcessorId::new(i)],
            physical_instances: Vec::new(),
            virtual_mapping: false,
        });
        template.record_op_view(
            memo.trace_local_id(),
            view,
            region,
            region.expr,
            RegionUsage::read_write(),
            mask,
        );
        h.engine.update_valid_views(region, view, region.expr, RegionUsage::read_write(), mask);
        let mut sync = Event::NONE;
        template.record_set_op_sync_event(&mut sync, memo.trace_local_id());
        template.record_complete_replay(memo.trace_local_id(), sync);
        op.finish_execution();
    }
    h.engine.end_recording();
    assert!(template.finalize(false).is_replayable());

    let inner = template.inner.lock();
    assert_eq!(inner.slices.len(), 2);
    // task 1 waits on task 0's term event from the other slice, so at least
    // one crossing was triangulated in
    assert!(!inner.crossing_events.is_empty());
    for (slot, info) in &inner.crossing_events {
        assert!(info.refs > 0, "crossing {slot} has no references");
        let mut found = false;
        for slice in &inner.slices {
            if slice.iter().any(
                |i| matches!(i, Instruction::TriggerEvent { lhs, .. } if lhs == slot),
            ) {
                found = true;
            }
        }
        assert!(found, "crossing {slot} has no trigger");
    }
}

#[test]
fn read_only_indirections_are_trace_immutable() {
    let h = harness();
    let mask = FieldMask::single(0);

    // all indirection users are reads: the preimages are immutable
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    let region = h.region(0, 80);
    let (src, dst, index) = (h.view(0, 0), h.view(0, 0), h.view(0, 0));
    let executor = TestAcrossExecutor::new();
    let mut lhs = Event::NONE;
    template.record_issue_across(
        0u64.into(),
        &mut lhs,
        executor.clone(),
        fence.event(),
        None,
        None,
        None,
    );
    template.record_copy_views(
        0u64.into(),
        lhs,
        region,
        region.expr,
        vec![(src, mask)],
        vec![(dst, mask)],
    );
    template.record_indirect_views(0u64.into(), lhs, vec![(index, region.expr, mask)], Vec::new());
    assert!(template.finalize(false).is_replayable());
    assert_eq!(executor.trace_immutable(), Some(true));

    // a traced write to the indirection view flips the verdict
    let fence2 = h.fabric.create_user_event();
    let template2 = PhysicalTemplate::new(h.ctx.clone(), fence2.event());
    let region2 = h.region(1, 80);
    let (src2, dst2, index2) = (h.view(1, 0), h.view(1, 0), h.view(1, 0));
    let executor2 = TestAcrossExecutor::new();
    let mut lhs2 = Event::NONE;
    template2.record_issue_across(
        0u64.into(),
        &mut lhs2,
        executor2.clone(),
        fence2.event(),
        None,
        None,
        None,
    );
    template2.record_copy_views(
        0u64.into(),
        lhs2,
        region2,
        region2.expr,
        vec![(src2, mask)],
        vec![(dst2, mask)],
    );
    template2.record_indirect_views(
        0u64.into(),
        lhs2,
        vec![(index2, region2.expr, mask)],
        Vec::new(),
    );
    let writer = TestOperation::new(h.fabric.clone(), OperationKind::Task, 41, "remapper", 1);
    writer.set_trace_local_id(1u64.into());
    let memo = writer.as_memoizable().expect("memoizable");
    writer.begin_execution();
    template2.record_get_term_event(&memo, OperationKind::Task);
    template2.record_mapper_output(&memo, MapperOutput::default());
    template2.record_op_view(
        memo.trace_local_id(),
        index2,
        region2,
        region2.expr,
        RegionUsage::read_write(),
        mask,
    );
    let mut sync = Event::NONE;
    template2.record_set_op_sync_event(&mut sync, memo.trace_local_id());
    template2.record_complete_replay(memo.trace_local_id(), sync);
    writer.finish_execution();
    assert!(template2.finalize(false).is_replayable());
    assert_eq!(executor2.trace_immutable(), Some(false));
}

#[test]
fn background_reduction_lands_before_the_next_replay() {
    let h = TestHarness::new(TraceConfig::new().with_background_reduction(true));
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();
    let ops = record_tasks(&h, &template, 3);
    h.engine.end_recording();
    assert!(template.finalize(false).is_replayable());

    // wait for the worker's single-writer handoff to land
    let mut spins = 0u32;
    while template.pending_reduction.lock().is_none() {
        std::thread::yield_now();
        spins += 1;
        assert!(spins < 1_000_000, "reduction worker never published a result");
    }

    // the next replay finalizes the deferred reduction and still resolves
    let replay_fence = h.fabric.create_user_event();
    template.initialize_replay(replay_fence.event(), false);
    assert!(template.pending_reduction.lock().is_none(), "reduction was consumed");
    assert!(template.reduction_worker.lock().is_none(), "worker was joined");
    for op in &ops {
        let memo = op.as_memoizable().expect("memoizable");
        template
            .register_replay_operation(memo, OperationKind::Task, op.unique_id())
            .expect("fingerprints match");
    }
    template.perform_replay().expect("replay executes");
    let completion = template.finish_replay();
    h.fabric.trigger(replay_fence, Event::NONE);
    assert!(h.fabric.has_triggered(completion));
}

#[test]
fn replay_reproduces_the_recorded_graph() {
    let h = harness();
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();
    let ops = record_tasks(&h, &template, 3);
    h.engine.end_recording();
    assert!(template.finalize(false).is_replayable());

    // replay with the same operations standing in for themselves
    let replay_fence = h.fabric.create_user_event();
    template.initialize_replay(replay_fence.event(), false);
    for op in &ops {
        let memo = op.as_memoizable().expect("memoizable");
        template
            .register_replay_operation(memo, OperationKind::Task, op.unique_id())
            .expect("fingerprints match");
    }
    template.perform_replay().expect("replay executes");
    let completion = template.finish_replay();

    // completions hang off the replay fence
    assert!(!h.fabric.has_triggered(completion));
    h.fabric.trigger(replay_fence, Event::NONE);
    assert!(h.fabric.has_triggered(completion));
    for op in &ops {
        assert!(h.fabric.has_triggered(op.completion_event()));
        assert_eq!(op.replayed_mapping().expect("mapping replayed").chosen_variant, 1);
    }
}

#[test]
fn recurrent_replay_carries_frontiers() {
    let h = harness();
    let fence = h.fabric.create_user_event();
    let template = PhysicalTemplate::new(h.ctx.clone(), fence.event());
    h.engine.begin_recording();
    let ops = record_tasks(&h, &template, 2);
    h.engine.end_recording();
    assert!(template.finalize(false).is_replayable());
    assert!(
        !template.inner.lock().frontiers.is_empty(),
        "a write-after-write trace carries frontiers"
    );

    let register = |template: &Arc<PhysicalTemplate>| {
        for op in &ops {
            let memo = op.as_memoizable().expect("memoizable");
            template
                .register_replay_operation(memo, OperationKind::Task, op.unique_id())
                .expect("fingerprints match");
        }
    };

    let replay_fence = h.fabric.create_user_event();
    template.initialize_replay(replay_fence.event(), false);
    register(&template);
    template.perform_replay().expect("first replay");
    let first = template.finish_replay();
    h.fabric.trigger(replay_fence, Event::NONE);
    assert!(h.fabric.has_triggered(first));

    // second, recurrent replay: slot 0 is untouched and the frontier values
    // of the first iteration gate the second
    template.initialize_replay(Event::NONE, true);
    register(&template);
    template.perform_replay().expect("second replay");
    let second = template.finish_replay();
    // the first iteration fully completed, so the second resolves without a
    // new fence trigger
    assert!(h.fabric.has_triggered(second));
    assert_eq!(template.replay_count(), 2);
}
