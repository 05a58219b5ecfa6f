//! End-to-end capture and replay scenarios over the public trace API.

use std::sync::Arc;

use phalanx_core::{Event, FieldMask, Region, ViewId};
use phalanx_trace::{
    DependenceType, DynamicTrace, MapperOutput, Memoizable, Operation, OperationKind,
    PhysicalTrace, RegionUsage, StaticDependence, StaticTrace, TraceConfig, TraceError,
    testing::{TestHarness, TestOperation},
};
use pretty_assertions::assert_eq;

fn mask() -> FieldMask {
    FieldMask::single(0)
}

struct World {
    h: TestHarness,
    trace: DynamicTrace,
    ops: Vec<Arc<TestOperation>>,
    regions: Vec<Region>,
    views: Vec<ViewId>,
    fence_uid: u64,
}

impl World {
    fn new(task_count: usize) -> Self {
        let h = TestHarness::new(TraceConfig::new());
        let mut trace = DynamicTrace::new(7);
        trace.set_physical_trace(PhysicalTrace::new(h.ctx.clone()));
        let mut ops = Vec::new();
        let mut regions = Vec::new();
        let mut views = Vec::new();
        for i in 0..task_count {
            ops.push(TestOperation::new(
                h.fabric.clone(),
                OperationKind::Task,
                10 + i as u64,
                format!("worker{i}"),
                1,
            ));
            regions.push(h.region(i as u32, 128));
            views.push(h.view(i as u32, 0));
        }
        Self { h, trace, ops, regions, views, fence_uid: 1000 }
    }

    fn fence_op(&mut self) -> Arc<TestOperation> {
        self.fence_uid += 1;
        TestOperation::new(
            self.h.fabric.clone(),
            OperationKind::Fence,
            self.fence_uid,
            "trace-fence",
            0,
        )
    }

    /// Runs the recording pass and completes the capture.
    fn record_pass(&mut self) -> phalanx_trace::Replayable {
        self.trace.begin_pass(false);
        self.h.engine.begin_recording();
        let fence = self.h.fabric.create_user_event();
        let template = {
            let physical = self.trace.physical_trace().expect("physical tracing enabled");
            assert!(!physical.check_template_preconditions());
            physical.begin_recording(fence.event())
        };
        for i in 0..self.ops.len() {
            let op = self.ops[i].clone();
            self.trace.register_operation(op.op_ref()).expect("recording accepts operations");
            let memo = op.as_memoizable().expect("memoizable");
            op.begin_execution();
            template.record_get_term_event(&memo, OperationKind::Task);
            template.record_mapper_output(&memo, MapperOutput {
                chosen_variant: 1,
                target_procs: vec![phalanx_core::ProcessorId::new(i as u64)],
                physical_instances: vec![(0, self.views[i])],
                virtual_mapping: false,
            });
            let tlid = memo.trace_local_id();
            template.record_op_view(
                tlid,
                self.views[i],
                self.regions[i],
                self.regions[i].expr,
                RegionUsage::read_write(),
                mask(),
            );
            self.h.engine.update_valid_views(
                self.regions[i],
                self.views[i],
                self.regions[i].expr,
                RegionUsage::read_write(),
                mask(),
            );
            let mut sync = Event::NONE;
            template.record_set_op_sync_event(&mut sync, tlid);
            template.record_complete_replay(tlid, sync);
            op.finish_execution();
        }
        let fence_op = self.fence_op();
        self.trace.end_trace(&fence_op.op_ref()).expect("recording pass completes");
        self.trace.fix_trace();
        self.h.engine.end_recording();
        self.trace
            .physical_trace()
            .expect("physical tracing enabled")
            .record_completed(false)
    }

    /// Runs one replay pass; returns the events to observe.
    fn replay_pass(&mut self) -> Event {
        self.trace.begin_pass(true);
        let fence = self.h.fabric.create_user_event();
        let template = {
            let physical = self.trace.physical_trace().expect("physical tracing enabled");
            assert!(physical.check_template_preconditions(), "a template must match");
            physical.start_replay(fence.event());
            physical.current_template().expect("selected")
        };
        for op in &self.ops {
            self.trace.register_operation(op.op_ref()).expect("fingerprints match");
            template
                .register_replay_operation(
                    op.as_memoizable().expect("memoizable"),
                    OperationKind::Task,
                    op.unique_id(),
                )
                .expect("replay registration");
        }
        self.trace
            .physical_trace()
            .expect("physical tracing enabled")
            .execute_replay()
            .expect("replay executes");
        let fence_op = self.fence_op();
        self.trace.end_trace(&fence_op.op_ref()).expect("replay pass completes");
        fence.event()
    }
}

#[test]
fn capture_then_replay_round_trip() {
    let mut world = World::new(3);
    let verdict = world.record_pass();
    assert!(verdict.is_replayable(), "{verdict:?}");
    assert_eq!(
        world.trace.physical_trace().expect("physical tracing enabled").template_count(),
        1
    );

    let fence = world.replay_pass();
    let completion =
        world.trace.physical_trace().expect("physical tracing enabled").previous_completion();
    assert!(!world.h.fabric.has_triggered(completion));

    // releasing the entry fence releases the whole replayed graph
    world.h.fabric.trigger(
        phalanx_core::UserEvent::from_event(fence),
        Event::NONE,
    );
    assert!(world.h.fabric.has_triggered(completion));
    for op in &world.ops {
        assert!(world.h.fabric.has_triggered(op.completion_event()));
        let mapping = op.replayed_mapping().expect("mapping replayed from the cache");
        assert_eq!(mapping.chosen_variant, 1);
    }
}

#[test]
fn recurrent_replay_skips_the_fence() {
    let mut world = World::new(2);
    assert!(world.record_pass().is_replayable());

    let fence = world.replay_pass();
    world.h.fabric.trigger(phalanx_core::UserEvent::from_event(fence), Event::NONE);
    let first =
        world.trace.physical_trace().expect("physical tracing enabled").previous_completion();
    assert!(world.h.fabric.has_triggered(first));

    // the same template matches again: the replay is recurrent and resolves
    // off the previous completion without waiting for the new fence
    let _fence2 = world.replay_pass();
    let second =
        world.trace.physical_trace().expect("physical tracing enabled").previous_completion();
    assert!(world.h.fabric.has_triggered(second), "recurrent replay chained off iteration 1");
}

#[test]
fn intermediate_fence_suppresses_recurrence() {
    let mut world = World::new(1);
    assert!(world.record_pass().is_replayable());

    let fence = world.replay_pass();
    world.h.fabric.trigger(phalanx_core::UserEvent::from_event(fence), Event::NONE);

    world
        .trace
        .physical_trace()
        .expect("physical tracing enabled")
        .invalidate_current_template(false);

    let fence2 = world.replay_pass();
    let second =
        world.trace.physical_trace().expect("physical tracing enabled").previous_completion();
    // non-recurrent: the new fence gates the replay
    assert!(!world.h.fabric.has_triggered(second));
    world.h.fabric.trigger(phalanx_core::UserEvent::from_event(fence2), Event::NONE);
    assert!(world.h.fabric.has_triggered(second));
}

#[test]
fn virtual_mapping_discards_the_template() {
    let h = TestHarness::new(TraceConfig::new());
    let mut physical = PhysicalTrace::new(h.ctx.clone());
    let fence = h.fabric.create_user_event();
    let template = physical.begin_recording(fence.event());
    h.engine.begin_recording();

    let op = TestOperation::new(h.fabric.clone(), OperationKind::Task, 99, "virtualized", 1);
    op.set_trace_local_id(0u64.into());
    let memo = op.as_memoizable().expect("memoizable");
    op.begin_execution();
    template.record_get_term_event(&memo, OperationKind::Task);
    template.record_mapper_output(&memo, MapperOutput {
        virtual_mapping: true,
        ..Default::default()
    });
    op.finish_execution();
    h.engine.end_recording();

    let verdict = physical.record_completed(false);
    assert!(matches!(
        verdict,
        phalanx_trace::Replayable::NotReplayable(
            phalanx_trace::RejectionReason::VirtualMapping { .. }
        )
    ));
    // the rejected capture never enters the cache
    assert_eq!(physical.template_count(), 0);
    assert!(!physical.check_template_preconditions());
}

#[test]
fn stale_equivalence_sets_reject_the_template() {
    let h = TestHarness::new(TraceConfig::new());
    let mut physical = PhysicalTrace::new(h.ctx.clone());
    let region_in = h.region(0, 64);
    let region_out = h.region(1, 64);
    let source = h.view(0, 0);
    let dest = h.view(1, 0);

    // `source` is valid before the trace; the trace reads it and writes
    // `dest`, so validity of `source` is a precondition
    h.engine.seed_valid_view(region_in, source, region_in.expr, mask());

    let fence = h.fabric.create_user_event();
    let template = physical.begin_recording(fence.event());
    h.engine.begin_recording();
    let op = TestOperation::new(h.fabric.clone(), OperationKind::Task, 55, "reader", 2);
    op.set_trace_local_id(0u64.into());
    let memo = op.as_memoizable().expect("memoizable");
    op.begin_execution();
    template.record_get_term_event(&memo, OperationKind::Task);
    template.record_mapper_output(&memo, MapperOutput::default());
    let tlid = memo.trace_local_id();
    template.record_op_view(
        tlid,
        source,
        region_in,
        region_in.expr,
        RegionUsage::read_only(),
        mask(),
    );
    h.engine.update_valid_views(region_in, source, region_in.expr, RegionUsage::read_only(), mask());
    template.record_op_view(
        tlid,
        dest,
        region_out,
        region_out.expr,
        RegionUsage::read_write(),
        mask(),
    );
    h.engine.update_valid_views(
        region_out,
        dest,
        region_out.expr,
        RegionUsage::read_write(),
        mask(),
    );
    let mut sync = Event::NONE;
    template.record_set_op_sync_event(&mut sync, tlid);
    template.record_complete_replay(tlid, sync);
    op.finish_execution();
    h.engine.end_recording();

    assert!(physical.record_completed(false).is_replayable());
    assert!(physical.check_template_preconditions(), "conditions hold right after capture");

    // an upstream write invalidates the source view; the template no longer
    // matches
    h.engine.invalidate_region(region_in, source, region_in.expr, mask());
    assert!(!physical.check_template_preconditions());
}

#[test]
fn lru_cache_is_bounded() {
    let h = TestHarness::new(
        TraceConfig::new().with_max_templates(1).expect("valid capacity"),
    );
    let mut physical = PhysicalTrace::new(h.ctx.clone());
    for round in 0..2u64 {
        let fence = h.fabric.create_user_event();
        let template = physical.begin_recording(fence.event());
        h.engine.begin_recording();
        let op = TestOperation::new(
            h.fabric.clone(),
            OperationKind::Task,
            300 + round,
            "round",
            1,
        );
        op.set_trace_local_id(0u64.into());
        let memo = op.as_memoizable().expect("memoizable");
        op.begin_execution();
        template.record_get_term_event(&memo, OperationKind::Task);
        template.record_mapper_output(&memo, MapperOutput::default());
        let region = h.region(round as u32, 32);
        let view = h.view(round as u32, 0);
        template.record_op_view(
            memo.trace_local_id(),
            view,
            region,
            region.expr,
            RegionUsage::read_write(),
            mask(),
        );
        h.engine.update_valid_views(region, view, region.expr, RegionUsage::read_write(), mask());
        let mut sync = Event::NONE;
        template.record_set_op_sync_event(&mut sync, memo.trace_local_id());
        template.record_complete_replay(memo.trace_local_id(), sync);
        op.finish_execution();
        h.engine.end_recording();
        assert!(physical.record_completed(false).is_replayable());
    }
    assert_eq!(physical.template_count(), 1, "the coldest template was evicted");
}

#[test]
fn underissued_replay_is_a_trace_violation() {
    let h = TestHarness::new(TraceConfig::new());
    let mut trace = DynamicTrace::new(3);
    let ops: Vec<Arc<TestOperation>> = (0..5)
        .map(|i| {
            TestOperation::new(h.fabric.clone(), OperationKind::Task, 40 + i, format!("t{i}"), 1)
        })
        .collect();

    trace.begin_pass(false);
    for op in &ops {
        trace.register_operation(op.op_ref()).expect("recording accepts operations");
    }
    let fence = TestOperation::new(h.fabric.clone(), OperationKind::Fence, 90, "fence", 0);
    trace.end_trace(&fence.op_ref()).expect("recording pass completes");
    trace.fix_trace();

    trace.begin_pass(false);
    for op in ops.iter().take(4) {
        trace.register_operation(op.op_ref()).expect("fingerprints match");
    }
    let fence2 = TestOperation::new(h.fabric.clone(), OperationKind::Fence, 91, "fence", 0);
    let err = trace.end_trace(&fence2.op_ref()).expect_err("the fifth task never arrived");
    match err {
        TraceError::IncompleteReplay { trace_id, recorded, issued } => {
            assert_eq!(trace_id, 3);
            assert_eq!(recorded, 5);
            assert_eq!(issued, 4);
        },
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn mismatched_operation_kind_is_a_trace_violation() {
    let h = TestHarness::new(TraceConfig::new());
    let mut trace = DynamicTrace::new(4);
    let task = TestOperation::new(h.fabric.clone(), OperationKind::Task, 61, "task", 1);

    trace.begin_pass(false);
    trace.register_operation(task.op_ref()).expect("recording accepts operations");
    let fence = TestOperation::new(h.fabric.clone(), OperationKind::Fence, 95, "fence", 0);
    trace.end_trace(&fence.op_ref()).expect("recording pass completes");
    trace.fix_trace();

    trace.begin_pass(false);
    let copy = TestOperation::new(h.fabric.clone(), OperationKind::Copy, 62, "copy", 1);
    let err = trace.register_operation(copy.op_ref()).expect_err("wrong kind at index 0");
    assert!(matches!(err, TraceError::OperationKindMismatch { index: 0, .. }));
}

#[test]
fn logical_replay_reregisters_recorded_dependences() {
    let h = TestHarness::new(TraceConfig::new());
    let mut trace = DynamicTrace::new(5);
    let a = TestOperation::new(h.fabric.clone(), OperationKind::Task, 71, "a", 1);
    let b = TestOperation::new(h.fabric.clone(), OperationKind::Task, 72, "b", 1);

    trace.begin_pass(false);
    trace.register_operation(a.op_ref()).expect("recording accepts operations");
    trace.register_operation(b.op_ref()).expect("recording accepts operations");
    trace.record_region_dependence(
        &a.op_ref(),
        0,
        &b.op_ref(),
        0,
        DependenceType::TrueDependence,
        false,
        mask(),
    );
    let fence = TestOperation::new(h.fabric.clone(), OperationKind::Fence, 96, "fence", 0);
    trace.end_trace(&fence.op_ref()).expect("recording pass completes");
    trace.fix_trace();
    assert_eq!(trace.recorded_operations(), 2);
    // the fence only depends on the frontier operation
    assert_eq!(fence.registered_dependences(), vec![b.op_ref().key()]);

    // logical-only pass: the recorded dependence is re-registered on b
    trace.begin_pass(false);
    trace.register_operation(a.op_ref()).expect("fingerprints match");
    trace.register_operation(b.op_ref()).expect("fingerprints match");
    assert_eq!(b.registered_dependences(), vec![a.op_ref().key()]);
    let fence2 = TestOperation::new(h.fabric.clone(), OperationKind::Fence, 97, "fence", 0);
    trace.end_trace(&fence2.op_ref()).expect("replay pass completes");
    assert_eq!(fence2.registered_dependences(), vec![b.op_ref().key()]);
}

#[test]
fn static_traces_apply_supplied_dependences_every_pass() {
    let h = TestHarness::new(TraceConfig::new());
    let mut trace = StaticTrace::new(
        6,
        vec![(1, StaticDependence {
            previous_offset: 1,
            previous_req_index: 0,
            next_req_index: 0,
            validates: false,
            dtype: DependenceType::TrueDependence,
            dependent_mask: mask(),
        })],
    );
    let a = TestOperation::new(h.fabric.clone(), OperationKind::Task, 81, "a", 1);
    let b = TestOperation::new(h.fabric.clone(), OperationKind::Task, 82, "b", 1);

    for _pass in 0..2 {
        trace.begin_pass();
        trace.register_operation(a.op_ref()).expect("static traces accept any structure");
        trace.register_operation(b.op_ref()).expect("static traces accept any structure");
        let fence = TestOperation::new(h.fabric.clone(), OperationKind::Fence, 98, "fence", 0);
        trace.end_trace(&fence.op_ref()).expect("pass completes");
        trace.perform_logging();
        // only b is at the frontier; a gained a successor
        assert_eq!(fence.registered_dependences(), vec![b.op_ref().key()]);
    }
    // the same edge was applied on both passes
    assert_eq!(
        b.registered_dependences(),
        vec![a.op_ref().key(), a.op_ref().key()]
    );
}
