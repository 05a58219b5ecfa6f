//! Control-replicated capture and replay across two in-process shards.

use std::{collections::BTreeMap, sync::Arc};

use phalanx_core::{AddressSpace, Event, FieldMask, ShardId};
use phalanx_trace::{
    LocalShardGroup, MapperOutput, Operation, OperationKind, RegionUsage, ShardMapping,
    ShardedPhysicalTemplate, TraceConfig,
    testing::{TestHarness, TestOperation},
};
use pretty_assertions::assert_eq;

fn mask() -> FieldMask {
    FieldMask::single(0)
}

fn two_shard_mapping() -> Arc<ShardMapping> {
    Arc::new(ShardMapping::new(BTreeMap::from([
        (AddressSpace::new(0), vec![ShardId::new(0)]),
        (AddressSpace::new(1), vec![ShardId::new(1)]),
    ])))
}

struct ShardedWorld {
    h: TestHarness,
    templates: Vec<Arc<ShardedPhysicalTemplate>>,
    ops: Vec<Arc<TestOperation>>,
}

impl ShardedWorld {
    /// Two shards, each running one point task of the same index launch:
    /// shard s writes view[s] (which it owns) and reads the peer's view, the
    /// classic halo exchange.
    fn record(config: TraceConfig) -> Self {
        let h = TestHarness::new(config);
        let mapping = two_shard_mapping();
        let group = LocalShardGroup::new();
        let fences = [h.fabric.create_user_event(), h.fabric.create_user_event()];
        let templates: Vec<Arc<ShardedPhysicalTemplate>> = (0..2)
            .map(|s| {
                let template = ShardedPhysicalTemplate::new(
                    h.ctx.clone(),
                    fences[s].event(),
                    ShardId::new(s as u32),
                    mapping.clone(),
                    group.clone(),
                );
                group.register(&template);
                template
            })
            .collect();

        // view[s] lives on space s, so shard s owns it
        let views = vec![h.view(0, 0), h.view(1, 1)];
        let regions = vec![h.region(0, 64), h.region(1, 64)];

        h.engine.begin_recording();
        let mut ops = Vec::new();
        for s in 0..2usize {
            let peer = 1 - s;
            let op = TestOperation::new(
                h.fabric.clone(),
                OperationKind::Task,
                500 + s as u64,
                format!("point{s}"),
                2,
            );
            op.set_trace_local_id(0u64.into());
            let memo = op.as_memoizable().expect("memoizable");
            op.begin_execution();
            let template = &templates[s];
            template.template().record_get_term_event(&memo, OperationKind::Task);
            template.template().record_mapper_output(&memo, MapperOutput {
                chosen_variant: 1,
                target_procs: vec![phalanx_core::ProcessorId::new(s as u64)],
                physical_instances: Vec::new(),
                virtual_mapping: false,
            });
            template.template().record_owner_shard(memo.trace_local_id(), ShardId::new(s as u32));
            let tlid = memo.trace_local_id();
            // own halo: written locally
            template.record_op_view(
                tlid,
                views[s],
                regions[s],
                regions[s].expr,
                RegionUsage::read_write(),
                mask(),
            );
            h.engine.update_valid_views(
                regions[s],
                views[s],
                regions[s].expr,
                RegionUsage::read_write(),
                mask(),
            );
            // peer halo: read, user routed to the owning shard
            template.record_op_view(
                tlid,
                views[peer],
                regions[peer],
                regions[peer].expr,
                RegionUsage::read_only(),
                mask(),
            );
            let mut sync = Event::NONE;
            template.template().record_set_op_sync_event(&mut sync, tlid);
            template.template().record_complete_replay(tlid, sync);
            op.finish_execution();
            ops.push(op);
        }
        h.engine.end_recording();

        // the replayability exchange: every shard must agree
        let locals: Vec<_> =
            templates.iter().map(|t| t.check_replayable_local(false)).collect();
        for (s, local) in locals.iter().enumerate() {
            group.post_replayable(ShardId::new(s as u32), local.is_replayable());
        }
        let all_agree = group.resolve_replayable();
        for (template, local) in templates.iter().zip(locals) {
            let verdict = template.complete_capture(local, all_agree);
            assert!(verdict.is_replayable(), "{verdict:?}");
        }

        Self { h, templates, ops }
    }

    fn replay_once(&self, iteration: u64) {
        let fence = self.h.fabric.create_user_event();
        let recurrent = iteration > 0;
        // the refresh round is collective: every shard refreshes before any
        // shard begins the replay
        for template in &self.templates {
            template.maybe_refresh_barriers();
        }
        for template in &self.templates {
            template.initialize_replay(fence.event(), recurrent);
        }
        for (s, template) in self.templates.iter().enumerate() {
            let op = &self.ops[s];
            template
                .template()
                .register_replay_operation(
                    op.as_memoizable().expect("memoizable"),
                    OperationKind::Task,
                    op.unique_id(),
                )
                .expect("fingerprints match");
        }
        for template in &self.templates {
            template.perform_replay().expect("replay executes");
        }
        let completions: Vec<Event> =
            self.templates.iter().map(|t| t.finish_replay()).collect();
        self.h.fabric.trigger(fence, Event::NONE);
        for completion in completions {
            assert!(
                self.h.fabric.has_triggered(completion),
                "shard replay did not resolve at iteration {iteration}"
            );
        }
    }
}

#[test]
fn view_users_route_to_their_owner_shards() {
    let world = ShardedWorld::record(TraceConfig::new());
    // both shards recorded a user of each view, so the halo-exchange edges
    // had to cross shards; each shard ends up producing a frontier barrier
    // for its peer
    for (s, template) in world.templates.iter().enumerate() {
        assert!(
            !template.local_frontier_barriers().is_empty(),
            "shard {s} publishes no frontier"
        );
        assert!(
            !template.remote_frontier_barriers().is_empty(),
            "shard {s} consumes no remote frontier"
        );
    }
}

#[test]
fn sharded_replay_resolves_across_shards() {
    let world = ShardedWorld::record(TraceConfig::new());
    for iteration in 0..3 {
        world.replay_once(iteration);
    }
    for template in &world.templates {
        assert_eq!(template.template().replay_count(), 3);
    }
}

#[test]
fn barrier_generations_refresh_before_exhaustion() {
    let config = TraceConfig::new()
        .with_max_barrier_generations(4)
        .expect("valid generation bound");
    let world = ShardedWorld::record(config);

    let before: Vec<Vec<u64>> = world
        .templates
        .iter()
        .map(|t| t.local_frontier_barriers().iter().map(|(_, b)| b.uid()).collect())
        .collect();

    // run past the generation bound; the refresh protocol must swap every
    // frontier barrier before the replay that would exhaust them
    for iteration in 0..6 {
        world.replay_once(iteration);
    }

    for (s, template) in world.templates.iter().enumerate() {
        let after: Vec<u64> =
            template.local_frontier_barriers().iter().map(|(_, b)| b.uid()).collect();
        assert_eq!(before[s].len(), after.len());
        for (old, new) in before[s].iter().zip(after.iter()) {
            assert_ne!(old, new, "shard {s} kept an exhausted frontier barrier");
        }
        // every barrier the peer still consumes is one this shard now
        // produces
        let peer = &world.templates[1 - s];
        for (barrier, _) in peer.remote_frontier_barriers() {
            assert!(
                !before[s].contains(&barrier.uid()),
                "a peer kept consuming a refreshed barrier"
            );
        }
    }
}

#[test]
fn cross_shard_events_are_published_through_barriers() {
    let h = TestHarness::new(TraceConfig::new());
    let mapping = two_shard_mapping();
    let group = LocalShardGroup::new();
    let fence0 = h.fabric.create_user_event();
    let fence1 = h.fabric.create_user_event();
    let t0 = ShardedPhysicalTemplate::new(
        h.ctx.clone(),
        fence0.event(),
        ShardId::new(0),
        mapping.clone(),
        group.clone(),
    );
    let t1 = ShardedPhysicalTemplate::new(
        h.ctx.clone(),
        fence1.event(),
        ShardId::new(1),
        mapping,
        group.clone(),
    );
    group.register(&t0);
    group.register(&t1);

    // shard 1 records a task; shard 0 then merges with its completion event,
    // which only shard 1 knows
    let op = TestOperation::new(h.fabric.clone(), OperationKind::Task, 700, "remote", 1);
    op.set_trace_local_id(0u64.into());
    let memo = op.as_memoizable().expect("memoizable");
    let completion = op.begin_execution();
    t1.template().record_get_term_event(&memo, OperationKind::Task);

    let before = t0.template().instruction_count();
    let mut merged = Event::NONE;
    t0.record_merge_events(&mut merged, &[completion], 0u64.into());
    // a barrier-advance instruction was installed for the foreign event
    assert!(t0.template().instruction_count() > before + 1);
    assert!(merged.exists());
}

#[test]
fn collective_barriers_take_replay_values() {
    let h = TestHarness::new(TraceConfig::new());
    let mapping = two_shard_mapping();
    let group = LocalShardGroup::new();
    let fence = h.fabric.create_user_event();
    let template = ShardedPhysicalTemplate::new(
        h.ctx.clone(),
        fence.event(),
        ShardId::new(0),
        mapping,
        group.clone(),
    );
    group.register(&template);

    let recorded = h.fabric.create_barrier(1, 64);
    template.record_collective_barrier((3, 0), recorded, 1, Event::NONE);

    let local = template.check_replayable_local(false);
    group.post_replayable(ShardId::new(0), local.is_replayable());
    let all = group.resolve_replayable();
    assert!(template.complete_capture(local, all).is_replayable());

    // the application supplies the live barrier value for this replay
    let mut live = h.fabric.create_barrier(1, 64);
    template.prepare_collective_barrier_replay((3, 0), live);

    template.initialize_replay(Event::NONE, false);
    template.perform_replay().expect("replay executes");
    let _ = template.finish_replay();

    // the arrival landed on the supplied barrier's current generation
    assert!(h.fabric.has_triggered(h.fabric.barrier_phase(live)));
    live.advance();
    assert!(!h.fabric.has_triggered(h.fabric.barrier_phase(live)));
}
