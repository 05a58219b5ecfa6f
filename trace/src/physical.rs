use std::sync::Arc;

use phalanx_core::Event;
use tracing::{debug, warn};

use crate::{
    context::TraceContext,
    errors::Replayable,
    template::PhysicalTemplate,
};

// PHYSICAL TRACE
// ================================================================================================

/// The per-trace cache of captured templates.
///
/// Templates are kept in LRU order, bounded by the configured capacity. On
/// every trace entry the cache is scanned from most- to least-recently used;
/// the first template whose conditions hold over current state becomes the
/// replay target. Consecutive replays of the same template run recurrent,
/// chaining the previous completion into slot 0 instead of a fresh fence.
#[derive(Debug)]
pub struct PhysicalTrace {
    ctx: Arc<TraceContext>,
    /// LRU order: front is coldest, back is the most recently used.
    templates: Vec<Arc<PhysicalTemplate>>,
    current: Option<Arc<PhysicalTemplate>>,
    recording: Option<Arc<PhysicalTemplate>>,
    /// Template replayed by the previous pass, for recurrence detection.
    previous_template: Option<u64>,
    previous_completion: Event,
    intermediate_execution_fence: bool,
    nonreplayable_count: u32,
    new_template_count: u32,
    /// Evicted templates awaiting their deletion preconditions.
    retired: Vec<Arc<PhysicalTemplate>>,
}

impl PhysicalTrace {
    pub fn new(ctx: Arc<TraceContext>) -> Self {
        Self {
            ctx,
            templates: Vec::new(),
            current: None,
            recording: None,
            previous_template: None,
            previous_completion: Event::NONE,
            intermediate_execution_fence: false,
            nonreplayable_count: 0,
            new_template_count: 0,
            retired: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<TraceContext> {
        &self.ctx
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn current_template(&self) -> Option<Arc<PhysicalTemplate>> {
        self.current.clone()
    }

    pub fn recording_template(&self) -> Option<Arc<PhysicalTemplate>> {
        self.recording.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn previous_completion(&self) -> Event {
        self.previous_completion
    }

    /// Scans the cache from most-recently used backward and selects the
    /// first template whose conditions hold over current equivalence-set
    /// state. Returns whether a template was selected.
    pub fn check_template_preconditions(&mut self) -> bool {
        self.collect_retired();
        let mut selected = None;
        for (pos, template) in self.templates.iter().enumerate().rev() {
            match template.check_preconditions() {
                Ok(()) => {
                    selected = Some(pos);
                    break;
                },
                Err(failed) => {
                    debug!(
                        template = template.template_id(),
                        failure = %failed.describe(&self.ctx.forest, &self.ctx.views),
                        "template preconditions failed"
                    );
                },
            }
        }
        match selected {
            Some(pos) => {
                let template = self.templates.remove(pos);
                self.templates.push(template.clone());
                self.current = Some(template);
                true
            },
            None => {
                self.current = None;
                false
            },
        }
    }

    /// Starts recording a fresh template.
    pub fn begin_recording(&mut self, fence_completion: Event) -> Arc<PhysicalTemplate> {
        debug_assert!(self.recording.is_none());
        let template = PhysicalTemplate::new(self.ctx.clone(), fence_completion);
        self.recording = Some(template.clone());
        template
    }

    /// Completes the in-flight recording: replayable templates enter the
    /// cache (evicting the coldest beyond capacity); rejected ones are
    /// counted toward the consecutive-failure warning.
    pub fn record_completed(&mut self, blocking_call_observed: bool) -> Replayable {
        let template = self.recording.take().expect("no recording in flight");
        let replayable = template.finalize(blocking_call_observed);
        self.process_capture_verdict(template, replayable.clone());
        replayable
    }

    /// Shared cache bookkeeping for a finished capture (used by both the
    /// single-shard and control-replicated paths).
    pub(crate) fn process_capture_verdict(
        &mut self,
        template: Arc<PhysicalTemplate>,
        replayable: Replayable,
    ) {
        let config = &self.ctx.config;
        match &replayable {
            Replayable::Replayable => {
                self.nonreplayable_count = 0;
                self.new_template_count += 1;
                if self.new_template_count > config.new_template_warning_threshold() {
                    warn!(
                        count = self.new_template_count,
                        "trace keeps capturing new templates; the mapper's choices are not \
                         template-stable"
                    );
                }
                self.templates.push(template);
                if self.templates.len() > config.max_templates() {
                    let evicted = self.templates.remove(0);
                    debug!(template = evicted.template_id(), "evicting coldest template");
                    self.retired.push(evicted);
                }
            },
            Replayable::NotReplayable(reason) => {
                self.nonreplayable_count += 1;
                if self.nonreplayable_count > config.nonreplayable_warning_threshold() {
                    warn!(
                        count = self.nonreplayable_count,
                        %reason,
                        "trace keeps capturing non-replayable templates"
                    );
                }
                // the rejected template is discarded outright
                drop(template);
            },
        }
    }

    /// Queues a replay of the current template. Consecutive replays of the
    /// same template run recurrent (reusing the previous completion for slot
    /// 0) unless an intermediate execution fence was recorded.
    pub fn start_replay(&mut self, fence_completion: Event) {
        let template = self.current.clone().expect("start_replay without a selected template");
        let recurrent = self.previous_template == Some(template.template_id())
            && !self.intermediate_execution_fence;
        let completion = if recurrent { self.previous_completion } else { fence_completion };
        template.initialize_replay(completion, recurrent);
        self.intermediate_execution_fence = false;
    }

    /// Executes the queued replay and records its completion for chaining.
    pub fn execute_replay(&mut self) -> Result<(), crate::errors::TraceError> {
        let template = self.current.clone().expect("execute_replay without a selected template");
        template.perform_replay()?;
        let completion = template.finish_replay();
        template.apply_postconditions();
        self.previous_completion = completion;
        self.previous_template = Some(template.template_id());
        Ok(())
    }

    /// Serializes successive replays: the next pass's fence must not outrun
    /// the previous replay's completion.
    pub fn chain_replays(&self, fence: Event) -> Event {
        self.ctx.fabric.merge(&[self.previous_completion, fence])
    }

    /// Handles an operation that invalidates the selected template
    /// mid-trace: either stamp its postconditions through summary operations
    /// and drop it, or keep it and fence the next replay.
    pub fn invalidate_current_template(&mut self, issue_summaries: bool) {
        if let Some(template) = &self.current {
            if issue_summaries {
                template.issue_summary_operations();
                self.current = None;
                self.previous_template = None;
            } else {
                self.intermediate_execution_fence = true;
            }
        }
    }

    pub fn has_intermediate_execution_fence(&self) -> bool {
        self.intermediate_execution_fence
    }

    /// Drops retired templates whose deletion preconditions have fired.
    fn collect_retired(&mut self) {
        self.retired.retain(|template| !template.ready_for_deletion());
    }
}
