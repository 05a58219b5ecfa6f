use std::sync::Arc;

use parking_lot::Mutex;
use phalanx_core::{ExpressionForest, FieldMask, Region};
use tracing::trace;

use crate::{
    errors::RejectionReason,
    version::{
        CapturedConditions, EquivalenceSetId, VersionEngineRef, VersionSubscriber,
        next_subscriber_id,
    },
    view_set::{ExprViews, FailedPrecondition, TraceViewSet},
};

// TRACE CONDITION SET
// ================================================================================================

/// The replayability conditions of one region touched by a trace.
///
/// Holds the captured pre/anti/post view sets for `(region, mask)` along with
/// their transposed forms, and tracks which equivalence sets currently cover
/// the region. Stale coverage (reported through the invalidation
/// subscription) is re-derived lazily on the next test or enforcement.
pub struct TraceConditionSet {
    engine: VersionEngineRef,
    region: Region,
    mask: FieldMask,
    subscriber_id: u64,

    /// Captured view sets, kept for the idempotence check.
    preconditions: TraceViewSet,
    anticonditions: TraceViewSet,
    postconditions: TraceViewSet,

    /// Transposed forms consumed at replay entry and exit.
    pre_views: ExprViews,
    anti_views: ExprViews,
    post_views: ExprViews,

    state: Mutex<ConditionSetState>,
}

#[derive(Debug, Default)]
struct ConditionSetState {
    /// Equivalence sets currently covering `(region, mask)`.
    current_sets: Vec<(EquivalenceSetId, FieldMask)>,
    /// Portion of the mask whose coverage is stale and must be re-derived.
    invalid_mask: FieldMask,
}

impl TraceConditionSet {
    /// Captures the conditions for `(region, mask)` from the equivalence sets
    /// currently covering it.
    pub fn capture(
        forest: Arc<ExpressionForest>,
        engine: VersionEngineRef,
        region: Region,
        mask: FieldMask,
    ) -> Arc<Self> {
        let current_sets = engine.compute_equivalence_sets(region, &mask);
        let mut preconditions = TraceViewSet::new(forest.clone(), region);
        let mut anticonditions = TraceViewSet::new(forest.clone(), region);
        let mut postconditions = TraceViewSet::new(forest.clone(), region);
        for (set, set_mask) in &current_sets {
            let CapturedConditions {
                preconditions: pre,
                anticonditions: anti,
                postconditions: post,
            } = engine.capture_trace_conditions(*set, set_mask);
            preconditions.merge(&pre);
            anticonditions.merge(&anti);
            postconditions.merge(&post);
        }

        let condition_set = Arc::new(Self {
            engine: engine.clone(),
            region,
            mask,
            subscriber_id: next_subscriber_id(),
            pre_views: preconditions.transpose_uniquely(),
            anti_views: anticonditions.transpose_uniquely(),
            post_views: postconditions.transpose_uniquely(),
            preconditions,
            anticonditions,
            postconditions,
            state: Mutex::new(ConditionSetState { current_sets, invalid_mask: FieldMask::EMPTY }),
        });
        let weak: std::sync::Weak<TraceConditionSet> = Arc::downgrade(&condition_set);
        let subscriber: std::sync::Weak<dyn VersionSubscriber> = weak;
        for (set, _) in &condition_set.state.lock().current_sets {
            engine.subscribe(*set, subscriber.clone());
        }
        condition_set
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn mask(&self) -> FieldMask {
        self.mask
    }

    pub fn has_preconditions(&self) -> bool {
        !self.pre_views.is_empty()
    }

    pub fn has_postconditions(&self) -> bool {
        !self.post_views.is_empty()
    }

    /// The idempotence half of the replayability decision: preconditions must
    /// be subsumed by postconditions (read-only users that appear only in
    /// preconditions may instead be independent), and postconditions must be
    /// independent of anticonditions.
    pub fn check_idempotence(&self) -> Result<(), RejectionReason> {
        if !self.preconditions.is_empty()
            && !self.postconditions.is_empty()
            && let Err(failed) = self.preconditions.subsumed_by(&self.postconditions, true)
        {
            return Err(RejectionReason::PreconditionNotSubsumed {
                description: failed.to_string(),
            });
        }
        if !self.postconditions.is_empty()
            && !self.anticonditions.is_empty()
            && let Err(failed) = self.postconditions.independent_of(&self.anticonditions)
        {
            return Err(RejectionReason::PostconditionAntiDependent {
                description: failed.to_string(),
            });
        }
        Ok(())
    }

    /// Tests whether the captured conditions hold over current state: every
    /// precondition view must still be valid, and no anticondition view may
    /// be.
    pub fn test_require(self: &Arc<Self>) -> Result<(), FailedPrecondition> {
        let sets = self.refresh_equivalence_sets();
        for (expr, views) in &self.pre_views {
            for (set, set_mask) in &sets {
                let mut restricted = views.clone();
                restricted.restrict(*set_mask);
                if restricted.is_empty() {
                    continue;
                }
                if let Some(failed) = self.engine.find_invalid_views(*set, *expr, &restricted) {
                    trace!(%failed, "precondition test failed");
                    return Err(failed);
                }
            }
        }
        for (expr, views) in &self.anti_views {
            for (set, set_mask) in &sets {
                let mut restricted = views.clone();
                restricted.restrict(*set_mask);
                if restricted.is_empty() {
                    continue;
                }
                if let Some(failed) = self.engine.find_antivalid_views(*set, *expr, &restricted) {
                    trace!(%failed, "anticondition test failed");
                    return Err(failed);
                }
            }
        }
        Ok(())
    }

    /// Stamps the postcondition views as the new valid state of the covered
    /// equivalence sets.
    pub fn ensure(self: &Arc<Self>) {
        let sets = self.refresh_equivalence_sets();
        for (expr, views) in &self.post_views {
            for (set, set_mask) in &sets {
                let mut restricted = views.clone();
                restricted.restrict(*set_mask);
                if restricted.is_empty() {
                    continue;
                }
                self.engine.overwrite(*set, *expr, &restricted);
            }
        }
    }

    /// Re-derives any stale portion of the equivalence-set coverage and
    /// returns the complete current coverage.
    fn refresh_equivalence_sets(self: &Arc<Self>) -> Vec<(EquivalenceSetId, FieldMask)> {
        let mut state = self.state.lock();
        if !state.invalid_mask.is_empty() {
            let recomputed = self.engine.compute_equivalence_sets(self.region, &state.invalid_mask);
            let weak: std::sync::Weak<TraceConditionSet> = Arc::downgrade(self);
            let subscriber: std::sync::Weak<dyn VersionSubscriber> = weak;
            for (set, _) in &recomputed {
                self.engine.subscribe(*set, subscriber.clone());
            }
            state.current_sets.extend(recomputed);
            state.invalid_mask = FieldMask::EMPTY;
        }
        state.current_sets.clone()
    }
}

impl VersionSubscriber for TraceConditionSet {
    fn subscriber_id(&self) -> u64 {
        self.subscriber_id
    }

    fn invalidate_equivalence_set(&self, set: EquivalenceSetId, mask: &FieldMask) {
        let mut state = self.state.lock();
        let mut invalidated = FieldMask::EMPTY;
        state.current_sets.retain_mut(|(current, current_mask)| {
            if *current == set && current_mask.overlaps(mask) {
                invalidated |= *current_mask & *mask;
                *current_mask -= *mask;
                return !current_mask.is_empty();
            }
            true
        });
        state.invalid_mask |= invalidated;
    }
}

impl Drop for TraceConditionSet {
    fn drop(&mut self) {
        let state = self.state.lock();
        for (set, _) in &state.current_sets {
            self.engine.unsubscribe(*set, self.subscriber_id);
        }
    }
}

impl std::fmt::Debug for TraceConditionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceConditionSet")
            .field("region", &self.region)
            .field("mask", &self.mask)
            .field("preconditions", &self.pre_views.len())
            .field("anticonditions", &self.anti_views.len())
            .field("postconditions", &self.post_views.len())
            .finish()
    }
}
