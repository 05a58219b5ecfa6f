use core::fmt;
use std::sync::{Arc, Weak};

use phalanx_core::{ExprId, FieldMask, FieldMaskSet, Region, ViewId};

use crate::view_set::{FailedPrecondition, TraceViewSet};

// EQUIVALENCE SET ID
// ================================================================================================

/// Handle to one equivalence set, the granular unit of physical region state
/// the runtime tracks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EquivalenceSetId(u64);

impl EquivalenceSetId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EquivalenceSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eqset{}", self.0)
    }
}

// CAPTURED CONDITIONS
// ================================================================================================

/// The view sets one equivalence set hands back when a trace's conditions are
/// captured.
#[derive(Clone, Debug)]
pub struct CapturedConditions {
    /// Views whose data the trace consumed and that must therefore be valid
    /// on entry.
    pub preconditions: TraceViewSet,
    /// Views that must *not* be valid on entry (the trace overwrites them
    /// without reading).
    pub anticonditions: TraceViewSet,
    /// Views the trace leaves valid on exit.
    pub postconditions: TraceViewSet,
}

// VERSION ENGINE
// ================================================================================================

/// The seam to the equivalence-set engine.
///
/// The trace engine performs no version analysis of its own; it asks this
/// interface to capture a recording's conditions, to test whether required
/// views are still valid, and to stamp a replayed template's postconditions
/// back into the physical state.
pub trait VersionEngine: Send + Sync + fmt::Debug {
    /// The equivalence sets covering `(region, mask)`, each with the portion
    /// of the mask it covers.
    fn compute_equivalence_sets(
        &self,
        region: Region,
        mask: &FieldMask,
    ) -> Vec<(EquivalenceSetId, FieldMask)>;

    /// Hands back the pre/anti/post view sets the equivalence set accumulated
    /// during the current recording, restricted to `mask`.
    fn capture_trace_conditions(&self, set: EquivalenceSetId, mask: &FieldMask)
    -> CapturedConditions;

    /// Reports the first of the given views that is no longer valid on
    /// `expr` within the equivalence set.
    fn find_invalid_views(
        &self,
        set: EquivalenceSetId,
        expr: ExprId,
        views: &FieldMaskSet<ViewId>,
    ) -> Option<FailedPrecondition>;

    /// Reports the first of the given views that is still valid on `expr`
    /// within the equivalence set (the anticondition check).
    fn find_antivalid_views(
        &self,
        set: EquivalenceSetId,
        expr: ExprId,
        views: &FieldMaskSet<ViewId>,
    ) -> Option<FailedPrecondition>;

    /// Stamps the given views as the valid state of `expr` within the
    /// equivalence set, invalidating everything else.
    fn overwrite(&self, set: EquivalenceSetId, expr: ExprId, views: &FieldMaskSet<ViewId>);

    /// Subscribes to invalidations of the equivalence set. The engine holds
    /// the subscriber weakly.
    fn subscribe(&self, set: EquivalenceSetId, subscriber: Weak<dyn VersionSubscriber>);

    /// Cancels a subscription previously installed for `subscriber_id`.
    fn unsubscribe(&self, set: EquivalenceSetId, subscriber_id: u64);
}

/// Receives equivalence-set invalidation callbacks.
pub trait VersionSubscriber: Send + Sync {
    fn subscriber_id(&self) -> u64;

    /// Called when the fields in `mask` of the given equivalence set are
    /// invalidated upstream.
    fn invalidate_equivalence_set(&self, set: EquivalenceSetId, mask: &FieldMask);
}

/// Allocates process-unique subscriber ids.
pub(crate) fn next_subscriber_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Convenience alias: a reference-counted version engine.
pub type VersionEngineRef = Arc<dyn VersionEngine>;
