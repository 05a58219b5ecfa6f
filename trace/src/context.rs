use std::sync::Arc;

use phalanx_core::{EventFabric, ExpressionForest, ViewRegistry};

use crate::{config::TraceConfig, issue::IssueEngine, version::VersionEngineRef};

// TRACE CONTEXT
// ================================================================================================

/// The bundle of collaborators every trace component works against: the
/// event fabric, the expression forest, the view registry, the
/// equivalence-set engine, the data movement layer, and the configuration.
#[derive(Clone, Debug)]
pub struct TraceContext {
    pub fabric: Arc<EventFabric>,
    pub forest: Arc<ExpressionForest>,
    pub views: Arc<ViewRegistry>,
    pub versions: VersionEngineRef,
    pub issuer: Arc<dyn IssueEngine>,
    pub config: TraceConfig,
}
