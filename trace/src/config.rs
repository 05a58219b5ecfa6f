use phalanx_core::ProcessorId;

// TRACE CONFIG
// ================================================================================================

/// Knobs controlling trace capture and replay.
///
/// Defaults match the values the runtime ships with; use the builder-style
/// setters to override individual knobs. Setters validate eagerly so a bad
/// configuration is caught where it is written, not when a template misbehaves.
#[derive(Clone, Debug)]
pub struct TraceConfig {
    max_templates: usize,
    replay_parallelism: usize,
    background_reduction: bool,
    max_barrier_generations: u32,
    nonreplayable_warning_threshold: u32,
    new_template_warning_threshold: u32,
    dump_templates: bool,
    replay_targets: Vec<ProcessorId>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_templates: 16,
            replay_parallelism: 1,
            background_reduction: false,
            max_barrier_generations: 4096,
            nonreplayable_warning_threshold: 5,
            new_template_warning_threshold: 16,
            dump_templates: false,
            replay_targets: vec![ProcessorId::new(0)],
        }
    }
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the per-trace template cache.
    pub fn with_max_templates(mut self, max_templates: usize) -> Result<Self, TraceConfigError> {
        if max_templates == 0 {
            return Err(TraceConfigError::ZeroTemplateCapacity);
        }
        self.max_templates = max_templates;
        Ok(self)
    }

    /// Number of slices a template's instructions are partitioned into for
    /// parallel replay.
    pub fn with_replay_parallelism(
        mut self,
        replay_parallelism: usize,
    ) -> Result<Self, TraceConfigError> {
        if replay_parallelism == 0 {
            return Err(TraceConfigError::ZeroReplayParallelism);
        }
        self.replay_parallelism = replay_parallelism;
        Ok(self)
    }

    /// Runs transitive reduction on a background worker instead of inline
    /// during template finalization.
    pub fn with_background_reduction(mut self, background: bool) -> Self {
        self.background_reduction = background;
        self
    }

    /// Number of generations a phase barrier provides before the refresh
    /// protocol must replace it.
    pub fn with_max_barrier_generations(
        mut self,
        generations: u32,
    ) -> Result<Self, TraceConfigError> {
        if generations < 2 {
            return Err(TraceConfigError::BarrierGenerations(generations));
        }
        self.max_barrier_generations = generations;
        Ok(self)
    }

    /// Emits finalized instruction streams through `tracing::debug!`.
    pub fn with_dump_templates(mut self, dump: bool) -> Self {
        self.dump_templates = dump;
        self
    }

    /// Processors on which replay slices may execute.
    pub fn with_replay_targets(
        mut self,
        targets: Vec<ProcessorId>,
    ) -> Result<Self, TraceConfigError> {
        if targets.is_empty() {
            return Err(TraceConfigError::NoReplayTargets);
        }
        self.replay_targets = targets;
        Ok(self)
    }

    pub fn max_templates(&self) -> usize {
        self.max_templates
    }

    pub fn replay_parallelism(&self) -> usize {
        self.replay_parallelism
    }

    pub fn background_reduction(&self) -> bool {
        self.background_reduction
    }

    pub fn max_barrier_generations(&self) -> u32 {
        self.max_barrier_generations
    }

    pub fn nonreplayable_warning_threshold(&self) -> u32 {
        self.nonreplayable_warning_threshold
    }

    pub fn new_template_warning_threshold(&self) -> u32 {
        self.new_template_warning_threshold
    }

    pub fn dump_templates(&self) -> bool {
        self.dump_templates
    }

    pub fn replay_targets(&self) -> &[ProcessorId] {
        &self.replay_targets
    }
}

/// Errors raised while building a [`TraceConfig`].
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceConfigError {
    #[error("template cache capacity must be at least 1")]
    ZeroTemplateCapacity,
    #[error("replay parallelism must be at least 1")]
    ZeroReplayParallelism,
    #[error("barriers need at least 2 generations, got {0}")]
    BarrierGenerations(u32),
    #[error("at least one replay target processor is required")]
    NoReplayTargets,
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, true)]
    #[case(1, false)]
    #[case(8, false)]
    fn parallelism_is_validated(#[case] value: usize, #[case] rejected: bool) {
        assert_eq!(TraceConfig::new().with_replay_parallelism(value).is_err(), rejected);
    }

    #[rstest]
    #[case(0, true)]
    #[case(1, true)]
    #[case(2, false)]
    #[case(4096, false)]
    fn barrier_generations_are_validated(#[case] generations: u32, #[case] rejected: bool) {
        assert_eq!(
            TraceConfig::new().with_max_barrier_generations(generations).is_err(),
            rejected
        );
    }

    #[test]
    fn empty_knobs_are_rejected() {
        assert_eq!(
            TraceConfig::new().with_max_templates(0).unwrap_err(),
            TraceConfigError::ZeroTemplateCapacity
        );
        assert_eq!(
            TraceConfig::new().with_replay_targets(Vec::new()).unwrap_err(),
            TraceConfigError::NoReplayTargets
        );
    }
}
