use core::fmt;
use std::sync::Arc;

use phalanx_core::{DomainPoint, Event, EventFabric, FieldMask, ProcessorId, ViewId};

// IDENTIFIERS
// ================================================================================================

/// Unique identifier of an operation instance.
pub type UniqueOpId = u64;

/// Generation counter distinguishing reuses of an operation slot.
pub type GenerationId = u64;

/// Identifies one operation within the scope of a trace: its index in the
/// enclosing context plus its launch point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceLocalId {
    pub context_index: u64,
    pub point: DomainPoint,
}

impl TraceLocalId {
    pub fn new(context_index: u64, point: DomainPoint) -> Self {
        Self { context_index, point }
    }
}

impl From<u64> for TraceLocalId {
    fn from(context_index: u64) -> Self {
        Self { context_index, point: DomainPoint::ORIGIN }
    }
}

impl fmt::Display for TraceLocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}{}", self.context_index, self.point)
    }
}

// OPERATION KIND
// ================================================================================================

/// Structural kind of an application operation, recorded as part of a trace's
/// fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Task,
    Copy,
    Fill,
    Fence,
    Discard,
    Summary,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Copy => write!(f, "copy"),
            Self::Fill => write!(f, "fill"),
            Self::Fence => write!(f, "fence"),
            Self::Discard => write!(f, "discard"),
            Self::Summary => write!(f, "summary"),
        }
    }
}

// REGION USAGE
// ================================================================================================

/// Access privilege of a region requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Privilege {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteDiscard,
    Reduce(u32),
}

impl Privilege {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard)
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self, Self::Reduce(_))
    }
}

/// Coherence mode of a region requirement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Coherence {
    #[default]
    Exclusive,
    Atomic,
    Simultaneous,
}

/// Privilege and coherence of one region access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionUsage {
    pub privilege: Privilege,
    pub coherence: Coherence,
}

impl RegionUsage {
    pub const fn new(privilege: Privilege, coherence: Coherence) -> Self {
        Self { privilege, coherence }
    }

    pub const fn read_only() -> Self {
        Self::new(Privilege::ReadOnly, Coherence::Exclusive)
    }

    pub const fn read_write() -> Self {
        Self::new(Privilege::ReadWrite, Coherence::Exclusive)
    }

    pub const fn write_discard() -> Self {
        Self::new(Privilege::WriteDiscard, Coherence::Exclusive)
    }

    pub const fn reduce(redop: u32) -> Self {
        Self::new(Privilege::Reduce(redop), Coherence::Exclusive)
    }
}

impl phalanx_core::serde::Serializable for RegionUsage {
    fn write_into<W: phalanx_core::serde::ByteWriter>(&self, target: &mut W) {
        let (tag, redop) = match self.privilege {
            Privilege::NoAccess => (0u8, 0u32),
            Privilege::ReadOnly => (1, 0),
            Privilege::ReadWrite => (2, 0),
            Privilege::WriteDiscard => (3, 0),
            Privilege::Reduce(redop) => (4, redop),
        };
        target.write_u8(tag);
        target.write_u32(redop);
        target.write_u8(match self.coherence {
            Coherence::Exclusive => 0,
            Coherence::Atomic => 1,
            Coherence::Simultaneous => 2,
        });
    }
}

impl phalanx_core::serde::Deserializable for RegionUsage {
    fn read_from<R: phalanx_core::serde::ByteReader>(
        source: &mut R,
    ) -> Result<Self, phalanx_core::serde::DeserializationError> {
        use phalanx_core::serde::DeserializationError;
        let tag = source.read_u8()?;
        let redop = source.read_u32()?;
        let privilege = match tag {
            0 => Privilege::NoAccess,
            1 => Privilege::ReadOnly,
            2 => Privilege::ReadWrite,
            3 => Privilege::WriteDiscard,
            4 => Privilege::Reduce(redop),
            other => {
                return Err(DeserializationError::InvalidValue(format!(
                    "unknown privilege tag {other}"
                )));
            },
        };
        let coherence = match source.read_u8()? {
            0 => Coherence::Exclusive,
            1 => Coherence::Atomic,
            2 => Coherence::Simultaneous,
            other => {
                return Err(DeserializationError::InvalidValue(format!(
                    "unknown coherence tag {other}"
                )));
            },
        };
        Ok(Self { privilege, coherence })
    }
}

// DEPENDENCE TYPE
// ================================================================================================

/// Classification of the dependence between two region accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependenceType {
    NoDependence,
    TrueDependence,
    AntiDependence,
    AtomicDependence,
    SimultaneousDependence,
}

impl DependenceType {
    pub fn is_dependence(&self) -> bool {
        !matches!(self, Self::NoDependence)
    }
}

/// Computes the dependence the `next` access carries on the `prev` access to
/// overlapping data.
pub fn check_dependence(prev: &RegionUsage, next: &RegionUsage) -> DependenceType {
    use Privilege::*;
    if matches!(prev.privilege, NoAccess) || matches!(next.privilege, NoAccess) {
        return DependenceType::NoDependence;
    }
    // readers never conflict with readers, and same-operator reductions fold
    if prev.privilege.is_read_only() && next.privilege.is_read_only() {
        return DependenceType::NoDependence;
    }
    if let (Reduce(a), Reduce(b)) = (prev.privilege, next.privilege)
        && a == b
    {
        return DependenceType::NoDependence;
    }
    // war and discarding writes do not carry data forward
    let anti = prev.privilege.is_read_only()
        || prev.privilege.is_reduction()
        || matches!(next.privilege, WriteDiscard);
    match (prev.coherence, next.coherence) {
        (Coherence::Atomic, Coherence::Atomic) => DependenceType::AtomicDependence,
        (Coherence::Simultaneous, Coherence::Simultaneous) => DependenceType::SimultaneousDependence,
        _ if anti => DependenceType::AntiDependence,
        _ => DependenceType::TrueDependence,
    }
}

// OPERATION INTERFACE
// ================================================================================================

/// A reference to an operation pinned at a specific generation.
///
/// Operation slots are recycled by the runtime; the generation lets holders
/// detect that the operation they recorded has been reused for younger work.
#[derive(Clone)]
pub struct OpRef {
    pub op: Arc<dyn Operation>,
    pub generation: GenerationId,
}

impl OpRef {
    pub fn new(op: Arc<dyn Operation>) -> Self {
        let generation = op.generation();
        Self { op, generation }
    }

    /// Key used to order and deduplicate operation references.
    pub fn key(&self) -> (UniqueOpId, GenerationId) {
        (self.op.unique_id(), self.generation)
    }

    /// Whether the referenced operation is still at the pinned generation.
    pub fn is_current(&self) -> bool {
        self.op.generation() == self.generation
    }
}

impl fmt::Debug for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpRef({} gen {})", self.op.unique_id(), self.generation)
    }
}

impl PartialEq for OpRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for OpRef {}

/// The face an application operation presents to the trace engine.
///
/// Everything behind this trait (dependence analysis, mapping, the region
/// tree) is an external collaborator; the trace engine only consumes the
/// results.
pub trait Operation: Send + Sync + fmt::Debug {
    fn kind(&self) -> OperationKind;
    fn unique_id(&self) -> UniqueOpId;
    fn generation(&self) -> GenerationId;
    fn name(&self) -> &str;
    fn region_count(&self) -> usize;

    /// Internal operations are runtime-synthesized (closes, refinements) and
    /// folded into their creator's dependence bucket.
    fn is_internal(&self) -> bool {
        false
    }

    /// For internal operations, the requirement index on the creator.
    fn internal_index(&self) -> usize {
        0
    }

    fn is_memoizing(&self) -> bool;

    /// The memoizable face of this operation, if it supports replay.
    fn as_memoizable(&self) -> Option<Arc<dyn Memoizable>>;

    fn set_trace_local_id(&self, tlid: TraceLocalId);

    fn add_mapping_reference(&self, generation: GenerationId);
    fn remove_mapping_reference(&self, generation: GenerationId);

    /// Registers a whole-operation mapping dependence on `target`. Returns
    /// false if the target has already retired.
    fn register_dependence(&self, target: &OpRef) -> bool;

    /// Registers a dependence between requirement `target_idx` of `target`
    /// and requirement `own_idx` of this operation.
    fn register_region_dependence(
        &self,
        own_idx: usize,
        target: &OpRef,
        target_idx: usize,
        dtype: DependenceType,
        validates: bool,
        mask: &FieldMask,
    ) -> bool;

    /// Whether issuing this operation invalidates the currently selected
    /// physical template.
    fn invalidates_template(&self) -> bool {
        false
    }
}

// MEMOIZABLE INTERFACE
// ================================================================================================

/// A reservation handle acquired around an atomic-coherence access.
pub type Reservation = u64;

/// An operation that supports re-issuing its mapping output from a recorded
/// cache during template replay.
pub trait Memoizable: Send + Sync + fmt::Debug {
    fn trace_local_id(&self) -> TraceLocalId;

    /// The completion event of the current execution of this operation.
    fn completion_event(&self) -> Event;

    /// Re-applies the recorded mapping output for this replay.
    fn replay_mapping_output(&self, output: &MapperOutput, reservations: &[Reservation]);

    /// Computes the operation's current synchronization precondition.
    fn compute_sync_precondition(&self, fabric: &EventFabric) -> Event;

    /// Pushes the effects postcondition into the operation.
    fn set_effects_postcondition(&self, effects: Event);

    /// Signals that template replay for this operation is complete; the
    /// operation's execution must wait on `precondition`.
    fn complete_replay(&self, precondition: Event);

    /// Processor this operation's work runs on, used to slice parallel
    /// replay.
    fn target_processor(&self) -> ProcessorId;
}

// MAPPER OUTPUT
// ================================================================================================

/// The subset of a mapper's decisions a template caches so replay can skip
/// the mapper entirely.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapperOutput {
    pub chosen_variant: u32,
    pub target_procs: Vec<ProcessorId>,
    /// Physical instance selected per region requirement.
    pub physical_instances: Vec<(usize, ViewId)>,
    /// A virtual mapping defers materialization and cannot be memoized.
    pub virtual_mapping: bool,
}

impl MapperOutput {
    pub fn primary_target(&self) -> Option<ProcessorId> {
        self.target_procs.first().copied()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(privilege: Privilege) -> RegionUsage {
        RegionUsage::new(privilege, Coherence::Exclusive)
    }

    #[test]
    fn reader_pairs_are_independent() {
        assert_eq!(
            check_dependence(&usage(Privilege::ReadOnly), &usage(Privilege::ReadOnly)),
            DependenceType::NoDependence
        );
        assert_eq!(
            check_dependence(&usage(Privilege::Reduce(7)), &usage(Privilege::Reduce(7))),
            DependenceType::NoDependence
        );
    }

    #[test]
    fn writers_carry_dependences() {
        assert_eq!(
            check_dependence(&usage(Privilege::ReadWrite), &usage(Privilege::ReadOnly)),
            DependenceType::TrueDependence
        );
        assert_eq!(
            check_dependence(&usage(Privilege::ReadOnly), &usage(Privilege::ReadWrite)),
            DependenceType::AntiDependence
        );
        assert_eq!(
            check_dependence(&usage(Privilege::ReadWrite), &usage(Privilege::WriteDiscard)),
            DependenceType::AntiDependence
        );
        assert_eq!(
            check_dependence(&usage(Privilege::Reduce(1)), &usage(Privilege::Reduce(2))),
            DependenceType::AntiDependence
        );
    }

    #[test]
    fn coherence_refines_conflicts() {
        let atomic = RegionUsage::new(Privilege::ReadWrite, Coherence::Atomic);
        let simult = RegionUsage::new(Privilege::ReadWrite, Coherence::Simultaneous);
        assert_eq!(check_dependence(&atomic, &atomic), DependenceType::AtomicDependence);
        assert_eq!(check_dependence(&simult, &simult), DependenceType::SimultaneousDependence);
        assert_eq!(check_dependence(&atomic, &simult), DependenceType::TrueDependence);
    }
}
