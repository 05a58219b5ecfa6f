use core::fmt;

use parking_lot::Mutex;
use smallvec::SmallVec;
use winter_utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable};

// EVENT HANDLES
// ================================================================================================

/// A completion event. `Event::NONE` is the event that has already triggered.
///
/// Events are resolved by the [`EventFabric`] that issued them; handles are
/// plain integers and can be freely copied and sent across shards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event(u64);

impl Event {
    /// The already-triggered event.
    pub const NONE: Self = Self(0);

    pub const fn exists(&self) -> bool {
        self.0 != 0
    }

    pub const fn id(&self) -> u64 {
        self.0
    }

    /// Reconstructs a handle from its raw id, e.g. after a trip through an
    /// atomic slot or the wire.
    pub const fn from_id(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "ev{}", self.0)
        } else {
            write!(f, "ev-none")
        }
    }
}

impl Serializable for Event {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u64(self.0);
    }
}

impl Deserializable for Event {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self(source.read_u64()?))
    }
}

/// An event that the creator triggers explicitly, optionally gated on a
/// precondition event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserEvent(Event);

impl UserEvent {
    pub const fn event(&self) -> Event {
        self.0
    }

    /// Reconstructs the user-event handle from its underlying event. The
    /// caller asserts the event was created by `create_user_event`.
    pub const fn from_event(event: Event) -> Self {
        Self(event)
    }
}

impl fmt::Display for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user-{}", self.0)
    }
}

// BARRIER
// ================================================================================================

/// A phase barrier with a bounded number of generations.
///
/// The handle carries its own generation cursor: advancing a copy of the
/// handle does not affect other copies, which is what lets every instruction
/// that participates in a barrier track its own phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Barrier {
    uid: u64,
    generation: u32,
    total_arrivals: u32,
    max_generations: u32,
}

impl Barrier {
    /// The null barrier.
    pub const NONE: Self = Self { uid: 0, generation: 0, total_arrivals: 0, max_generations: 0 };

    pub const fn exists(&self) -> bool {
        self.uid != 0
    }

    pub const fn uid(&self) -> u64 {
        self.uid
    }

    pub const fn generation(&self) -> u32 {
        self.generation
    }

    pub const fn total_arrivals(&self) -> u32 {
        self.total_arrivals
    }

    /// Advances this handle to the next generation.
    pub fn advance(&mut self) {
        debug_assert!(self.exists());
        self.generation += 1;
    }

    /// Returns true once this handle has consumed every generation the
    /// underlying barrier can provide.
    pub const fn has_exhausted(&self) -> bool {
        self.generation >= self.max_generations
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bar{}@{}", self.uid, self.generation)
    }
}

impl Serializable for Barrier {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u64(self.uid);
        target.write_u32(self.generation);
        target.write_u32(self.total_arrivals);
        target.write_u32(self.max_generations);
    }
}

impl Deserializable for Barrier {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        Ok(Self {
            uid: source.read_u64()?,
            generation: source.read_u32()?,
            total_arrivals: source.read_u32()?,
            max_generations: source.read_u32()?,
        })
    }
}

// EVENT FABRIC
// ================================================================================================

/// The in-memory event graph.
///
/// All state lives behind a single mutex; triggering cascades eagerly, so
/// `has_triggered` is exact the moment any public call returns. Merge events
/// count outstanding preconditions; user events count a single explicit
/// trigger; barrier generations count arrivals.
#[derive(Debug, Default)]
pub struct EventFabric {
    inner: Mutex<FabricInner>,
}

#[derive(Debug, Default)]
struct FabricInner {
    /// Event id N lives at index N-1.
    events: Vec<EventState>,
    /// Barrier uid N lives at index N-1.
    barriers: Vec<BarrierState>,
}

#[derive(Debug)]
struct EventState {
    triggered: bool,
    /// Outstanding preconditions (1 for a user event's explicit trigger).
    remaining: u32,
    waiters: Vec<Waiter>,
}

#[derive(Debug)]
enum Waiter {
    /// Decrement the remaining count of the given event, firing it at zero.
    Decrement(u64),
    /// Perform a barrier arrival.
    Arrive { uid: u64, generation: u32, count: u32 },
}

#[derive(Debug)]
struct BarrierState {
    total_arrivals: u32,
    generations: Vec<GenerationState>,
}

#[derive(Debug, Default)]
struct GenerationState {
    arrived: u32,
    /// Lazily allocated completion event for this generation.
    event: Option<u64>,
}

impl EventFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh user-triggerable event.
    pub fn create_user_event(&self) -> UserEvent {
        let mut inner = self.inner.lock();
        UserEvent(Event(inner.alloc_event(1)))
    }

    /// Triggers the user event once `precondition` has triggered.
    pub fn trigger(&self, user: UserEvent, precondition: Event) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.state(user.0.id()).triggered, "user event {user} double-triggered");
        if inner.is_complete(precondition) {
            inner.decrement(user.0.id());
        } else {
            inner.state_mut(precondition.id()).waiters.push(Waiter::Decrement(user.0.id()));
        }
    }

    /// Returns an event that triggers once all of `preconditions` have.
    pub fn merge(&self, preconditions: &[Event]) -> Event {
        let mut inner = self.inner.lock();
        let mut pending: SmallVec<[u64; 8]> = preconditions
            .iter()
            .filter(|e| !inner.is_complete(**e))
            .map(|e| e.id())
            .collect();
        pending.sort_unstable();
        pending.dedup();
        match pending.len() {
            0 => Event::NONE,
            1 => Event(pending[0]),
            n => {
                let merged = inner.alloc_event(n as u32);
                for pre in pending {
                    inner.state_mut(pre).waiters.push(Waiter::Decrement(merged));
                }
                Event(merged)
            },
        }
    }

    pub fn has_triggered(&self, event: Event) -> bool {
        self.inner.lock().is_complete(event)
    }

    /// Creates a barrier expecting `total_arrivals` arrivals per generation,
    /// usable for `max_generations` generations.
    pub fn create_barrier(&self, total_arrivals: u32, max_generations: u32) -> Barrier {
        assert!(total_arrivals > 0 && max_generations > 0);
        let mut inner = self.inner.lock();
        let uid = inner.barriers.len() as u64 + 1;
        inner.barriers.push(BarrierState { total_arrivals, generations: Vec::new() });
        Barrier { uid, generation: 0, total_arrivals, max_generations }
    }

    /// Contributes `count` arrivals to the barrier's current generation once
    /// `precondition` has triggered.
    pub fn arrive(&self, barrier: Barrier, count: u32, precondition: Event) {
        debug_assert!(barrier.exists());
        let mut inner = self.inner.lock();
        if inner.is_complete(precondition) {
            inner.do_arrive(barrier.uid, barrier.generation, count);
        } else {
            inner.state_mut(precondition.id()).waiters.push(Waiter::Arrive {
                uid: barrier.uid,
                generation: barrier.generation,
                count,
            });
        }
    }

    /// The completion event of the barrier's current generation.
    pub fn barrier_phase(&self, barrier: Barrier) -> Event {
        debug_assert!(barrier.exists());
        let mut inner = self.inner.lock();
        Event(inner.phase_event(barrier.uid, barrier.generation))
    }
}

impl FabricInner {
    fn alloc_event(&mut self, remaining: u32) -> u64 {
        self.events.push(EventState { triggered: false, remaining, waiters: Vec::new() });
        self.events.len() as u64
    }

    fn state(&self, id: u64) -> &EventState {
        &self.events[id as usize - 1]
    }

    fn state_mut(&mut self, id: u64) -> &mut EventState {
        &mut self.events[id as usize - 1]
    }

    fn is_complete(&self, event: Event) -> bool {
        !event.exists() || self.state(event.id()).triggered
    }

    /// Decrements the remaining count of `id`, firing it (and cascading) at
    /// zero. Iterative worklist to keep deep event chains off the call stack.
    fn decrement(&mut self, id: u64) {
        let mut worklist: SmallVec<[u64; 8]> = SmallVec::new();
        self.decrement_inner(id, &mut worklist);
        self.drain(worklist);
    }

    fn do_arrive(&mut self, uid: u64, generation: u32, count: u32) {
        let mut worklist: SmallVec<[u64; 8]> = SmallVec::new();
        self.do_arrive_inner(uid, generation, count, &mut worklist);
        self.drain(worklist);
    }

    fn drain(&mut self, mut worklist: SmallVec<[u64; 8]>) {
        while let Some(fired) = worklist.pop() {
            let waiters = core::mem::take(&mut self.state_mut(fired).waiters);
            for waiter in waiters {
                match waiter {
                    Waiter::Decrement(target) => self.decrement_inner(target, &mut worklist),
                    Waiter::Arrive { uid, generation, count } => {
                        self.do_arrive_inner(uid, generation, count, &mut worklist)
                    },
                }
            }
        }
    }

    fn decrement_inner(&mut self, id: u64, worklist: &mut SmallVec<[u64; 8]>) {
        let state = self.state_mut(id);
        debug_assert!(state.remaining > 0);
        state.remaining -= 1;
        if state.remaining == 0 {
            state.triggered = true;
            worklist.push(id);
        }
    }

    fn do_arrive_inner(
        &mut self,
        uid: u64,
        generation: u32,
        count: u32,
        worklist: &mut SmallVec<[u64; 8]>,
    ) {
        let barrier = &mut self.barriers[uid as usize - 1];
        if barrier.generations.len() <= generation as usize {
            barrier.generations.resize_with(generation as usize + 1, GenerationState::default);
        }
        let total = barrier.total_arrivals;
        let gen_state = &mut barrier.generations[generation as usize];
        debug_assert!(gen_state.arrived + count <= total, "barrier bar{uid} over-arrived");
        gen_state.arrived += count;
        if gen_state.arrived == total
            && let Some(event) = gen_state.event
        {
            let state = self.state_mut(event);
            if !state.triggered {
                state.triggered = true;
                state.remaining = 0;
                worklist.push(event);
            }
        }
    }

    fn phase_event(&mut self, uid: u64, generation: u32) -> u64 {
        let barrier = &mut self.barriers[uid as usize - 1];
        if barrier.generations.len() <= generation as usize {
            barrier.generations.resize_with(generation as usize + 1, GenerationState::default);
        }
        let complete = barrier.generations[generation as usize].arrived == barrier.total_arrivals;
        if let Some(event) = barrier.generations[generation as usize].event {
            return event;
        }
        let event = self.alloc_event(if complete { 0 } else { 1 });
        if complete {
            self.state_mut(event).triggered = true;
        }
        self.barriers[uid as usize - 1].generations[generation as usize].event = Some(event);
        event
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_event_trigger_cascade() {
        let fabric = EventFabric::new();
        let a = fabric.create_user_event();
        let b = fabric.create_user_event();

        fabric.trigger(b, a.event());
        assert!(!fabric.has_triggered(b.event()));

        fabric.trigger(a, Event::NONE);
        assert!(fabric.has_triggered(a.event()));
        assert!(fabric.has_triggered(b.event()));
    }

    #[test]
    fn merge_waits_for_all() {
        let fabric = EventFabric::new();
        let a = fabric.create_user_event();
        let b = fabric.create_user_event();

        let merged = fabric.merge(&[a.event(), b.event(), Event::NONE]);
        assert!(!fabric.has_triggered(merged));

        fabric.trigger(a, Event::NONE);
        assert!(!fabric.has_triggered(merged));
        fabric.trigger(b, Event::NONE);
        assert!(fabric.has_triggered(merged));
    }

    #[test]
    fn merge_of_complete_inputs_is_none() {
        let fabric = EventFabric::new();
        assert_eq!(fabric.merge(&[]), Event::NONE);
        assert_eq!(fabric.merge(&[Event::NONE, Event::NONE]), Event::NONE);

        let a = fabric.create_user_event();
        assert_eq!(fabric.merge(&[a.event(), a.event()]), a.event());
    }

    #[test]
    fn barrier_generations_are_independent() {
        let fabric = EventFabric::new();
        let mut barrier = fabric.create_barrier(2, 4);
        let gen0 = fabric.barrier_phase(barrier);

        fabric.arrive(barrier, 1, Event::NONE);
        assert!(!fabric.has_triggered(gen0));

        // arrival gated on a user event
        let gate = fabric.create_user_event();
        fabric.arrive(barrier, 1, gate.event());
        assert!(!fabric.has_triggered(gen0));
        fabric.trigger(gate, Event::NONE);
        assert!(fabric.has_triggered(gen0));

        barrier.advance();
        let gen1 = fabric.barrier_phase(barrier);
        assert!(!fabric.has_triggered(gen1));
        fabric.arrive(barrier, 2, Event::NONE);
        assert!(fabric.has_triggered(gen1));

        assert!(!barrier.has_exhausted());
        barrier.advance();
        barrier.advance();
        barrier.advance();
        assert!(barrier.has_exhausted());
    }

    #[test]
    fn phase_event_after_completion_is_triggered() {
        let fabric = EventFabric::new();
        let barrier = fabric.create_barrier(1, 2);
        fabric.arrive(barrier, 1, Event::NONE);
        // event requested only after all arrivals happened
        assert!(fabric.has_triggered(fabric.barrier_phase(barrier)));
    }
}
