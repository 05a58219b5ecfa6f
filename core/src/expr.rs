use core::fmt;
use std::collections::BTreeMap;

use parking_lot::Mutex;
use smallvec::SmallVec;
use winter_utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable};

use crate::TreeId;

// INTERVAL SET
// ================================================================================================

/// The value form of an index-space expression: a normalized union of
/// half-open intervals over a one-dimensional coordinate space.
///
/// Normalization sorts the spans, merges adjacent and overlapping spans, and
/// drops empty ones, so equal point sets compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntervalSet {
    spans: SmallVec<[(u64, u64); 4]>,
}

impl IntervalSet {
    pub const EMPTY: Self = Self { spans: SmallVec::new_const() };

    /// Builds a normalized set from arbitrary `[lo, hi)` spans.
    pub fn from_spans(spans: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut spans: SmallVec<[(u64, u64); 4]> =
            spans.into_iter().filter(|(lo, hi)| lo < hi).collect();
        spans.sort_unstable();
        let mut normalized: SmallVec<[(u64, u64); 4]> = SmallVec::new();
        for (lo, hi) in spans {
            match normalized.last_mut() {
                Some((_, prev_hi)) if lo <= *prev_hi => *prev_hi = (*prev_hi).max(hi),
                _ => normalized.push((lo, hi)),
            }
        }
        Self { spans: normalized }
    }

    /// A single contiguous `[lo, hi)` interval.
    pub fn interval(lo: u64, hi: u64) -> Self {
        Self::from_spans([(lo, hi)])
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total number of points covered.
    pub fn volume(&self) -> u64 {
        self.spans.iter().map(|(lo, hi)| hi - lo).sum()
    }

    pub fn spans(&self) -> &[(u64, u64)] {
        &self.spans
    }

    pub fn union(&self, other: &Self) -> Self {
        Self::from_spans(self.spans.iter().chain(other.spans.iter()).copied())
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut out: SmallVec<[(u64, u64); 4]> = SmallVec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.spans.len() && j < other.spans.len() {
            let (alo, ahi) = self.spans[i];
            let (blo, bhi) = other.spans[j];
            let lo = alo.max(blo);
            let hi = ahi.min(bhi);
            if lo < hi {
                out.push((lo, hi));
            }
            if ahi <= bhi {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { spans: out }
    }

    pub fn subtract(&self, other: &Self) -> Self {
        let mut out: SmallVec<[(u64, u64); 4]> = SmallVec::new();
        let mut j = 0;
        for &(lo, hi) in &self.spans {
            let mut cursor = lo;
            while j < other.spans.len() && other.spans[j].1 <= cursor {
                j += 1;
            }
            let mut k = j;
            while k < other.spans.len() && other.spans[k].0 < hi {
                let (blo, bhi) = other.spans[k];
                if cursor < blo {
                    out.push((cursor, blo.min(hi)));
                }
                cursor = cursor.max(bhi);
                if cursor >= hi {
                    break;
                }
                k += 1;
            }
            if cursor < hi {
                out.push((cursor, hi));
            }
        }
        Self { spans: out }
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (lo, hi)) in self.spans.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{lo}..{hi}")?;
        }
        write!(f, "]")
    }
}

impl Serializable for IntervalSet {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u32(self.spans.len() as u32);
        for (lo, hi) in &self.spans {
            target.write_u64(*lo);
            target.write_u64(*hi);
        }
    }
}

impl Deserializable for IntervalSet {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let len = source.read_u32()? as usize;
        let mut spans = Vec::with_capacity(len);
        for _ in 0..len {
            let lo = source.read_u64()?;
            let hi = source.read_u64()?;
            if lo >= hi {
                return Err(DeserializationError::InvalidValue(format!(
                    "malformed interval {lo}..{hi}"
                )));
            }
            spans.push((lo, hi));
        }
        Ok(Self::from_spans(spans))
    }
}

// EXPRESSION FOREST
// ================================================================================================

/// Handle to an interned index-space expression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(u32);

impl ExprId {
    pub const fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expr{}", self.0)
    }
}

/// Interns index-space expressions and provides the set algebra over them.
///
/// Expressions with equal point sets intern to the same handle, so handle
/// equality is set equality. Derived expressions (unions, intersections,
/// differences) are canonicalized before interning.
#[derive(Debug, Default)]
pub struct ExpressionForest {
    inner: Mutex<ForestInner>,
}

#[derive(Debug, Default)]
struct ForestInner {
    exprs: Vec<IntervalSet>,
    index: BTreeMap<IntervalSet, ExprId>,
}

impl ExpressionForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, set: IntervalSet) -> ExprId {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.index.get(&set) {
            return *id;
        }
        let id = ExprId(inner.exprs.len() as u32);
        inner.exprs.push(set.clone());
        inner.index.insert(set, id);
        id
    }

    /// The value form of the expression behind a handle.
    pub fn get(&self, id: ExprId) -> IntervalSet {
        self.inner.lock().exprs[id.0 as usize].clone()
    }

    pub fn empty(&self) -> ExprId {
        self.intern(IntervalSet::EMPTY)
    }

    pub fn union(&self, a: ExprId, b: ExprId) -> ExprId {
        if a == b {
            return a;
        }
        let (sa, sb) = (self.get(a), self.get(b));
        self.intern(sa.union(&sb))
    }

    pub fn union_many(&self, ids: &[ExprId]) -> ExprId {
        let mut spans = Vec::new();
        for id in ids {
            spans.extend(self.get(*id).spans().iter().copied());
        }
        self.intern(IntervalSet::from_spans(spans))
    }

    pub fn intersect(&self, a: ExprId, b: ExprId) -> ExprId {
        if a == b {
            return a;
        }
        let (sa, sb) = (self.get(a), self.get(b));
        self.intern(sa.intersect(&sb))
    }

    pub fn subtract(&self, a: ExprId, b: ExprId) -> ExprId {
        let (sa, sb) = (self.get(a), self.get(b));
        self.intern(sa.subtract(&sb))
    }

    pub fn volume(&self, id: ExprId) -> u64 {
        self.inner.lock().exprs[id.0 as usize].volume()
    }

    pub fn is_empty(&self, id: ExprId) -> bool {
        self.inner.lock().exprs[id.0 as usize].is_empty()
    }

    /// Serializes the expression by value so a peer with a different forest
    /// can reconstruct it.
    pub fn pack_expression<W: ByteWriter>(&self, id: ExprId, target: &mut W) {
        self.get(id).write_into(target);
    }

    /// Reads an expression serialized by [`Self::pack_expression`] and interns
    /// it into this forest.
    pub fn unpack_expression<R: ByteReader>(
        &self,
        source: &mut R,
    ) -> Result<ExprId, DeserializationError> {
        Ok(self.intern(IntervalSet::read_from(source)?))
    }
}

// REGION
// ================================================================================================

/// A logical region: one region tree plus the expression covering the
/// region's index space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region {
    pub tree_id: TreeId,
    pub expr: ExprId,
}

impl Region {
    pub const fn new(tree_id: TreeId, expr: ExprId) -> Self {
        Self { tree_id, expr }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tree_id, self.expr)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use winter_utils::SliceReader;

    use super::*;

    #[test]
    fn normalization_merges_spans() {
        let set = IntervalSet::from_spans([(5, 10), (0, 5), (20, 30), (8, 12)]);
        assert_eq!(set.spans(), &[(0, 12), (20, 30)]);
        assert_eq!(set.volume(), 22);
    }

    #[test]
    fn subtract_splits_spans() {
        let a = IntervalSet::interval(0, 100);
        let b = IntervalSet::from_spans([(10, 20), (50, 60)]);
        assert_eq!(a.subtract(&b).spans(), &[(0, 10), (20, 50), (60, 100)]);
    }

    #[test]
    fn interning_is_canonical() {
        let forest = ExpressionForest::new();
        let a = forest.intern(IntervalSet::from_spans([(0, 5), (5, 10)]));
        let b = forest.intern(IntervalSet::interval(0, 10));
        assert_eq!(a, b);

        let c = forest.intern(IntervalSet::interval(0, 5));
        let d = forest.intern(IntervalSet::interval(5, 10));
        assert_eq!(forest.union(c, d), a);
        assert_eq!(forest.intersect(c, d), forest.empty());
    }

    #[test]
    fn pack_unpack_reinterns() {
        let forest = ExpressionForest::new();
        let id = forest.intern(IntervalSet::from_spans([(3, 9), (12, 40)]));
        let mut bytes = Vec::new();
        forest.pack_expression(id, &mut bytes);

        let peer = ExpressionForest::new();
        let unpacked = peer.unpack_expression(&mut SliceReader::new(&bytes)).unwrap();
        assert_eq!(peer.get(unpacked), forest.get(id));
    }

    proptest! {
        #[test]
        fn set_algebra_laws(
            a in proptest::collection::vec((0u64..64, 1u64..16), 0..6),
            b in proptest::collection::vec((0u64..64, 1u64..16), 0..6),
        ) {
            let a = IntervalSet::from_spans(a.into_iter().map(|(lo, len)| (lo, lo + len)));
            let b = IntervalSet::from_spans(b.into_iter().map(|(lo, len)| (lo, lo + len)));

            // inclusion-exclusion on volumes
            let union = a.union(&b);
            let inter = a.intersect(&b);
            prop_assert_eq!(union.volume() + inter.volume(), a.volume() + b.volume());

            // difference laws
            prop_assert_eq!(a.subtract(&b).volume(), a.volume() - inter.volume());
            prop_assert!(a.subtract(&b).intersect(&b).is_empty());
        }
    }
}
