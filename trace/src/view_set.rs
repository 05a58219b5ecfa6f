use core::fmt;
use std::{collections::BTreeMap, sync::Arc};

use phalanx_core::{
    ExprId, ExpressionForest, FieldMask, FieldMaskSet, Region, ViewId, ViewRegistry,
    serde::{ByteReader, ByteWriter, DeserializationError, Serializable},
};

// Re-exported here because the transposed form is what condition sets consume.
/// A mapping from index-space expression to the views valid on it, the
/// transposed form of a [`TraceViewSet`].
pub type ExprViews = BTreeMap<ExprId, FieldMaskSet<ViewId>>;

// FAILED PRECONDITION
// ================================================================================================

/// Describes the first condition that kept a template from matching, used by
/// the consecutive-rejection warning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedPrecondition {
    pub view: ViewId,
    pub expr: ExprId,
    pub mask: FieldMask,
}

impl FailedPrecondition {
    /// Renders the failure with the view's instance details when the registry
    /// still knows the view.
    pub fn describe(&self, forest: &ExpressionForest, views: &ViewRegistry) -> String {
        let expr = forest.get(self.expr);
        match views.get(self.view) {
            Some(view) => {
                format!("fields {} of {} over {} in {}", self.mask, self.view, expr, view.memory)
            },
            None => format!("fields {} of {} over {}", self.mask, self.view, expr),
        }
    }
}

impl fmt::Display for FailedPrecondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fields {} of {} over {}", self.mask, self.view, self.expr)
    }
}

// TRACE VIEW SET
// ================================================================================================

/// The algebraic substrate for reasoning about which fields of which
/// sub-regions of which instances a trace references.
///
/// Maintains the invariant that for any (view, field) pair at most one
/// expression entry exists; inserts that would violate it union the covering
/// expressions instead, canonicalizing to the region's own expression
/// whenever the union covers the whole region.
#[derive(Clone, Debug)]
pub struct TraceViewSet {
    forest: Arc<ExpressionForest>,
    region: Region,
    conditions: BTreeMap<ViewId, FieldMaskSet<ExprId>>,
}

impl TraceViewSet {
    pub fn new(forest: Arc<ExpressionForest>, region: Region) -> Self {
        Self { forest, region, conditions: BTreeMap::new() }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ViewId, &FieldMaskSet<ExprId>)> {
        self.conditions.iter()
    }

    /// Inserts `(view, expr, mask)`, preserving one-expression-per-field.
    pub fn insert(&mut self, view: ViewId, expr: ExprId, mask: FieldMask) {
        if mask.is_empty() {
            return;
        }
        let expr = self.canonicalize(expr);
        let existing = self.conditions.get(&view).cloned().unwrap_or_default();
        let mut rebuilt = FieldMaskSet::new();
        let mut remaining = mask;
        for (prev_expr, prev_mask) in existing.iter() {
            let overlap = *prev_mask & remaining;
            if overlap.is_empty() {
                rebuilt.insert(*prev_expr, *prev_mask);
                continue;
            }
            let merged = self.canonicalize(self.forest.union(*prev_expr, expr));
            rebuilt.insert(merged, overlap);
            let rest = *prev_mask - overlap;
            if !rest.is_empty() {
                rebuilt.insert(*prev_expr, rest);
            }
            remaining -= overlap;
        }
        if !remaining.is_empty() {
            rebuilt.insert(expr, remaining);
        }
        self.conditions.insert(view, rebuilt);
    }

    /// Removes `(expr, mask)` coverage from the view's entries.
    pub fn invalidate(&mut self, view: ViewId, expr: ExprId, mask: FieldMask) {
        let Some(entries) = self.conditions.get_mut(&view) else {
            return;
        };
        let covers_region =
            self.forest.volume(self.forest.intersect(expr, self.region.expr))
                == self.forest.volume(self.region.expr);
        if covers_region {
            entries.filter(mask);
        } else {
            let mut rebuilt = FieldMaskSet::new();
            for (prev_expr, prev_mask) in entries.iter() {
                let overlap = *prev_mask & mask;
                if overlap.is_empty() {
                    rebuilt.insert(*prev_expr, *prev_mask);
                    continue;
                }
                let difference = self.forest.subtract(*prev_expr, expr);
                if !self.forest.is_empty(difference) {
                    rebuilt.insert(difference, overlap);
                }
                let rest = *prev_mask - overlap;
                if !rest.is_empty() {
                    rebuilt.insert(*prev_expr, rest);
                }
            }
            *entries = rebuilt;
        }
        if entries.is_empty() {
            self.conditions.remove(&view);
        }
    }

    /// Invalidates `(expr, mask)` on every view except `keep`.
    pub fn invalidate_all_but(&mut self, keep: ViewId, expr: ExprId, mask: FieldMask) {
        let others: Vec<ViewId> =
            self.conditions.keys().filter(|v| **v != keep).copied().collect();
        for view in others {
            self.invalidate(view, expr, mask);
        }
    }

    /// Folds every entry of `other` into this set.
    pub fn merge(&mut self, other: &TraceViewSet) {
        for (view, entries) in other.iter() {
            for (expr, mask) in entries.iter() {
                self.insert(*view, *expr, *mask);
            }
        }
    }

    /// Partitions `(view, expr, mask)` into the portion this set dominates
    /// and the portion it does not.
    ///
    /// Domination is all-or-nothing per field: a field is dominated only if
    /// this set's entry for it covers every point of `expr`.
    pub fn dominates(
        &self,
        view: ViewId,
        expr: ExprId,
        mask: FieldMask,
    ) -> (FieldMaskSet<ExprId>, FieldMaskSet<ExprId>) {
        let mut non_dominated = FieldMaskSet::new();
        let mut dominated = FieldMaskSet::new();
        let Some(entries) = self.conditions.get(&view) else {
            non_dominated.insert(expr, mask);
            return (non_dominated, dominated);
        };
        let expr_volume = self.forest.volume(expr);
        let mut remaining = mask;
        for (prev_expr, prev_mask) in entries.iter() {
            let overlap = *prev_mask & remaining;
            if overlap.is_empty() {
                continue;
            }
            let covered = *prev_expr == self.region.expr
                || self.forest.volume(self.forest.intersect(*prev_expr, expr)) == expr_volume;
            if covered {
                dominated.insert(expr, overlap);
            } else {
                non_dominated.insert(expr, overlap);
            }
            remaining -= overlap;
        }
        if !remaining.is_empty() {
            non_dominated.insert(expr, remaining);
        }
        (non_dominated, dominated)
    }

    /// Whether every `(view, expr, field)` of this set is dominated by
    /// `target`, or (with `allow_independent`) independent of `target`'s
    /// conditions on the same view.
    ///
    /// On failure, returns the first condition that is neither.
    pub fn subsumed_by(
        &self,
        target: &TraceViewSet,
        allow_independent: bool,
    ) -> Result<(), FailedPrecondition> {
        for (view, entries) in self.iter() {
            for (expr, mask) in entries.iter() {
                let (non_dominated, _) = target.dominates(*view, *expr, *mask);
                for (nd_expr, nd_mask) in non_dominated.iter() {
                    if allow_independent
                        && target.view_independent_of(*view, *nd_expr, *nd_mask)
                    {
                        continue;
                    }
                    return Err(FailedPrecondition { view: *view, expr: *nd_expr, mask: *nd_mask });
                }
            }
        }
        Ok(())
    }

    /// Whether no `(view, expr, field)` of this set overlaps one of
    /// `other`'s.
    pub fn independent_of(&self, other: &TraceViewSet) -> Result<(), FailedPrecondition> {
        for (view, entries) in self.iter() {
            for (expr, mask) in entries.iter() {
                if !other.view_independent_of(*view, *expr, *mask) {
                    return Err(FailedPrecondition { view: *view, expr: *expr, mask: *mask });
                }
            }
        }
        Ok(())
    }

    fn view_independent_of(&self, view: ViewId, expr: ExprId, mask: FieldMask) -> bool {
        let Some(entries) = self.conditions.get(&view) else {
            return true;
        };
        for (prev_expr, prev_mask) in entries.iter() {
            if !prev_mask.overlaps(&mask) {
                continue;
            }
            if !self.forest.is_empty(self.forest.intersect(*prev_expr, expr)) {
                return false;
            }
        }
        true
    }

    /// Inverts the set into a mapping from expression to views, decomposing
    /// overlapping expressions into pairwise-disjoint cells so no
    /// `(expression, field)` pair appears twice.
    pub fn transpose_uniquely(&self) -> ExprViews {
        // group (view, expr) pairs by the exact fields they share
        let mut pairs: FieldMaskSet<(ViewId, ExprId)> = FieldMaskSet::new();
        for (view, entries) in self.iter() {
            for (expr, mask) in entries.iter() {
                pairs.insert((*view, *expr), *mask);
            }
        }
        let mut out = ExprViews::new();
        for field_set in pairs.compute_field_sets() {
            // decompose this group's expressions into disjoint cells, carrying
            // the views whose expressions cover each cell
            let mut cells: Vec<(ExprId, Vec<ViewId>)> = Vec::new();
            for (view, expr) in &field_set.elements {
                let mut remaining = *expr;
                let mut split: Vec<(ExprId, Vec<ViewId>)> = Vec::new();
                for (cell_expr, cell_views) in cells.iter_mut() {
                    if self.forest.is_empty(remaining) {
                        break;
                    }
                    let overlap = self.forest.intersect(*cell_expr, remaining);
                    if self.forest.is_empty(overlap) {
                        continue;
                    }
                    if overlap == *cell_expr {
                        cell_views.push(*view);
                    } else {
                        let mut covered = cell_views.clone();
                        covered.push(*view);
                        *cell_expr = self.forest.subtract(*cell_expr, overlap);
                        split.push((overlap, covered));
                    }
                    remaining = self.forest.subtract(remaining, overlap);
                }
                cells.extend(split);
                if !self.forest.is_empty(remaining) {
                    cells.push((remaining, vec![*view]));
                }
            }
            for (cell_expr, cell_views) in cells {
                let entry = out.entry(cell_expr).or_default();
                for view in cell_views {
                    entry.insert(view, field_set.mask);
                }
            }
        }
        out
    }

    /// Serializes the set by value: expressions are written as interval sets
    /// so a peer with a different forest can reconstruct them.
    pub fn pack<W: ByteWriter>(&self, target: &mut W) {
        self.region.tree_id.write_into(target);
        self.forest.pack_expression(self.region.expr, target);
        target.write_u32(self.conditions.len() as u32);
        for (view, entries) in self.iter() {
            view.write_into(target);
            target.write_u32(entries.len() as u32);
            for (expr, mask) in entries.iter() {
                self.forest.pack_expression(*expr, target);
                mask.write_into(target);
            }
        }
    }

    /// Reconstructs a set serialized with [`Self::pack`], re-interning all
    /// expressions into `forest`.
    pub fn unpack<R: ByteReader>(
        forest: Arc<ExpressionForest>,
        source: &mut R,
    ) -> Result<Self, DeserializationError> {
        use phalanx_core::{TreeId, serde::Deserializable};
        let tree_id = TreeId::read_from(source)?;
        let region_expr = forest.unpack_expression(source)?;
        let region = Region::new(tree_id, region_expr);
        let mut set = Self::new(forest.clone(), region);
        let num_views = source.read_u32()? as usize;
        for _ in 0..num_views {
            let view = ViewId::read_from(source)?;
            let num_entries = source.read_u32()? as usize;
            for _ in 0..num_entries {
                let expr = forest.unpack_expression(source)?;
                let mask = FieldMask::read_from(source)?;
                set.insert(view, expr, mask);
            }
        }
        Ok(set)
    }

    /// Canonicalizes expressions that cover the whole region to the region's
    /// own expression.
    fn canonicalize(&self, expr: ExprId) -> ExprId {
        if expr != self.region.expr
            && self.forest.volume(expr) == self.forest.volume(self.region.expr)
            && self.forest.volume(self.forest.intersect(expr, self.region.expr))
                == self.forest.volume(self.region.expr)
        {
            self.region.expr
        } else {
            expr
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use phalanx_core::{IntervalSet, TreeId};
    use pretty_assertions::assert_eq;

    use super::*;

    fn setup() -> (Arc<ExpressionForest>, Region) {
        let forest = Arc::new(ExpressionForest::new());
        let expr = forest.intern(IntervalSet::interval(0, 100));
        (forest.clone(), Region::new(TreeId::new(1), expr))
    }

    fn view(id: u64) -> ViewId {
        ViewId::new(id)
    }

    #[test]
    fn one_expression_per_field() {
        let (forest, region) = setup();
        let mut set = TraceViewSet::new(forest.clone(), region);
        let lo = forest.intern(IntervalSet::interval(0, 50));
        let hi = forest.intern(IntervalSet::interval(50, 100));
        let mask = FieldMask::from_bits(&[0, 1]);

        set.insert(view(1), lo, mask);
        set.insert(view(1), hi, FieldMask::single(1));

        let entries = set.iter().next().unwrap().1;
        // field 0 still covered by lo; field 1 unioned to the full region and
        // canonicalized to the region expression
        assert_eq!(entries.get(&lo), Some(&FieldMask::single(0)));
        assert_eq!(entries.get(&region.expr), Some(&FieldMask::single(1)));
        for bit in [0usize, 1] {
            let covering: Vec<_> =
                entries.iter().filter(|(_, m)| m.contains_bit(bit)).collect();
            assert_eq!(covering.len(), 1);
        }
    }

    #[test]
    fn invalidate_region_covering_filters_fields() {
        let (forest, region) = setup();
        let mut set = TraceViewSet::new(forest.clone(), region);
        set.insert(view(1), region.expr, FieldMask::from_bits(&[0, 1]));

        set.invalidate(view(1), region.expr, FieldMask::single(0));
        let entries = set.iter().next().unwrap().1;
        assert_eq!(entries.get(&region.expr), Some(&FieldMask::single(1)));

        set.invalidate(view(1), region.expr, FieldMask::single(1));
        assert!(set.is_empty());
    }

    #[test]
    fn invalidate_partial_keeps_difference() {
        let (forest, region) = setup();
        let mut set = TraceViewSet::new(forest.clone(), region);
        set.insert(view(1), region.expr, FieldMask::single(0));

        let lo = forest.intern(IntervalSet::interval(0, 30));
        set.invalidate(view(1), lo, FieldMask::single(0));

        let expected = forest.intern(IntervalSet::interval(30, 100));
        let entries = set.iter().next().unwrap().1;
        assert_eq!(entries.get(&expected), Some(&FieldMask::single(0)));
    }

    #[test]
    fn dominates_is_per_field_all_or_nothing() {
        let (forest, region) = setup();
        let mut set = TraceViewSet::new(forest.clone(), region);
        let lo = forest.intern(IntervalSet::interval(0, 50));
        set.insert(view(1), region.expr, FieldMask::single(0));
        set.insert(view(1), lo, FieldMask::single(1));

        let probe = forest.intern(IntervalSet::interval(25, 75));
        let (non_dom, dom) = set.dominates(view(1), probe, FieldMask::from_bits(&[0, 1]));
        assert_eq!(dom.get(&probe), Some(&FieldMask::single(0)));
        assert_eq!(non_dom.get(&probe), Some(&FieldMask::single(1)));
    }

    #[test]
    fn subsumption_and_independence() {
        let (forest, region) = setup();
        let lo = forest.intern(IntervalSet::interval(0, 50));
        let hi = forest.intern(IntervalSet::interval(50, 100));

        let mut pre = TraceViewSet::new(forest.clone(), region);
        pre.insert(view(1), lo, FieldMask::single(0));

        let mut post = TraceViewSet::new(forest.clone(), region);
        post.insert(view(1), region.expr, FieldMask::single(0));
        assert!(pre.subsumed_by(&post, false).is_ok());

        // a read-only view only present in preconditions is independent when
        // the postconditions never touch its points
        let mut pre2 = TraceViewSet::new(forest.clone(), region);
        pre2.insert(view(2), hi, FieldMask::single(3));
        let mut post2 = TraceViewSet::new(forest.clone(), region);
        post2.insert(view(2), lo, FieldMask::single(3));
        assert!(pre2.subsumed_by(&post2, true).is_ok());
        let failed = pre2.subsumed_by(&post2, false).unwrap_err();
        assert_eq!(failed.view, view(2));

        assert!(post2.independent_of(&pre2).is_ok());
        let mut anti = TraceViewSet::new(forest.clone(), region);
        anti.insert(view(2), region.expr, FieldMask::single(3));
        assert!(post2.independent_of(&anti).is_err());
    }

    #[test]
    fn transpose_decomposes_overlaps() {
        let (forest, region) = setup();
        let mut set = TraceViewSet::new(forest.clone(), region);
        let lo = forest.intern(IntervalSet::interval(0, 60));
        let hi = forest.intern(IntervalSet::interval(40, 100));
        let mask = FieldMask::single(0);
        set.insert(view(1), lo, mask);
        set.insert(view(2), hi, mask);

        let transposed = set.transpose_uniquely();

        // cells must be pairwise disjoint
        let cells: Vec<ExprId> = transposed.keys().copied().collect();
        for (i, a) in cells.iter().enumerate() {
            for b in cells.iter().skip(i + 1) {
                assert!(forest.is_empty(forest.intersect(*a, *b)), "{a} overlaps {b}");
            }
        }

        // the middle cell carries both views
        let mid = forest.intern(IntervalSet::interval(40, 60));
        let mid_views = transposed.get(&mid).unwrap();
        assert!(mid_views.get(&view(1)).is_some());
        assert!(mid_views.get(&view(2)).is_some());
    }

    #[test]
    fn pack_unpack_preserves_triples() {
        let (forest, region) = setup();
        let mut set = TraceViewSet::new(forest.clone(), region);
        let lo = forest.intern(IntervalSet::interval(0, 50));
        set.insert(view(1), lo, FieldMask::from_bits(&[0, 2]));
        set.insert(view(2), region.expr, FieldMask::single(1));

        let mut bytes = Vec::new();
        set.pack(&mut bytes);

        let peer_forest = Arc::new(ExpressionForest::new());
        let unpacked = TraceViewSet::unpack(
            peer_forest.clone(),
            &mut phalanx_core::serde::SliceReader::new(&bytes),
        )
        .unwrap();

        let originals: Vec<(ViewId, IntervalSet, FieldMask)> = set
            .iter()
            .flat_map(|(v, es)| es.iter().map(|(e, m)| (*v, forest.get(*e), *m)))
            .collect();
        let roundtripped: Vec<(ViewId, IntervalSet, FieldMask)> = unpacked
            .iter()
            .flat_map(|(v, es)| es.iter().map(|(e, m)| (*v, peer_forest.get(*e), *m)))
            .collect();
        assert_eq!(originals, roundtripped);
    }
}
