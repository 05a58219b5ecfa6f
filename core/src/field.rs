use core::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign},
};
use std::collections::BTreeMap;

use winter_utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable};

// FIELD MASK
// ================================================================================================

/// Maximum number of fields in a field space.
pub const MAX_FIELDS: usize = 256;

const MASK_WORDS: usize = MAX_FIELDS / 64;

/// A fixed-width bitmask over the fields of a field space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldMask {
    words: [u64; MASK_WORDS],
}

impl FieldMask {
    /// The empty mask.
    pub const EMPTY: Self = Self { words: [0; MASK_WORDS] };

    /// Returns a mask with the single given bit set.
    pub fn single(bit: usize) -> Self {
        let mut mask = Self::EMPTY;
        mask.set_bit(bit);
        mask
    }

    /// Returns a mask with all of the given bits set.
    pub fn from_bits(bits: &[usize]) -> Self {
        let mut mask = Self::EMPTY;
        for &bit in bits {
            mask.set_bit(bit);
        }
        mask
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn set_bit(&mut self, bit: usize) {
        assert!(bit < MAX_FIELDS);
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    pub fn clear_bit(&mut self, bit: usize) {
        assert!(bit < MAX_FIELDS);
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    pub fn contains_bit(&self, bit: usize) -> bool {
        assert!(bit < MAX_FIELDS);
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// Returns true if the two masks share at least one set bit.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.words.iter().zip(other.words.iter()).any(|(a, b)| a & b != 0)
    }

    /// Returns true if every bit of `other` is also set in `self`.
    pub fn contains(&self, other: &Self) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| a & b == *b)
    }

    pub fn pop_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates the indices of the set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, word)| {
            (0..64).filter_map(move |bi| (word & (1 << bi) != 0).then_some(wi * 64 + bi))
        })
    }
}

impl BitOr for FieldMask {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        self |= rhs;
        self
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a |= b;
        }
    }
}

impl BitAnd for FieldMask {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        self &= rhs;
        self
    }
}

impl BitAndAssign for FieldMask {
    fn bitand_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= b;
        }
    }
}

impl Sub for FieldMask {
    type Output = Self;

    fn sub(mut self, rhs: Self) -> Self {
        self -= rhs;
        self
    }
}

impl SubAssign for FieldMask {
    fn sub_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= !b;
        }
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use itertools::Itertools;
        write!(f, "{{{}}}", self.iter().format(","))
    }
}

impl Serializable for FieldMask {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        for word in &self.words {
            target.write_u64(*word);
        }
    }
}

impl Deserializable for FieldMask {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let mut words = [0u64; MASK_WORDS];
        for word in words.iter_mut() {
            *word = source.read_u64()?;
        }
        Ok(Self { words })
    }
}

// FIELD MASK SET
// ================================================================================================

/// An ordered map from elements to the field masks under which they are live.
///
/// The aggregate valid mask (the union of all entry masks) is maintained
/// incrementally so that overlap queries against the whole set are cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMaskSet<T: Ord> {
    entries: BTreeMap<T, FieldMask>,
    valid: FieldMask,
}

impl<T: Ord> Default for FieldMaskSet<T> {
    fn default() -> Self {
        Self { entries: BTreeMap::new(), valid: FieldMask::EMPTY }
    }
}

impl<T: Ord + Clone> FieldMaskSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the element with the given mask, unioning with any existing
    /// mask. Returns true if the element was not previously present.
    pub fn insert(&mut self, element: T, mask: FieldMask) -> bool {
        if mask.is_empty() {
            return false;
        }
        self.valid |= mask;
        match self.entries.get_mut(&element) {
            Some(existing) => {
                *existing |= mask;
                false
            },
            None => {
                self.entries.insert(element, mask);
                true
            },
        }
    }

    pub fn get(&self, element: &T) -> Option<&FieldMask> {
        self.entries.get(element)
    }

    pub fn remove(&mut self, element: &T) -> Option<FieldMask> {
        let removed = self.entries.remove(element);
        if removed.is_some() {
            self.recompute_valid();
        }
        removed
    }

    /// Removes the given fields from every entry, dropping entries whose mask
    /// becomes empty.
    pub fn filter(&mut self, mask: FieldMask) {
        if !self.valid.overlaps(&mask) {
            return;
        }
        self.entries.retain(|_, entry| {
            *entry -= mask;
            !entry.is_empty()
        });
        self.recompute_valid();
    }

    /// Restricts every entry to the given fields, dropping entries whose mask
    /// becomes empty.
    pub fn restrict(&mut self, mask: FieldMask) {
        self.entries.retain(|_, entry| {
            *entry &= mask;
            !entry.is_empty()
        });
        self.recompute_valid();
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T, &mut FieldMask) -> bool) {
        self.entries.retain(|element, mask| keep(element, mask));
        self.recompute_valid();
    }

    /// The union of all entry masks.
    pub fn valid_mask(&self) -> FieldMask {
        self.valid
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.valid = FieldMask::EMPTY;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&T, &FieldMask)> {
        self.entries.iter()
    }

    /// Decomposes the set into groups of elements that share exactly the same
    /// fields. The returned groups have pairwise-disjoint masks whose union is
    /// the set's valid mask.
    pub fn compute_field_sets(&self) -> Vec<FieldSet<T>> {
        let mut sets: Vec<FieldSet<T>> = Vec::new();
        for (element, mask) in &self.entries {
            let mut remaining = *mask;
            let mut split: Vec<FieldSet<T>> = Vec::new();
            for set in sets.iter_mut() {
                if remaining.is_empty() {
                    break;
                }
                let overlap = set.mask & remaining;
                if overlap.is_empty() {
                    continue;
                }
                if overlap == set.mask {
                    // the whole group also carries this element
                    set.elements.push(element.clone());
                } else {
                    // split the group into the overlapping and disjoint parts
                    let mut carried = set.elements.clone();
                    carried.push(element.clone());
                    set.mask -= overlap;
                    split.push(FieldSet { mask: overlap, elements: carried });
                }
                remaining -= overlap;
            }
            sets.extend(split);
            if !remaining.is_empty() {
                sets.push(FieldSet { mask: remaining, elements: vec![element.clone()] });
            }
        }
        sets
    }

    fn recompute_valid(&mut self) {
        self.valid = FieldMask::EMPTY;
        for mask in self.entries.values() {
            self.valid |= *mask;
        }
    }
}

impl<T: Ord + Clone> FromIterator<(T, FieldMask)> for FieldMaskSet<T> {
    fn from_iter<I: IntoIterator<Item = (T, FieldMask)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (element, mask) in iter {
            set.insert(element, mask);
        }
        set
    }
}

/// One group produced by [`FieldMaskSet::compute_field_sets`]: the elements
/// that are all live under exactly the fields in `mask`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSet<T> {
    pub mask: FieldMask,
    pub elements: Vec<T>,
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[0, 1], &[1, 2], &[1])]
    #[case(&[5], &[7], &[])]
    #[case(&[63, 64], &[64, 65], &[64])]
    fn mask_intersection_cases(
        #[case] a: &[usize],
        #[case] b: &[usize],
        #[case] expected: &[usize],
    ) {
        assert_eq!(
            FieldMask::from_bits(a) & FieldMask::from_bits(b),
            FieldMask::from_bits(expected)
        );
    }

    #[test]
    fn mask_algebra() {
        let a = FieldMask::from_bits(&[0, 3, 64, 200]);
        let b = FieldMask::from_bits(&[3, 200, 255]);

        assert_eq!(a & b, FieldMask::from_bits(&[3, 200]));
        assert_eq!(a | b, FieldMask::from_bits(&[0, 3, 64, 200, 255]));
        assert_eq!(a - b, FieldMask::from_bits(&[0, 64]));
        assert!(a.overlaps(&b));
        assert!(!a.contains(&b));
        assert!((a | b).contains(&b));
        assert_eq!(a.pop_count(), 4);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 3, 64, 200]);
    }

    #[test]
    fn mask_set_insert_and_filter() {
        let mut set = FieldMaskSet::new();
        assert!(set.insert("a", FieldMask::from_bits(&[0, 1])));
        assert!(!set.insert("a", FieldMask::from_bits(&[2])));
        assert!(set.insert("b", FieldMask::from_bits(&[1, 2])));
        assert_eq!(set.valid_mask(), FieldMask::from_bits(&[0, 1, 2]));

        set.filter(FieldMask::from_bits(&[1, 2]));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&"a"), Some(&FieldMask::single(0)));
        assert_eq!(set.valid_mask(), FieldMask::single(0));
    }

    #[test]
    fn field_set_decomposition_is_disjoint() {
        let mut set = FieldMaskSet::new();
        set.insert("a", FieldMask::from_bits(&[0, 1, 2]));
        set.insert("b", FieldMask::from_bits(&[1, 2, 3]));
        set.insert("c", FieldMask::from_bits(&[2]));

        let groups = set.compute_field_sets();

        // groups must be pairwise disjoint and union back to the valid mask
        let mut union = FieldMask::EMPTY;
        for (i, g) in groups.iter().enumerate() {
            for other in groups.iter().skip(i + 1) {
                assert!(!g.mask.overlaps(&other.mask));
            }
            union |= g.mask;
        }
        assert_eq!(union, set.valid_mask());

        // every (element, field) pair must land in exactly one group
        for (element, mask) in set.iter() {
            for bit in mask.iter() {
                let hits = groups
                    .iter()
                    .filter(|g| g.mask.contains_bit(bit) && g.elements.contains(element))
                    .count();
                assert_eq!(hits, 1, "element {element} field {bit}");
            }
        }
    }
}
