use core::fmt;

use winter_utils::{ByteReader, ByteWriter, Deserializable, DeserializationError, Serializable};

/// Maximum dimensionality of an index point.
pub const MAX_POINT_DIM: usize = 3;

/// A point in an index space of up to [`MAX_POINT_DIM`] dimensions.
///
/// Operations inside an index launch are distinguished by their launch point;
/// single operations use the zero-dimensional point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainPoint {
    dim: u8,
    coords: [i64; MAX_POINT_DIM],
}

impl DomainPoint {
    /// The zero-dimensional point used by non-index operations.
    pub const ORIGIN: Self = Self { dim: 0, coords: [0; MAX_POINT_DIM] };

    pub fn new_1d(x: i64) -> Self {
        Self { dim: 1, coords: [x, 0, 0] }
    }

    pub fn new_2d(x: i64, y: i64) -> Self {
        Self { dim: 2, coords: [x, y, 0] }
    }

    pub fn new_3d(x: i64, y: i64, z: i64) -> Self {
        Self { dim: 3, coords: [x, y, z] }
    }

    pub fn dim(&self) -> usize {
        self.dim as usize
    }

    pub fn coord(&self, idx: usize) -> i64 {
        assert!(idx < self.dim as usize);
        self.coords[idx]
    }
}

impl Default for DomainPoint {
    fn default() -> Self {
        Self::ORIGIN
    }
}

impl From<i64> for DomainPoint {
    fn from(x: i64) -> Self {
        Self::new_1d(x)
    }
}

impl fmt::Display for DomainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for i in 0..self.dim as usize {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", self.coords[i])?;
        }
        write!(f, ")")
    }
}

impl Serializable for DomainPoint {
    fn write_into<W: ByteWriter>(&self, target: &mut W) {
        target.write_u8(self.dim);
        for coord in &self.coords[..self.dim as usize] {
            target.write_u64(*coord as u64);
        }
    }
}

impl Deserializable for DomainPoint {
    fn read_from<R: ByteReader>(source: &mut R) -> Result<Self, DeserializationError> {
        let dim = source.read_u8()?;
        if dim as usize > MAX_POINT_DIM {
            return Err(DeserializationError::InvalidValue(format!(
                "point dimension {dim} exceeds maximum of {MAX_POINT_DIM}"
            )));
        }
        let mut coords = [0i64; MAX_POINT_DIM];
        for coord in coords.iter_mut().take(dim as usize) {
            *coord = source.read_u64()? as i64;
        }
        Ok(Self { dim, coords })
    }
}
