use smallvec::SmallVec;
use std::fmt;

/// Shape of one tensor in a packed list, with stack storage for ≤4 dims.
///
/// Dimensions are kept as `u64` because the packed format records them as
/// signed 64-bit values; negative sizes are rejected before a `Shape` exists.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[u64; 4]>,
}

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: &[u64]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Scalar shape (0 dimensions).
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Get dimension sizes as a slice.
    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    /// Total number of elements, or `None` if the product does not fit the
    /// format's signed 64-bit element count.
    pub fn checked_numel(&self) -> Option<u64> {
        if self.dims.contains(&0) {
            return Some(0);
        }
        let mut n: u64 = 1;
        for &d in &self.dims {
            n = n.checked_mul(d)?;
        }
        if n > i64::MAX as u64 {
            return None;
        }
        Some(n)
    }

    /// Total number of elements. Scalars hold one element.
    ///
    /// # Panics
    /// Panics if the element count overflows; shapes produced by the decoder
    /// never do.
    pub fn numel(&self) -> u64 {
        self.checked_numel().expect("shape element count overflows i64")
    }

    /// Whether this is a scalar (0-dimensional).
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return write!(f, "[]");
        }
        let parts: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", parts.join("x"))
    }
}

impl From<&[u64]> for Shape {
    fn from(dims: &[u64]) -> Self {
        Self::new(dims)
    }
}

impl<const N: usize> From<[u64; N]> for Shape {
    fn from(dims: [u64; N]) -> Self {
        Self::new(&dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numel() {
        assert_eq!(Shape::new(&[2, 3, 4]).numel(), 24);
        assert_eq!(Shape::scalar().numel(), 1);
        assert_eq!(Shape::new(&[7, 0, 3]).numel(), 0);
    }

    #[test]
    fn test_zero_dim_wins_over_overflow() {
        assert_eq!(Shape::new(&[1 << 40, 1 << 40, 0]).checked_numel(), Some(0));
        assert_eq!(Shape::new(&[u64::MAX, 0, u64::MAX]).numel(), 0);
    }

    #[test]
    fn test_overflow_detected() {
        assert_eq!(Shape::new(&[u64::MAX, 2]).checked_numel(), None);
        // Fits u64 but not the signed count the format stores.
        assert_eq!(Shape::new(&[1 << 32, 1 << 31]).checked_numel(), None);
        assert_eq!(Shape::new(&[1 << 31, 1 << 31]).checked_numel(), Some(1 << 62));
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(&[10, 10]).to_string(), "[10x10]");
        assert_eq!(Shape::scalar().to_string(), "[]");
        assert_eq!(format!("{:?}", Shape::from([5u64])), "Shape([5])");
    }
}
