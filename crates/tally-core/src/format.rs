//! Packed tensor-list format: one buffer describing a ragged list of tensors.
//!
//! Layout:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Pointer-table offset O: u64 LE (byte 0)       │
//! ├───────────────────────────────────────────────┤
//! │ Shape record 1:                               │
//! │   dimension count: i32 LE                     │
//! │   repetition count: i32 LE                    │
//! │   dimension count × i64 LE dimension sizes    │
//! │ Shape record 2 ...                            │
//! ├───────────────────────────────────────────────┤ ← byte O
//! │ N × u64 LE tensor base offsets                │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! `N` is the sum of all repetition counts: a record with repetition count
//! `k` describes `k` consecutive tensors of the same shape. Base offsets are
//! byte offsets into the data arena handed to the engine alongside the
//! packed buffer; they are resolved to element ranges by [`TensorList::bind`].

use std::ops::Range;

use crate::shape::Shape;

/// Size of the leading pointer-table offset and of each table entry.
const WORD: usize = 8;

/// Size of a shape record header (dimension count + repetition count).
const RECORD_HEADER: usize = 8;

/// Default cap on the number of tensors in one list.
pub const DEFAULT_MAX_TENSORS: usize = 1 << 16;

/// Default cap on the rank of a single tensor.
pub const DEFAULT_MAX_RANK: usize = 8;

/// Capacity limits checked while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_tensors: usize,
    pub max_rank: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_tensors: DEFAULT_MAX_TENSORS,
            max_rank: DEFAULT_MAX_RANK,
        }
    }
}

/// One tensor of a decoded list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub shape: Shape,
    pub element_count: u64,
    /// Byte offset of the first element inside the data arena.
    pub base_offset: u64,
}

impl TensorDescriptor {
    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }
}

/// An ordered list of tensor descriptors. Order is the packed order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorList {
    tensors: Vec<TensorDescriptor>,
}

impl TensorList {
    pub fn new(tensors: Vec<TensorDescriptor>) -> Self {
        Self { tensors }
    }

    /// Number of tensors in the list.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TensorDescriptor> {
        self.tensors.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TensorDescriptor> {
        self.tensors.iter()
    }

    /// Per-tensor element counts, in list order.
    pub fn element_counts(&self) -> Vec<u64> {
        self.tensors.iter().map(|t| t.element_count).collect()
    }

    /// Total number of elements across the list.
    pub fn total_elements(&self) -> u64 {
        self.tensors.iter().map(|t| t.element_count).sum()
    }

    /// Each tensor's element count rounded up to whole blocks, summed.
    pub fn total_blocks(&self, elements_per_block: u64) -> u64 {
        self.tensors
            .iter()
            .map(|t| blocks_for(t.element_count, elements_per_block))
            .sum()
    }

    /// Resolve every descriptor to an element range inside an arena of
    /// `arena_len` elements of `element_width` bytes each.
    pub fn bind(
        &self,
        element_width: usize,
        arena_len: usize,
    ) -> Result<Vec<Range<usize>>, FormatError> {
        let width = element_width as u64;
        self.tensors
            .iter()
            .enumerate()
            .map(|(index, t)| {
                if width == 0 || t.base_offset % width != 0 {
                    return Err(FormatError::MisalignedBase {
                        index,
                        base_offset: t.base_offset,
                        element_width,
                    });
                }
                let start = t.base_offset / width;
                let end = start
                    .checked_add(t.element_count)
                    .filter(|&end| end <= arena_len as u64)
                    .ok_or(FormatError::OutOfArena {
                        index,
                        base_offset: t.base_offset,
                        element_count: t.element_count,
                        arena_len,
                    })?;
                Ok(start as usize..end as usize)
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a TensorList {
    type Item = &'a TensorDescriptor;
    type IntoIter = std::slice::Iter<'a, TensorDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}

/// Number of alignment blocks covering `count` elements.
pub fn blocks_for(count: u64, elements_per_block: u64) -> u64 {
    if elements_per_block == 0 {
        return count;
    }
    count.div_ceil(elements_per_block)
}

/// Errors from packed tensor-list parsing and binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("packed buffer too small: {len} bytes")]
    TooSmall { len: usize },

    #[error("pointer-table offset {offset} is invalid for a {len}-byte buffer")]
    BadTableOffset { offset: u64, len: usize },

    #[error("shape record at byte {at} runs past the pointer table at {table}")]
    RecordOverrun { at: usize, table: usize },

    #[error("shape record at byte {at} has negative dimension count {rank}")]
    NegativeRank { at: usize, rank: i32 },

    #[error("shape record at byte {at} has rank {rank}, limit is {max}")]
    RankTooLarge { at: usize, rank: usize, max: usize },

    #[error("shape record at byte {at} has repetition count {count}")]
    BadRepetition { at: usize, count: i32 },

    #[error("shape record at byte {at} has negative dimension {dim}")]
    NegativeDim { at: usize, dim: i64 },

    #[error("shape record at byte {at} overflows the element count")]
    ElementOverflow { at: usize },

    #[error("tensor {index} of shape {shape} does not fit a 64-bit byte range")]
    TensorTooLarge { index: usize, shape: Shape },

    #[error("tensor list holds more than {max} tensors")]
    TooManyTensors { max: usize },

    #[error("pointer table needs {needed} bytes, buffer has {len}")]
    TruncatedPointerTable { needed: usize, len: usize },

    #[error("tensor {index}: base offset {base_offset} is not a multiple of element width {element_width}")]
    MisalignedBase {
        index: usize,
        base_offset: u64,
        element_width: usize,
    },

    #[error("tensor {index}: {element_count} elements at byte {base_offset} exceed the {arena_len}-element arena")]
    OutOfArena {
        index: usize,
        base_offset: u64,
        element_count: u64,
        arena_len: usize,
    },
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes = data.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn read_i64(data: &[u8], at: usize) -> Option<i64> {
    let bytes = data.get(at..at + 8)?;
    Some(i64::from_le_bytes(bytes.try_into().ok()?))
}

fn read_i32(data: &[u8], at: usize) -> Option<i32> {
    let bytes = data.get(at..at + 4)?;
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

/// Decode a packed tensor list. Pure; the buffer is not retained.
pub fn decode(data: &[u8], limits: &DecodeLimits) -> Result<TensorList, FormatError> {
    if data.len() < WORD {
        return Err(FormatError::TooSmall { len: data.len() });
    }

    let offset = read_u64(data, 0).ok_or(FormatError::TooSmall { len: data.len() })?;
    if offset < WORD as u64 || offset % WORD as u64 != 0 || offset > data.len() as u64 {
        return Err(FormatError::BadTableOffset {
            offset,
            len: data.len(),
        });
    }
    let table = offset as usize;

    let mut shapes: Vec<Shape> = Vec::new();
    let mut pos = WORD;
    while pos < table {
        let at = pos;
        if pos + RECORD_HEADER > table {
            return Err(FormatError::RecordOverrun { at, table });
        }
        let rank = read_i32(data, pos).ok_or(FormatError::RecordOverrun { at, table })?;
        let repeat = read_i32(data, pos + 4).ok_or(FormatError::RecordOverrun { at, table })?;
        pos += RECORD_HEADER;

        if rank < 0 {
            return Err(FormatError::NegativeRank { at, rank });
        }
        let rank = rank as usize;
        if rank > limits.max_rank {
            return Err(FormatError::RankTooLarge {
                at,
                rank,
                max: limits.max_rank,
            });
        }
        if repeat < 1 {
            return Err(FormatError::BadRepetition { at, count: repeat });
        }
        if pos + rank * WORD > table {
            return Err(FormatError::RecordOverrun { at, table });
        }

        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            let dim = read_i64(data, pos).ok_or(FormatError::RecordOverrun { at, table })?;
            if dim < 0 {
                return Err(FormatError::NegativeDim { at, dim });
            }
            dims.push(dim as u64);
            pos += WORD;
        }
        let shape = Shape::new(&dims);
        if shape.checked_numel().is_none() {
            return Err(FormatError::ElementOverflow { at });
        }

        let repeat = repeat as usize;
        if shapes.len() + repeat > limits.max_tensors {
            return Err(FormatError::TooManyTensors {
                max: limits.max_tensors,
            });
        }
        shapes.extend(std::iter::repeat(shape).take(repeat));
    }

    let needed = table + shapes.len() * WORD;
    if needed > data.len() {
        return Err(FormatError::TruncatedPointerTable {
            needed,
            len: data.len(),
        });
    }

    let tensors = shapes
        .into_iter()
        .enumerate()
        .map(|(i, shape)| {
            let base_offset = read_u64(data, table + i * WORD).unwrap_or_default();
            let element_count = shape.numel();
            TensorDescriptor {
                shape,
                element_count,
                base_offset,
            }
        })
        .collect();

    Ok(TensorList::new(tensors))
}

/// Builder for packed tensor lists.
///
/// Tensors pushed with [`push`](Self::push) are laid out back to back in the
/// data arena; [`push_at`](Self::push_at) places one at an explicit byte
/// offset.
pub struct TensorListBuilder {
    element_width: usize,
    merge_repeats: bool,
    tensors: Vec<TensorDescriptor>,
    next_offset: u64,
}

impl TensorListBuilder {
    /// Create a builder for elements of `element_width` bytes.
    pub fn new(element_width: usize) -> Self {
        Self {
            element_width,
            merge_repeats: false,
            tensors: Vec::new(),
            next_offset: 0,
        }
    }

    /// Encode runs of identical shapes as one record with a repetition count.
    pub fn merge_repeats(mut self, merge: bool) -> Self {
        self.merge_repeats = merge;
        self
    }

    /// Append a tensor directly after the previous contiguous one.
    ///
    /// # Panics
    /// Panics if the tensor's byte extent overflows; see
    /// [`try_push`](Self::try_push).
    pub fn push(&mut self, dims: &[u64]) -> &mut Self {
        let base = self.next_offset;
        self.push_at(dims, base)
    }

    /// Append a tensor whose data starts at byte `base_offset`.
    ///
    /// # Panics
    /// Panics if the tensor's byte extent overflows; see
    /// [`try_push_at`](Self::try_push_at).
    pub fn push_at(&mut self, dims: &[u64], base_offset: u64) -> &mut Self {
        if let Err(e) = self.try_push_at(dims, base_offset) {
            panic!("{e}");
        }
        self
    }

    /// Fallible [`push`](Self::push) for shapes from untrusted input.
    pub fn try_push(&mut self, dims: &[u64]) -> Result<&mut Self, FormatError> {
        let base = self.next_offset;
        self.try_push_at(dims, base)
    }

    /// Fallible [`push_at`](Self::push_at).
    pub fn try_push_at(&mut self, dims: &[u64], base_offset: u64) -> Result<&mut Self, FormatError> {
        let shape = Shape::new(dims);
        let end = shape.checked_numel().and_then(|count| {
            let bytes = count.checked_mul(self.element_width as u64)?;
            Some((count, base_offset.checked_add(bytes)?))
        });
        let Some((element_count, end)) = end else {
            return Err(FormatError::TensorTooLarge {
                index: self.tensors.len(),
                shape,
            });
        };
        self.next_offset = self.next_offset.max(end);
        self.tensors.push(TensorDescriptor {
            shape,
            element_count,
            base_offset,
        });
        Ok(self)
    }

    /// Arena length, in elements, needed to hold every pushed tensor.
    pub fn arena_len(&self) -> usize {
        (self.next_offset as usize).div_ceil(self.element_width.max(1))
    }

    /// Serialize to the packed layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut records: Vec<(&Shape, i32)> = Vec::new();
        for t in &self.tensors {
            match records.last_mut() {
                Some((shape, count)) if self.merge_repeats && **shape == t.shape && *count < i32::MAX => {
                    *count += 1;
                }
                _ => records.push((&t.shape, 1)),
            }
        }

        let table: usize = WORD
            + records
                .iter()
                .map(|(shape, _)| RECORD_HEADER + shape.ndim() * WORD)
                .sum::<usize>();

        let mut buf = Vec::with_capacity(table + self.tensors.len() * WORD);
        buf.extend_from_slice(&(table as u64).to_le_bytes());
        for (shape, count) in &records {
            buf.extend_from_slice(&(shape.ndim() as i32).to_le_bytes());
            buf.extend_from_slice(&count.to_le_bytes());
            for &d in shape.dims() {
                buf.extend_from_slice(&(d as i64).to_le_bytes());
            }
        }
        for t in &self.tensors {
            buf.extend_from_slice(&t.base_offset.to_le_bytes());
        }
        buf
    }

    /// The list this builder describes, without a serialization round trip.
    pub fn build(&self) -> TensorList {
        TensorList::new(self.tensors.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TensorListBuilder {
        let mut b = TensorListBuilder::new(4);
        b.push(&[5]).push(&[0]).push(&[10, 10]);
        b
    }

    #[test]
    fn test_decode_sample() {
        let bytes = sample().to_bytes();
        let list = decode(&bytes, &DecodeLimits::default()).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.element_counts(), vec![5, 0, 100]);
        assert_eq!(list.get(0).unwrap().base_offset, 0);
        assert_eq!(list.get(1).unwrap().base_offset, 20);
        assert_eq!(list.get(2).unwrap().base_offset, 20);
        assert_eq!(list.get(2).unwrap().shape.dims(), &[10, 10]);
        assert_eq!(list, sample().build());
    }

    #[test]
    fn test_total_blocks() {
        let list = sample().build();
        assert_eq!(list.total_elements(), 105);
        assert_eq!(list.total_blocks(8), 1 + 0 + 13);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let bytes = sample().to_bytes();
        let a = decode(&bytes, &DecodeLimits::default()).unwrap();
        let b = decode(&bytes, &DecodeLimits::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_repetition_count_expands() {
        let mut b = TensorListBuilder::new(4).merge_repeats(true);
        b.push(&[3, 2]).push(&[3, 2]).push(&[3, 2]).push(&[1]);
        let merged = b.to_bytes();
        // One record of rank 2 + one record of rank 1.
        assert_eq!(u64::from_le_bytes(merged[0..8].try_into().unwrap()), 8 + 24 + 16);
        assert_eq!(i32::from_le_bytes(merged[12..16].try_into().unwrap()), 3);

        let list = decode(&merged, &DecodeLimits::default()).unwrap();
        assert_eq!(list.element_counts(), vec![6, 6, 6, 1]);
        assert_eq!(list.get(2).unwrap().base_offset, 2 * 24);
        assert_eq!(list, b.build());
    }

    #[test]
    fn test_scalar_record() {
        let mut b = TensorListBuilder::new(4);
        b.push(&[]);
        let list = decode(&b.to_bytes(), &DecodeLimits::default()).unwrap();
        assert_eq!(list.element_counts(), vec![1]);
        assert!(list.get(0).unwrap().shape.is_scalar());
    }

    #[test]
    fn test_empty_list() {
        let list = decode(&8u64.to_le_bytes(), &DecodeLimits::default()).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.total_blocks(8), 0);
    }

    #[test]
    fn test_too_small() {
        assert_eq!(
            decode(&[0u8; 4], &DecodeLimits::default()),
            Err(FormatError::TooSmall { len: 4 })
        );
    }

    #[test]
    fn test_bad_table_offset() {
        let mut bytes = sample().to_bytes();
        bytes[0..8].copy_from_slice(&12u64.to_le_bytes());
        assert!(matches!(
            decode(&bytes, &DecodeLimits::default()),
            Err(FormatError::BadTableOffset { offset: 12, .. })
        ));
        bytes[0..8].copy_from_slice(&4096u64.to_le_bytes());
        assert!(matches!(
            decode(&bytes, &DecodeLimits::default()),
            Err(FormatError::BadTableOffset { .. })
        ));
    }

    #[test]
    fn test_record_runs_past_table() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&24u64.to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes()); // claims two dims
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&4i64.to_le_bytes()); // only one present
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(
            decode(&bytes, &DecodeLimits::default()),
            Err(FormatError::RecordOverrun { at: 8, table: 24 })
        );
    }

    #[test]
    fn test_limits_enforced() {
        let mut b = TensorListBuilder::new(4).merge_repeats(true);
        for _ in 0..5 {
            b.push(&[2]);
        }
        let bytes = b.to_bytes();
        let tight = DecodeLimits { max_tensors: 4, max_rank: 8 };
        assert_eq!(decode(&bytes, &tight), Err(FormatError::TooManyTensors { max: 4 }));

        let mut deep = TensorListBuilder::new(4);
        deep.push(&[1, 1, 1]);
        let shallow = DecodeLimits { max_tensors: 16, max_rank: 2 };
        assert!(matches!(
            decode(&deep.to_bytes(), &shallow),
            Err(FormatError::RankTooLarge { rank: 3, max: 2, .. })
        ));
    }

    #[test]
    fn test_negative_fields_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&24u64.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&(-3i64).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(
            decode(&bytes, &DecodeLimits::default()),
            Err(FormatError::NegativeDim { at: 8, dim: -3 })
        );

        bytes[12..16].copy_from_slice(&0i32.to_le_bytes());
        assert_eq!(
            decode(&bytes, &DecodeLimits::default()),
            Err(FormatError::BadRepetition { at: 8, count: 0 })
        );
    }

    #[test]
    fn test_zero_dim_after_huge_dims() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&40u64.to_le_bytes());
        bytes.extend_from_slice(&3i32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        for d in [1i64 << 40, 1 << 40, 0] {
            bytes.extend_from_slice(&d.to_le_bytes());
        }
        bytes.extend_from_slice(&0u64.to_le_bytes());

        let list = decode(&bytes, &DecodeLimits::default()).unwrap();
        assert_eq!(list.element_counts(), vec![0]);
        assert!(list.get(0).unwrap().is_empty());
        assert_eq!(list.total_blocks(8), 0);
    }

    #[test]
    fn test_builder_rejects_oversized_tensor() {
        let mut b = TensorListBuilder::new(4);
        assert_eq!(
            b.try_push(&[1 << 32, 1 << 32]).err(),
            Some(FormatError::TensorTooLarge {
                index: 0,
                shape: Shape::new(&[1 << 32, 1 << 32]),
            })
        );
        // Fits the element count but not the byte range.
        assert!(matches!(
            b.try_push(&[1 << 62]),
            Err(FormatError::TensorTooLarge { index: 0, .. })
        ));
        assert!(b.build().is_empty());

        b.try_push(&[3]).unwrap().try_push(&[1 << 20, 0]).unwrap();
        assert_eq!(b.build().element_counts(), vec![3, 0]);
        assert_eq!(b.arena_len(), 3);
    }

    #[test]
    fn test_truncated_pointer_table() {
        let mut bytes = sample().to_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            decode(&bytes, &DecodeLimits::default()),
            Err(FormatError::TruncatedPointerTable { .. })
        ));
    }

    #[test]
    fn test_bind_ranges() {
        let b = sample();
        let ranges = b.build().bind(4, b.arena_len()).unwrap();
        assert_eq!(ranges, vec![0..5, 5..5, 5..105]);
    }

    #[test]
    fn test_bind_rejects_bad_bases() {
        let mut b = TensorListBuilder::new(4);
        b.push_at(&[4], 2);
        assert!(matches!(
            b.build().bind(4, 64),
            Err(FormatError::MisalignedBase { index: 0, .. })
        ));

        let b = sample();
        assert!(matches!(
            b.build().bind(4, 50),
            Err(FormatError::OutOfArena { index: 2, .. })
        ));
    }
}
