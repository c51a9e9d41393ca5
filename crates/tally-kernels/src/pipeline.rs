//! Double-buffered chunk streaming for Stage 1.
//!
//! Each worker owns two fixed-capacity local buffers. While one buffer is
//! being reduced the next chunk is copied into the other, so at most two
//! chunks are in flight and memory use does not depend on tensor size.
//!
//! ```text
//! chunk:     0        1        2        3
//! buf A:  [FILL]   [DRAIN]  [FILL]   [DRAIN]
//! buf B:           [FILL]   [DRAIN]  [FILL]   [DRAIN]
//! ```
//!
//! Every buffer moves through `Empty -> Filling -> Ready -> Draining -> Empty`;
//! any other transition is rejected.

use smallvec::SmallVec;
use tally_core::Element;

use crate::error::EngineError;
use crate::strategy::Chunk;
use crate::Result;

/// Number of alternating buffers.
pub const BUFFER_COUNT: usize = 2;

/// Lifecycle of one local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Filling,
    Ready,
    Draining,
}

#[derive(Debug)]
struct LocalBuffer {
    data: Vec<f32>,
    len: usize,
    state: BufferState,
    tensor: usize,
    offset: u64,
}

impl LocalBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            len: 0,
            state: BufferState::Empty,
            tensor: 0,
            offset: 0,
        }
    }
}

/// Two local buffers of `capacity` compute elements each.
#[derive(Debug)]
pub struct DoubleBuffer {
    buffers: [LocalBuffer; BUFFER_COUNT],
    capacity: usize,
    chunks: u64,
}

impl DoubleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: [LocalBuffer::new(capacity), LocalBuffer::new(capacity)],
            capacity,
            chunks: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self, buffer: usize) -> BufferState {
        self.buffers[buffer].state
    }

    /// Chunks drained since construction.
    pub fn chunks_streamed(&self) -> u64 {
        self.chunks
    }

    fn transition(&mut self, buffer: usize, expected: BufferState, to: BufferState) -> Result<()> {
        let state = &mut self.buffers[buffer].state;
        if *state != expected {
            return Err(EngineError::InvalidTransition {
                buffer,
                from: *state,
                to,
            });
        }
        *state = to;
        Ok(())
    }

    /// Copy `src` into an empty buffer, widening to f32.
    pub fn fill<T: Element>(&mut self, buffer: usize, tensor: usize, offset: u64, src: &[T]) -> Result<()> {
        if src.len() > self.capacity {
            return Err(EngineError::ChunkTooLarge {
                len: src.len(),
                capacity: self.capacity,
            });
        }
        self.transition(buffer, BufferState::Empty, BufferState::Filling)?;

        let buf = &mut self.buffers[buffer];
        for (dst, &x) in buf.data.iter_mut().zip(src) {
            *dst = x.to_f32();
        }
        buf.len = src.len();
        buf.tensor = tensor;
        buf.offset = offset;

        self.transition(buffer, BufferState::Filling, BufferState::Ready)
    }

    /// Hand a ready buffer to `reduce` and release it.
    pub fn drain<R>(&mut self, buffer: usize, reduce: impl FnOnce(Chunk<'_>) -> R) -> Result<R> {
        self.transition(buffer, BufferState::Ready, BufferState::Draining)?;

        let buf = &self.buffers[buffer];
        let out = reduce(Chunk {
            tensor: buf.tensor,
            offset: buf.offset,
            data: &buf.data[..buf.len],
        });
        tracing::trace!(buffer, tensor = buf.tensor, offset = buf.offset, len = buf.len, "chunk drained");
        self.chunks += 1;

        self.transition(buffer, BufferState::Draining, BufferState::Empty)?;
        Ok(out)
    }

    /// Stream one tensor segment through both buffers, returning one result
    /// per chunk in element order.
    ///
    /// `offset` is the element offset of `src[0]` inside tensor `tensor`.
    pub fn stream<T: Element, R>(
        &mut self,
        tensor: usize,
        offset: u64,
        src: &[T],
        mut reduce: impl FnMut(Chunk<'_>) -> R,
    ) -> Result<SmallVec<[R; 8]>> {
        let mut out = SmallVec::new();
        if src.is_empty() {
            return Ok(out);
        }

        let cap = self.capacity.max(1);
        let mut pieces = src.chunks(cap);
        let mut chunk_offset = offset;
        let mut current = 0;

        if let Some(first) = pieces.next() {
            self.fill(current, tensor, chunk_offset, first)?;
            chunk_offset += first.len() as u64;
        }
        for next in pieces {
            let other = 1 - current;
            self.fill(other, tensor, chunk_offset, next)?;
            chunk_offset += next.len() as u64;
            out.push(self.drain(current, &mut reduce)?);
            current = other;
        }
        out.push(self.drain(current, &mut reduce)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_stream_splits_into_chunks() {
        let mut db = DoubleBuffer::new(4);
        let src: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let sums = db
            .stream(3, 100, &src, |c| (c.tensor, c.offset, c.data.iter().sum::<f32>()))
            .unwrap();
        assert_eq!(
            sums.as_slice(),
            &[(3, 100, 6.0), (3, 104, 22.0), (3, 108, 17.0)]
        );
        assert_eq!(db.chunks_streamed(), 3);
        assert_eq!(db.state(0), BufferState::Empty);
        assert_eq!(db.state(1), BufferState::Empty);
    }

    #[test]
    fn test_stream_empty_segment() {
        let mut db = DoubleBuffer::new(4);
        let empty: &[f32] = &[];
        let out = db.stream(0, 0, empty, |_| ()).unwrap();
        assert!(out.is_empty());
        assert_eq!(db.chunks_streamed(), 0);
    }

    #[test]
    fn test_widens_half_input() {
        let mut db = DoubleBuffer::new(8);
        let src = [f16::from_f32(0.5), f16::from_f32(-1.25)];
        let seen = db.stream(0, 0, &src, |c| c.data.to_vec()).unwrap();
        assert_eq!(seen[0], vec![0.5, -1.25]);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut db = DoubleBuffer::new(4);
        db.fill(0, 0, 0, &[1.0f32]).unwrap();
        let refill = db.fill(0, 0, 0, &[2.0f32]);
        assert!(matches!(
            refill,
            Err(EngineError::InvalidTransition { buffer: 0, from: BufferState::Ready, .. })
        ));

        let drain_empty = db.drain(1, |_| ());
        assert!(matches!(
            drain_empty,
            Err(EngineError::InvalidTransition { buffer: 1, from: BufferState::Empty, .. })
        ));

        let oversized = db.fill(1, 0, 0, &[0.0f32; 5]);
        assert!(matches!(
            oversized,
            Err(EngineError::ChunkTooLarge { len: 5, capacity: 4 })
        ));

        assert!(refill.unwrap_err().is_config());
        assert!(drain_empty.unwrap_err().is_config());
        assert!(oversized.unwrap_err().is_config());
    }
}
