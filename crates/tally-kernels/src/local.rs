//! Stage 1: each worker reduces its own slice of the tensor list.

use std::ops::Range;

use tally_core::{Element, PartitionPlan, TensorMiddleIndex};

use crate::error::EngineError;
use crate::pipeline::DoubleBuffer;
use crate::scratch::SlotArray;
use crate::strategy::ReduceStrategy;
use crate::Result;

/// What one worker did in Stage 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStats {
    pub segments: usize,
    pub chunks: u64,
}

/// Shared, read-only view of everything Stage 1 needs.
pub struct LocalReducer<'a, T, S: ReduceStrategy + ?Sized> {
    pub plan: &'a PartitionPlan,
    pub index: &'a TensorMiddleIndex,
    pub counts: &'a [u64],
    /// Element range of each tensor inside `data`.
    pub bound: &'a [Range<usize>],
    pub data: &'a [T],
    pub strategy: &'a S,
    pub scratch: &'a SlotArray<S::Partial>,
    pub chunk_elements: usize,
}

impl<T: Element, S: ReduceStrategy + ?Sized> LocalReducer<'_, T, S> {
    /// Reduce worker `worker`'s range, writing one partial per segment.
    ///
    /// `after_all` runs even when a segment fails.
    pub fn run(&self, worker: usize) -> Result<LocalStats> {
        let mut buffers = DoubleBuffer::new(self.chunk_elements);

        self.strategy.before_all(worker);
        let segments = self.reduce_segments(worker, &mut buffers);
        self.strategy.after_all(worker);

        let stats = LocalStats {
            segments: segments?,
            chunks: buffers.chunks_streamed(),
        };
        tracing::debug!(worker, segments = stats.segments, chunks = stats.chunks, "stage 1 done");
        Ok(stats)
    }

    fn reduce_segments(&self, worker: usize, buffers: &mut DoubleBuffer) -> Result<usize> {
        let strategy = self.strategy;
        let segments = self.plan.segments(worker, self.counts);
        for seg in &segments {
            let slot = self
                .index
                .slot_for(worker, seg.tensor)
                .ok_or(EngineError::Unindexed {
                    worker,
                    tensor: seg.tensor,
                })?;

            let base = self.bound[seg.tensor].start;
            let elems = seg.elements();
            let src = &self.data[base + elems.start as usize..base + elems.end as usize];

            let chunk_partials =
                buffers.stream(seg.tensor, seg.offset, src, |chunk| strategy.compute_partial(chunk))?;
            self.scratch.write(slot, strategy.combine_partials(&chunk_partials))?;
        }
        Ok(segments.len())
    }
}
