//! Static partition planning.
//!
//! The element space of a tensor list is measured in alignment blocks. Each
//! tensor occupies `ceil(count / epb)` blocks of padded element space; the
//! total block count is split as evenly as possible over `P` workers, with
//! the first `total % P` workers taking one extra block.
//!
//! ```text
//! counts = [5, 0, 100], epb = 8, P = 4   (14 blocks, quotas 4/4/3/3)
//!
//!   t0 |#####...|                         w0: (0,0)  .. (2,24)
//!   t1 ||                                 w1: (2,24) .. (2,56)
//!   t2 |........|........|...  ...|....|  w2: (2,56) .. (2,80)
//!                                         w3: (2,80) .. (3,0)
//! ```
//!
//! Worker ranges are half-open cursors `(tensor, element offset)`. A tensor
//! split between workers is shared at the exact element offset, never
//! duplicated or dropped. [`TensorMiddleIndex`] then gives every tensor a
//! contiguous run of scratch slots, one per contributing worker.

use std::ops::Range;

use crate::format::blocks_for;

/// A position in the element space of a tensor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Cursor {
    pub tensor: usize,
    pub offset: u64,
}

impl Cursor {
    pub const fn new(tensor: usize, offset: u64) -> Self {
        Self { tensor, offset }
    }
}

/// The half-open slice of the tensor list one worker reduces in Stage 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRange {
    pub start: Cursor,
    pub end: Cursor,
    /// Blocks of padded element space in the range.
    pub blocks: u64,
}

impl WorkerRange {
    pub fn is_empty(&self) -> bool {
        self.blocks == 0 || self.start >= self.end
    }
}

/// One tensor's contribution to a worker range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub tensor: usize,
    /// First element of the piece, relative to the tensor.
    pub offset: u64,
    pub len: u64,
}

impl Segment {
    pub fn elements(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("cannot partition over zero workers")]
    ZeroWorkers,

    #[error("elements per block must be at least 1")]
    ZeroBlockSize,

    #[error("padded element space of the tensor list overflows u64")]
    Overflow,
}

/// Assignment of every block of a tensor list to one of `P` workers.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    ranges: Vec<WorkerRange>,
    total_blocks: u64,
    elements_per_block: u64,
}

impl PartitionPlan {
    /// Partition `counts` over `workers` workers in blocks of
    /// `elements_per_block` elements.
    pub fn build(counts: &[u64], elements_per_block: u64, workers: usize) -> Result<Self, PlanError> {
        if workers == 0 {
            return Err(PlanError::ZeroWorkers);
        }
        if elements_per_block == 0 {
            return Err(PlanError::ZeroBlockSize);
        }

        let epb = elements_per_block;
        let mut total_blocks: u64 = 0;
        for &count in counts {
            let blocks = blocks_for(count, epb);
            blocks.checked_mul(epb).ok_or(PlanError::Overflow)?;
            total_blocks = total_blocks
                .checked_add(blocks)
                .ok_or(PlanError::Overflow)?;
        }
        // Every quota in elements must be representable too.
        total_blocks.checked_mul(epb).ok_or(PlanError::Overflow)?;

        let p = workers as u64;
        let per_worker = total_blocks / p;
        let remainder = total_blocks % p;
        let quota = |w: usize| per_worker + u64::from((w as u64) < remainder);

        let mut ranges = Vec::with_capacity(workers);
        let mut start = Cursor::default();
        let mut worker = 0usize;
        let mut remaining = quota(0) * epb;

        if remaining > 0 {
            'tensors: for (t, &count) in counts.iter().enumerate() {
                let padded = blocks_for(count, epb) * epb;
                let mut pos = 0u64;
                while pos < padded {
                    let take = remaining.min(padded - pos);
                    pos += take;
                    remaining -= take;
                    if remaining > 0 {
                        continue;
                    }

                    // Quota reached. Inside the data the next worker shares
                    // this tensor; at its end or in its padding tail the next
                    // worker moves on to the following tensor.
                    let end = if pos < count {
                        Cursor::new(t, pos)
                    } else {
                        Cursor::new(t + 1, 0)
                    };
                    ranges.push(WorkerRange {
                        start,
                        end,
                        blocks: quota(worker),
                    });
                    start = end;
                    worker += 1;
                    if worker == workers || quota(worker) == 0 {
                        break 'tensors;
                    }
                    remaining = quota(worker) * epb;
                }
            }
        }

        // Workers beyond the available blocks get an empty range.
        ranges.resize(
            workers,
            WorkerRange {
                start,
                end: start,
                blocks: 0,
            },
        );

        for (w, r) in ranges.iter().enumerate() {
            tracing::debug!(
                worker = w,
                start = ?(r.start.tensor, r.start.offset),
                end = ?(r.end.tensor, r.end.offset),
                blocks = r.blocks,
                "partition range"
            );
        }

        Ok(Self {
            ranges,
            total_blocks,
            elements_per_block: epb,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn elements_per_block(&self) -> u64 {
        self.elements_per_block
    }

    pub fn range(&self, worker: usize) -> &WorkerRange {
        &self.ranges[worker]
    }

    pub fn ranges(&self) -> &[WorkerRange] {
        &self.ranges
    }

    pub fn blocks_for(&self, worker: usize) -> u64 {
        self.ranges[worker].blocks
    }

    /// Workers with at least one block to reduce.
    pub fn active_workers(&self) -> usize {
        self.ranges.iter().filter(|r| r.blocks > 0).count()
    }

    /// Per-tensor pieces of a worker's range, clipped at the range ends.
    ///
    /// `counts` must be the element counts the plan was built from.
    /// Zero-length pieces are skipped.
    pub fn segments(&self, worker: usize, counts: &[u64]) -> Vec<Segment> {
        let r = &self.ranges[worker];
        if r.is_empty() || counts.is_empty() {
            return Vec::new();
        }

        let last = r.end.tensor.min(counts.len() - 1);
        let mut out = Vec::new();
        for (t, &count) in counts.iter().enumerate().take(last + 1).skip(r.start.tensor) {
            let lo = if t == r.start.tensor { r.start.offset } else { 0 };
            let hi = if t == r.end.tensor {
                r.end.offset.min(count)
            } else {
                count
            };
            if hi > lo {
                out.push(Segment {
                    tensor: t,
                    offset: lo,
                    len: hi - lo,
                });
            }
        }
        out
    }
}

/// Number of workers the SPMD group is launched with.
///
/// With `clamp` set no more workers are launched than there are blocks of
/// work (at least one); otherwise `requested` is honored as declared.
pub fn effective_worker_count(total_blocks: u64, requested: usize, clamp: bool) -> usize {
    if !clamp {
        return requested;
    }
    let cap = usize::try_from(total_blocks.max(1)).unwrap_or(usize::MAX);
    requested.min(cap)
}

/// Contiguous slot run owned by one tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotRun {
    pub start: usize,
    pub count: usize,
    /// Lowest worker contributing to the tensor.
    pub first_worker: usize,
}

/// Where each Stage 1 partial lives in the scratch area.
///
/// Slots are numbered in worker order, so the partials of one tensor are
/// adjacent and ordered by contributing worker.
#[derive(Debug, Clone)]
pub struct TensorMiddleIndex {
    runs: Vec<SlotRun>,
    worker_slots: Vec<Range<usize>>,
    total_slots: usize,
}

impl TensorMiddleIndex {
    pub fn build(plan: &PartitionPlan, counts: &[u64]) -> Self {
        let mut runs = vec![SlotRun::default(); counts.len()];
        let mut worker_slots = Vec::with_capacity(plan.worker_count());
        let mut next = 0usize;

        for w in 0..plan.worker_count() {
            let first = next;
            for seg in plan.segments(w, counts) {
                let run = &mut runs[seg.tensor];
                if run.count == 0 {
                    run.start = next;
                    run.first_worker = w;
                }
                run.count += 1;
                next += 1;
            }
            worker_slots.push(first..next);
        }

        Self {
            runs,
            worker_slots,
            total_slots: next,
        }
    }

    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    pub fn run(&self, tensor: usize) -> SlotRun {
        self.runs[tensor]
    }

    /// Slots holding the partials of `tensor`; empty for zero-element tensors.
    pub fn tensor_slots(&self, tensor: usize) -> Range<usize> {
        let run = self.runs[tensor];
        run.start..run.start + run.count
    }

    /// Slots written by `worker` during Stage 1.
    pub fn worker_slots(&self, worker: usize) -> Range<usize> {
        self.worker_slots[worker].clone()
    }

    /// Slot of the partial `worker` produces for `tensor`, if it has one.
    pub fn slot_for(&self, worker: usize, tensor: usize) -> Option<usize> {
        let run = self.runs.get(tensor)?;
        let k = worker.checked_sub(run.first_worker)?;
        (k < run.count).then_some(run.start + k)
    }
}
