//! Write-once slot arrays for Stage 1 partials and per-tensor outputs.
//!
//! Each slot has exactly one writer and is read only after the barrier, so a
//! slot is a [`OnceLock`]: a second write or a read of an unwritten slot is
//! reported instead of racing. Traffic counters feed [`RunStats`](crate::RunStats).

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use smallvec::SmallVec;

use crate::error::EngineError;
use crate::Result;

/// Partials of one tensor, copied out of the scratch area for merging.
pub type PartialRun<T> = SmallVec<[T; 16]>;

pub struct SlotArray<T> {
    cells: Vec<OnceLock<T>>,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

impl<T> SlotArray<T> {
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| OnceLock::new()).collect(),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn cell(&self, slot: usize) -> Result<&OnceLock<T>> {
        self.cells.get(slot).ok_or(EngineError::SlotOutOfRange {
            slot,
            len: self.cells.len(),
        })
    }

    pub fn write(&self, slot: usize, value: T) -> Result<()> {
        self.cell(slot)?
            .set(value)
            .map_err(|_| EngineError::SlotRewritten { slot })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn read(&self, slot: usize) -> Result<&T> {
        let value = self
            .cell(slot)?
            .get()
            .ok_or(EngineError::SlotMissing { slot })?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Take every value, failing on the first unwritten slot.
    pub fn into_values(self) -> Result<Vec<T>> {
        self.cells
            .into_iter()
            .enumerate()
            .map(|(slot, cell)| cell.into_inner().ok_or(EngineError::SlotMissing { slot }))
            .collect()
    }
}

impl<T: Copy> SlotArray<T> {
    /// Copy a contiguous run of written slots.
    pub fn read_run(&self, slots: Range<usize>) -> Result<PartialRun<T>> {
        slots.map(|slot| self.read(slot).copied()).collect()
    }
}

impl<T> std::fmt::Debug for SlotArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotArray")
            .field("len", &self.cells.len())
            .field("writes", &self.writes())
            .field("reads", &self.reads())
            .finish()
    }
}
