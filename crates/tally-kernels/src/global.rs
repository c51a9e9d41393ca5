//! Stage 2: merge each tensor's partials into its output.
//!
//! Tensors are owned round-robin (`tensor % P == worker`), which balances
//! the number of tensors per worker rather than the merge cost.

use tally_core::TensorMiddleIndex;

use crate::scratch::SlotArray;
use crate::strategy::ReduceStrategy;
use crate::Result;

pub struct GlobalMerger<'a, S: ReduceStrategy + ?Sized> {
    pub index: &'a TensorMiddleIndex,
    pub counts: &'a [u64],
    pub strategy: &'a S,
    pub scratch: &'a SlotArray<S::Partial>,
    pub outputs: &'a SlotArray<S::Output>,
    pub workers: usize,
}

impl<S: ReduceStrategy + ?Sized> GlobalMerger<'_, S> {
    /// Tensors owned by `worker`.
    pub fn owned(&self, worker: usize) -> impl Iterator<Item = usize> {
        (worker..self.counts.len()).step_by(self.workers.max(1))
    }

    /// Merge every tensor owned by `worker`; returns how many it wrote.
    pub fn run(&self, worker: usize) -> Result<usize> {
        let mut merged = 0;
        for t in self.owned(worker) {
            let value = if self.counts[t] == 0 {
                self.strategy.identity()
            } else {
                let partials = self.scratch.read_run(self.index.tensor_slots(t))?;
                self.strategy.merge_partials(&partials)
            };
            self.outputs.write(t, value)?;
            merged += 1;
        }
        tracing::debug!(worker, tensors = merged, "stage 2 done");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::strategy::Max;
    use tally_core::PartitionPlan;

    #[test]
    fn test_round_robin_ownership() {
        let counts = [1u64; 7];
        let plan = PartitionPlan::build(&counts, 1, 3).unwrap();
        let index = TensorMiddleIndex::build(&plan, &counts);
        let scratch = SlotArray::<f64>::new(0);
        let outputs = SlotArray::<f32>::new(7);
        let merger = GlobalMerger {
            index: &index,
            counts: &counts,
            strategy: &Max,
            scratch: &scratch,
            outputs: &outputs,
            workers: 3,
        };
        assert_eq!(merger.owned(0).collect::<Vec<_>>(), vec![0, 3, 6]);
        assert_eq!(merger.owned(2).collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn test_empty_tensor_takes_identity_without_reads() {
        let counts = [0u64, 3];
        let plan = PartitionPlan::build(&counts, 8, 2).unwrap();
        let index = TensorMiddleIndex::build(&plan, &counts);
        let scratch = SlotArray::new(index.total_slots());
        scratch.write(0, 2.5f64).unwrap();
        let outputs = SlotArray::new(2);
        let merger = GlobalMerger {
            index: &index,
            counts: &counts,
            strategy: &Max,
            scratch: &scratch,
            outputs: &outputs,
            workers: 2,
        };

        assert_eq!(merger.run(0).unwrap(), 1);
        assert_eq!(scratch.reads(), 0);
        assert_eq!(merger.run(1).unwrap(), 1);
        assert_eq!(scratch.reads(), 1);
        assert_eq!(outputs.into_values().unwrap(), vec![f32::NEG_INFINITY, 2.5]);
    }

    #[test]
    fn test_missing_partial_is_reported() {
        let counts = [4u64];
        let plan = PartitionPlan::build(&counts, 8, 1).unwrap();
        let index = TensorMiddleIndex::build(&plan, &counts);
        let scratch = SlotArray::<f64>::new(index.total_slots());
        let outputs = SlotArray::new(1);
        let merger = GlobalMerger {
            index: &index,
            counts: &counts,
            strategy: &Max,
            scratch: &scratch,
            outputs: &outputs,
            workers: 1,
        };
        assert!(matches!(merger.run(0), Err(EngineError::SlotMissing { slot: 0 })));
    }
}
