//! Invocation driver.
//!
//! One call to [`ReduceEngine::run`] decodes the packed list, binds it to
//! the data arena, plans the partition, then launches exactly `P` workers:
//!
//! ```text
//! worker w:  before_all ─ Stage 1 (own range) ─ after_all ─┐
//!                                                          ├─ barrier ─ Stage 2 (tensors w, w+P, ..)
//! worker v:  before_all ─ Stage 1 (own range) ─ after_all ─┘
//! ```
//!
//! Any failure aborts the whole invocation; no outputs are returned.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tally_core::{
    decode, effective_worker_count, BufferLayout, ConfigError, Element, PartitionPlan, ReduceConfig,
    TensorList, TensorMiddleIndex,
};

use crate::barrier::StageBarrier;
use crate::error::EngineError;
use crate::global::GlobalMerger;
use crate::local::LocalReducer;
use crate::scratch::SlotArray;
use crate::strategy::ReduceStrategy;
use crate::Result;

/// Counters describing one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub tensors: usize,
    /// Workers in the SPMD group.
    pub workers: usize,
    /// Workers with a non-empty Stage 1 range.
    pub active_workers: usize,
    pub total_blocks: u64,
    /// Capacity of each pipeline buffer, in elements.
    pub chunk_elements: usize,
    pub slots_used: usize,
    /// Scratch slots read back in Stage 2.
    pub slot_reads: usize,
    pub chunks_streamed: u64,
}

/// One output per tensor, in list order.
#[derive(Debug, Clone)]
pub struct ReduceOutput<O> {
    pub values: Vec<O>,
    pub stats: RunStats,
}

/// Validated configuration plus a reusable worker pool.
///
/// Invocations on one engine are serialized.
#[derive(Debug)]
pub struct ReduceEngine {
    config: ReduceConfig,
    layout: BufferLayout,
    pool: Mutex<Option<(usize, Arc<ThreadPool>)>>,
}

impl ReduceEngine {
    pub fn new(config: ReduceConfig) -> Result<Self> {
        let layout = config.validate()?;
        Ok(Self {
            config,
            layout,
            pool: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ReduceConfig {
        &self.config
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Reduce every tensor of a packed list whose data lives in `data`.
    pub fn run<T, S>(&self, packed: &[u8], data: &[T], strategy: &S) -> Result<ReduceOutput<S::Output>>
    where
        T: Element,
        S: ReduceStrategy + ?Sized,
    {
        let list = decode(packed, &self.config.decode_limits())?;
        self.run_list(&list, data, strategy)
    }

    /// Reduce an already decoded list.
    pub fn run_list<T, S>(
        &self,
        list: &TensorList,
        data: &[T],
        strategy: &S,
    ) -> Result<ReduceOutput<S::Output>>
    where
        T: Element,
        S: ReduceStrategy + ?Sized,
    {
        let width = T::DTYPE.element_size();
        if width != self.config.element_byte_width {
            return Err(ConfigError::ElementWidthMismatch {
                configured: self.config.element_byte_width,
                actual: width,
            }
            .into());
        }

        let bound = list.bind(width, data.len())?;
        let counts = list.element_counts();
        let epb = self.layout.elements_per_block as u64;
        let total_blocks = list.total_blocks(epb);
        let workers = effective_worker_count(total_blocks, self.config.worker_count, self.config.clamp_workers);

        let plan = PartitionPlan::build(&counts, epb, workers)?;
        let index = TensorMiddleIndex::build(&plan, &counts);
        tracing::info!(
            strategy = strategy.name(),
            tensors = counts.len(),
            total_blocks,
            workers,
            active = plan.active_workers(),
            slots = index.total_slots(),
            "reduce"
        );

        let scratch = SlotArray::new(index.total_slots());
        let outputs = SlotArray::new(counts.len());
        let barrier = StageBarrier::new(workers);
        let chunks = AtomicU64::new(0);

        let local = LocalReducer {
            plan: &plan,
            index: &index,
            counts: &counts,
            bound: &bound,
            data,
            strategy,
            scratch: &scratch,
            chunk_elements: self.layout.chunk_elements,
        };
        let global = GlobalMerger {
            index: &index,
            counts: &counts,
            strategy,
            scratch: &scratch,
            outputs: &outputs,
            workers,
        };

        {
            let mut cached = self.pool.lock();
            let pool = pool_for(&mut cached, workers)?;
            pool.broadcast(|ctx| {
                let worker = ctx.index();

                let stage1 = catch_unwind(AssertUnwindSafe(|| local.run(worker)))
                    .unwrap_or_else(|payload| Err(panicked(worker, payload)))
                    .map(|stats| {
                        chunks.fetch_add(stats.chunks, Ordering::Relaxed);
                    });
                if !barrier.arrive(worker, stage1) {
                    return;
                }

                let stage2 = catch_unwind(AssertUnwindSafe(|| global.run(worker)))
                    .unwrap_or_else(|payload| Err(panicked(worker, payload)));
                if let Err(err) = stage2 {
                    barrier.fail(worker, err);
                }
            });
        }

        if let Some((worker, err)) = barrier.take_failure() {
            tracing::debug!(worker, "invocation aborted");
            return Err(err);
        }

        let stats = RunStats {
            tensors: counts.len(),
            workers,
            active_workers: plan.active_workers(),
            total_blocks,
            chunk_elements: self.layout.chunk_elements,
            slots_used: scratch.writes(),
            slot_reads: scratch.reads(),
            chunks_streamed: chunks.load(Ordering::Relaxed),
        };
        let values = outputs.into_values()?;
        Ok(ReduceOutput { values, stats })
    }
}

/// Reuse the cached pool when it has the right size, otherwise replace it.
fn pool_for(cached: &mut Option<(usize, Arc<ThreadPool>)>, workers: usize) -> Result<Arc<ThreadPool>> {
    if let Some((n, pool)) = cached.as_ref() {
        if *n == workers {
            return Ok(Arc::clone(pool));
        }
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("tally-worker-{i}"))
        .build()
        .map_err(|e| EngineError::ThreadPool(e.to_string()))?;
    let pool = Arc::new(pool);
    *cached = Some((workers, Arc::clone(&pool)));
    Ok(pool)
}

fn panicked(worker: usize, payload: Box<dyn Any + Send>) -> EngineError {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    EngineError::WorkerPanicked { worker, msg }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Sum;
    use tally_core::TensorListBuilder;

    #[test]
    fn test_reference_scenario() {
        let mut builder = TensorListBuilder::new(4);
        builder.push(&[5]).push(&[0]).push(&[10, 10]);
        let data: Vec<f32> = (0..builder.arena_len()).map(|i| i as f32).collect();

        let engine = ReduceEngine::new(ReduceConfig::with_workers(4).buffer_bytes(128)).unwrap();
        let out = engine.run(&builder.to_bytes(), &data, &Sum).unwrap();

        assert_eq!(out.values, vec![10.0, 0.0, (5..105).sum::<i32>() as f32]);
        assert_eq!(out.stats.total_blocks, 14);
        assert_eq!(out.stats.workers, 4);
        assert_eq!(out.stats.slots_used, 5);
        assert_eq!(out.stats.slot_reads, 5);
        assert_eq!(out.stats.chunk_elements, 16);
    }

    #[test]
    fn test_pool_is_reused() {
        let engine = ReduceEngine::new(ReduceConfig::with_workers(2)).unwrap();
        let mut builder = TensorListBuilder::new(4);
        builder.push(&[3]);
        let list = builder.build();
        let data = [1.0f32, 2.0, 3.0];

        engine.run_list(&list, &data[..], &Sum).unwrap();
        let first = engine.pool.lock().as_ref().map(|(_, p)| Arc::as_ptr(p));
        engine.run_list(&list, &data[..], &Sum).unwrap();
        let second = engine.pool.lock().as_ref().map(|(_, p)| Arc::as_ptr(p));
        assert_eq!(first, second);
    }

    #[test]
    fn test_width_mismatch() {
        let engine = ReduceEngine::new(ReduceConfig::with_workers(1)).unwrap();
        let list = TensorListBuilder::new(2).build();
        let data: [half::f16; 0] = [];
        let err = engine.run_list(&list, &data[..], &Sum).unwrap_err();
        assert!(err.is_config());
    }
}
