//! # tally-kernels
//!
//! Two-phase reduction over a ragged list of tensors, run by a fixed SPMD
//! group of workers.
//!
//! Provides:
//! - Stage 1 local reduction streamed through a double buffer (`local`, `pipeline`)
//! - A single barrier that carries worker failures (`barrier`)
//! - Stage 2 round-robin merge of per-tensor partials (`global`)
//! - Write-once scratch and output slots (`scratch`)
//! - Pluggable reduction strategies with reference norm implementations (`strategy`)
//! - The invocation driver tying it together (`engine`)

pub mod barrier;
pub mod engine;
pub mod error;
pub mod global;
pub mod local;
pub mod pipeline;
pub mod scratch;
pub mod strategy;

pub use engine::{ReduceEngine, ReduceOutput, RunStats};
pub use error::EngineError;
pub use strategy::{ArgMax, ArgMaxHit, BoxedStrategy, Chunk, ReduceStrategy, StrategyKind};

pub type Result<T> = std::result::Result<T, EngineError>;
