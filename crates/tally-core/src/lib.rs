//! # tally-core
//!
//! Host-side building blocks of the tally two-phase reduction engine.
//!
//! - Packed tensor-list decoding and encoding (`format`)
//! - Element types and shapes (`dtype`, `shape`)
//! - Host configuration with JSON loading and env overrides (`config`)
//! - Block-aligned partitioning and the tensor middle index (`plan`)

pub mod config;
pub mod dtype;
pub mod error;
pub mod format;
pub mod plan;
pub mod shape;

pub use config::{BufferLayout, ConfigError, ReduceConfig};
pub use dtype::{DType, Element};
pub use error::TallyError;
pub use format::{decode, DecodeLimits, FormatError, TensorDescriptor, TensorList, TensorListBuilder};
pub use plan::{
    effective_worker_count, Cursor, PartitionPlan, PlanError, Segment, TensorMiddleIndex, WorkerRange,
};
pub use shape::Shape;

pub type Result<T> = std::result::Result<T, TallyError>;
