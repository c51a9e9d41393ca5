use tally_core::{ConfigError, FormatError, PlanError, TallyError};

use crate::pipeline::BufferState;

/// Errors that abort a reduction invocation.
///
/// None of them are retryable; the invocation returns no partial outputs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] TallyError),

    #[error("buffer {buffer}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        buffer: usize,
        from: BufferState,
        to: BufferState,
    },

    #[error("chunk of {len} elements exceeds buffer capacity {capacity}")]
    ChunkTooLarge { len: usize, capacity: usize },

    #[error("slot {slot} written twice")]
    SlotRewritten { slot: usize },

    #[error("slot {slot} read before it was written")]
    SlotMissing { slot: usize },

    #[error("slot {slot} out of range ({len} slots)")]
    SlotOutOfRange { slot: usize, len: usize },

    #[error("worker {worker} has no slot for tensor {tensor}")]
    Unindexed { worker: usize, tensor: usize },

    #[error("worker {worker} panicked: {msg}")]
    WorkerPanicked { worker: usize, msg: String },

    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
}

impl EngineError {
    /// Whether the error stems from configuration or input rather than a
    /// failing worker. Local buffer overflow and underflow count as
    /// configuration errors.
    pub fn is_config(&self) -> bool {
        match self {
            EngineError::Core(e) => e.is_config(),
            EngineError::ChunkTooLarge { .. } | EngineError::InvalidTransition { .. } => true,
            _ => false,
        }
    }
}

impl From<FormatError> for EngineError {
    fn from(e: FormatError) -> Self {
        EngineError::Core(e.into())
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Core(e.into())
    }
}

impl From<PlanError> for EngineError {
    fn from(e: PlanError) -> Self {
        EngineError::Core(e.into())
    }
}
