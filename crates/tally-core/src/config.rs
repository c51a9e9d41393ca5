//! Host configuration for one reduction invocation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::format::{DecodeLimits, DEFAULT_MAX_RANK, DEFAULT_MAX_TENSORS};

/// Number of local buffers a worker streams through (double buffering).
pub const BUFFER_NUM: usize = 2;

/// Environment variable overriding [`ReduceConfig::worker_count`].
pub const ENV_WORKERS: &str = "TALLY_WORKERS";

/// Environment variable overriding [`ReduceConfig::on_chip_buffer_bytes`].
pub const ENV_BUFFER_BYTES: &str = "TALLY_BUFFER_BYTES";

/// Configuration supplied once per invocation.
///
/// Controls how many workers take part, how much local buffer each worker
/// may stream through, and the transfer granularity partition boundaries
/// must respect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceConfig {
    /// Number of workers in the SPMD group.
    pub worker_count: usize,

    /// Local buffer budget per worker, shared by both pipeline buffers.
    pub on_chip_buffer_bytes: usize,

    /// Minimum transfer granularity; partition boundaries land on it.
    pub alignment_bytes: usize,

    /// Width of one input element (2 for f16/bf16, 4 for f32).
    pub element_byte_width: usize,

    /// Launch no more workers than there are blocks of work.
    pub clamp_workers: bool,

    /// Largest tensor list the decoder accepts.
    pub max_tensors: usize,

    /// Largest tensor rank the decoder accepts.
    pub max_rank: usize,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            on_chip_buffer_bytes: 64 * 1024,
            alignment_bytes: 32,
            element_byte_width: 4,
            clamp_workers: false,
            max_tensors: DEFAULT_MAX_TENSORS,
            max_rank: DEFAULT_MAX_RANK,
        }
    }
}

/// Buffer geometry derived from a validated [`ReduceConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Elements per alignment unit.
    pub elements_per_block: usize,
    /// Bytes in one of the two pipeline buffers, aligned down.
    pub chunk_bytes: usize,
    /// Elements one pipeline buffer holds.
    pub chunk_elements: usize,
}

/// Invalid host configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("unsupported element width: {0} bytes")]
    UnsupportedElementWidth(usize),

    #[error("alignment {alignment} is not a positive multiple of element width {width}")]
    MisalignedAlignment { alignment: usize, width: usize },

    #[error("buffer size {buffer} is not a multiple of alignment {alignment}")]
    MisalignedBuffer { buffer: usize, alignment: usize },

    #[error("buffer size {buffer} cannot hold two chunks of {alignment} bytes")]
    BufferTooSmall { buffer: usize, alignment: usize },

    #[error("element type is {actual} bytes wide but the configuration says {configured}")]
    ElementWidthMismatch { configured: usize, actual: usize },

    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: String, value: String },

    #[error("failed to read config {path}: {msg}")]
    Io { path: String, msg: String },

    #[error("invalid config: {0}")]
    Parse(String),
}

impl ReduceConfig {
    /// Default configuration with `worker_count` workers.
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    pub fn buffer_bytes(mut self, bytes: usize) -> Self {
        self.on_chip_buffer_bytes = bytes;
        self
    }

    pub fn alignment(mut self, bytes: usize) -> Self {
        self.alignment_bytes = bytes;
        self
    }

    pub fn element_width(mut self, bytes: usize) -> Self {
        self.element_byte_width = bytes;
        self
    }

    pub fn clamp(mut self, clamp: bool) -> Self {
        self.clamp_workers = clamp;
        self
    }

    /// Check the configuration and derive the buffer geometry.
    pub fn validate(&self) -> Result<BufferLayout, ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let width = self.element_byte_width;
        if !matches!(width, 2 | 4) {
            return Err(ConfigError::UnsupportedElementWidth(width));
        }
        let alignment = self.alignment_bytes;
        if alignment == 0 || alignment % width != 0 {
            return Err(ConfigError::MisalignedAlignment { alignment, width });
        }
        let buffer = self.on_chip_buffer_bytes;
        if buffer % alignment != 0 {
            return Err(ConfigError::MisalignedBuffer { buffer, alignment });
        }

        let chunk_bytes = buffer / BUFFER_NUM / alignment * alignment;
        if chunk_bytes == 0 {
            return Err(ConfigError::BufferTooSmall { buffer, alignment });
        }

        Ok(BufferLayout {
            elements_per_block: alignment / width,
            chunk_bytes,
            chunk_elements: chunk_bytes / width,
        })
    }

    /// Decoder limits implied by this configuration.
    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_tensors: self.max_tensors,
            max_rank: self.max_rank,
        }
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Apply `TALLY_WORKERS` / `TALLY_BUFFER_BYTES` from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let parse = |key: &str, value: String| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: key.to_string(),
                    value,
                })
        };
        if let Some(v) = lookup(ENV_WORKERS) {
            self.worker_count = parse(ENV_WORKERS, v)?;
        }
        if let Some(v) = lookup(ENV_BUFFER_BYTES) {
            self.on_chip_buffer_bytes = parse(ENV_BUFFER_BYTES, v)?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let layout = ReduceConfig::default().validate().unwrap();
        assert_eq!(layout.elements_per_block, 8);
        assert_eq!(layout.chunk_bytes, 32 * 1024);
        assert_eq!(layout.chunk_elements, 8 * 1024);
    }

    #[test]
    fn test_chunk_aligned_down() {
        let layout = ReduceConfig::with_workers(2)
            .buffer_bytes(96)
            .alignment(32)
            .validate()
            .unwrap();
        // 96 / 2 = 48, aligned down to 32.
        assert_eq!(layout.chunk_bytes, 32);
        assert_eq!(layout.chunk_elements, 8);
    }

    #[test]
    fn test_half_width() {
        let layout = ReduceConfig::with_workers(1).element_width(2).validate().unwrap();
        assert_eq!(layout.elements_per_block, 16);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(ReduceConfig::with_workers(0).validate(), Err(ConfigError::ZeroWorkers));
        assert_eq!(
            ReduceConfig::with_workers(1).element_width(3).validate(),
            Err(ConfigError::UnsupportedElementWidth(3))
        );
        assert_eq!(
            ReduceConfig::with_workers(1).alignment(6).validate(),
            Err(ConfigError::MisalignedAlignment { alignment: 6, width: 4 })
        );
        assert_eq!(
            ReduceConfig::with_workers(1).buffer_bytes(100).validate(),
            Err(ConfigError::MisalignedBuffer { buffer: 100, alignment: 32 })
        );
        assert_eq!(
            ReduceConfig::with_workers(1).buffer_bytes(32).validate(),
            Err(ConfigError::BufferTooSmall { buffer: 32, alignment: 32 })
        );
    }

    #[test]
    fn test_json_partial_fields() {
        let cfg = ReduceConfig::from_json_str(r#"{"worker_count": 3, "alignment_bytes": 64}"#).unwrap();
        assert_eq!(cfg.worker_count, 3);
        assert_eq!(cfg.alignment_bytes, 64);
        assert_eq!(cfg.element_byte_width, 4);
        assert!(matches!(
            ReduceConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.json");
        std::fs::write(&path, r#"{"worker_count": 5, "clamp_workers": true}"#).unwrap();
        let cfg = ReduceConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.worker_count, 5);
        assert!(cfg.clamp_workers);

        let missing = ReduceConfig::from_json_file(&dir.path().join("absent.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_overrides() {
        let cfg = ReduceConfig::with_workers(1)
            .with_overrides(|key| match key {
                ENV_WORKERS => Some("6".into()),
                ENV_BUFFER_BYTES => Some(" 4096 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.worker_count, 6);
        assert_eq!(cfg.on_chip_buffer_bytes, 4096);

        let bad = ReduceConfig::default().with_overrides(|key| {
            (key == ENV_WORKERS).then(|| "many".to_string())
        });
        assert!(matches!(bad, Err(ConfigError::InvalidOverride { .. })));
    }
}
