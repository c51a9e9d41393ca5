use crate::config::ConfigError;
use crate::format::FormatError;
use crate::plan::PlanError;

/// Errors raised while preparing a reduction on the host side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TallyError {
    #[error("malformed tensor list: {0}")]
    Format(#[from] FormatError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("partitioning failed: {0}")]
    Plan(#[from] PlanError),
}

impl TallyError {
    /// Whether the error is a configuration error: bad host parameters or a
    /// malformed tensor list. Every host-side error is one.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            TallyError::Format(_) | TallyError::Config(_) | TallyError::Plan(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_input_is_config() {
        let err: TallyError = FormatError::TooSmall { len: 3 }.into();
        assert!(err.is_config());
        assert_eq!(err.to_string(), "malformed tensor list: packed buffer too small: 3 bytes");

        assert!(TallyError::from(ConfigError::ZeroWorkers).is_config());
        assert!(TallyError::from(PlanError::ZeroBlockSize).is_config());
    }
}
