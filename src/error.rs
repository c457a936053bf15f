//! Error types for VDF store operations

use thiserror::Error;

/// Main error type for VDF store operations
#[derive(Error, Debug)]
pub enum VdfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Variable not open: {0}")]
    NotOpen(String),

    #[error("Region out of bounds: {0}")]
    OutOfBounds(String),

    #[error(
        "Data unavailable for variable {variable} at refinement level {level}, timestep {timestep}; \
         try a lower refinement level or a different timestep"
    )]
    DataUnavailable {
        variable: String,
        level: usize,
        timestep: usize,
    },

    #[error(
        "Region too large for cache: estimated {estimated_mb:.1} MB exceeds budget of {budget_mb:.1} MB; \
         lower the refinement level (level {suggested_level} fits), shrink the region or raise the cache size"
    )]
    RegionTooLarge {
        estimated_mb: f64,
        budget_mb: f64,
        suggested_level: usize,
    },

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Missing value mask inconsistency: {0}")]
    MaskInconsistency(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl VdfError {
    /// Build a `DataUnavailable` error for a (variable, level, timestep) triple
    pub fn unavailable(variable: impl Into<String>, level: usize, timestep: usize) -> Self {
        VdfError::DataUnavailable {
            variable: variable.into(),
            level,
            timestep,
        }
    }

    /// Whether the caller can recover by asking for less (coarser level,
    /// smaller region, other variables) rather than treating it as fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VdfError::DataUnavailable { .. } | VdfError::RegionTooLarge { .. }
        )
    }
}

/// Specialized Result type for VDF store operations
pub type Result<T> = std::result::Result<T, VdfError>;

impl From<bincode::Error> for VdfError {
    fn from(err: bincode::Error) -> Self {
        VdfError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdfError {
    fn from(err: serde_json::Error) -> Self {
        VdfError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message_names_triple() {
        let err = VdfError::unavailable("temp", 2, 7);
        let msg = err.to_string();
        assert!(msg.contains("temp"));
        assert!(msg.contains("level 2"));
        assert!(msg.contains("timestep 7"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_storage_errors_are_not_recoverable() {
        assert!(!VdfError::StorageBackend("put_vara failed".into()).is_recoverable());
        assert!(!VdfError::MaskInconsistency("size".into()).is_recoverable());
    }
}
