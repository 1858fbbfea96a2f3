//! Error types for flipflop-rs.
//!
//! This module provides error types and result aliases for the library.
//!
//! Configuration problems and data exhaustion are fatal and abort a run
//! before or during training. Chunk rejections are not errors at all; they
//! are tallied observationally by the batch assembler (see
//! [`crate::chunks::RejectionTally`]).
//!
//! # Example
//!
//! ```rust
//! use flipflop_rs::{FlipflopConfig, Result};
//!
//! fn load_and_validate(path: &str) -> Result<FlipflopConfig> {
//!     let config = FlipflopConfig::from_file(path)?;
//!     config.validate()?;
//!     Ok(config)
//! }
//! ```
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use flipflop_rs::{FlipflopConfig, FlipflopError};
//!
//! # fn main() {
//! match FlipflopConfig::from_file("/nonexistent/config.yaml") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(FlipflopError::Io(e)) => eprintln!("could not read config: {e}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for flipflop-rs operations.
pub type Result<T> = std::result::Result<T, FlipflopError>;

/// Errors that can occur in flipflop-rs.
///
/// # Example
///
/// ```rust
/// use flipflop_rs::{FlipflopError, Result};
///
/// fn validate_output(path: &str) -> Result<()> {
///     if path.is_empty() {
///         return Err(FlipflopError::Config("output path cannot be empty".to_string()));
///     }
///     Ok(())
/// }
///
/// assert!(validate_output("").is_err());
/// assert!(validate_output("./training").is_ok());
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlipflopError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Read data error (malformed records, bad alphabet, broken mapping).
    #[error("read data error: {0}")]
    Data(String),

    /// No acceptable chunks could be assembled within the retry budget.
    #[error("insufficient data: no acceptable chunks after {attempts} attempts over {passes} passes")]
    InsufficientData {
        /// Total chunk sampling attempts made before giving up.
        attempts: usize,
        /// Number of full passes over the read collection.
        passes: usize,
    },

    /// Model construction or forward-pass error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for FlipflopError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        FlipflopError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_display() {
        let error = FlipflopError::Config("bad threshold".to_string());
        assert_eq!(error.to_string(), "configuration error: bad threshold");
    }

    #[test]
    fn test_data_error_display() {
        let error = FlipflopError::Data("symbol out of alphabet".to_string());
        assert_eq!(error.to_string(), "read data error: symbol out of alphabet");
    }

    #[test]
    fn test_insufficient_data_display() {
        let error = FlipflopError::InsufficientData {
            attempts: 120,
            passes: 10,
        };
        let msg = error.to_string();
        assert!(msg.contains("insufficient data"));
        assert!(msg.contains("120"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_checkpoint_error_display() {
        let error = FlipflopError::Checkpoint("index 3 already exists".to_string());
        assert_eq!(
            error.to_string(),
            "checkpoint error: index 3 already exists"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: FlipflopError = io_error.into();
        assert!(matches!(error, FlipflopError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: FlipflopError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: FlipflopError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let io_error = io::Error::new(io::ErrorKind::NotFound, "reads.jsonl not found");
        let error: FlipflopError = io_error.into();
        assert!(error.source().is_some());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
