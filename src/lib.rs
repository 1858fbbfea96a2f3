//! # flipflop-rs
//!
//! Training toolkit for flip-flop basecalling models.
//!
//! A flip-flop model reads a raw nanopore current trace and emits
//! transition scores over a doubled base alphabet; training optimizes a
//! CRF loss over those transitions against reference-mapped reads. This
//! crate provides the whole training pipeline: robust dwell-time
//! filtering, dynamic chunk batching, flip-flop label encoding, the CRF
//! loss, and the checkpointed training loop, with a CLI binary driving it
//! all from a YAML configuration.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Generate a starting configuration
//! flipflop init config.yaml
//!
//! # Validate it
//! flipflop validate config.yaml
//!
//! # Train
//! flipflop train config.yaml --overwrite
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use flipflop_rs::{FlipflopConfig, Trainer};
//!
//! # fn main() -> flipflop_rs::Result<()> {
//! let config = FlipflopConfig::from_file("config.yaml")?;
//! let mut trainer = Trainer::new(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Building Custom Configurations
//!
//! ```rust
//! use flipflop_rs::FlipflopConfig;
//!
//! let mut config = FlipflopConfig::dna_preset();
//! config.data.inputs = vec!["./reads.jsonl".to_string()];
//! config.chunks.chunk_len_min = 2000;
//! config.chunks.chunk_len_max = 4000;
//! config.training.iterations = 100_000;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod chunk_log;
pub mod chunks;
pub mod config;
pub mod data;
pub mod error;
pub mod flipflop;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod stats;
pub mod trainer;

pub use config::FlipflopConfig;
pub use error::{FlipflopError, Result};
pub use trainer::{StepMetrics, Trainer, TrainingState};
