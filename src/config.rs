//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlipflopError, Result};
use crate::model::ModelKind;

/// Main configuration for a flip-flop training run.
///
/// # Example
///
/// ```rust
/// use flipflop_rs::FlipflopConfig;
///
/// # fn main() -> flipflop_rs::Result<()> {
/// let mut config = FlipflopConfig::dna_preset();
/// config.data.inputs = vec!["./reads.jsonl".to_string()];
/// config.training.iterations = 10_000;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlipflopConfig {
    /// Read data configuration.
    pub data: DataConfig,

    /// Chunk length and batch sizing policy.
    #[serde(default)]
    pub chunks: ChunkConfig,

    /// Dwell-time filter settings.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Network architecture settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Output directory for checkpoints and logs.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./training".into()
}

fn default_seed() -> u64 {
    42
}

/// Where reads come from and how they are interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// JSONL files of mapped reads.
    pub inputs: Vec<String>,

    /// Base alphabet, one character per symbol.
    #[serde(default = "default_alphabet")]
    pub alphabet: String,

    /// Maximum reads to load per input file. Enables periodic reload.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Optional newline-separated read id list restricting training.
    #[serde(default)]
    pub read_id_list: Option<String>,
}

fn default_alphabet() -> String {
    "ACGT".into()
}

/// Chunk length bounds and the batch sizing policy.
///
/// Chunk lengths are drawn uniformly between the bounds each iteration.
/// The batch size then scales inversely so every step carries roughly
/// `min_batch_size * chunk_len_max` samples regardless of the draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Minimum chunk length in samples.
    #[serde(default = "default_chunk_len_min")]
    pub chunk_len_min: usize,

    /// Maximum chunk length in samples.
    #[serde(default = "default_chunk_len_max")]
    pub chunk_len_max: usize,

    /// Chunks per batch at the maximum chunk length.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
}

fn default_chunk_len_min() -> usize {
    2000
}
fn default_chunk_len_max() -> usize {
    4000
}
fn default_min_batch_size() -> usize {
    50
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_len_min: default_chunk_len_min(),
            chunk_len_max: default_chunk_len_max(),
            min_batch_size: default_min_batch_size(),
        }
    }
}

/// Dwell-time filter settings.
///
/// A chunk passes when its mean dwell lies within
/// `location ± deviation * scale` of the estimated filter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Reads sampled to estimate the filter parameters.
    #[serde(default = "default_sample_reads")]
    pub sample_reads: usize,

    /// Scale multiples below the location before rejection.
    #[serde(default = "default_dwell_deviation")]
    pub min_dwell_deviation: f64,

    /// Scale multiples above the location before rejection.
    #[serde(default = "default_dwell_deviation")]
    pub max_dwell_deviation: f64,

    /// MAD scale factor; 1.4826 matches the standard deviation for
    /// normal data.
    #[serde(default = "default_mad_factor")]
    pub mad_factor: f64,
}

fn default_sample_reads() -> usize {
    1000
}
fn default_dwell_deviation() -> f64 {
    10.0
}
fn default_mad_factor() -> f64 {
    crate::stats::MAD_NORMAL_FACTOR
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            sample_reads: default_sample_reads(),
            min_dwell_deviation: default_dwell_deviation(),
            max_dwell_deviation: default_dwell_deviation(),
            mad_factor: default_mad_factor(),
        }
    }
}

/// Network architecture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture registry key.
    #[serde(default)]
    pub kind: ModelKind,

    /// Hidden feature width.
    #[serde(default = "default_model_size")]
    pub size: usize,

    /// Convolution window length in samples, odd.
    #[serde(default = "default_winlen")]
    pub winlen: usize,

    /// Downsampling stride between samples and output blocks.
    #[serde(default = "default_stride")]
    pub stride: usize,
}

fn default_model_size() -> usize {
    256
}
fn default_winlen() -> usize {
    19
}
fn default_stride() -> usize {
    2
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::default(),
            size: default_model_size(),
            winlen: default_winlen(),
            stride: default_stride(),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of optimization iterations.
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Base learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Reciprocal learning-rate decay constant in steps.
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,

    /// Sharpening factor applied inside the loss.
    #[serde(default = "default_sharpen")]
    pub sharpen: f64,

    /// Smoothing factor for progress reporting.
    #[serde(default = "default_smooth")]
    pub smooth: f64,

    /// Checkpoint every this many iterations.
    #[serde(default = "default_save_every")]
    pub save_every: usize,

    /// Reload the read collection every this many iterations when a read
    /// limit is set.
    #[serde(default = "default_reload_after_batches")]
    pub reload_after_batches: usize,

    /// Instantaneous-to-smoothed loss ratio treated as a poison batch.
    /// Zero logs every batch.
    #[serde(default = "default_poison_threshold")]
    pub poison_threshold: f64,

    /// Compute device: `auto`, `cpu` or `cuda:<index>`.
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_iterations() -> usize {
    50_000
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_lr_decay() -> f64 {
    5000.0
}
fn default_sharpen() -> f64 {
    1.0
}
fn default_smooth() -> f64 {
    0.45
}
fn default_save_every() -> usize {
    5000
}
fn default_reload_after_batches() -> usize {
    500
}
fn default_poison_threshold() -> f64 {
    10.0
}
fn default_device() -> String {
    "auto".into()
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            lr_decay: default_lr_decay(),
            sharpen: default_sharpen(),
            smooth: default_smooth(),
            save_every: default_save_every(),
            reload_after_batches: default_reload_after_batches(),
            poison_threshold: default_poison_threshold(),
            device: default_device(),
        }
    }
}

impl FlipflopConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Fails when serialization or the write fails.
    pub fn to_file(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(Path::new(path), yaml)?;
        Ok(())
    }

    /// Default settings for a 4-base DNA alphabet.
    #[must_use]
    pub fn dna_preset() -> Self {
        Self {
            data: DataConfig {
                inputs: vec!["./reads.jsonl".to_string()],
                alphabet: default_alphabet(),
                limit: None,
                read_id_list: None,
            },
            chunks: ChunkConfig::default(),
            filter: FilterConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }

    /// Check the configuration for contradictions before training.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.data.inputs.is_empty() {
            return Err(FlipflopError::Config("data.inputs is required".into()));
        }
        if self.data.alphabet.is_empty() {
            return Err(FlipflopError::Config("data.alphabet is required".into()));
        }
        {
            let mut seen = std::collections::HashSet::new();
            if !self.data.alphabet.chars().all(|c| seen.insert(c)) {
                return Err(FlipflopError::Config(format!(
                    "data.alphabet {:?} has repeated symbols",
                    self.data.alphabet
                )));
            }
        }
        if self.data.limit == Some(0) {
            return Err(FlipflopError::Config("data.limit must be > 0".into()));
        }
        if self.chunks.min_batch_size == 0 {
            return Err(FlipflopError::Config(
                "chunks.min_batch_size must be > 0".into(),
            ));
        }
        if self.chunks.chunk_len_min == 0
            || self.chunks.chunk_len_min > self.chunks.chunk_len_max
        {
            return Err(FlipflopError::Config(format!(
                "chunk length bounds [{}, {}] are invalid",
                self.chunks.chunk_len_min, self.chunks.chunk_len_max
            )));
        }
        if self.chunks.chunk_len_min < self.model.stride {
            return Err(FlipflopError::Config(
                "chunks.chunk_len_min must be at least model.stride".into(),
            ));
        }
        if self.filter.min_dwell_deviation < 0.0 || self.filter.max_dwell_deviation < 0.0 {
            return Err(FlipflopError::Config(
                "filter deviation multipliers must be non-negative".into(),
            ));
        }
        if self.filter.mad_factor <= 0.0 {
            return Err(FlipflopError::Config(
                "filter.mad_factor must be positive".into(),
            ));
        }
        if self.training.iterations == 0 {
            return Err(FlipflopError::Config(
                "training.iterations must be > 0".into(),
            ));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(FlipflopError::Config(
                "training.learning_rate must be positive".into(),
            ));
        }
        if self.training.lr_decay <= 0.0 {
            return Err(FlipflopError::Config(
                "training.lr_decay must be positive".into(),
            ));
        }
        if self.training.sharpen <= 0.0 {
            return Err(FlipflopError::Config(
                "training.sharpen must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.training.smooth) {
            return Err(FlipflopError::Config(
                "training.smooth must be between 0.0 and 1.0".into(),
            ));
        }
        if self.training.save_every == 0 {
            return Err(FlipflopError::Config(
                "training.save_every must be > 0".into(),
            ));
        }
        if self.training.reload_after_batches == 0 {
            return Err(FlipflopError::Config(
                "training.reload_after_batches must be > 0".into(),
            ));
        }
        if self.training.poison_threshold < 0.0 {
            return Err(FlipflopError::Config(
                "training.poison_threshold must be non-negative".into(),
            ));
        }
        if self.output_dir.is_empty() {
            return Err(FlipflopError::Config("output_dir is required".into()));
        }
        Ok(())
    }
}
