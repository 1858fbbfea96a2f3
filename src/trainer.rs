//! Training loop and optimization.
//!
//! One [`Trainer`] drives a whole run: it owns the model parameters, the
//! optimizer and scheduler, the random stream, and the checkpoint writer.
//! The read collection is deliberately not a field; it is threaded through
//! [`Trainer::run_iteration`] by reference and replaced wholesale on a
//! periodic reload, so nothing can hold into a stale collection.
//!
//! Per iteration: draw a chunk length, size the batch so the sample volume
//! stays near `min_batch_size * chunk_len_max`, assemble and filter
//! chunks, encode their labels, forward, loss, backward, step, smooth,
//! and watch for poison batches. Reporting, checkpointing and reload run
//! on fixed cadences between iterations.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{CheckpointManager, CheckpointManifest};
use crate::chunk_log::ChunkLog;
use crate::chunks::{
    assemble_batch, sample_filter_parameters, FilterParameters, RejectionTally,
};
use crate::config::FlipflopConfig;
use crate::data::{JsonlReadSource, Read, ReadSource};
use crate::error::{FlipflopError, Result};
use crate::flipflop::flip_flop_code;
use crate::loss::crf_flipflop_loss;
use crate::model::{build_model, Model};
use crate::optimizer::{AdamWOptimizer, OptimizerConfig};
use crate::scheduler::{LRScheduler, SchedulerType};
use crate::stats::ExponentialSmoother;

/// Iterations between progress report lines.
const REPORT_EVERY: usize = 50;

/// What one optimization step did.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Mean loss over chunks with labels.
    pub loss: f64,
    /// Chunk length drawn for this step, a stride multiple.
    pub chunk_len: usize,
    /// Chunks actually trained on.
    pub batch_size: usize,
    /// Whether the step tripped the poison detector.
    pub poison: bool,
}

/// Mutable per-run counters threaded through every iteration.
///
/// Interval counters accumulate between report lines and reset when one is
/// emitted; the smoothed loss and the overall chunk count span the run.
#[derive(Debug)]
pub struct TrainingState {
    /// Exponentially smoothed loss estimate.
    pub smoothed_loss: ExponentialSmoother,
    /// Chunks trained on since the run started.
    pub total_chunks: usize,
    /// Signal samples consumed since the last report.
    pub interval_samples: usize,
    /// Bases consumed since the last report.
    pub interval_bases: usize,
    /// Rejections tallied since the last report.
    pub interval_rejections: RejectionTally,
    /// When the current report interval began.
    pub interval_start: Instant,
}

impl TrainingState {
    /// Fresh state with the given smoothing factor.
    ///
    /// # Errors
    ///
    /// Fails when the smoothing factor is out of range.
    pub fn new(smooth: f64) -> Result<Self> {
        Ok(Self {
            smoothed_loss: ExponentialSmoother::new(smooth)?,
            total_chunks: 0,
            interval_samples: 0,
            interval_bases: 0,
            interval_rejections: RejectionTally::default(),
            interval_start: Instant::now(),
        })
    }

    /// Reset the between-report counters.
    pub fn reset_interval(&mut self) {
        self.interval_samples = 0;
        self.interval_bases = 0;
        self.interval_rejections.clear();
        self.interval_start = Instant::now();
    }
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use flipflop_rs::{FlipflopConfig, Trainer};
///
/// # fn main() -> flipflop_rs::Result<()> {
/// let config = FlipflopConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: FlipflopConfig,
    device: Device,
    source: Box<dyn ReadSource>,
    varmap: VarMap,
    model: Box<dyn Model>,
    optimizer: AdamWOptimizer,
    scheduler: LRScheduler,
    checkpoints: CheckpointManager,
    rng: ChaCha8Rng,
    nbase: usize,
}

impl Trainer {
    /// Create a trainer reading from the JSONL files named in the
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or model
    /// construction fails.
    pub fn new(config: FlipflopConfig) -> Result<Self> {
        config.validate()?;
        let source = Box::new(JsonlReadSource::from_config(&config.data)?);
        Self::with_source(config, source)
    }

    /// Create a trainer over an arbitrary read source.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or model
    /// construction fails.
    pub fn with_source(config: FlipflopConfig, source: Box<dyn ReadSource>) -> Result<Self> {
        config.validate()?;
        let device = select_device(&config.training.device)?;
        let nbase = config.data.alphabet.chars().count();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = build_model(&config.model, nbase, vb)?;

        let optimizer = OptimizerConfig {
            learning_rate: config.training.learning_rate,
            weight_decay: config.training.weight_decay,
            ..OptimizerConfig::default()
        }
        .build_adamw(&varmap)?;

        let scheduler = LRScheduler::new(
            SchedulerType::Reciprocal {
                decay: config.training.lr_decay,
            },
            config.training.learning_rate,
        );

        let checkpoints = CheckpointManager::new(PathBuf::from(&config.output_dir));
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            device,
            source,
            varmap,
            model,
            optimizer,
            scheduler,
            checkpoints,
            rng,
            nbase,
        })
    }

    /// Restore parameters from a `.params` checkpoint file before
    /// training, continuing from those weights.
    ///
    /// # Errors
    ///
    /// Fails when the file is missing or does not match the model.
    pub fn resume_from(&mut self, params_path: &str) -> Result<()> {
        let path = Path::new(params_path);
        CheckpointManager::load_params(path, &mut self.varmap)?;
        let manifest_path = path.with_extension("checkpoint");
        if manifest_path.exists() {
            let manifest = CheckpointManager::load_manifest(&manifest_path)?;
            tracing::info!(
                "resumed from {} (iteration {}, smoothed loss {:.4})",
                params_path,
                manifest.iteration,
                manifest.smoothed_loss
            );
        } else {
            tracing::info!("resumed parameters from {params_path}");
        }
        Ok(())
    }

    /// Run the full training loop.
    ///
    /// # Errors
    ///
    /// Returns an error when data cannot be loaded, a batch cannot be
    /// assembled within the retry budget, or a step fails. Per-iteration
    /// failures are never retried; a half-applied optimization step is not
    /// safe to continue from.
    pub fn train(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        tracing::info!("flipflop-rs {}", env!("CARGO_PKG_VERSION"));
        tracing::info!("  device: {:?}", self.device);
        tracing::info!("  alphabet: {}", self.config.data.alphabet);
        tracing::info!("  read data sha256: {}", self.source.checksum()?);

        let mut chunk_log = ChunkLog::create(Path::new(&self.config.output_dir))?;
        let mut reads = self.load_reads()?;
        let mut filter_params = self.estimate_filter(&reads);

        let param_count: usize = self.varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        tracing::info!("network has {param_count} parameters");

        let mut state = TrainingState::new(self.config.training.smooth)?;

        // Index 0 is the untrained network.
        self.checkpoints
            .save_indexed(0, &self.varmap, &self.manifest(0, &state))?;

        let iterations = self.config.training.iterations;
        let pb = ProgressBar::new(iterations as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}",
                )?
                .progress_chars("#>-"),
        );

        let save_every = self.config.training.save_every;
        let reload_every = self.config.training.reload_after_batches;
        for i in 0..iterations {
            let metrics =
                self.run_iteration(i, &reads, &filter_params, &mut state, &mut chunk_log)?;

            pb.set_message(format!("{:.4}", state.smoothed_loss.value()));
            pb.inc(1);
            if metrics.poison {
                pb.println(format!(
                    "poison batch at iteration {i}: loss {:.4}",
                    metrics.loss
                ));
            }

            if (i + 1) % REPORT_EVERY == 0 {
                self.report(i, &mut state);
            }

            if (i + 1) % save_every == 0 {
                self.checkpoints.save_indexed(
                    (i + 1) / save_every,
                    &self.varmap,
                    &self.manifest(i + 1, &state),
                )?;
            }

            // Reload trades resident memory for data diversity; skipped on
            // the last iteration where the fresh subset would go unused.
            if self.config.data.limit.is_some()
                && (i + 1) % reload_every == 0
                && i + 1 != iterations
            {
                reads = self.load_reads()?;
                filter_params = self.estimate_filter(&reads);
            }
        }
        pb.finish_with_message("training complete");

        chunk_log.flush()?;
        self.checkpoints
            .save_final(&self.varmap, &self.manifest(iterations, &state))?;
        tracing::info!(
            "trained on {} chunks over {iterations} iterations",
            state.total_chunks
        );
        Ok(())
    }

    /// Perform a single optimization step against the given reads.
    ///
    /// Exposed so that one iteration can be exercised without a full run;
    /// [`train`](Trainer::train) calls this in a loop.
    ///
    /// # Errors
    ///
    /// Fails when batch assembly exhausts its retry budget or any tensor
    /// operation fails.
    pub fn run_iteration(
        &mut self,
        iteration: usize,
        reads: &[Read],
        filter_params: &FilterParameters,
        state: &mut TrainingState,
        chunk_log: &mut ChunkLog,
    ) -> Result<StepMetrics> {
        let min_len = self.config.chunks.chunk_len_min;
        let max_len = self.config.chunks.chunk_len_max;
        let min_batch = self.config.chunks.min_batch_size;
        let sharpen = self.config.training.sharpen;
        let poison_threshold = self.config.training.poison_threshold;
        let stride = self.model.stride();

        // Chunk length is uniform in the configured range, rounded down to
        // a stride multiple so the model emits whole blocks.
        let chunk_len = (self.rng.gen_range(min_len..=max_len) / stride) * stride;

        // Batch size scales inversely with chunk length to keep the sample
        // volume per step roughly constant, capped by the collection size.
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let target_batch_size =
            (min_batch as f64 * max_len as f64 / chunk_len as f64 + 0.5) as usize;
        let batch_size = target_batch_size.min(reads.len());

        let log_all = poison_threshold == 0.0;
        let (batch, rejections) = assemble_batch(
            reads,
            batch_size,
            chunk_len,
            filter_params,
            &self.config.filter,
            &mut self.rng,
            iteration,
            log_all.then_some(&mut *chunk_log),
        )?;
        state.interval_rejections.merge(&rejections);
        state.total_chunks += batch.len();

        let mut seqs = Vec::new();
        let mut seqlens = Vec::with_capacity(batch.len());
        for chunk in &batch {
            let code = flip_flop_code(&chunk.sequence, self.nbase)?;
            seqlens.push(code.len());
            seqs.extend(code);
        }

        // Input tensor contract: (samples, batch, 1 channel).
        let nchunks = batch.len();
        let mut flat = Vec::with_capacity(nchunks * chunk_len);
        for chunk in &batch {
            flat.extend_from_slice(&chunk.signal);
        }
        let indata = Tensor::from_vec(flat, (nchunks, chunk_len), &self.device)?
            .transpose(0, 1)?
            .unsqueeze(2)?;

        let outputs = self.model.forward(&indata)?;
        let lossvec = crf_flipflop_loss(&outputs, &seqs, &seqlens, sharpen)?;

        let nvalid = seqlens.iter().filter(|&&l| l > 0).count();
        if nvalid == 0 {
            tracing::warn!("iteration {iteration}: no labeled chunks in batch, skipping step");
            return Ok(StepMetrics {
                loss: 0.0,
                chunk_len,
                batch_size: nchunks,
                poison: false,
            });
        }
        #[allow(clippy::cast_precision_loss)]
        let loss = lossvec.sum_all()?.affine(1.0 / nvalid as f64, 0.0)?;

        self.optimizer.step(&loss)?;
        self.scheduler.step(&mut self.optimizer);

        let loss_value = f64::from(loss.to_vec0::<f32>()?);
        state.smoothed_loss.update(loss_value);

        let poison = poison_threshold > 0.0
            && loss_value / state.smoothed_loss.value() >= poison_threshold;
        if poison {
            tracing::warn!(
                "iteration {iteration}: loss {loss_value:.4} against smoothed {:.4}, dumping batch",
                state.smoothed_loss.value()
            );
            chunk_log.write_batch(iteration, &batch, &lossvec.to_vec1::<f32>()?)?;
        } else if log_all {
            chunk_log.write_batch(iteration, &batch, &lossvec.to_vec1::<f32>()?)?;
        }

        state.interval_bases += seqlens.iter().sum::<usize>();
        state.interval_samples += nchunks * chunk_len;

        Ok(StepMetrics {
            loss: loss_value,
            chunk_len,
            batch_size: nchunks,
            poison,
        })
    }

    fn load_reads(&mut self) -> Result<Vec<Read>> {
        let mut reads = self.source.load(self.config.data.limit)?;
        if reads.is_empty() {
            return Err(FlipflopError::Data("no reads loaded".into()));
        }
        reads.shuffle(&mut self.rng);
        tracing::info!("loaded {} reads", reads.len());
        Ok(reads)
    }

    fn estimate_filter(&mut self, reads: &[Read]) -> FilterParameters {
        // A mid-range chunk length is representative of what training
        // will actually draw.
        let sampling_len =
            (self.config.chunks.chunk_len_min + self.config.chunks.chunk_len_max) / 2;
        let params =
            sample_filter_parameters(reads, sampling_len, &self.config.filter, &mut self.rng);
        tracing::info!(
            "sampled {} chunks: median(mean_dwell)={:.2}, mad(mean_dwell)={:.2}",
            params.n_sampled,
            params.location,
            params.scale
        );
        params
    }

    fn report(&self, iteration: usize, state: &mut TrainingState) {
        let elapsed = state.interval_start.elapsed().as_secs_f64().max(1e-9);
        #[allow(clippy::cast_precision_loss)]
        let ksample_rate = state.interval_samples as f64 / 1000.0 / elapsed;
        #[allow(clippy::cast_precision_loss)]
        let kbase_rate = state.interval_bases as f64 / 1000.0 / elapsed;
        tracing::info!(
            "iteration {:6} loss {:6.4} {:5.2}s ({:.2} ksample/s {:.2} kbase/s) lr={:.2e} rejections[{}]",
            iteration + 1,
            state.smoothed_loss.value(),
            elapsed,
            ksample_rate,
            kbase_rate,
            self.optimizer.learning_rate(),
            state.interval_rejections
        );
        state.reset_interval();
    }

    fn manifest(&self, iteration: usize, state: &TrainingState) -> CheckpointManifest {
        CheckpointManifest {
            iteration,
            learning_rate: self.optimizer.learning_rate(),
            smoothed_loss: state.smoothed_loss.value(),
            alphabet: self.config.data.alphabet.clone(),
            model: self.config.model.clone(),
        }
    }

    /// Parameter store backing the model, for inspection.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Device the run executes on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Resolve a device specification string.
///
/// `auto` prefers CUDA when the feature is compiled in and a device is
/// reachable, falling back to CPU with a warning. The
/// `FLIPFLOP_FORCE_CPU` environment variable overrides everything.
fn select_device(spec: &str) -> Result<Device> {
    let force_cpu = std::env::var("FLIPFLOP_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if force_cpu {
        tracing::warn!("CPU mode forced via FLIPFLOP_FORCE_CPU");
        return Ok(Device::Cpu);
    }
    match spec {
        "cpu" => Ok(Device::Cpu),
        "auto" => {
            if cfg!(feature = "cuda") {
                match Device::cuda_if_available(0) {
                    Ok(device @ Device::Cuda(_)) => Ok(device),
                    Ok(_) => {
                        tracing::warn!("CUDA not available, falling back to CPU");
                        Ok(Device::Cpu)
                    }
                    Err(err) => {
                        tracing::warn!("CUDA init failed ({err}), falling back to CPU");
                        Ok(Device::Cpu)
                    }
                }
            } else {
                Ok(Device::Cpu)
            }
        }
        other => {
            if let Some(index) = other.strip_prefix("cuda") {
                let index = index
                    .strip_prefix(':')
                    .unwrap_or("0")
                    .parse::<usize>()
                    .map_err(|_| {
                        FlipflopError::Config(format!("invalid device spec {other:?}"))
                    })?;
                Ok(Device::new_cuda(index)?)
            } else {
                Err(FlipflopError::Config(format!(
                    "invalid device spec {other:?}, expected auto, cpu or cuda:<index>"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_device_cpu() {
        assert!(matches!(select_device("cpu").unwrap(), Device::Cpu));
        assert!(matches!(select_device("auto").unwrap(), Device::Cpu));
        assert!(select_device("tpu").is_err());
    }

    #[test]
    fn test_state_interval_reset() {
        let mut state = TrainingState::new(0.45).unwrap();
        state.interval_samples = 100;
        state.interval_bases = 10;
        state.total_chunks = 5;
        state
            .interval_rejections
            .record(crate::chunks::RejectReason::TooShort);
        state.reset_interval();
        assert_eq!(state.interval_samples, 0);
        assert_eq!(state.interval_bases, 0);
        assert!(state.interval_rejections.is_empty());
        // Whole-run counters survive a report.
        assert_eq!(state.total_chunks, 5);
    }

    #[test]
    fn test_state_rejects_bad_smooth() {
        assert!(TrainingState::new(2.0).is_err());
    }
}
