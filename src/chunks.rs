//! Chunk filtering and batch assembly.
//!
//! Every iteration draws a fresh batch of chunks from the read collection.
//! A chunk is accepted when its mean dwell time sits inside a band around
//! the robust location/scale estimate computed once per data load; anything
//! else is rejected with a reason that is tallied, never thrown.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::chunk_log::ChunkLog;
use crate::config::FilterConfig;
use crate::data::{Chunk, Read};
use crate::error::{FlipflopError, Result};
use crate::stats::med_mad;

/// Shuffled passes over the read collection before batch assembly gives up.
const MAX_ASSEMBLY_PASSES: usize = 10;

/// Why a candidate chunk was not used for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RejectReason {
    /// Source read shorter than the requested chunk length.
    TooShort,
    /// Mean dwell below the low edge of the filter band.
    BelowMinDwell,
    /// Mean dwell above the high edge of the filter band.
    AboveMaxDwell,
    /// Chunk window covers no bases at all.
    InsufficientCoverage,
    /// Anything else.
    Other,
}

impl RejectReason {
    /// Stable name used in tallies and the chunk log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::TooShort => "too_short",
            RejectReason::BelowMinDwell => "below_min_dwell",
            RejectReason::AboveMaxDwell => "above_max_dwell",
            RejectReason::InsufficientCoverage => "insufficient_coverage",
            RejectReason::Other => "other",
        }
    }
}

/// Counts of rejections by reason, accumulated during batch assembly and
/// merged into the interval totals reported by the training loop.
#[derive(Debug, Clone, Default)]
pub struct RejectionTally(BTreeMap<RejectReason, usize>);

impl RejectionTally {
    /// Count one rejection.
    pub fn record(&mut self, reason: RejectReason) {
        *self.0.entry(reason).or_insert(0) += 1;
    }

    /// Fold another tally into this one.
    pub fn merge(&mut self, other: &RejectionTally) {
        for (&reason, &count) in &other.0 {
            *self.0.entry(reason).or_insert(0) += count;
        }
    }

    /// Total rejections across all reasons.
    #[must_use]
    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    /// True when nothing has been rejected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate reasons and counts in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = (RejectReason, usize)> + '_ {
        self.0.iter().map(|(&r, &c)| (r, c))
    }

    /// Drop all counts.
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl std::fmt::Display for RejectionTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (reason, count) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", reason.as_str(), count)?;
            first = false;
        }
        Ok(())
    }
}

/// Robust dwell statistics estimated from a sample of reads.
///
/// Valid only for the read collection it was estimated from; a reload of
/// the collection requires re-estimation.
#[derive(Debug, Clone, Copy)]
pub struct FilterParameters {
    /// Median of sampled per-chunk mean dwell times.
    pub location: f64,
    /// Scaled median absolute deviation of the same sample.
    pub scale: f64,
    /// How many chunks contributed to the estimate.
    pub n_sampled: usize,
}

impl FilterParameters {
    /// True when no chunks could be sampled and the band is meaningless.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.n_sampled == 0
    }
}

/// Estimate [`FilterParameters`] from a random sample of reads.
///
/// One chunk of `chunk_len` samples is drawn per sampled read; chunks that
/// cover no bases contribute nothing. An empty sample is reported, not an
/// error: the returned parameters are degenerate and the filter passes
/// everything through.
pub fn sample_filter_parameters(
    reads: &[Read],
    chunk_len: usize,
    filter: &FilterConfig,
    rng: &mut impl Rng,
) -> FilterParameters {
    let mut dwells = Vec::new();
    let n = filter.sample_reads.min(reads.len());
    for read in reads.choose_multiple(rng, n) {
        if let Ok(chunk) = read.sample_chunk(chunk_len, rng) {
            if let Some(dwell) = chunk.mean_dwell() {
                dwells.push(dwell);
            }
        }
    }
    match med_mad(&dwells, filter.mad_factor) {
        Some((location, scale)) => FilterParameters {
            location,
            scale,
            n_sampled: dwells.len(),
        },
        None => {
            tracing::warn!(
                "no chunks of length {chunk_len} could be sampled from {} reads; \
                 dwell filtering disabled",
                reads.len()
            );
            FilterParameters {
                location: 0.0,
                scale: 0.0,
                n_sampled: 0,
            }
        }
    }
}

/// Decide whether a chunk is usable for training.
///
/// A pure function of the chunk summary, the filter parameters, and the
/// configured deviation multipliers, so a rejection can always be
/// reproduced from the chunk log.
pub fn chunk_verdict(
    chunk: &Chunk,
    params: &FilterParameters,
    filter: &FilterConfig,
) -> std::result::Result<(), RejectReason> {
    let Some(dwell) = chunk.mean_dwell() else {
        return Err(RejectReason::InsufficientCoverage);
    };
    if params.is_degenerate() {
        return Ok(());
    }
    if dwell < params.location - filter.min_dwell_deviation * params.scale {
        return Err(RejectReason::BelowMinDwell);
    }
    if dwell > params.location + filter.max_dwell_deviation * params.scale {
        return Err(RejectReason::AboveMaxDwell);
    }
    Ok(())
}

/// Assemble a batch of chunks of `chunk_len` samples.
///
/// The batch never exceeds the requested size nor the size of the read
/// collection. Each pass visits the reads once in a fresh shuffled order,
/// drawing one candidate chunk per read, so a single pass never samples
/// the same read twice; a read whose candidate was rejected gets a fresh
/// offset on the next pass. Passes repeat until the batch is full, up to
/// a fixed budget. A partially filled batch is returned as-is; a
/// completely empty one after the full budget is an
/// [`FlipflopError::InsufficientData`] failure.
///
/// The returned tally satisfies
/// `accepted + tally.total() == sampling attempts`.
///
/// # Errors
///
/// Fails when every attempt in every pass was rejected, or when the chunk
/// log cannot be written.
pub fn assemble_batch(
    reads: &[Read],
    batch_size: usize,
    chunk_len: usize,
    params: &FilterParameters,
    filter: &FilterConfig,
    rng: &mut impl Rng,
    iteration: usize,
    mut chunk_log: Option<&mut ChunkLog>,
) -> Result<(Vec<Chunk>, RejectionTally)> {
    let batch_size = batch_size.min(reads.len());
    let mut accepted = Vec::with_capacity(batch_size);
    let mut tally = RejectionTally::default();
    if batch_size == 0 {
        return Ok((accepted, tally));
    }

    let mut attempts = 0usize;
    let mut passes = 0usize;
    let mut order: Vec<usize> = (0..reads.len()).collect();
    while accepted.len() < batch_size && passes < MAX_ASSEMBLY_PASSES {
        passes += 1;
        order.shuffle(rng);
        for &idx in &order {
            if accepted.len() >= batch_size {
                break;
            }
            attempts += 1;
            let read = &reads[idx];
            match read.sample_chunk(chunk_len, rng) {
                Err(reason) => {
                    tally.record(reason);
                    if let Some(log) = chunk_log.as_deref_mut() {
                        log.record_read(iteration, &read.id, reason.as_str())?;
                    }
                }
                Ok(chunk) => match chunk_verdict(&chunk, params, filter) {
                    Ok(()) => {
                        if let Some(log) = chunk_log.as_deref_mut() {
                            log.record_chunk(iteration, &chunk, "accepted", None)?;
                        }
                        accepted.push(chunk);
                    }
                    Err(reason) => {
                        tally.record(reason);
                        if let Some(log) = chunk_log.as_deref_mut() {
                            log.record_chunk(iteration, &chunk, reason.as_str(), None)?;
                        }
                    }
                },
            }
        }
    }

    if accepted.is_empty() {
        return Err(FlipflopError::InsufficientData { attempts, passes });
    }
    Ok((accepted, tally))
}
