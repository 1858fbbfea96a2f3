//! Read loading and chunk extraction.
//!
//! A [`Read`] is one mapped strand: the raw current trace, the reference
//! base sequence aligned to it, and the sample offset at which each base
//! starts. Training never consumes whole reads; it consumes [`Chunk`]s cut
//! from them at random offsets, one chunk length per iteration.
//!
//! Reads are interchanged as JSONL, one record per line:
//!
//! ```json
//! {"id": "read-0001", "signal": [0.12, ...], "sequence": "ACGGT...", "base_locations": [0, 9, ...]}
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunks::RejectReason;
use crate::config::DataConfig;
use crate::error::{FlipflopError, Result};

/// One mapped read held in memory.
///
/// The base sequence is stored as alphabet indices, and `base_locations[i]`
/// is the signal sample at which base `i` starts. Both vectors have the
/// same length and `base_locations` is non-decreasing within the signal.
#[derive(Debug, Clone)]
pub struct Read {
    /// Read identifier.
    pub id: String,
    /// Raw current samples.
    pub signal: Vec<f32>,
    /// Reference bases as alphabet indices.
    pub sequence: Vec<u8>,
    /// Signal sample index where each base starts.
    pub base_locations: Vec<usize>,
}

impl Read {
    /// Number of signal samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signal.len()
    }

    /// True if the read carries no signal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signal.is_empty()
    }

    /// Cut a chunk of `chunk_len` samples at a random valid offset.
    ///
    /// The label span is every base whose start sample falls inside the
    /// window. Reads shorter than the requested length cannot supply a
    /// chunk and yield [`RejectReason::TooShort`].
    pub fn sample_chunk(
        &self,
        chunk_len: usize,
        rng: &mut impl Rng,
    ) -> std::result::Result<Chunk, RejectReason> {
        if chunk_len == 0 || self.signal.len() < chunk_len {
            return Err(RejectReason::TooShort);
        }
        let start = rng.gen_range(0..=self.signal.len() - chunk_len);
        Ok(self.chunk_at(start, chunk_len))
    }

    /// Cut the chunk starting at a fixed sample offset.
    ///
    /// # Panics
    ///
    /// Panics if `start + chunk_len` exceeds the signal length.
    #[must_use]
    pub fn chunk_at(&self, start: usize, chunk_len: usize) -> Chunk {
        let end = start + chunk_len;
        assert!(end <= self.signal.len());
        let lo = self.base_locations.partition_point(|&p| p < start);
        let hi = self.base_locations.partition_point(|&p| p < end);
        Chunk {
            read_id: self.id.clone(),
            start_sample: start,
            signal: self.signal[start..end].to_vec(),
            sequence: self.sequence[lo..hi].to_vec(),
        }
    }
}

/// A contiguous sub-segment of one read, the atomic training example.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Identifier of the source read.
    pub read_id: String,
    /// Sample offset of the chunk within the source read.
    pub start_sample: usize,
    /// Current samples for the chunk window.
    pub signal: Vec<f32>,
    /// Base labels whose starts fall inside the window.
    pub sequence: Vec<u8>,
}

impl Chunk {
    /// Mean number of samples per base, or `None` when the chunk covers no
    /// bases at all.
    #[must_use]
    pub fn mean_dwell(&self) -> Option<f64> {
        if self.sequence.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.signal.len() as f64 / self.sequence.len() as f64)
    }
}

/// Supplier of the in-memory read collection.
///
/// The training loop reloads through this interface when periodic refresh
/// is enabled, so implementations must be callable more than once. The
/// checksum identifies the backing content for provenance logging.
pub trait ReadSource {
    /// Load up to `limit` reads per backing file.
    fn load(&self, limit: Option<usize>) -> Result<Vec<Read>>;

    /// Content digest of the backing data.
    fn checksum(&self) -> Result<String>;
}

/// Wire format for one JSONL read record.
#[derive(Debug, Serialize, Deserialize)]
struct ReadRecord {
    id: String,
    signal: Vec<f32>,
    sequence: String,
    base_locations: Vec<usize>,
}

/// [`ReadSource`] over one or more JSONL files of mapped reads.
pub struct JsonlReadSource {
    paths: Vec<PathBuf>,
    alphabet: String,
    read_ids: Option<HashSet<String>>,
}

impl JsonlReadSource {
    /// Create a source over the given files.
    ///
    /// When `read_ids` is supplied, records whose id is not in the set are
    /// skipped before the per-file limit applies.
    #[must_use]
    pub fn new(
        paths: Vec<PathBuf>,
        alphabet: String,
        read_ids: Option<HashSet<String>>,
    ) -> Self {
        Self {
            paths,
            alphabet,
            read_ids,
        }
    }

    /// Build a source from the data section of a run configuration.
    pub fn from_config(config: &DataConfig) -> Result<Self> {
        let read_ids = match &config.read_id_list {
            Some(path) => Some(load_read_id_list(Path::new(path))?),
            None => None,
        };
        Ok(Self::new(
            config.inputs.iter().map(PathBuf::from).collect(),
            config.alphabet.clone(),
            read_ids,
        ))
    }

    fn parse_record(&self, record: ReadRecord) -> Result<Read> {
        let sequence = encode_sequence(&record.sequence, &self.alphabet)
            .map_err(|e| FlipflopError::Data(format!("read {}: {e}", record.id)))?;
        if record.base_locations.len() != sequence.len() {
            return Err(FlipflopError::Data(format!(
                "read {}: {} base locations for {} bases",
                record.id,
                record.base_locations.len(),
                sequence.len()
            )));
        }
        if record.base_locations.windows(2).any(|w| w[0] > w[1]) {
            return Err(FlipflopError::Data(format!(
                "read {}: base locations are not sorted",
                record.id
            )));
        }
        if let Some(&last) = record.base_locations.last() {
            if last >= record.signal.len() {
                return Err(FlipflopError::Data(format!(
                    "read {}: base location {last} beyond signal of length {}",
                    record.id,
                    record.signal.len()
                )));
            }
        }
        Ok(Read {
            id: record.id,
            signal: record.signal,
            sequence,
            base_locations: record.base_locations,
        })
    }
}

impl ReadSource for JsonlReadSource {
    fn load(&self, limit: Option<usize>) -> Result<Vec<Read>> {
        let mut reads = Vec::new();
        for path in &self.paths {
            let bytes = std::fs::read(path)?;
            tracing::info!(
                "loading reads from {} (sha256 {})",
                path.display(),
                hex_digest(&bytes)
            );
            let text = String::from_utf8(bytes)
                .map_err(|e| FlipflopError::Data(format!("{}: not UTF-8: {e}", path.display())))?;
            let mut loaded_here = 0usize;
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                if limit.is_some_and(|l| loaded_here >= l) {
                    break;
                }
                let record: ReadRecord = serde_json::from_str(line).map_err(|e| {
                    FlipflopError::Data(format!(
                        "{} line {}: {e}",
                        path.display(),
                        lineno + 1
                    ))
                })?;
                if self
                    .read_ids
                    .as_ref()
                    .is_some_and(|ids| !ids.contains(&record.id))
                {
                    continue;
                }
                reads.push(self.parse_record(record)?);
                loaded_here += 1;
            }
            tracing::info!("loaded {loaded_here} reads from {}", path.display());
        }
        Ok(reads)
    }

    fn checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for path in &self.paths {
            hasher.update(std::fs::read(path)?);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Map a base string onto alphabet indices.
fn encode_sequence(sequence: &str, alphabet: &str) -> std::result::Result<Vec<u8>, String> {
    sequence
        .chars()
        .map(|c| {
            alphabet
                .chars()
                .position(|a| a == c)
                .map(|i| {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        i as u8
                    }
                })
                .ok_or_else(|| format!("symbol {c:?} not in alphabet {alphabet:?}"))
        })
        .collect()
}

/// Load a newline-separated read id list.
fn load_read_id_list(path: &Path) -> Result<HashSet<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
