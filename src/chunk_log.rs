//! Per-chunk diagnostics log.
//!
//! An append-only TSV written alongside the checkpoints. The training core
//! only ever writes to it; inspection happens offline. Every record is
//! keyed by the iteration that produced it, and poison batches additionally
//! carry the per-chunk loss so the offending chunk can be pinned down.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::data::Chunk;
use crate::error::Result;

const HEADER: &str = "iteration\tread_id\tstart_sample\tn_samples\tn_bases\tstatus\tloss\n";

/// Writer for the chunk diagnostics file.
pub struct ChunkLog {
    writer: BufWriter<File>,
}

impl ChunkLog {
    /// Create `chunk_log.tsv` inside the output directory.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created or the header not written.
    pub fn create(output_dir: &Path) -> Result<Self> {
        let file = File::create(output_dir.join("chunk_log.tsv"))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(HEADER.as_bytes())?;
        Ok(Self { writer })
    }

    /// Record a chunk verdict, with an optional per-chunk loss.
    pub fn record_chunk(
        &mut self,
        iteration: usize,
        chunk: &Chunk,
        status: &str,
        loss: Option<f32>,
    ) -> Result<()> {
        let loss = loss.map_or_else(|| "-".to_string(), |l| format!("{l:.6}"));
        writeln!(
            self.writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            iteration,
            chunk.read_id,
            chunk.start_sample,
            chunk.signal.len(),
            chunk.sequence.len(),
            status,
            loss
        )?;
        Ok(())
    }

    /// Record a read that could not supply a chunk at all.
    pub fn record_read(&mut self, iteration: usize, read_id: &str, status: &str) -> Result<()> {
        writeln!(
            self.writer,
            "{iteration}\t{read_id}\t-\t-\t-\t{status}\t-"
        )?;
        Ok(())
    }

    /// Dump a whole batch with its loss vector, used when an anomalous
    /// loss spike implicates the batch.
    pub fn write_batch(
        &mut self,
        iteration: usize,
        chunks: &[Chunk],
        losses: &[f32],
    ) -> Result<()> {
        for (chunk, &loss) in chunks.iter().zip(losses) {
            self.record_chunk(iteration, chunk, "batch_dump", Some(loss))?;
        }
        self.flush()
    }

    /// Flush buffered records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
