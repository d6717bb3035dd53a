use std::path::PathBuf;
use std::time::Duration;

use eyre::{bail, Result};

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Tunables shared by every pipeline component.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Directory that holds `request_<id>/` working trees.
    pub storage_root: PathBuf,
    /// Directory that holds the progress store.
    pub state_dir: PathBuf,
    /// Byte budget for a single chunk.
    pub chunk_budget: u64,
    /// Largest artifact the sink accepts in one item.
    pub sink_limit: u64,
    /// Headroom kept below `sink_limit` when splitting.
    pub split_margin: u64,
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub retry_max_delay: Duration,
    pub compression_level: i32,
    /// Minimum spacing between byte-progress notifications per request.
    pub progress_interval: Duration,
    /// Journal size that triggers snapshot compaction.
    pub compact_after_bytes: u64,
    pub sync_writes: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/var/lib/ferry/downloads"),
            state_dir: PathBuf::from("/var/lib/ferry/state"),
            chunk_budget: 4 * GIB,
            sink_limit: 2 * GIB,
            split_margin: 10 * MIB,
            max_concurrent: 2,
            retry_attempts: 5,
            retry_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(600),
            compression_level: 3,
            progress_interval: Duration::from_secs(3),
            compact_after_bytes: 4 * MIB,
            sync_writes: true,
        }
    }
}

impl PipelineConfig {
    /// Size each part is cut to when an artifact exceeds the sink limit.
    pub fn part_size(&self) -> u64 {
        if self.split_margin >= self.sink_limit {
            self.sink_limit
        } else {
            self.sink_limit - self.split_margin
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_budget == 0 {
            bail!("chunk budget must be greater than zero");
        }
        if self.sink_limit == 0 {
            bail!("sink file limit must be greater than zero");
        }
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.retry_attempts == 0 {
            bail!("retry_attempts must be at least 1");
        }
        if self.retry_max_delay < self.retry_delay {
            bail!(
                "retry ceiling {:?} is below the retry floor {:?}",
                self.retry_max_delay,
                self.retry_delay
            );
        }
        if !(1..=22).contains(&self.compression_level) {
            bail!(
                "compression level {} outside zstd range 1..=22",
                self.compression_level
            );
        }
        Ok(())
    }
}
