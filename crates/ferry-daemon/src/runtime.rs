use clap::Parser;
use eyre::{bail, Context, Result};
use ferry_core::config::{GIB, MIB};
use ferry_core::model::{DestinationId, OwnerId};
use ferry_core::PipelineConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct DaemonRuntime {
    pub(crate) pipeline: PipelineConfig,
    pub(crate) source_root: PathBuf,
    pub(crate) outbox: PathBuf,
    pub(crate) operator: Operator,
    pub(crate) warnings: Vec<String>,
}

/// Identity the console commands act as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Operator {
    pub(crate) owner: OwnerId,
    pub(crate) destination: DestinationId,
}

#[derive(Parser, Debug, Default)]
#[command(name = "ferry-daemon", about = "Relay shared folders as size-bounded archives")]
pub(crate) struct DaemonArgs {
    /// Path to the daemon configuration file (TOML). Defaults to /etc/ferry/config.toml when present.
    #[arg(long, env = "FERRY_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    /// Directory holding per-request working trees
    #[arg(long, env = "FERRY_STORAGE_ROOT")]
    pub(crate) storage_root: Option<PathBuf>,
    /// Directory holding the progress store
    #[arg(long, env = "FERRY_STATE_DIR")]
    pub(crate) state_dir: Option<PathBuf>,
    /// Directory the local source provider serves shared folders from
    #[arg(long, env = "FERRY_SOURCE_ROOT")]
    pub(crate) source_root: Option<PathBuf>,
    /// Directory delivered archives are dropped into
    #[arg(long, env = "FERRY_OUTBOX")]
    pub(crate) outbox: Option<PathBuf>,
    /// Chunk budget in GiB (fractions allowed)
    #[arg(long, env = "FERRY_CHUNK_SIZE_GB")]
    pub(crate) chunk_size_gb: Option<f64>,
    /// Largest artifact the sink accepts, in bytes
    #[arg(long, env = "FERRY_SINK_LIMIT")]
    pub(crate) sink_limit: Option<u64>,
    /// Requests transferred at the same time
    #[arg(long, env = "FERRY_MAX_CONCURRENT")]
    pub(crate) max_concurrent: Option<usize>,
    /// Download attempts per file when the source quota is exhausted
    #[arg(long, env = "FERRY_RETRY_ATTEMPTS")]
    pub(crate) retry_attempts: Option<u32>,
    /// First quota backoff delay in seconds
    #[arg(long, env = "FERRY_RETRY_DELAY")]
    pub(crate) retry_delay: Option<u64>,
    /// Suppress periodic byte-progress notices on the console
    #[arg(long)]
    pub(crate) no_progress: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    transfer: RawTransfer,
    #[serde(default)]
    source: RawSource,
    #[serde(default)]
    sink: RawSink,
    #[serde(default)]
    operator: RawOperator,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorage {
    root: Option<PathBuf>,
    state_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTransfer {
    chunk_size_gb: Option<f64>,
    max_concurrent: Option<usize>,
    retry_attempts: Option<u32>,
    retry_delay_secs: Option<u64>,
    retry_max_delay_secs: Option<u64>,
    compression_level: Option<i32>,
    progress_interval_secs: Option<u64>,
    compact_after_mb: Option<u64>,
    sync_writes: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSink {
    file_limit_bytes: Option<u64>,
    split_margin_mb: Option<u64>,
    outbox: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOperator {
    owner: Option<OwnerId>,
    destination: Option<DestinationId>,
}

fn default_config_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\Ferry\config.toml")
    } else {
        PathBuf::from("/etc/ferry/config.toml")
    }
}

fn gib_to_bytes(gb: f64) -> Result<u64> {
    if !gb.is_finite() || gb <= 0.0 {
        bail!("chunk size must be a positive number of GiB, got {gb}");
    }
    Ok((gb * GIB as f64) as u64)
}

fn read_config(path: &Path) -> Result<RawConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str::<RawConfig>(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

pub(crate) fn load_runtime(args: &DaemonArgs) -> Result<DaemonRuntime> {
    load_runtime_from(args, default_config_path())
}

fn load_runtime_from(args: &DaemonArgs, fallback: PathBuf) -> Result<DaemonRuntime> {
    let mut warnings = Vec::new();

    let config_path = match &args.config {
        Some(path) => Some(path.clone()),
        None if fallback.exists() => Some(fallback),
        None => None,
    };
    let raw = match &config_path {
        Some(path) => read_config(path)?,
        None => {
            warnings.push("no config file found; using built-in defaults".to_string());
            RawConfig::default()
        }
    };

    let defaults = PipelineConfig::default();
    let storage_root = args
        .storage_root
        .clone()
        .or(raw.storage.root)
        .unwrap_or(defaults.storage_root);
    let state_dir = args
        .state_dir
        .clone()
        .or(raw.storage.state_dir)
        .unwrap_or(defaults.state_dir);

    let chunk_budget = match args.chunk_size_gb.or(raw.transfer.chunk_size_gb) {
        Some(gb) => gib_to_bytes(gb)?,
        None => defaults.chunk_budget,
    };
    let sink_limit = args
        .sink_limit
        .or(raw.sink.file_limit_bytes)
        .unwrap_or(defaults.sink_limit);
    let split_margin = raw
        .sink
        .split_margin_mb
        .map(|mb| mb * MIB)
        .unwrap_or(defaults.split_margin);
    if split_margin >= sink_limit {
        warnings.push(format!(
            "split margin of {split_margin} bytes is not below the sink limit; parts use the full limit"
        ));
    }
    let retry_delay = args
        .retry_delay
        .or(raw.transfer.retry_delay_secs)
        .map(Duration::from_secs)
        .unwrap_or(defaults.retry_delay);
    let retry_max_delay = raw
        .transfer
        .retry_max_delay_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.retry_max_delay)
        .max(retry_delay);

    let pipeline = PipelineConfig {
        storage_root,
        state_dir,
        chunk_budget,
        sink_limit,
        split_margin,
        max_concurrent: args
            .max_concurrent
            .or(raw.transfer.max_concurrent)
            .unwrap_or(defaults.max_concurrent),
        retry_attempts: args
            .retry_attempts
            .or(raw.transfer.retry_attempts)
            .unwrap_or(defaults.retry_attempts),
        retry_delay,
        retry_max_delay,
        compression_level: raw
            .transfer
            .compression_level
            .unwrap_or(defaults.compression_level),
        progress_interval: raw
            .transfer
            .progress_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.progress_interval),
        compact_after_bytes: raw
            .transfer
            .compact_after_mb
            .map(|mb| mb * MIB)
            .unwrap_or(defaults.compact_after_bytes),
        sync_writes: raw.transfer.sync_writes.unwrap_or(defaults.sync_writes),
    };
    pipeline.validate().wrap_err("invalid transfer settings")?;
    if pipeline.chunk_budget < pipeline.sink_limit {
        warnings.push(format!(
            "chunk budget ({} bytes) is below the sink limit; archives will rarely need splitting",
            pipeline.chunk_budget
        ));
    }

    let source_root = args
        .source_root
        .clone()
        .or(raw.source.root)
        .unwrap_or_else(|| PathBuf::from("/var/lib/ferry/shared"));
    if !source_root.is_dir() {
        warnings.push(format!(
            "source root {} does not exist; every folder lookup will fail",
            source_root.display()
        ));
    }
    let outbox = args
        .outbox
        .clone()
        .or(raw.sink.outbox)
        .unwrap_or_else(|| PathBuf::from("/var/lib/ferry/outbox"));

    let operator = Operator {
        owner: raw.operator.owner.unwrap_or(0),
        destination: raw.operator.destination.unwrap_or(0),
    };

    Ok(DaemonRuntime {
        pipeline,
        source_root,
        outbox,
        operator,
        warnings,
    })
}
