//! CLI for the rollwal write-ahead log.
//!
//! Provides commands for inspecting, replaying, and cleaning WAL
//! directories, and for reading or advancing the persisted watermark.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use rollwal::cluster::SystemClock;
use rollwal::config::CleanerConfig;
use rollwal::wal::batch::decode_batch;
use rollwal::wal::segment::list_segments;
use rollwal::wal::{
    PersistedLsnStore, SegmentCleaner, SegmentIndex, StreamOptions, WalConsumer, WalEvent, WalStreamer,
};
use tracing_subscriber::EnvFilter;

/// rollwal: write-ahead log maintenance for the rollup store.
#[derive(Parser)]
#[command(name = "rollwal", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List segments, their side indexes, and the persisted watermark.
    Inspect {
        /// Path to the WAL directory.
        dir: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stream records from a WAL directory.
    Replay {
        /// Path to the WAL directory.
        dir: PathBuf,

        /// Deliver records with LSN greater than this.
        #[arg(long, default_value = "0")]
        from: u64,

        /// Stop after this LSN.
        #[arg(long)]
        to: Option<u64>,

        /// Verify record checksums.
        #[arg(long)]
        verify: bool,

        /// Truncate a torn tail before reading. Modifies the directory.
        /// Without it, a torn tail is reported as an error.
        #[arg(long)]
        repair: bool,

        /// Print every decoded event instead of only a summary.
        #[arg(long)]
        print: bool,
    },

    /// Quarantine segments covered by the watermark and purge expired quarantine.
    Clean {
        /// Path to the WAL directory.
        dir: PathBuf,

        /// Watermark to clean against (defaults to the persisted watermark).
        #[arg(long)]
        watermark: Option<u64>,

        /// Number of newest sealed segments to always keep.
        #[arg(long, default_value = "2")]
        keep: usize,

        /// Seconds a quarantine batch survives before deletion.
        #[arg(long, default_value = "1800")]
        grace_secs: u64,

        /// Report decisions without moving or deleting anything.
        #[arg(long)]
        dry_run: bool,

        /// Name of the quarantine directory inside the WAL root.
        #[arg(long)]
        trash_dir: Option<String>,
    },

    /// Read or advance a persisted watermark file.
    Watermark {
        /// Path to the watermark file.
        file: PathBuf,

        /// Advance the watermark to this LSN if it is greater.
        #[arg(long)]
        set: Option<u64>,
    },
}

/// Output format for inspection.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    Text,
    /// JSON document.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Inspect { dir, format } => cmd_inspect(&dir, &format),
        Commands::Replay {
            dir,
            from,
            to,
            verify,
            repair,
            print,
        } => cmd_replay(&dir, from, to, verify, repair, print),
        Commands::Clean {
            dir,
            watermark,
            keep,
            grace_secs,
            dry_run,
            trash_dir,
        } => {
            let mut config = CleanerConfig {
                keep_last_sealed: keep,
                grace_period: Duration::from_secs(grace_secs),
                dry_run,
                ..CleanerConfig::default()
            };
            if let Some(trash_dir) = trash_dir {
                config.trash_dir = trash_dir;
            }
            cmd_clean(&dir, watermark, config)
        }
        Commands::Watermark { file, set } => cmd_watermark(&file, set),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Lists segments with their sizes and side indexes.
fn cmd_inspect(dir: &Path, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let persisted = PersistedLsnStore::open(dir).read()?;
    let mut rows = Vec::new();
    for segment in list_segments(dir)? {
        let size = segment.len()?;
        let index = SegmentIndex::load_or_new(&segment)?;
        rows.push((segment, size, index));
    }

    match format {
        OutputFormat::Json => {
            let segments: Vec<_> = rows
                .iter()
                .map(|(segment, size, index)| {
                    serde_json::json!({
                        "path": segment.path.display().to_string(),
                        "bytes": size,
                        "index": index,
                    })
                })
                .collect();
            let doc = serde_json::json!({
                "root": dir.display().to_string(),
                "persistedLsn": persisted,
                "segments": segments,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => {
            println!("WAL: {}", dir.display());
            println!("Persisted watermark: {persisted}");
            println!("Segments: {}", rows.len());
            println!();
            println!(
                "  {:<12} {:>10} {:>10} {:>10} {:>8} {:>7}",
                "Epoch", "Size", "Min LSN", "Max LSN", "Records", "Sealed"
            );
            let mut total = 0;
            for (segment, size, index) in &rows {
                total += size;
                println!(
                    "  {:<12} {:>10} {:>10} {:>10} {:>8} {:>7}",
                    segment.epoch,
                    ByteSize(*size),
                    index.min_lsn,
                    index.max_lsn,
                    index.record_count,
                    if index.sealed { "yes" } else { "no" },
                );
            }
            println!();
            println!("Total: {}", ByteSize(total));
        }
    }

    Ok(())
}

/// Prints or counts replayed records.
struct PrintingConsumer {
    start_after: u64,
    print: bool,
    events: u64,
}

impl WalConsumer for PrintingConsumer {
    fn consume(&mut self, lsn: u64, payload: &[u8]) -> rollwal::Result<()> {
        for blob in decode_batch(payload)? {
            let event = WalEvent::decode(&blob)?;
            self.events += 1;
            if self.print {
                println!(
                    "lsn={lsn} shard={} series={} points={}",
                    event.shard,
                    event.series,
                    event.timestamps.len()
                );
                for (ts, value) in event.timestamps.iter().zip(&event.values) {
                    println!("  {ts},{value}");
                }
            }
        }
        Ok(())
    }

    fn last_applied_lsn(&self) -> u64 {
        self.start_after
    }
}

/// Streams a WAL directory through a printing consumer.
fn cmd_replay(
    dir: &Path,
    from: u64,
    to: Option<u64>,
    verify: bool,
    repair: bool,
    print: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = StreamOptions {
        run_recovery: repair,
        verify_crc: verify,
        fence_to_persisted_lsn: false,
        up_to_lsn: to,
    };
    let mut consumer = PrintingConsumer {
        start_after: from,
        print,
        events: 0,
    };

    tracing::debug!("replaying {} after LSN {from}", dir.display());
    let start = Instant::now();
    let result = WalStreamer::new(dir).stream(&mut consumer, &options)?;
    let elapsed = start.elapsed();

    eprintln!(
        "Replayed {} records ({} events) from {} segments in {:.2?}",
        result.records_delivered, consumer.events, result.segments_visited, elapsed
    );
    eprintln!("Last LSN: {}", result.last_delivered_lsn);
    if let Some(offset) = result.torn_at {
        eprintln!("Stopped at an incomplete record at offset {offset} of the last segment");
    }
    Ok(())
}

/// Runs one cleaner pass.
fn cmd_clean(dir: &Path, watermark: Option<u64>, config: CleanerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cleaner = SegmentCleaner::new(dir, config, Arc::new(SystemClock));
    let report = match watermark {
        Some(watermark) => cleaner.run_at(watermark)?,
        None => cleaner.run()?,
    };

    let verb = if report.dry_run { "Would quarantine" } else { "Quarantined" };
    println!("Watermark: {}", report.watermark);
    println!("{verb} {} segments", report.quarantined.len());
    for path in &report.quarantined {
        println!("  {}", path.display());
    }
    if !report.purged_batches.is_empty() {
        println!("Purged {} quarantine batches", report.purged_batches.len());
    }
    if report.skipped > 0 {
        println!("Skipped {} segments", report.skipped);
    }
    Ok(())
}

/// Reads or advances a watermark file.
fn cmd_watermark(file: &Path, set: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let store = PersistedLsnStore::at(file);
    if let Some(lsn) = set {
        if store.update_if_greater(lsn)? {
            println!("Advanced to {lsn}");
        } else {
            println!("Unchanged at {}", store.read()?);
        }
    } else {
        println!("{}", store.read()?);
    }
    Ok(())
}

/// Segment size rendered with a binary unit, e.g. `1.5 KiB`.
struct ByteSize(u64);

impl std::fmt::Display for ByteSize {
    #[allow(clippy::cast_precision_loss)] // display only
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
        if self.0 < 1024 {
            return f.pad(&format!("{} B", self.0));
        }
        let mut scaled = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while scaled >= 1024.0 && unit + 1 < UNITS.len() {
            scaled /= 1024.0;
            unit += 1;
        }
        // pad, not write!, so table column widths apply
        f.pad(&format!("{scaled:.1} {}", UNITS[unit]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_units() {
        assert_eq!(ByteSize(512).to_string(), "512 B");
        assert_eq!(ByteSize(1536).to_string(), "1.5 KiB");
        assert_eq!(ByteSize(64 << 20).to_string(), "64.0 MiB");
        assert_eq!(ByteSize(3 << 40).to_string(), "3.0 TiB");
        assert_eq!(format!("{:>8}", ByteSize(10)), "    10 B");
    }
}
