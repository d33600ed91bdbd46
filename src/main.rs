//! blockcache - Persistent Block Cache CLI
//!
//! Drives a block cache directory from the command line.
//!
//! ```text
//! blockcache bench   --path /tmp/bc --blocks 10000 --block-size 4096
//! blockcache inspect --path /tmp/bc --json
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockcache::{BlockCache, BlockCacheConfig, CacheKey, CacheTier, Error};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Persistent block cache tier
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "BLOCKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root directory (overrides the configuration file)
    #[arg(long, env = "BLOCKCACHE_PATH")]
    path: Option<PathBuf>,

    /// Overall cache capacity in bytes
    #[arg(long, env = "BLOCKCACHE_SIZE")]
    cache_size: Option<u64>,

    /// Number of writer threads
    #[arg(long, env = "BLOCKCACHE_WRITERS")]
    writers: Option<usize>,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Print prometheus metrics after the command
    #[arg(long)]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert blocks, flush, then look every block up
    Bench {
        /// Number of blocks to insert
        #[arg(long, default_value = "10000")]
        blocks: usize,

        /// Size of each block in bytes
        #[arg(long, default_value = "4096")]
        block_size: usize,

        /// Start from an empty cache directory
        #[arg(long)]
        fresh: bool,
    },
    /// Open an existing cache directory and report its contents
    Inspect,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => BlockCacheConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BlockCacheConfig::default(),
    };
    if let Some(path) = &args.path {
        config.path = path.clone();
    }
    if let Some(size) = args.cache_size {
        config.cache_size = size;
    }
    if let Some(writers) = args.writers {
        config.writer_qdepth = writers;
    }

    match &args.command {
        Command::Bench {
            blocks,
            block_size,
            fresh,
        } => {
            if *fresh {
                config.recover_on_open = false;
            }
            let cache = BlockCache::open_with(config).context("opening block cache")?;
            run_bench(&cache, *blocks, *block_size)?;
            report(&cache, &args)?;
            cache.close()?;
        }
        Command::Inspect => {
            config.recover_on_open = true;
            let cache = BlockCache::open_with(config).context("opening block cache")?;
            for file in cache.files() {
                println!(
                    "file {:>6}  {:>12} bytes  sealed={} failed={}",
                    file.id, file.size, file.sealed, file.failed
                );
            }
            println!(
                "{} keys, {} of {} bytes used",
                cache.key_count(),
                cache.size(),
                cache.capacity()
            );
            report(&cache, &args)?;
            cache.close()?;
        }
    }

    Ok(())
}

fn run_bench(cache: &BlockCache, blocks: usize, block_size: usize) -> anyhow::Result<()> {
    info!(blocks, block_size, "Starting insert phase");
    let start = Instant::now();
    let mut rejected = 0usize;
    for i in 0..blocks {
        let key = CacheKey::from(format!("block-{:010}", i).as_str());
        let data = Bytes::from(vec![(i % 251) as u8; block_size]);
        match cache.insert(key, data) {
            Ok(()) => {}
            Err(e) if e.is_retryable() => rejected += 1,
            Err(e) => return Err(e).context("insert failed"),
        }
    }
    cache.flush_all()?;
    let elapsed = start.elapsed();
    let written = (blocks - rejected) as f64 * block_size as f64;
    info!(
        accepted = blocks - rejected,
        rejected,
        elapsed_ms = elapsed.as_millis() as u64,
        mb_per_sec = written / 1e6 / elapsed.as_secs_f64().max(1e-9),
        "Insert phase complete"
    );

    let start = Instant::now();
    let mut found = 0usize;
    for i in 0..blocks {
        let key = CacheKey::from(format!("block-{:010}", i).as_str());
        match cache.lookup(&key) {
            Ok(Some(value)) => {
                if value.len() != block_size || value.iter().any(|b| *b != (i % 251) as u8) {
                    bail!("block {} came back with different contents", i);
                }
                found += 1;
            }
            Ok(None) => {}
            Err(Error::Corruption { file_id, offset, reason }) => {
                warn!(file_id, offset, %reason, "Corrupt block");
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(
        found,
        missing = blocks - found,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Lookup phase complete"
    );
    Ok(())
}

fn report(cache: &BlockCache, args: &Args) -> anyhow::Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(&cache.snapshot())?);
    } else {
        print!("{}", cache.print_stats());
    }
    if args.metrics {
        print!("{}", cache.stats().encode_text()?);
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
