mod config;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thumbnail_cache::{CacheEvent, DirectoryLoader, LoadEvent, ThumbnailCache, ThumbnailSize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "thumbs")]
#[command(about = "Generate and cache thumbnails for folders of images")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache root directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a folder and generate thumbnails for every image in it
    Load {
        /// Folder containing images
        path: PathBuf,

        /// Number of images requested per batch
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Include subfolders
        #[arg(short, long)]
        recursive: bool,

        /// Thumbnail bounding box, e.g. 200x200
        #[arg(long)]
        size: Option<ThumbnailSize>,

        /// Number of generation workers
        #[arg(long)]
        workers: Option<usize>,

        /// Maximum thumbnails kept in memory
        #[arg(long)]
        memory_capacity: Option<usize>,

        /// Give up if no event arrives for this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },

    /// Show cache statistics
    Stats,

    /// Delete every cached thumbnail
    Clear,

    /// Delete thumbnails older than the given age
    Prune {
        #[arg(long, default_value = "30")]
        days: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache.cache_dir = cache_dir;
    }

    match cli.command {
        Commands::Load {
            path,
            batch_size,
            recursive,
            size,
            workers,
            memory_capacity,
            timeout_secs,
        } => {
            let overrides = LoadOverrides {
                batch_size,
                recursive,
                size,
                workers,
                memory_capacity,
            };
            overrides.apply(&mut config);
            load_folder(path, config, Duration::from_secs(timeout_secs))
        }
        Commands::Stats => show_stats(config),
        Commands::Clear => clear_cache(config),
        Commands::Prune { days } => prune_cache(config, days),
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Command-line values that take precedence over the config file
struct LoadOverrides {
    batch_size: Option<usize>,
    recursive: bool,
    size: Option<ThumbnailSize>,
    workers: Option<usize>,
    memory_capacity: Option<usize>,
}

impl LoadOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(batch_size) = self.batch_size {
            config.loader.batch_size = batch_size;
        }
        if self.recursive {
            config.loader.recursive = true;
        }
        if let Some(size) = self.size {
            config.cache.thumbnail_size = size;
        }
        if let Some(workers) = self.workers {
            config.cache.workers = workers;
        }
        if let Some(memory_capacity) = self.memory_capacity {
            config.cache.memory_capacity = memory_capacity;
        }
    }
}

fn load_folder(path: PathBuf, config: Config, timeout: Duration) -> Result<()> {
    println!("🔍 Loading thumbnails for: {}", path.display());
    let started = Instant::now();

    let cache = Arc::new(ThumbnailCache::new(config.cache.clone())?);
    let cache_events = cache.subscribe();
    let loader = DirectoryLoader::new(Arc::clone(&cache))?;
    let load_events = loader.subscribe();

    loader.load_with(&path, &config.loader);

    let mut outstanding = 0usize;
    let mut cached = 0usize;
    loop {
        let event = match load_events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => bail!("Timed out waiting for directory scan"),
            Err(RecvTimeoutError::Disconnected) => bail!("Directory loader stopped unexpectedly"),
        };
        match event {
            LoadEvent::BatchReady(batch) => {
                outstanding += batch.len();
                tracing::debug!("Batch of {} images", batch.len());
            }
            LoadEvent::ThumbnailCached { path, .. } => {
                outstanding = outstanding.saturating_sub(1);
                cached += 1;
                tracing::debug!("Already cached: {}", path.display());
            }
            LoadEvent::Progress { loaded, total } => {
                println!("📦 Queued {}/{} images", loaded, total);
                if loaded == total {
                    break;
                }
            }
            LoadEvent::Cancelled { loaded, total } => {
                println!("⏹️  Load cancelled after {}/{} images", loaded, total);
                break;
            }
            LoadEvent::Error(message) => bail!(message),
        }
    }

    let mut generated = 0usize;
    let mut failed = 0usize;
    while outstanding > 0 {
        let event = match cache_events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(_) => bail!("Timed out with {} thumbnails still pending", outstanding),
        };
        outstanding -= 1;
        match event {
            CacheEvent::ThumbnailReady { path, thumbnail } => {
                generated += 1;
                println!("✅ {} ({}x{})", path.display(), thumbnail.width(), thumbnail.height());
            }
            CacheEvent::ThumbnailError { path, message } => {
                failed += 1;
                println!("❌ {}: {}", path.display(), message);
            }
        }
    }

    println!(
        "\n📊 {} ready, {} already cached, {} failed in {:.2}s",
        generated,
        cached,
        failed,
        started.elapsed().as_secs_f64()
    );
    print_stats(&cache);
    Ok(())
}

fn show_stats(config: Config) -> Result<()> {
    let cache = ThumbnailCache::new(config.cache)?;
    print_stats(&cache);
    Ok(())
}

fn print_stats(cache: &ThumbnailCache) {
    let stats = cache.cache_stats();
    println!("🗂️  Cache directory: {}", cache.thumbnail_dir().display());
    println!(
        "   Memory: {}/{} thumbnails ({:.1}%)",
        stats.memory_entries,
        stats.memory_capacity,
        stats.memory_usage_percent()
    );
    println!(
        "   Disk:   {} thumbnails, {}",
        stats.disk_entries,
        format_bytes(stats.disk_bytes)
    );
}

fn clear_cache(config: Config) -> Result<()> {
    let cache = ThumbnailCache::new(config.cache)?;
    let before = cache.cache_stats().disk_entries;
    cache.clear();
    println!("🧹 Removed {} cached thumbnails", before);
    Ok(())
}

fn prune_cache(config: Config, days: u64) -> Result<()> {
    let cache = ThumbnailCache::new(config.cache)?;
    let removed = cache.prune(max_age(days))?;
    println!("🧹 Removed {} thumbnails older than {} days", removed, days);
    Ok(())
}

fn max_age(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(24 * 60 * 60))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
