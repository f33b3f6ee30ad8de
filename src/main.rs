//! Corpus Cache operator CLI
//!
//! Inspects and maintains a file-backed corpus cache directory shared by
//! the processes that read and write it.
//!
//! ```text
//! corpus-cache --dir /var/cache/corpus stats
//! corpus-cache --dir /var/cache/corpus sweep
//! corpus-cache --dir /var/cache/corpus invalidate --type gaucho
//! corpus-cache --dir /var/cache/corpus put gaucho corpus.json --filter '{"artistas":["x"]}'
//! corpus-cache --dir /var/cache/corpus get gaucho
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use corpus_cache::cache::journal::DEFAULT_POLL_INTERVAL;
use corpus_cache::cache::PayloadSchema;
use corpus_cache::config::parse_duration;
use corpus_cache::{BroadcastHub, CacheConfig, CorpusCache, FileStore, FilterDescriptor};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Corpus Cache - inspect and maintain a persistent corpus cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache directory
    #[arg(long, env = "CORPUS_CACHE_DIR", default_value = ".corpus-cache")]
    dir: PathBuf,

    /// YAML configuration file
    #[arg(long, env = "CORPUS_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage quota in bytes (overrides the config file)
    #[arg(long, env = "CORPUS_CACHE_QUOTA_BYTES")]
    quota_bytes: Option<u64>,

    /// TTL for unfiltered datasets, e.g. "7d"
    #[arg(long, env = "CORPUS_CACHE_FULL_TTL")]
    full_ttl: Option<String>,

    /// TTL for filtered datasets, e.g. "24h"
    #[arg(long, env = "CORPUS_CACHE_FILTERED_TTL")]
    filtered_ttl: Option<String>,

    /// Payload shape enforced on reads
    #[arg(long, value_enum, env = "CORPUS_CACHE_SCHEMA", default_value = "corpus")]
    schema: SchemaArg,

    /// Print Prometheus metrics to stderr after the command
    #[arg(long)]
    emit_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchemaArg {
    /// `musicas` list with a matching `totalMusicas`
    Corpus,
    /// Any JSON document
    Any,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print size, count, compression and age of stored entries
    Stats,
    /// Delete expired entries
    Sweep,
    /// Delete one entry, one type, or everything
    Invalidate {
        /// Logical type; omit to clear the whole cache
        #[arg(long = "type")]
        logical_type: Option<String>,
        /// Filter descriptor as JSON
        #[arg(long, requires = "logical_type")]
        filter: Option<String>,
    },
    /// Cache a JSON document
    Put {
        logical_type: String,
        file: PathBuf,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Print a cached JSON document
    Get {
        logical_type: String,
        #[arg(long)]
        filter: Option<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    let store = FileStore::open(&args.dir, config.quota_bytes)
        .await
        .with_context(|| format!("opening cache directory {}", args.dir.display()))?;
    let hub = BroadcastHub::journaled(store.journal_dir(), DEFAULT_POLL_INTERVAL)
        .context("opening broadcast journal")?;
    let schema = match args.schema {
        SchemaArg::Corpus => PayloadSchema::corpus(),
        SchemaArg::Any => PayloadSchema::permissive(),
    };
    let cache = CorpusCache::builder()
        .with_config(config)
        .with_store(Arc::new(store))
        .with_hub(hub)
        .with_schema(schema)
        .build()?;

    let outcome = run(&cache, &args.command).await;

    if args.emit_metrics {
        eprint!("{}", cache.metrics().encode_prometheus()?);
    }
    cache.shutdown().await;
    outcome
}

async fn run(cache: &CorpusCache, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Stats => {
            let stats = cache.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Sweep => {
            let removed = cache.sweep_expired().await?;
            println!("{}", removed);
        }
        Command::Invalidate {
            logical_type,
            filter,
        } => {
            let filter = parse_filter(filter.as_deref())?;
            let removed = cache
                .invalidate(logical_type.as_deref(), filter.as_ref())
                .await?;
            println!("{}", removed);
        }
        Command::Put {
            logical_type,
            file,
            filter,
        } => {
            let filter = parse_filter(filter.as_deref())?;
            let text = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let payload: Value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not JSON", file.display()))?;
            cache.save(logical_type, &payload, filter.as_ref()).await?;
            let key = cache.key_for(logical_type, filter.as_ref());
            info!(key = %key, "Stored");
            println!("{}", key);
        }
        Command::Get {
            logical_type,
            filter,
        } => {
            let filter = parse_filter(filter.as_deref())?;
            match cache.load_value(logical_type, filter.as_ref()).await? {
                Some(value) => println!("{}", serde_json::to_string(value.as_ref())?),
                None => bail!("no usable cached entry for {}", logical_type),
            }
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(quota) = args.quota_bytes {
        config.quota_bytes = quota;
    }
    if let Some(ttl) = &args.full_ttl {
        config.full_ttl = parse_duration(ttl)?;
    }
    if let Some(ttl) = &args.filtered_ttl {
        config.filtered_ttl = parse_duration(ttl)?;
    }
    config.validate()?;
    Ok(config)
}

fn parse_filter(raw: Option<&str>) -> anyhow::Result<Option<FilterDescriptor>> {
    raw.map(|text| {
        let value: Value = serde_json::from_str(text).context("filter is not JSON")?;
        Ok(FilterDescriptor::from_json(value)?)
    })
    .transpose()
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
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command output; logs go to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
