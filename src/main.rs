use clap::{Parser, Subcommand};
use image_derivatives::cache::{CacheStats, DerivativeCache};
use image_derivatives::config::{self, Config};
use image_derivatives::delegate::{DelegateEngine, TableDelegate};
use image_derivatives::format::Format;
use image_derivatives::operation::{Dimensions, OperationList};
use image_derivatives::processor::RustProcessor;
use image_derivatives::representation::{
    ImageRepresentation, Outcome, Source, content_disposition,
};
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use std::error::Error;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, error, info, warn};

#[derive(Parser)]
#[command(name = "image-derivatives")]
#[command(about = "Render and cache image derivatives")]
#[command(long_about = "\
Render and cache image derivatives

A derivative is described by an operation list in JSON:

  {
    \"identifier\": \"cats/tabby.jpg\",
    \"operations\": [
      {\"crop\": {\"pixels\": {\"x\": 0, \"y\": 0, \"width\": 400, \"height\": 300}}},
      {\"scale\": {\"percent\": 0.5}},
      {\"rotate\": 90}
    ],
    \"output_format\": \"png\",
    \"options\": {\"watermark\": \"v2\"}
  }

Derivatives are served from the cache when present and stored in it
otherwise. Run 'image-derivatives gen-config' for a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Configuration file (missing file = defaults)
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Log debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the canonical display string and cache key of an operation list
    Key {
        /// Operation list JSON file
        ops: PathBuf,
    },
    /// Render one derivative through the cache
    Render {
        /// Operation list JSON file
        ops: PathBuf,
        /// Source image
        #[arg(long)]
        source: PathBuf,
        /// Where to write the derivative
        #[arg(long)]
        output: PathBuf,
    },
    /// Render many derivatives in parallel through one shared cache
    Batch {
        /// JSON array of {"ops": <operation list>, "source": <path>}
        requests: PathBuf,
        /// Directory receiving the derivatives, named by cache key
        #[arg(long, default_value = "derivatives")]
        output_dir: PathBuf,
    },
    /// Purge one cache entry, or the whole cache when no list is given
    Purge {
        /// Operation list JSON file
        ops: Option<PathBuf>,
        /// Only sweep unfinished writes idle for at least this many seconds
        #[arg(long, value_name = "SECS", conflicts_with = "ops")]
        incomplete: Option<u64>,
    },
    /// Invoke a delegate method from the configured delegate script
    Invoke {
        /// Method name, e.g. resolver::source
        method: String,
        /// Arguments as JSON (bare words are taken as strings)
        args: Vec<String>,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

#[derive(Deserialize)]
struct BatchRequest {
    ops: OperationList,
    source: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    // gen-config has to work next to a broken config.toml
    let config = if matches!(cli.command, Command::GenConfig) {
        Config::default()
    } else {
        config::load_config(&cli.config)?
    };
    let cache = config.cache.open();

    match cli.command {
        Command::Key { ops } => {
            let ops = read_ops(&ops)?;
            println!("{}", ops.display_string());
            println!("{}", ops.cache_key());
        }
        Command::Render {
            ops,
            source,
            output,
        } => {
            let ops = read_ops(&ops)?;
            let outcome = render(&ops, &source, &output, cache.as_ref())?;
            println!("{}: {outcome}", output.display());
            if let Some(header) = content_disposition(&ops, config.http.content_disposition) {
                println!("Content-Disposition: {header}");
            }
        }
        Command::Batch {
            requests,
            output_dir,
        } => {
            let stats = batch(&config, &requests, &output_dir, cache.as_ref())?;
            println!("Cache: {stats}");
        }
        Command::Purge { ops, incomplete } => {
            let Some(cache) = cache else {
                return Err("cache is disabled".into());
            };
            match (ops, incomplete) {
                (_, Some(secs)) => {
                    let removed = cache.purge_incomplete(Duration::from_secs(secs))?;
                    println!("Swept {removed} unfinished entries");
                }
                (Some(path), None) => {
                    let ops = read_ops(&path)?;
                    cache.purge(&ops)?;
                    println!("Purged {}", ops.cache_key());
                }
                (None, None) => {
                    let removed = cache.purge_all()?;
                    println!("Purged {removed} entries");
                }
            }
        }
        Command::Invoke { method, args } => {
            let value = invoke(&config, &method, &args)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::GenConfig => print!("{}", config::stock_config_toml()),
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<(), Box<dyn Error>> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Read and freeze an operation list.
fn read_ops(path: &Path) -> Result<OperationList, Box<dyn Error>> {
    let mut ops: OperationList = serde_json::from_str(&fs::read_to_string(path)?)?;
    ops.freeze();
    Ok(ops)
}

/// Render one derivative into `output`, removing the file if rendering fails.
fn render(
    ops: &OperationList,
    source: &Path,
    output: &Path,
    cache: Option<&DerivativeCache>,
) -> Result<Outcome, Box<dyn Error>> {
    let source_format = source
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Format::from_extension)
        .or_else(|| ops.identifier().source_format())
        .ok_or_else(|| format!("cannot tell the format of {}", source.display()))?;
    let (width, height) = image::image_dimensions(source)?;
    let processor = RustProcessor::new();
    let representation = ImageRepresentation::new(
        ops,
        source_format,
        Dimensions::new(width, height),
        Source::File(source.to_path_buf()),
        &processor,
    );

    let mut sink = BufWriter::new(File::create(output)?);
    let written = representation
        .write(&mut sink, cache)
        .map_err(Box::<dyn Error>::from)
        .and_then(|outcome| sink.flush().map(|()| outcome).map_err(Into::into));
    if written.is_err() {
        drop(sink);
        if let Err(e) = fs::remove_file(output) {
            warn!(path = %output.display(), error = %e, "failed to remove partial output");
        }
    }
    written
}

fn batch(
    config: &Config,
    requests: &Path,
    output_dir: &Path,
    cache: Option<&DerivativeCache>,
) -> Result<CacheStats, Box<dyn Error>> {
    let requests: Vec<BatchRequest> = serde_json::from_str(&fs::read_to_string(requests)?)?;
    fs::create_dir_all(output_dir)?;
    init_thread_pool(&config.processing);
    info!(count = requests.len(), "rendering batch");

    let stats = requests
        .into_par_iter()
        .map(|BatchRequest { mut ops, source }| {
            ops.freeze();
            let output = output_dir.join(ops.cache_key());
            let mut stats = CacheStats::default();
            match render(&ops, &source, &output, cache) {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    error!(ops = %ops, source = %source.display(), error = %e, "render failed");
                    stats.fail();
                }
            }
            stats
        })
        .reduce(CacheStats::default, CacheStats::merge);
    Ok(stats)
}

fn invoke(config: &Config, method: &str, args: &[String]) -> Result<Value, Box<dyn Error>> {
    let script = config
        .delegate
        .script
        .as_ref()
        .ok_or("no delegate script configured ([delegate] script)")?;
    let mut engine = DelegateEngine::new(
        TableDelegate::new(),
        config.delegate.invocation_cache_enabled,
    );
    if let Some(namespace) = &config.delegate.namespace {
        engine = engine.with_namespace(namespace)?;
    }
    engine.load(&fs::read_to_string(script)?)?;
    let args: Vec<Value> = args
        .iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect();
    Ok(engine.invoke_named(method, &args)?)
}

/// Initialize the rayon thread pool from the processing config.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_workers(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
