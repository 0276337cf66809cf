//! wos-melt: Flatten Web of Science XML exports into relational tables
//!
//! Usage:
//!   # Chunked INSERT IGNORE statements, one .sql file per table, in ./out
//!   wos-melt -s WR_2019_part1.xml -d ./out
//!
//!   # Gzipped input, JSON documents, tables written while reading
//!   wos-melt -s WR_2019_part1.xml.gz -d ./out -f json --streaming
//!
//!   # Fail records that carry title or identifier types without a column
//!   wos-melt -s sample.xml --unknown-keys error

// Use MiMalloc allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use wos_melt::melt::{MeltConfig, MeltPlan, OutputFormat, UnknownKeyPolicy};
use wos_melt::{melt_to_dir, MeltEvent, UNKNOWN_ID};

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "UPPER")]
enum Verbosity {
    Debug,
    Info,
    #[value(alias = "WARNING")]
    Warn,
    Error,
    Critical,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warn => "warn",
            Verbosity::Error | Verbosity::Critical => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Sql,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UnknownKeys {
    Overflow,
    Drop,
    Error,
}

#[derive(Parser, Debug)]
#[command(name = "wos-melt")]
#[command(about = "Flatten Web of Science XML records into relational tables", long_about = None)]
struct Args {
    /// Path to the XML document (.gz is decompressed)
    #[arg(short, long, default_value = "sample.xml")]
    sourcefile: PathBuf,

    /// Log level
    #[arg(short, long, value_enum, default_value = "DEBUG", ignore_case = true)]
    verbosity: Verbosity,

    /// Log file path
    #[arg(short, long, default_value = "./extract.log")]
    logfile: PathBuf,

    /// Folder to write table files to
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "sql")]
    format: Format,

    /// Maximum value tuples per INSERT statement
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Value written for absent optional fields
    #[arg(long)]
    sentinel: Option<String>,

    /// What to do with title, identifier and attribute keys that have no column
    #[arg(long, value_enum, default_value = "overflow")]
    unknown_keys: UnknownKeys,

    /// Write tables as records are read instead of dumping at the end
    #[arg(long)]
    streaming: bool,

    /// Also emit rows for cited works outside the index
    #[arg(long)]
    unindexed: bool,

    /// JSON table catalog replacing the built-in one
    #[arg(long)]
    catalog: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    println!("Processing : {}", args.sourcefile.display());

    if let Err(err) = run(&args) {
        println!("[ERROR] Dumping failed for {}", args.sourcefile.display());
        error!("Dumping failed for {}: {:#}", args.sourcefile.display(), err);
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    init_tracing(&args.logfile, args.verbosity)?;
    debug!("Document processing starts");

    let config = build_config(args);
    let plan = match &args.catalog {
        Some(path) => MeltPlan::from_file(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => MeltPlan::default(),
    };

    std::fs::create_dir_all(&args.dir).context("Failed to create output directory")?;
    debug!("Data output folder confirmed: {}", args.dir.display());

    let reader = open_source(&args.sourcefile)?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {pos} records | {msg}")?);
    progress.enable_steady_tick(Duration::from_millis(200));

    let stats = melt_to_dir(reader, &plan, &args.dir, &config, args.streaming, |event| {
        progress.inc(1);
        match event {
            MeltEvent::Committed { wos_id } => progress.set_message(wos_id.to_string()),
            MeltEvent::Skipped { wos_id, error } => progress.suspend(|| {
                println!(
                    "[ERROR:{}] Caught an exception : {}",
                    wos_id.unwrap_or(UNKNOWN_ID),
                    error
                );
            }),
        }
    })?;
    progress.finish_and_clear();

    info!(
        records = stats.records,
        committed = stats.committed,
        skipped = stats.skipped,
        "Completed processing {}",
        args.sourcefile.display()
    );
    println!("Processed {} records", stats.records);
    Ok(())
}

fn build_config(args: &Args) -> MeltConfig {
    let mut config = MeltConfig::default();
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
    if let Some(sentinel) = &args.sentinel {
        config.sentinel = sentinel.clone();
    }
    config.format = match args.format {
        Format::Sql => OutputFormat::Sql,
        Format::Json => OutputFormat::Json,
    };
    config.unknown_keys = match args.unknown_keys {
        UnknownKeys::Overflow => UnknownKeyPolicy::Overflow,
        UnknownKeys::Drop => UnknownKeyPolicy::Drop,
        UnknownKeys::Error => UnknownKeyPolicy::Error,
    };
    config.include_unindexed = args.unindexed;
    config
}

fn init_tracing(logfile: &Path, verbosity: Verbosity) -> Result<()> {
    let file = File::create(logfile)
        .with_context(|| format!("Failed to create log file {}", logfile.display()))?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn open_source(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader: Box<dyn BufRead> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}
