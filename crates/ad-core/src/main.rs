//! Anomaly Detector Core - job supervisor and score normalizer
//!
//! The main entry point for ad-core, handling:
//! - Running an autodetect job over NDJSON input
//! - Normalizing raw scores through the normalizer helper
//! - Configuration checks

use ad_common::{format_error_human, Error, JobId, Result, StructuredError};
use ad_core::config::{load_config, EngineConfig};
use ad_core::exit_codes::ExitCode;
use ad_core::logging::{generate_run_id, init_logging, LogConfig, LogFormat, LogLevel};
use ad_core::normalize::BucketScoresUpdater;
use ad_core::orchestrator::{NativeNormalizerFactory, NormalizerOrchestrator, RawScoreProvider};
use ad_core::process::{
    DataDescription, DataLoadParams, FlushParams, NativeAnalysisProcess, ProcessCommand,
    ProcessSupervisor, TimeFormat,
};
use ad_core::renormalize::Renormalizer;
use ad_core::results::{MemoryResultsStore, ResultProcessor};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Anomaly Detector Core - job supervisor and score normalizer
#[derive(Parser)]
#[command(name = "ad-core")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (overrides AD_CONFIG and the XDG config file)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format on stderr (human or jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream NDJSON input through an autodetect job
    Run(RunArgs),

    /// Normalize a list of raw scores
    Normalize(NormalizeArgs),

    /// Validate configuration
    Check,

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job id
    #[arg(long)]
    job_id: String,

    /// Analysis fields, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    fields: Vec<String>,

    /// Name of the time field in input records
    #[arg(long, default_value = "time")]
    time_field: String,

    /// Time encoding: epoch or epoch_ms
    #[arg(long, default_value = "epoch")]
    time_format: TimeFormat,

    /// NDJSON input file (stdin if omitted)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Bucket span in seconds (overrides config)
    #[arg(long)]
    bucket_span: Option<u64>,

    /// Renormalize stored buckets when quantiles arrive
    #[arg(long)]
    renormalize: bool,
}

#[derive(Args, Debug)]
struct NormalizeArgs {
    /// Job id used for helper arguments and logging
    #[arg(long, default_value = "normalize")]
    job_id: String,

    /// JSON list of [epoch, score] pairs
    #[arg(long)]
    scores: PathBuf,

    /// Quantiles state file
    #[arg(long)]
    quantiles: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else if cli.global.verbose > 0 {
        Some((0..cli.global.verbose).fold(LogLevel::Info, |level, _| level.more_verbose()))
    } else {
        None
    };
    let log_config = LogConfig::from_env(cli_level, cli.global.log_format);
    init_logging(&log_config);

    let result = match &cli.command {
        Commands::Run(args) => run_job(&cli.global, args),
        Commands::Normalize(args) => run_normalize(&cli.global, args),
        Commands::Check => run_check(&cli.global),
        Commands::Version => {
            print_version();
            Ok(ExitCode::Clean)
        }
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(err) => {
            if log_config.format == LogFormat::Jsonl {
                eprintln!("{}", StructuredError::from(&err).to_json());
            } else {
                let use_color = !cli.global.no_color && std::io::stderr().is_terminal();
                eprintln!("{}", format_error_human(&err, use_color));
            }
            ExitCode::from(&err)
        }
    };

    std::process::exit(exit_code.as_i32());
}

fn load_engine_config(global: &GlobalOpts) -> Result<EngineConfig> {
    Ok(load_config(global.config.as_deref())?.config)
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    JobId::parse(raw).ok_or_else(|| Error::InvalidJobId(raw.to_string()))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_job(global: &GlobalOpts, args: &RunArgs) -> Result<ExitCode> {
    let config = load_engine_config(global)?;
    let job_id = parse_job_id(&args.job_id)?;
    let run_id = generate_run_id();
    let bucket_span = args.bucket_span.or(config.autodetect.bucket_span);
    info!(run_id = %run_id, job_id = %job_id, "starting job");

    let input: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(std::io::stdin().lock()),
    };

    let store = MemoryResultsStore::new();
    let renormalizer = if args.renormalize {
        let span = bucket_span.ok_or_else(|| {
            Error::Config("--renormalize needs a bucket span (--bucket-span or config)".to_string())
        })?;
        let orchestrator = NormalizerOrchestrator::new(
            job_id.clone(),
            Arc::new(NativeNormalizerFactory::new(
                config.normalizer.program.clone(),
                config.normalizer.args.clone(),
            )),
        );
        let updater = BucketScoresUpdater::new(
            orchestrator,
            span,
            Box::new(store.clone()),
            Arc::new(store.clone()),
        );
        Some(Arc::new(Renormalizer::start(job_id.clone(), Box::new(updater))?))
    } else {
        None
    };

    let mut command = ProcessCommand::new(&config.autodetect.program)
        .args(config.autodetect.args.iter().cloned())
        .job_id(&job_id)
        .length_encoded_input();
    if let Some(span) = bucket_span {
        command = command.bucket_span(span);
    }
    for (name, path) in &config.autodetect.config_files {
        command = command.config_file(name, path);
    }

    let (process, output) = NativeAnalysisProcess::spawn(
        job_id.clone(),
        command,
        &config.supervisor.process_options(),
    )?;
    let processor = Arc::new(ResultProcessor::start(
        job_id.clone(),
        output,
        Arc::new(store.clone()),
        renormalizer.clone(),
    )?);

    let mut builder = ProcessSupervisor::builder(
        job_id.clone(),
        Box::new(process),
        DataDescription {
            time_field: args.time_field.clone(),
            time_format: args.time_format,
            analysis_fields: args.fields.clone(),
        },
        processor.clone(),
    )
    .flush_poll_interval(config.supervisor.flush_poll_interval());
    if let Some(renormalizer) = &renormalizer {
        builder = builder.renormalization(renormalizer.clone());
    }
    let supervisor = builder.start()?;

    let written = supervisor
        .write_to_job(input, &DataLoadParams::default())
        .and_then(|counts| supervisor.flush_job(&FlushParams::default()).map(|_| counts));
    let closed = supervisor.close();
    if let Some(renormalizer) = &renormalizer {
        renormalizer.shutdown();
    }
    let counts = written?;
    closed?;

    print_json(&serde_json::json!({
        "run_id": run_id,
        "job_id": job_id.to_string(),
        "data_counts": supervisor.data_counts(),
        "results": {
            "buckets": store.buckets_for(&job_id).len(),
            "bucket_writes": store.bucket_writes(&job_id),
            "influencers": store.influencers_for(&job_id).len(),
            "processor": processor.stats(),
        },
    }))?;

    Ok(if counts.skipped_record_count() > 0 {
        ExitCode::PartialInput
    } else {
        ExitCode::Clean
    })
}

/// Raw scores read from a JSON file.
struct ScoresFile(Vec<(i64, f64)>);

impl ScoresFile {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self(serde_json::from_str(&content)?))
    }
}

impl RawScoreProvider for ScoresFile {
    fn raw_scores(&self, _job_id: &JobId) -> Result<Vec<(i64, f64)>> {
        Ok(self.0.clone())
    }
}

fn run_normalize(global: &GlobalOpts, args: &NormalizeArgs) -> Result<ExitCode> {
    let config = load_engine_config(global)?;
    let job_id = parse_job_id(&args.job_id)?;
    let scores = ScoresFile::load(&args.scores)?;
    let quantiles = args
        .quantiles
        .as_deref()
        .map(std::fs::read_to_string)
        .transpose()?;

    let orchestrator = NormalizerOrchestrator::new(
        job_id.clone(),
        Arc::new(NativeNormalizerFactory::new(
            config.normalizer.program.clone(),
            config.normalizer.args.clone(),
        )),
    );
    let results = orchestrator.normalize_job(&scores, quantiles.as_deref())?;

    print_json(&serde_json::json!({
        "job_id": job_id.to_string(),
        "results": results,
    }))?;
    Ok(ExitCode::Clean)
}

fn run_check(global: &GlobalOpts) -> Result<ExitCode> {
    let resolved = load_config(global.config.as_deref())?;
    print_json(&serde_json::json!({
        "status": "ok",
        "source": resolved.source.path().map(|p| p.display().to_string()),
        "using_defaults": resolved.source.path().is_none(),
        "config": resolved.config,
    }))?;
    Ok(ExitCode::Clean)
}

fn print_version() {
    println!("ad-core {}", env!("CARGO_PKG_VERSION"));
}
