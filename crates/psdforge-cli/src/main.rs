//! psdforge CLI: convert PSD files and ZIP archives of PSD files into web
//! image formats.
//!
//! Configuration comes from `PSDFORGE_*` environment variables (and `.env`).
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use psdforge_cli::{
    build_converter, default_output_path, init_tracing, load_config, open_detector, print_json,
    run_worker, ConversionArgs,
};
use psdforge_core::{Config, ConversionOptions, ConversionRequest, Resolution, UseCase};
use psdforge_infra::{shutdown_telemetry, ErrorResponse};
use psdforge_processing::document::header::PsdHeader;
use psdforge_processing::recommend;
use psdforge_services::{zip_info, ArchiveLimits, ArchiveProcessor, FileOutcome, ProgressCallback};
use psdforge_storage::create_storage_service;
use psdforge_worker::{Orchestrator, OrchestratorConfig, ResultSink, StorageSink, WorkerCommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "psdforge", about = "PSD to web image conversion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one PSD file
    Convert {
        input: PathBuf,
        /// Defaults to the input path with the format's extension
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[command(flatten)]
        options: ConversionArgs,
    },
    /// Estimate the output size of a PSD file from its header
    Estimate {
        input: PathBuf,
        #[arg(long, default_value = "85")]
        quality: i64,
    },
    /// Recommend conversion settings for a PSD file
    Recommend {
        input: PathBuf,
        /// web, archive or print
        #[arg(long, default_value = "web")]
        use_case: String,
    },
    /// Convert every PSD file in a ZIP archive
    Archive {
        zip: PathBuf,
        /// Directory for converted files
        #[arg(long, short)]
        output_dir: PathBuf,
        #[command(flatten)]
        options: ConversionArgs,
    },
    /// List the entries of a ZIP archive
    ZipInfo { zip: PathBuf },
    /// Run files through the job orchestrator
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Files submitted per group (defaults to PSDFORGE_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Hand successful outputs to the storage service under this category
        #[arg(long)]
        category: Option<String>,
        #[command(flatten)]
        options: ConversionArgs,
    },
    /// Hash index maintenance
    Dedup {
        #[command(subcommand)]
        sub: DedupCommands,
    },
    /// Run one conversion request in isolation (used by the process pool)
    #[command(hide = true)]
    Worker { request: PathBuf },
}

#[derive(Subcommand)]
enum DedupCommands {
    /// Show index statistics
    Stats,
    /// Drop entries older than the retention window
    Cleanup {
        /// Defaults to PSDFORGE_HASH_RETENTION_DAYS
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// Write a copy of the index
    Export { path: PathBuf },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if let Err(e) = init_tracing() {
        eprintln!("{:#}", e);
    }

    let cli = Cli::parse();
    let outcome = run(cli.command).await;
    shutdown_telemetry().await;

    if let Err(e) = outcome {
        tracing::error!(error = %e, "Command failed");
        let response = ErrorResponse::from(&e);
        match serde_json::to_string_pretty(&response) {
            Ok(json) => eprintln!("{}", json),
            Err(_) => eprintln!("{:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    // The worker child only needs its request file
    let command = match command {
        Commands::Worker { request } => return run_worker(&request, &mut std::io::stdout().lock()),
        other => other,
    };
    let config = load_config()?;

    match command {
        Commands::Convert {
            input,
            output,
            options,
        } => {
            let options = options.into_options()?;
            let output = output.unwrap_or_else(|| default_output_path(&input, &options));
            let converter = build_converter(&config);
            let result = tokio::task::spawn_blocking(move || converter.convert(&input, &output, &options))
                .await
                .context("Conversion task panicked")?;
            print_json(&result)?;
            if let Some(err) = result.to_error() {
                return Err(err.into());
            }
        }
        Commands::Estimate { input, quality } => {
            let quality = psdforge_core::validation::validate_quality(quality)?;
            let header = PsdHeader::read_from_path(&input)?;
            let estimate = build_converter(&config).estimate_output_size(&input, quality);
            print_json(&serde_json::json!({
                "input": input,
                "width": header.width,
                "height": header.height,
                "quality": quality,
                "estimated_size_bytes": estimate,
            }))?;
        }
        Commands::Recommend { input, use_case } => {
            let use_case: UseCase = use_case.parse()?;
            let header = PsdHeader::read_from_path(&input)?;
            let file_size = std::fs::metadata(&input)
                .with_context(|| format!("Failed to stat {}", input.display()))?
                .len();
            let recommendation = recommend(Resolution::new(header.width, header.height), file_size, use_case);
            print_json(&recommendation)?;
        }
        Commands::Archive {
            zip,
            output_dir,
            options,
        } => {
            let options = options.into_options()?;
            let processor = ArchiveProcessor::new(Arc::new(build_converter(&config)), config.max_workers)
                .with_limits(ArchiveLimits::from_config(&config));
            let progress: ProgressCallback = Arc::new(|percent: f64, completed: usize, total: usize, outcome: &FileOutcome| {
                tracing::info!(
                    entry = %outcome.entry,
                    success = outcome.result.success,
                    completed,
                    total,
                    percent = format!("{:.1}", percent),
                    "Archive progress"
                );
            });
            let summary = processor
                .process_archive(&zip, &output_dir, &options, Some(progress))
                .await;
            print_json(&summary)?;
            if let Some(err) = summary.to_error() {
                return Err(err.into());
            }
        }
        Commands::ZipInfo { zip } => {
            let info = zip_info(&zip, &ArchiveLimits::from_config(&config))?;
            print_json(&info)?;
        }
        Commands::Batch {
            files,
            batch_size,
            category,
            options,
        } => {
            let options = options.into_options()?;
            run_batch(&config, files, batch_size, category, options).await?;
        }
        Commands::Dedup { sub } => {
            let detector = open_detector(&config);
            match sub {
                DedupCommands::Stats => print_json(&detector.statistics())?,
                DedupCommands::Cleanup { max_age_days } => {
                    let days = max_age_days
                        .unwrap_or_else(|| u32::try_from(config.hash_retention_days.max(0)).unwrap_or(u32::MAX));
                    let removed = detector.cleanup(days);
                    print_json(&serde_json::json!({
                        "removed": removed,
                        "max_age_days": days,
                        "remaining": detector.len(),
                    }))?;
                }
                DedupCommands::Export { path } => {
                    detector.export(&path)?;
                    print_json(&serde_json::json!({
                        "exported": path,
                        "entries": detector.len(),
                    }))?;
                }
            }
        }
        Commands::Worker { .. } => {}
    }

    Ok(())
}

async fn run_batch(
    config: &Config,
    files: Vec<PathBuf>,
    batch_size: Option<usize>,
    category: Option<String>,
    options: ConversionOptions,
) -> anyhow::Result<()> {
    let sink: Option<Arc<dyn ResultSink>> = match category {
        Some(category) => {
            let service = create_storage_service(config)
                .await?
                .context("--category needs PSDFORGE_STORAGE_ROOT to be set")?;
            Some(Arc::new(StorageSink::new(service, category)))
        }
        None => None,
    };

    let orchestrator_config = OrchestratorConfig::from_config(config)
        .with_worker_command(WorkerCommand::current_exe().context("Locate worker executable")?);
    let orchestrator = Orchestrator::new(orchestrator_config, Arc::new(build_converter(config)), sink);

    let mut requests = Vec::with_capacity(files.len());
    for path in &files {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        requests.push(ConversionRequest::new(data, filename, options.clone()));
    }

    let report = orchestrator.batch_process(requests, batch_size).await;
    let jobs: Vec<_> = report
        .succeeded
        .iter()
        .filter_map(|id| orchestrator.get_job(id))
        .collect();
    let metrics = orchestrator.metrics();
    orchestrator.shutdown().await;

    print_json(&serde_json::json!({
        "report": report,
        "jobs": jobs,
        "metrics": metrics,
    }))?;

    if report.succeeded.is_empty() && !report.failed.is_empty() {
        anyhow::bail!("All {} files failed", report.failed.len());
    }
    Ok(())
}
