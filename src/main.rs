use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use photomigrate::config::Config;
use photomigrate::events::{spawn_log_observer, ProgressEventBus};
use photomigrate::library::{DirectoryLibrary, FfmpegTranscoder};
use photomigrate::logging;
use photomigrate::media::{discover_media_in, ExifSidecarExtractor};
use photomigrate::memory::MemoryPressureMonitor;
use photomigrate::pipeline::{MigrationPipeline, MigrationReport};

#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<PathBuf>,
    dry_run: bool,
    verbose: bool,
    export_dir: Option<String>,
    dest_dir: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("photomigrate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    cli.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--dry-run" | "-n" => cli.dry_run = true,
            "--verbose" | "-v" => cli.verbose = true,
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            arg => {
                if cli.export_dir.is_none() {
                    cli.export_dir = Some(arg.to_string());
                } else if cli.dest_dir.is_none() {
                    cli.dest_dir = Some(PathBuf::from(arg));
                } else {
                    eprintln!("Unexpected argument: {}", arg);
                    std::process::exit(1);
                }
            }
        }
        i += 1;
    }

    cli
}

fn print_help() {
    println!(
        r#"photomigrate - migrate a photo export into a library, rebuilding Live Photos

USAGE:
    photomigrate [OPTIONS] <EXPORT_DIR> [DEST_DIR]

OPTIONS:
    --config, -c PATH   Path to config file
    --dry-run, -n       Pair and plan, but write nothing
    --verbose, -v       Log to stderr instead of the journal/log file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PHOTOMIGRATE_CONFIG       Path to config file (overrides default location)
    PHOTOMIGRATE_LOG          Log filter (trace, debug, info, warn, error)
    PHOTOMIGRATE_FFMPEG_PATH  ffmpeg binary used for motion conversion

Config file location: $XDG_CONFIG_HOME/photomigrate/config.toml
Press Ctrl-C to stop after the items in flight finish."#
    );
}

fn print_summary(report: &MigrationReport) {
    let run = &report.run;
    println!();
    println!("Discovered:           {}", report.discovered);
    println!("Live Photo pairs:     {}", report.pairs);
    println!("Singles:              {}", report.singles);
    println!("Conversion failures:  {}", report.conversion_failures.len());
    println!("Imported:             {} ({} Live Photos)", run.success_count, report.live_photos_imported());
    println!("Failed:               {}", run.failure_count);
    println!("Batches:              {} (final size {})", run.batches, run.final_batch_size);
    if run.cancelled {
        println!("Cancelled after {} of {} items", run.processed(), run.total_items);
    }

    for failure in &report.conversion_failures {
        println!("  conversion: {} ({})", failure.still_id, failure.error);
    }
    for error in report.failures() {
        println!("  failed: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    if let Err(e) = logging::init(None, cli.verbose) {
        eprintln!("Warning: logging unavailable: {:#}", e);
    }

    let Some(export_dir) = cli.export_dir.clone() else {
        print_help();
        std::process::exit(1);
    };

    let mut config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if cli.dry_run {
        config.library.dry_run = true;
    }
    if let Some(dest) = cli.dest_dir.clone() {
        config.library.destination = dest;
    }
    config.validate()?;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing in-flight items");
                eprintln!("Stopping after in-flight items...");
                cancel.cancel();
            }
        })
    };

    let monitor = Arc::new(MemoryPressureMonitor::with_sysinfo(config.memory_thresholds()));
    let sampler_stop = CancellationToken::new();
    let sampler = monitor.spawn_sampler(config.memory.sample_interval(), sampler_stop.clone());

    let bus = Arc::new(ProgressEventBus::new());
    let observer = spawn_log_observer(&bus);

    let extensions = config.pairing.media_extensions();
    let items = tokio::task::spawn_blocking(move || discover_media_in(&export_dir, &extensions, &ExifSidecarExtractor))
        .await
        .context("Discovery task panicked")??;
    println!("Found {} media files", items.len());

    let library = Arc::new(DirectoryLibrary::new(
        config.library.destination.clone(),
        config.library.dry_run,
    ));
    let transcoder =
        Arc::new(FfmpegTranscoder::new(config.library.transcode_dir.clone()).with_dry_run(config.library.dry_run));
    let pipeline = MigrationPipeline::from_config(&config, library, transcoder, monitor.clone(), bus.clone(), cancel);

    let outcome = pipeline.run(items).await;

    sampler_stop.cancel();
    let _ = sampler.await;
    ctrl_c.abort();
    drop(pipeline);
    drop(bus);
    let _ = observer.await;

    let report = outcome.context("Migration aborted")?;
    print_summary(&report);
    tracing::info!(
        peak_memory_bytes = monitor.peak_usage(),
        destination = %config.library.destination.display(),
        "Migration finished"
    );

    if report.run.cancelled {
        std::process::exit(130);
    }
    Ok(())
}
