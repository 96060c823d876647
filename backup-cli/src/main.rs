use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use backup::{BackupConfig, BackupError, BackupService, BackupVersion};
use chrono::Local;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_DIR: &str = "logs";

#[derive(Parser)]
#[command(name = "backup")]
#[command(about = "Back up directory trees with duplicate detection and version history")]
#[command(version)]
struct Cli {
    /// Configuration file path (.json, .yaml or .yml)
    #[arg(short, long)]
    config: PathBuf,

    /// Show what would be copied without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// List recorded backup versions
    #[arg(long)]
    list_versions: bool,

    /// Show details of one backup version
    #[arg(long, value_name = "ID")]
    show_version: Option<String>,

    /// Show details of the most recent backup version
    #[arg(long)]
    latest_version: bool,

    /// Enable debug output
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = BackupConfig::load(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    apply_flags(&cli, &mut config);

    let runs_backup = !(cli.validate
        || cli.list_versions
        || cli.latest_version
        || cli.show_version.is_some());
    let log_dir = (runs_backup && !cli.dry_run).then(|| config.target_directory.join(LOG_DIR));
    let _guard = init_logging(&config.options.log_level, log_dir.as_deref())?;

    let service = BackupService::new(config).context("Invalid configuration")?;

    if cli.validate {
        println!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    if cli.list_versions {
        print_version_list(&service.list_versions().await?);
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(id) = &cli.show_version {
        let version = service.get_version(id).await?;
        print_version_details(&version)?;
        return Ok(ExitCode::SUCCESS);
    }

    if cli.latest_version {
        match service.latest_version().await? {
            Some(version) => print_version_details(&version)?,
            None => println!("No backup versions found"),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    if cli.dry_run {
        return dry_run(&service, cancel).await;
    }

    backup(&service, cancel).await
}

fn apply_flags(cli: &Cli, config: &mut BackupConfig) {
    if let Some(level) = &cli.log_level {
        config.options.log_level = level.clone();
    }
    if cli.verbose {
        config.options.verbose = true;
        config.options.quiet = false;
        config.options.log_level = "debug".to_string();
    }
    if cli.quiet {
        config.options.quiet = true;
        config.options.verbose = false;
        config.options.log_level = "error".to_string();
    }
}

/// Console logging on stderr plus an optional per-run log file.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("backup={}", level)));

    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let file_name = format!("backup_{}.log", Local::now().format("%Y-%m-%d_%H-%M-%S"));
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight files");
            cancel.cancel();
        }
    });
}

async fn backup(service: &BackupService, cancel: CancellationToken) -> Result<ExitCode> {
    let quiet = service.config().options.quiet;

    let report = match service.backup_with_cancel(cancel).await {
        Ok(report) => report,
        Err(BackupError::Cancelled) => {
            eprintln!("Backup cancelled; the partial run was recorded as failed");
            return Ok(ExitCode::from(1));
        }
        Err(e) => return Err(e).context("Backup failed"),
    };

    if !quiet {
        println!("{}", report.summary);
        println!("Version: {}", report.version_id);
    }

    if report.has_failures() {
        eprintln!("{} file(s) could not be backed up:", report.failures.len());
        for (index, failure) in report.failures.iter().enumerate() {
            eprintln!("{}. {}: {}", index + 1, failure.source.display(), failure.error);
        }
        return Ok(ExitCode::from(2));
    }

    info!(version = %report.version_id, "Backup finished");
    Ok(ExitCode::SUCCESS)
}

async fn dry_run(service: &BackupService, cancel: CancellationToken) -> Result<ExitCode> {
    let report = service
        .dry_run_with_cancel(cancel)
        .await
        .context("Dry run failed")?;

    let log_path = std::env::temp_dir().join(format!(
        "backup_dry_run_{}.log",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    report.write_log(&log_path).await?;

    println!("Dry run analysis:");
    println!("  Total files:   {}", report.stats.total_files);
    println!(
        "  Files to copy: {} ({:.2} MB)",
        report.files_to_copy(),
        report.bytes_to_copy() as f64 / (1024.0 * 1024.0)
    );
    println!("  Files to skip: {}", report.files_to_skip());
    if !report.failures.is_empty() {
        println!("  Errors:        {}", report.failures.len());
    }
    println!("Detailed log written to {}", log_path.display());

    Ok(ExitCode::SUCCESS)
}

fn print_version_list(versions: &[BackupVersion]) {
    if versions.is_empty() {
        println!("No backup versions found");
        return;
    }

    println!("{:<20} {:<20} {:<12} {:>8} {:>12}", "ID", "Timestamp", "Status", "Files", "Size (MB)");
    for version in versions {
        println!(
            "{:<20} {:<20} {:<12} {:>8} {:>12.2}",
            version.id,
            version.timestamp.format("%Y-%m-%d %H:%M:%S"),
            version.status.to_string(),
            version.files.len(),
            version.size as f64 / (1024.0 * 1024.0)
        );
    }
}

fn print_version_details(version: &BackupVersion) -> Result<()> {
    let stats = &version.stats;

    println!("Version:   {}", version.id);
    println!("Timestamp: {}", version.timestamp.format("%Y-%m-%d %H:%M:%S"));
    println!("Status:    {}", version.status);
    println!("Duration:  {:.2?}", version.duration);
    println!("Size:      {:.2} MB", version.size as f64 / (1024.0 * 1024.0));
    println!();
    println!("Statistics:");
    println!("  Total files:       {}", stats.total_files);
    println!("  Files backed up:   {}", stats.files_backed_up);
    println!("  Files skipped:     {}", stats.files_skipped);
    println!("  Files failed:      {}", stats.files_failed);
    println!("  Bytes transferred: {}", stats.bytes_transferred);
    println!();
    println!("Configuration used:");
    println!("{}", serde_json::to_string_pretty(&version.config_used)?);

    Ok(())
}
