//! ebp-pg-sync CLI - Mirror an EBP SQL Server database into PostgreSQL.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ebp_pg_sync::backup::{cleanup_old_backups, list_backups};
use ebp_pg_sync::{
    create_target_backup, BackupFormat, BackupOptions, Config, Orchestrator, SyncError,
    SyncReport, VerificationReport, VerificationResult, VerificationStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "ebp-pg-sync")]
#[command(about = "Mirror an EBP SQL Server database into PostgreSQL and verify the mirror")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for running tables after SIGINT/SIGTERM (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy source tables into the PostgreSQL mirror
    Sync {
        /// Comma-separated tables to sync (default: all)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Drop and recreate each table; existing tables are backed up first
        #[arg(long, conflicts_with = "incremental")]
        drop_and_create: bool,

        /// Upsert on the key instead of reloading
        #[arg(long)]
        incremental: bool,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Compare row counts and seeded samples between source and mirror
    Verify {
        /// Comma-separated tables to verify (default: all)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Rows sampled per table (default: from config)
        #[arg(long)]
        sample_size: Option<usize>,
    },

    /// Incrementally re-sync tables flagged by a verification
    Repair {
        /// Verification JSON written by `verify --output-json`; verifies first when omitted
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Snapshot the mirror with pg_dump
    Backup {
        /// plain, custom, directory or tar (default: from config)
        #[arg(long)]
        format: Option<String>,

        /// Comma-separated tables to include (default: all)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Use the pg_dump executable name of this OS (e.g. windows)
        #[arg(long)]
        force_os: Option<String>,

        /// Dump table definitions only
        #[arg(long, conflicts_with = "data_only")]
        schema_only: bool,

        /// Dump rows only
        #[arg(long)]
        data_only: bool,

        /// List existing backups instead of creating one
        #[arg(long, conflicts_with = "cleanup")]
        list: bool,

        /// Keep only the N newest backups instead of creating one
        /// (default: backup.keep)
        #[arg(long, num_args = 0..=1, value_name = "N")]
        cleanup: Option<Option<usize>>,
    },

    /// Classify and score the source schema
    Audit,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

fn table_filter(tables: &[String]) -> Option<&[String]> {
    if tables.is_empty() {
        None
    } else {
        Some(tables)
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Backups only need pg_dump and the backup directory, never the source.
    if let Commands::Backup {
        format,
        tables,
        force_os,
        schema_only,
        data_only,
        list,
        cleanup,
    } = &cli.command
    {
        let format = match format {
            Some(f) => BackupFormat::parse(f)?,
            None => config.backup.format,
        };
        if *list {
            return print_backups(&config.backup.directory, cli.output_json).await;
        }
        if let Some(keep) = *cleanup {
            let keep = keep.unwrap_or(config.backup.keep);
            let removed = cleanup_old_backups(&config.backup.directory, keep).await?;
            println!("Removed {} backup(s), kept up to {}", removed, keep);
            return Ok(());
        }

        let report = create_target_backup(
            &config,
            BackupOptions {
                format,
                tables: tables.clone(),
                force_os: force_os.clone(),
                schema_only: *schema_only,
                data_only: *data_only,
            },
        )
        .await?;
        if cli.output_json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("Backup written to {}", report.file_path.display());
            println!("  Size: {:.2} MB", report.size_in_mb);
        }
        return Ok(());
    }

    if let Commands::Sync {
        workers: Some(w), ..
    } = &cli.command
    {
        config.sync.workers = Some(*w);
        config.validate()?;
    }
    let config = config.with_auto_tuning();

    let cancel = setup_signal_handler(cli.shutdown_timeout).await?;
    let orchestrator = Orchestrator::connect(config).await?.with_cancel(cancel.clone());
    let grace = Duration::from_secs(cli.shutdown_timeout);

    match cli.command {
        Commands::Sync {
            tables,
            drop_and_create,
            incremental,
            ..
        } => {
            let filter = table_filter(&tables);
            let report = with_shutdown_grace(&cancel, grace, async {
                if incremental {
                    orchestrator.run_incremental_sync(filter).await
                } else {
                    orchestrator.run_full_sync(filter, drop_and_create).await
                }
            })
            .await?;
            print_sync_report(&report, cli.output_json, "Sync")?;
        }

        Commands::Verify {
            tables,
            sample_size,
        } => {
            let report = with_shutdown_grace(
                &cancel,
                grace,
                orchestrator.run_verification(table_filter(&tables), sample_size),
            )
            .await?;
            print_verification_report(&report, cli.output_json)?;
        }

        Commands::Repair { from } => {
            let results = match from {
                Some(path) => load_verification(&path)?,
                None => {
                    info!("No verification file given, verifying first");
                    orchestrator.run_verification(None, None).await?.results
                }
            };
            let report =
                with_shutdown_grace(&cancel, grace, orchestrator.run_repair(&results)).await?;
            print_sync_report(&report, cli.output_json, "Repair")?;
        }

        // Handled before connecting.
        Commands::Backup { .. } => {}

        Commands::Audit => {
            let audit = orchestrator.audit().await?;
            if cli.output_json {
                println!("{}", audit.to_json()?);
            } else {
                println!("Schema audit:");
                println!("  Tables: {}", audit.total_tables);
                println!("  Rows (estimated): {}", audit.total_rows);
                println!(
                    "  Columns: {} ({} skipped)",
                    audit.total_columns, audit.skipped_columns
                );
                println!("\n  Domains:");
                for (domain, summary) in &audit.domains {
                    println!(
                        "    {:<14} {:>4} tables {:>12} rows",
                        domain, summary.table_count, summary.row_count
                    );
                }
                if !audit.critical_tables.is_empty() {
                    println!("\n  Critical tables:");
                    for t in &audit.critical_tables {
                        println!(
                            "    {} ({}, importance {}, {} rows)",
                            t.name, t.domain, t.importance, t.row_count
                        );
                    }
                }
                println!("\n  Inferred relations: {}", audit.relations.len());
            }
        }

        Commands::HealthCheck => {
            let result = orchestrator.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MSSQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(SyncError::Configuration("Health check failed".to_string()));
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

/// Run `operation`, giving it `grace` to wind down once `cancel` fires.
async fn with_shutdown_grace<T>(
    cancel: &CancellationToken,
    grace: Duration,
    operation: impl std::future::Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    tokio::select! {
        result = operation => result,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("Shutdown timeout of {}s reached, abandoning running tables", grace.as_secs());
            Err(SyncError::Cancelled)
        }
    }
}

/// Accept either a whole verification report or a bare results array.
fn load_verification(path: &Path) -> Result<Vec<VerificationResult>, SyncError> {
    let content = std::fs::read_to_string(path)?;
    if let Ok(report) = serde_json::from_str::<VerificationReport>(&content) {
        return Ok(report.results);
    }
    Ok(serde_json::from_str::<Vec<VerificationResult>>(&content)?)
}

fn print_sync_report(report: &SyncReport, json: bool, label: &str) -> Result<(), SyncError> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }
    println!("\n{} completed!", label);
    for r in &report.results {
        match &r.error {
            None => println!("  ✓ {} ({} rows, {}ms)", r.table_name, r.rows_synced, r.duration_ms),
            Some(e) => println!("  ✗ {} ({} rows committed): {}", r.table_name, r.rows_synced, e),
        }
    }
    let s = &report.summary;
    println!("  Tables: {}/{}", s.success, s.total_tables);
    println!("  Rows: {}", s.total_rows_synced);
    println!("  Duration: {:.2}s", s.total_duration_ms as f64 / 1000.0);
    Ok(())
}

fn print_verification_report(report: &VerificationReport, json: bool) -> Result<(), SyncError> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }
    println!("Verification results:");
    for r in &report.results {
        let mark = match r.status() {
            VerificationStatus::Ok => "✓",
            VerificationStatus::Warning => "!",
            VerificationStatus::Error => "✗",
        };
        println!(
            "  {} {} (rows {}/{}, samples {}/{})",
            mark, r.table_name, r.pg_row_count, r.ebp_row_count, r.samples_matched, r.samples_checked
        );
        if let Some(ref e) = r.error {
            println!("      {}", e);
        }
        for issue in &r.data_integrity_issues {
            println!(
                "      [{}] {}: {} != {}",
                issue.key, issue.column, issue.source_value, issue.target_value
            );
        }
    }
    let s = &report.summary;
    println!("\nVerification Summary:");
    println!("  Tables checked: {}", s.total_tables);
    println!("  OK: {}", s.ok);
    println!("  Warnings: {}", s.warnings);
    println!("  Errors: {}", s.errors);
    println!("  Issues: {}", s.total_issues);
    Ok(())
}

async fn print_backups(dir: &Path, json: bool) -> Result<(), SyncError> {
    let backups = list_backups(dir).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }
    if backups.is_empty() {
        println!("No backups in {}", dir.display());
        return Ok(());
    }
    println!("Backups in {} (newest first):", dir.display());
    for b in &backups {
        println!(
            "  {}  {:<9} {:>8.2} MB  {}",
            b.created_at.format("%Y-%m-%d %H:%M:%S"),
            b.format.to_string(),
            b.size_in_mb,
            b.file_path.display()
        );
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so `--output-json` stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
