use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ferry::cancel::{CancelReason, CancelToken};
use ferry::cli::{part_size, Cli, Commands};
use ferry::journal::{Journal, NoopJournal, TextJournal};
use ferry::manifest::StatusReport;
use ferry::stages::{Engine, StageReport};
use ferry::store::backend_from_config;
use ferry::FerryError;

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.global.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping after the current step (Ctrl-C again to force)...");
        if on_signal.is_cancelled() {
            std::process::exit(130);
        }
        on_signal.cancel(CancelReason::Interrupted);
    }) {
        tracing::warn!("cannot install Ctrl-C handler: {e}");
    }

    let code = match run(cli, cancel) {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<FerryError>() {
            Some(FerryError::Cancelled(CancelReason::Timeout)) => {
                tracing::warn!("upload stopped at its time limit; rerun to continue");
                0
            }
            Some(FerryError::Cancelled(CancelReason::Interrupted)) => 130,
            _ => {
                eprintln!("Error: {e:#}");
                1
            }
        },
    };
    std::process::exit(code);
}

fn run(cli: Cli, cancel: CancelToken) -> Result<()> {
    let config = cli.global.resolve_config()?;
    config.validate()?;

    let journal: Arc<dyn Journal> = match &cli.global.log_file {
        Some(path) => Arc::new(
            TextJournal::new(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?,
        ),
        None => Arc::new(NoopJournal),
    };

    let store = backend_from_config(&config).context("cannot open the object store")?;
    let engine = Engine::new(store, config)
        .with_cancel(cancel)
        .with_journal(journal);

    match cli.command {
        Commands::Status => print_status(&engine.status()?),
        Commands::RefreshOrigin { path, filters } => {
            let n = engine
                .scan_origin(&path, filters.as_slice())
                .with_context(|| format!("scanning {}", path.display()))?;
            println!("{n} files recorded from {}", path.display());
        }
        Commands::RefreshTarget { path } => {
            let n = engine
                .scan_target(&path)
                .with_context(|| format!("scanning {}", path.display()))?;
            println!("{n} files recorded from {}", path.display());
        }
        Commands::Disassemble {
            path,
            part_size_gb,
            dry_run,
        } => {
            let bytes = part_size(part_size_gb, engine.config())?;
            print_stage("disassemble", &engine.disassemble(&path, bytes, dry_run)?);
        }
        Commands::Upload { dry_run, timeout } => {
            if let Some(limit) = timeout
                .map(Duration::from_secs)
                .or_else(|| engine.config().timeout())
            {
                engine.cancel_token().arm_timeout(limit);
            }
            print_stage("upload", &engine.upload(dry_run)?);
        }
        Commands::Download { path, dry_run } => {
            print_stage("download", &engine.download(&path, dry_run)?);
        }
        Commands::Reassemble {
            work_path,
            dst_path,
        } => {
            let report = engine.reassemble(&work_path, &dst_path)?;
            println!(
                "reassemble: {} restored, {} conflicts, {} not ready",
                report.restored.len(),
                report.conflicts.len(),
                report.skipped.len()
            );
            for id in &report.conflicts {
                println!("  conflict: {id}");
            }
        }
    }
    Ok(())
}

fn print_stage(stage: &str, report: &StageReport) {
    if report.dry_run {
        println!("{stage} (dry run)");
        println!("  delivered, would clean: {:?}", report.cleaned);
        println!("  would process: {:?}", report.processed);
    } else {
        println!(
            "{stage}: {} cleaned, {} processed",
            report.cleaned.len(),
            report.processed.len()
        );
    }
}

fn print_status(report: &StatusReport) {
    println!("{} files present at target", report.present.len());
    if !report.undelivered.is_empty() {
        println!("Not delivered:");
        for id in &report.undelivered {
            println!("  {id}");
        }
    }
    if !report.mismatched.is_empty() {
        println!("Size mismatch:");
        for id in &report.mismatched {
            println!("  {id}");
        }
    }
}
