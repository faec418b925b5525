use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use ase_backup::config::AgentConfig;
use ase_backup::dump::IsqlDumpEngine;
use ase_backup::store::{ObjectStore, open_store};
use ase_backup::timing::{format_duration, parse_duration};
use ase_backup::{BackupAgent, BackupRequest, Kind, Result, RunReport, Timestamp};
use chrono::TimeDelta;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Agent configuration TOML
    #[arg(long, global = true, default_value = "/etc/ase-backup/agent.toml")]
    config: PathBuf,
    /// Comma-separated databases (default: every database the server reports)
    #[arg(long, global = true, value_delimiter = ',')]
    databases: Vec<String>,
    /// Local working directory (overrides agent.output_dir)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct BackupArgs {
    /// Run even if the schedule says it is not due
    #[arg(long)]
    force: bool,
    /// Keep the finished dump files locally instead of uploading them
    #[arg(long)]
    skip_upload: bool,
    /// Dump to local files first instead of streaming through named pipes
    #[arg(long)]
    file_mode: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Full database dump
    Full(BackupArgs),
    /// Transaction log dump
    Incremental(BackupArgs),
    /// Download the artifacts needed to reach a point in time
    Restore {
        /// Restore point, yyyyMMdd_HHmmss
        point: Timestamp,
    },
    /// List stored stripe sets
    List,
    /// Delete stored artifacts older than the given age (e.g. "30d")
    Prune {
        #[arg(value_parser = parse_duration)]
        age: TimeDelta,
    },
    /// Print the effective configuration
    ShowConfig,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_json);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let cfg = AgentConfig::load(&args.config)?;
    if let Command::ShowConfig = args.cmd {
        for line in cfg.describe() {
            println!("{line}");
        }
        return Ok(());
    }

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| cfg.agent.output_dir.clone());
    let streaming = cfg.agent.streaming;
    let store: Arc<dyn ObjectStore> = Arc::from(open_store(&cfg.store)?);
    let engine = Arc::new(IsqlDumpEngine::new(cfg.dump.clone()));
    let agent = BackupAgent::new(cfg, store, engine);

    match args.cmd {
        Command::Full(b) => cmd_backup(&agent, Kind::Full, &b, args.databases, streaming, &output_dir),
        Command::Incremental(b) => {
            cmd_backup(&agent, Kind::Incremental, &b, args.databases, streaming, &output_dir)
        }
        Command::Restore { point } => {
            let report = agent.restore(point, &args.databases, &output_dir)?;
            for (db, chain) in &report.completed {
                println!("{db}:");
                for a in chain {
                    let name = ase_backup::naming::encode_filename(a)?;
                    println!("  {}", output_dir.join(name).display());
                }
            }
            report.into_result()
        }
        Command::List => cmd_list(&agent, &args.databases),
        Command::Prune { age } => {
            let report = agent.prune(age, &args.databases, Timestamp::now())?;
            info!(
                deleted = report.deleted.len(),
                kept = report.kept,
                older_than = %format_duration(age),
                "prune finished"
            );
            Ok(())
        }
        Command::ShowConfig => Ok(()),
    }
}

fn cmd_backup(
    agent: &BackupAgent,
    kind: Kind,
    b: &BackupArgs,
    databases: Vec<String>,
    streaming: bool,
    output_dir: &Path,
) -> Result<()> {
    let req = BackupRequest {
        databases,
        force: b.force,
        skip_upload: b.skip_upload,
        streaming: streaming && !b.file_mode,
        output_dir: output_dir.to_path_buf(),
    };
    let report = agent.backup(kind, &req)?;
    summarize(kind, &report);
    report.into_result()
}

fn summarize(kind: Kind, report: &RunReport) {
    info!(
        kind = %kind,
        completed = report.completed.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "run finished"
    );
}

fn cmd_list(agent: &BackupAgent, databases: &[String]) -> Result<()> {
    for set in agent.list(databases)? {
        let end = set
            .end
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = if set.is_complete() {
            String::new()
        } else {
            format!("  INCOMPLETE {:?}", set.stripe_indices())
        };
        println!(
            "{:<20} {:<5} {} -> {}  {} stripe(s){}",
            set.database,
            set.kind.tag(),
            set.start,
            end,
            set.stripe_count,
            status
        );
    }
    Ok(())
}
