//! Thin control surface over the runtime: load a package, run it on a
//! scheduler, and report as JSON. Exit code 0 on full success, 1 on an
//! execution failure, 2 on a usage/load error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use utek_contracts::UTEK_VALIDATE_REPORT_SCHEMA_VERSION;
use utek_crypto::CryptoEngine;
use utek_pkg::{load_file, sample_package, LoadOptions};
use utek_runtime::{AuditSink, RuntimeConfig, Scheduler, SimulatedTransport};

#[derive(Parser)]
#[command(name = "utek")]
#[command(about = "Sandboxed execution runtime for .asu program packages.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run a program package to completion.
    Run(RunArgs),
    /// Write a sample package into a directory.
    CreateSample {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Parse and validate a package without running it.
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// PEM public key for signature verification.
        #[arg(long, value_name = "PATH")]
        verify_key: Option<PathBuf>,
    },
    /// Print a runtime status snapshot.
    Status {
        #[arg(long, value_name = "N", default_value_t = utek_runtime::DEFAULT_POOL_SIZE)]
        pool: usize,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Execution-unit pool size.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pool: usize,

    /// Append audit lines to this file as well as the report.
    #[arg(long, value_name = "PATH")]
    audit_log: Option<PathBuf>,

    /// PEM public key for signature verification.
    #[arg(long, value_name = "PATH")]
    verify_key: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        CliCommand::Run(args) => run(args),
        CliCommand::CreateSample { dir } => create_sample(&dir),
        CliCommand::Validate { file, verify_key } => validate(&file, verify_key.as_deref()),
        CliCommand::Status { pool } => status(pool),
    }
}

fn load_options(verify_key: Option<&std::path::Path>) -> Result<LoadOptions> {
    let mut opts = LoadOptions::default();
    if let Some(path) = verify_key {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("read key: {}", path.display()))?;
        let mut engine = CryptoEngine::new();
        engine.load_public_key_pem(&pem)?;
        opts.verify_engine = Some(engine);
    }
    Ok(opts)
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let opts = load_options(args.verify_key.as_deref())?;
    let loaded = load_file(&args.file, &opts)?;
    for warning in &loaded.warnings {
        eprintln!("warning: {warning}");
    }

    let audit = match &args.audit_log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open audit log: {}", path.display()))?;
            Arc::new(AuditSink::with_writer(Box::new(file)))
        }
        None => Arc::new(AuditSink::new()),
    };

    let config = RuntimeConfig {
        pool_size: args.pool,
        ..RuntimeConfig::default()
    };
    let scheduler = Scheduler::with_parts(
        config,
        Arc::new(SimulatedTransport),
        CryptoEngine::new(),
        audit,
    );
    let handle = scheduler
        .submit(loaded.package)
        .map_err(|e| anyhow::anyhow!("submit: {e}"))?;
    let report = handle.wait()?;
    scheduler.shutdown(Duration::from_secs(5));

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn create_sample(dir: &std::path::Path) -> Result<ExitCode> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
    let package = sample_package();
    let name = package.conventional_file_name()?;
    let path = dir.join(&name);
    package.write_file(&path)?;
    println!("{}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn validate(file: &std::path::Path, verify_key: Option<&std::path::Path>) -> Result<ExitCode> {
    let opts = load_options(verify_key)?;
    let loaded = load_file(file, &opts)?;
    let mut groups = std::collections::BTreeMap::new();
    for instruction in &loaded.package.instructions {
        *groups
            .entry(instruction.opcode.group().as_str())
            .or_insert(0u64) += 1;
    }
    let report = serde_json::json!({
        "schema_version": UTEK_VALIDATE_REPORT_SCHEMA_VERSION,
        "file": file.display().to_string(),
        "program_hash": loaded.hash,
        "instructions": loaded.package.instructions.len(),
        "instruction_groups": groups,
        "networking_mode": loaded.package.header.networking_mode,
        "warnings": loaded.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn status(pool: usize) -> Result<ExitCode> {
    let scheduler = Scheduler::new(RuntimeConfig {
        pool_size: pool,
        ..RuntimeConfig::default()
    });
    let status = scheduler.status();
    scheduler.shutdown(Duration::from_secs(1));
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(ExitCode::SUCCESS)
}
