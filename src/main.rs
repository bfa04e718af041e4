//! Armitage CLI: offline operations over an orchestration directory.
//!
//! The long-lived core (stream + supervisor + workflow engine) is
//! embedded by a host that supplies the runtime client; this binary
//! covers the operations that need no runtime: inspecting the ledger,
//! replaying the stream after a crash, sweeping stale snapshots, and
//! validating workflow documents.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use armitage::config::Config;
use armitage::kernel::ids::{self, Clock};
use armitage::kernel::stream::{EventStream, StreamError};
use armitage::ledger::{LedgerError, LedgerStore};
use armitage::logging;
use armitage::workflow;

/// Exit code for parse and configuration failures.
const EXIT_CONFIG: u8 = 2;

/// Exit code for filesystem failures.
const EXIT_IO: u8 = 3;

#[derive(Parser)]
#[command(name = "armitage", version, about = "Agent orchestration core")]
struct Cli {
    /// Orchestration data directory.
    #[arg(long, default_value = ".opencode")]
    dir: PathBuf,

    /// Configuration file.
    #[arg(long, default_value = "armitage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show ledger and registry state.
    Status,
    /// Replay the event stream and report what recovery found.
    Resume,
    /// Delete context snapshots older than the GC horizon.
    Gc {
        /// Override the horizon in hours.
        #[arg(long)]
        hours: Option<u64>,
    },
    /// Parse and validate a workflow document.
    Check {
        /// Path to the workflow markdown file.
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    if let Err(e) = logging::init(&logging::LogMode::OneShot) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(categorize(&e))
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)?;
    match cli.command {
        Command::Status => status(&cli.dir, &config),
        Command::Resume => resume(&cli.dir, &config),
        Command::Gc { hours } => gc(&cli.dir, &config, hours),
        Command::Check { file } => check(&file),
    }
}

fn open_stream(dir: &Path, config: &Config) -> anyhow::Result<EventStream> {
    let stream = EventStream::new(config.stream_config(dir), Arc::new(Clock::new()))?;
    Ok(stream)
}

fn status(dir: &Path, config: &Config) -> anyhow::Result<()> {
    let stream = open_stream(dir, config)?;
    let report = stream.initialize()?;

    let ledger = LedgerStore::new(dir, ids::session_id());
    ledger.initialize()?;
    let status = ledger.status()?;

    println!("phase: {}", status.index.meta.phase.as_str());
    match &status.index.active_epic {
        Some(epic) => println!(
            "epic: {} {} ({})",
            epic.id,
            epic.title,
            epic.status.as_str()
        ),
        None => println!("epic: none"),
    }
    if let Some(tasks_completed) = &status.index.meta.tasks_completed {
        println!("tasks: {tasks_completed}");
    }
    if let Some(epic) = &status.epic {
        for task in &epic.tasks {
            println!("  {} [{:?}] {}", task.id, task.status, task.title);
        }
    }
    if status.index.handoff.is_some() {
        println!("handoff: active");
    }
    println!(
        "stream: {} event(s) on disk, {} pending checkpoint(s)",
        report.events_replayed,
        report.pending_checkpoints.len()
    );
    Ok(())
}

fn resume(dir: &Path, config: &Config) -> anyhow::Result<()> {
    let stream = open_stream(dir, config)?;
    let report = stream.initialize()?;
    println!("{}", report.format_message());

    for checkpoint in &report.pending_checkpoints {
        println!("pending checkpoint {}: {}", checkpoint.id, checkpoint.decision_point);
    }
    for intent in &report.active_intents {
        println!("in-flight agent {} in session {}", intent.agent, intent.session_id);
    }

    let ledger = LedgerStore::new(dir, ids::session_id());
    ledger.initialize()?;
    if let Some(handoff) = ledger.status()?.index.handoff {
        println!("handoff ({}): {}", handoff.reason.as_str(), handoff.summary);
        println!("resume with: {}", handoff.resume_command);
    }
    Ok(())
}

fn gc(dir: &Path, config: &Config, hours: Option<u64>) -> anyhow::Result<()> {
    let stream = open_stream(dir, config)?;
    stream.initialize()?;
    let horizon = hours.unwrap_or(config.stream.snapshot_gc_hours);
    let removed = stream.gc_snapshots(horizon)?;
    println!("removed {removed} snapshot(s) older than {horizon}h");
    Ok(())
}

fn check(file: &Path) -> anyhow::Result<()> {
    let body = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let definition = workflow::parse(&body)?;
    println!(
        "workflow '{}': {} phase(s), {} step(s), entry agent {}",
        definition.name,
        definition.phases.len(),
        definition
            .phases
            .iter()
            .map(|p| p.steps.len())
            .sum::<usize>(),
        definition.entry_agent
    );
    Ok(())
}

/// Deterministic exit code by error kind.
fn categorize(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if let Some(stream_error) = cause.downcast_ref::<StreamError>() {
            return match stream_error {
                StreamError::Serialization(_) => EXIT_CONFIG,
                _ => EXIT_IO,
            };
        }
        if let Some(ledger_error) = cause.downcast_ref::<LedgerError>() {
            return match ledger_error {
                LedgerError::Markdown(_) | LedgerError::Json(_) => EXIT_CONFIG,
                _ => EXIT_IO,
            };
        }
        if cause.downcast_ref::<workflow::WorkflowError>().is_some() {
            return EXIT_CONFIG;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return EXIT_IO;
        }
        if cause.to_string().contains("config") {
            return EXIT_CONFIG;
        }
    }
    1
}
