//! mountmap CLI - command line front end for mount point mapping.
//!
//! This CLI edits the mount point mapping of a partitioning backend stored in
//! a state file, either directly or through a backend daemon child process,
//! and provides the daemon mode itself.

mod daemon;

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

use mountmap_core::backend::reset_if_needed;
use mountmap_core::validate::RowReport;
use mountmap_core::{
    Error, FileBackend, MappingConfig, MappingView, MemoryBackend, MountPointSession,
    PartitioningBackend, PartitioningTarget, PersistOutcome, ProcessBackend, Request, RequestEdit,
    Result,
};

/// Mount point mapping CLI tool.
#[derive(Parser)]
#[command(name = "mountmap-cli")]
#[command(about = "Map mount points to devices for installer partitioning", long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// Backend state file.
    #[arg(long)]
    state: PathBuf,

    /// Session configuration file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk to a backend daemon child process instead of the file directly.
    #[arg(long)]
    remote: bool,

    /// Continue without unlocking encrypted devices.
    #[arg(long)]
    skip_unlock: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a backend daemon, accepting signed commands via stdin.
    ///
    /// This mode is intended to be launched by a front end that owns the
    /// daemon's stdio.
    Backend {
        /// Backend state file.
        #[arg(long)]
        state: PathBuf,
    },

    /// Create a state file from a seed document with constraints and devices.
    Init {
        /// Backend state file to create.
        #[arg(long)]
        state: PathBuf,

        /// Seed document.
        #[arg(long)]
        seed: PathBuf,
    },

    /// Show the mount point mapping of the current partitioning.
    Show(SessionArgs),

    /// Edit one row and push the result to the backend.
    Edit {
        #[command(flatten)]
        session: SessionArgs,

        /// Row to edit. Use the row count to append a new row.
        ///
        /// Rows are rebuilt from the backend on every run, so only rows
        /// assigned to a device the backend knows persist between runs.
        #[arg(long)]
        index: usize,

        #[arg(long)]
        mount_point: Option<String>,

        #[arg(long)]
        device: Option<String>,

        #[arg(long)]
        reformat: Option<bool>,

        /// Remove the row instead of editing it.
        #[arg(long, conflicts_with_all = ["mount_point", "device", "reformat"])]
        remove: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Backend { state } => daemon::run_daemon(&state),
        Commands::Init { state, seed } => init_state(&state, &seed),
        Commands::Show(args) => with_session(&args, |session, _| {
            print_report(session, args.json);
            Ok(())
        }),
        Commands::Edit {
            session: args,
            index,
            mount_point,
            device,
            reformat,
            remove,
        } => {
            let edit = RequestEdit {
                request_index: index,
                mount_point,
                device_spec: device,
                reformat,
                remove,
            };
            with_session(&args, |session, backend| apply_edit(session, backend, &edit, args.json))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Stdout carries the daemon protocol and reports.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn init_state(state: &Path, seed: &Path) -> Result<()> {
    let content = fs::read_to_string(seed)
        .with_whatever_context(|e| format!("failed to read seed {}: {}", seed.display(), e))?;
    let backend: MemoryBackend = serde_json::from_str(&content)
        .with_whatever_context(|e| format!("failed to parse seed {}: {}", seed.display(), e))?;

    FileBackend::create(state, backend)?;
    println!("Initialized {}", state.display());
    Ok(())
}

/// Opens a session on the state file's current partitioning, runs `f` and
/// remembers the partitioning for the next invocation.
fn with_session(
    args: &SessionArgs,
    f: impl FnOnce(&mut MountPointSession, &mut dyn PartitioningBackend) -> Result<()>,
) -> Result<()> {
    let config = MappingConfig::load_or_default(args.config.as_deref())?;
    let stored = FileBackend::open(&args.state)?;
    let current = stored.current().cloned();
    let applied = stored.backend().applied.clone();
    drop(stored);

    let target = if args.remote {
        let program = std::env::current_exe()
            .with_whatever_context(|e| format!("failed to locate own executable: {}", e))?;
        let mut backend = ProcessBackend::spawn(&program, &args.state)?;
        let target = run_session(&mut backend, current.as_ref(), applied.as_ref(), config, args, f)?;
        backend.shutdown()?;
        target
    } else {
        let mut backend = FileBackend::open(&args.state)?;
        run_session(&mut backend, current.as_ref(), applied.as_ref(), config, args, f)?
    };

    FileBackend::open(&args.state)?.set_current(Some(target))
}

fn run_session(
    backend: &mut dyn PartitioningBackend,
    current: Option<&PartitioningTarget>,
    applied: Option<&PartitioningTarget>,
    config: MappingConfig,
    args: &SessionArgs,
    f: impl FnOnce(&mut MountPointSession, &mut dyn PartitioningBackend) -> Result<()>,
) -> Result<PartitioningTarget> {
    let reset_applied = config.reset_applied_partitioning;
    let mut session = MountPointSession::open(backend, current, config)?;
    let target = session.target().cloned().ok_or(Error::NoPartitioning)?;

    if reset_applied {
        reset_if_needed(backend, applied, &target)?;
    }
    if args.skip_unlock {
        session.skip_unlock();
    }

    f(&mut session, backend)?;
    Ok(target)
}

fn apply_edit(
    session: &mut MountPointSession,
    backend: &mut dyn PartitioningBackend,
    edit: &RequestEdit,
    json: bool,
) -> Result<()> {
    if let MappingView::UnlockRequired { devices } = session.view() {
        snafu::whatever!(
            "locked devices must be unlocked first: {} (or pass --skip-unlock)",
            devices.into_iter().collect::<Vec<_>>().join(", ")
        );
    }

    let ticket = session.edit(edit)?;
    let outcome = session.persist_with(backend, &ticket);
    print_report(session, json);

    match outcome {
        PersistOutcome::Failed { message } => Err(Error::PersistFailure {
            target: ticket.target.to_string(),
            message,
        }),
        PersistOutcome::Applied | PersistOutcome::Stale => Ok(()),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Report<'a> {
    partitioning: Option<&'a PartitioningTarget>,
    view: MappingView,
    valid: bool,
    persist_failure: Option<&'a str>,
    requests: &'a [Request],
    rows: Vec<RowReport>,
}

fn print_report(session: &MountPointSession, json: bool) {
    let report = Report {
        partitioning: session.target(),
        view: session.view(),
        valid: session.is_form_valid(),
        persist_failure: session.persist_failure(),
        requests: session.requests(),
        rows: session.rows(),
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: failed to serialize report: {}", e),
        }
        return;
    }

    let partitioning = report.partitioning.map_or("-", PartitioningTarget::as_str);
    match &report.view {
        MappingView::Loading => {
            println!("Partitioning {}: loading", partitioning);
            return;
        }
        MappingView::UnlockRequired { devices } => {
            let devices: Vec<_> = devices.iter().map(String::as_str).collect();
            println!(
                "Partitioning {}: unlock required for {}",
                partitioning,
                devices.join(", ")
            );
            return;
        }
        MappingView::Ready => {}
    }

    println!(
        "Partitioning {}: {}",
        partitioning,
        if report.valid { "valid" } else { "incomplete" }
    );
    println!(
        "{:<4}{:<16}{:<12}{:<10}{:<10}ISSUE",
        "#", "MOUNT POINT", "DEVICE", "FORMAT", "REFORMAT"
    );

    for (request, row) in report.requests.iter().zip(&report.rows) {
        let issue = if row.duplicate_mount_point {
            "Duplicate mount point.".to_string()
        } else if row.duplicate_device {
            "Duplicate device.".to_string()
        } else {
            row.device_issue
                .as_ref()
                .or(row.reformat_issue.as_ref())
                .map(ToString::to_string)
                .unwrap_or_default()
        };

        println!(
            "{:<4}{:<16}{:<12}{:<10}{:<10}{}",
            row.index,
            row.display_mount_point,
            request.device().unwrap_or("-"),
            request.format_type().unwrap_or("-"),
            if request.reformat { "yes" } else { "no" },
            issue
        );
    }

    if let Some(message) = report.persist_failure {
        println!("Failed to apply requests: {}", message);
    }
}
