use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use recipient_linker::{
    ConvergenceDriver, DriverSettings, LinkerConfig, ProgramConfig, ProgressReporter, SqliteStore,
};

#[derive(Parser, Debug)]
#[command(name = "recipient-linker", version, about = "Link funding-program records to canonical organizations")]
struct Cli {
    /// JSON config file (built-in defaults when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overrides the config file
    #[arg(long, global = true, env = "RECIPIENT_LINKER_DB")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the registry tables
    Init,

    /// Drain unlinked records for the selected programs
    Link {
        /// Program to run (repeatable; all configured programs when omitted)
        #[arg(long = "program")]
        programs: Vec<String>,

        #[arg(long)]
        page_size: Option<usize>,

        #[arg(long)]
        max_pages: Option<usize>,

        /// One thread and one connection per program
        #[arg(long)]
        parallel: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Also write per-program rows to a CSV file
        #[arg(long)]
        report_csv: Option<PathBuf>,
    },

    /// Show pending and unlinkable counts
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database = database;
    }

    match cli.command {
        Command::Init => run_init(&config),
        Command::Link {
            programs,
            page_size,
            max_pages,
            parallel,
            json,
            report_csv,
        } => {
            if let Some(page_size) = page_size {
                config.page_size = page_size;
            }
            if max_pages.is_some() {
                config.max_pages = max_pages;
            }
            config.validate()?;
            let clean = run_link(&config, &programs, parallel, json, report_csv.as_deref())?;
            if !clean {
                std::process::exit(2);
            }
            Ok(())
        }
        Command::Status { json } => run_status(&config, json),
    }
}

fn load_config(path: Option<&Path>) -> Result<LinkerConfig> {
    match path {
        Some(path) => LinkerConfig::load(path)
            .with_context(|| format!("Invalid configuration in {}", path.display())),
        None => Ok(LinkerConfig::default()),
    }
}

fn open_store(config: &LinkerConfig) -> Result<SqliteStore> {
    let store = SqliteStore::open(&config.database, Duration::from_millis(config.busy_timeout_ms))?;
    store.setup_registry()?;
    Ok(store)
}

/// Open the store and check every program's table before any page runs
fn prepare(config: &LinkerConfig, names: &[String]) -> Result<(SqliteStore, Vec<ProgramConfig>)> {
    let programs = config.select_programs(names)?;
    let store = open_store(config)?;
    for program in &programs {
        store.validate_program(program)?;
    }
    Ok((store, programs))
}

fn run_init(config: &LinkerConfig) -> Result<()> {
    println!("🗄️  Initializing registry at {}", config.database.display());
    open_store(config)?;
    println!("✓ Registry tables ready (WAL mode)");
    Ok(())
}

fn run_link(
    config: &LinkerConfig,
    names: &[String],
    parallel: bool,
    json: bool,
    report_csv: Option<&Path>,
) -> Result<bool> {
    let (mut store, programs) = prepare(config, names)?;
    let driver = ConvergenceDriver::new(DriverSettings::from(config));

    // First Ctrl-C stops at the next page boundary, a second one exits now
    let stop = driver.stop_flag();
    ctrlc::set_handler(move || {
        if stop.swap(true, Ordering::SeqCst) {
            eprintln!("\n⚠️  Second interrupt, exiting without finishing the page");
            std::process::exit(130);
        }
        eprintln!("\n⚠️  Interrupt received, finishing the current page...");
    })
    .context("Failed to install Ctrl-C handler")?;

    let before = ProgressReporter::snapshot(&store, &programs)?;
    info!(
        programs = programs.len(),
        pending = before.total_unlinked(),
        parallel,
        "starting linking run"
    );

    let outcomes = if parallel {
        driver.run_parallel(|| open_store(config), &programs)
    } else {
        driver.run(&mut store, &programs)
    };

    let after = ProgressReporter::snapshot(&store, &programs)?;
    let report = ProgressReporter::finish(&before, &outcomes, &after);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }

    if let Some(path) = report_csv {
        report.write_csv(path)?;
        if !json {
            println!("📄 Report written to {}", path.display());
        }
    }

    let clean = report.is_clean();
    if !clean && !json {
        println!("⚠️  Some records are still pending; re-run to continue");
    }
    Ok(clean)
}

fn run_status(config: &LinkerConfig, json: bool) -> Result<()> {
    let (store, programs) = prepare(config, &[])?;
    let snapshot = ProgressReporter::snapshot(&store, &programs)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{}", snapshot.summary());
    }
    Ok(())
}
