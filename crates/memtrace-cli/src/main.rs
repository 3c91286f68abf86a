use std::ffi::OsString;
use std::io::Write as _;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use anyhow::Context;
use clap::Parser;
use memtrace_shm::{LeakReport, SharedTable, TABLE_HANDLE_ENV, TableConfig};
use tracing::{Level, debug, info, warn};

const BANNER: &str = r"                          _
 _ __ ___   ___ _ __ ___ | |_ _ __ __ _  ___ ___
| '_ ` _ \ / _ \ '_ ` _ \| __| '__/ _` |/ __/ _ \
| | | | | |  __/ | | | | | |_| | | (_| | (_|  __/
|_| |_| |_|\___|_| |_| |_|\__|_|  \__,_|\___\___|

";

#[derive(Parser)]
#[command(
    name = "memtrace",
    about = "Run a program and report the memory it never freed",
    version,
    long_about = "Runs a program with an allocator override preloaded, records every live allocation in a shared-memory table and reports whatever is left once the program exits."
)]
struct Cli {
    /// Print the stack trace of every leaked block
    #[arg(short, long)]
    stacks: bool,

    /// Allocator override library to preload into the program
    #[arg(
        long,
        env = "MEMTRACE_PRELOAD",
        default_value = "/usr/local/lib/libmemtrace_preload.so"
    )]
    preload: PathBuf,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Set the logging level
    #[arg(short, long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Do not print the banner
    #[arg(long)]
    no_banner: bool,

    /// Program to run
    program: OsString,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    /// Human readable report
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the report
    tracing_subscriber::fmt()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !cli.no_banner && cli.format == OutputFormat::Text {
        print!("{BANNER}");
    }

    let table = SharedTable::create(&TableConfig::default())
        .context("Could not start the allocation table")?;

    with_table(table, |table| {
        let status = run_traced(&cli, table)?;

        if let Some(signal) = status.signal() {
            println!("executable process terminated due to signal {signal}");
        } else {
            debug!("Program exited with {status}");
        }

        let report = table
            .scan(cli.stacks)
            .context("Could not scan the allocation table")?;
        print_report(&report, &cli)
    })
}

/// Run `body` against `table`, then remove the table whatever the outcome.
///
/// A failure in `body` wins over a failure to remove the table, which is
/// only logged in that case.
fn with_table<T>(
    table: SharedTable,
    body: impl FnOnce(&SharedTable) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let result = body(&table);
    let destroyed = table.destroy();
    match (result, destroyed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e).context("Could not remove the allocation table"),
        (Err(e), destroyed) => {
            if let Err(cleanup) = destroyed {
                warn!("Failed to remove the allocation table: {cleanup}");
            }
            Err(e)
        }
    }
}

/// Run the program with the table published in its environment.
fn run_traced(cli: &Cli, table: &SharedTable) -> anyhow::Result<ExitStatus> {
    if !cli.preload.exists() {
        warn!(
            "Preload library {} not found; allocations will not be recorded",
            cli.preload.display()
        );
    }

    let handle = table.handle();
    info!(
        "Tracing {} with table {handle}",
        cli.program.to_string_lossy()
    );

    // Keep the banner ahead of the program's own output
    std::io::stdout().flush()?;

    let mut child = Command::new(&cli.program)
        .args(&cli.args)
        .env(TABLE_HANDLE_ENV, handle.to_string())
        .env("LD_PRELOAD", &cli.preload)
        .spawn()
        .with_context(|| format!("Could not start {}", cli.program.to_string_lossy()))?;

    child.wait().context("Could not wait for the traced program")
}

fn print_report(report: &LeakReport, cli: &Cli) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Text => print!("{}", report.render_text(cli.stacks)),
        OutputFormat::Json => println!("{}", report.to_json_pretty()?),
    }
    Ok(())
}
