use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use fleetreport::load::{self, Bucketing, LoadOptions};
use fleetreport::report::ReportOptions;
use fleetreport::{cpuhog, deadweight};

/// Scheduled post-processor for host-sampler analysis logs: distills
/// redundant daily violation logs into one-shot reports and publishes
/// per-host load series for the dashboard.
#[derive(Parser)]
#[command(name = "fleetreport", about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report new CPU hogs (high CPU use, no GPU) from the cpuhog logs.
    Cpuhog(ReportArgs),
    /// Report new zombie, defunct, or hung jobs from the deadweight logs.
    Deadweight(ReportArgs),
    /// Generate per-host load series JSON for the web dashboard.
    #[command(name = "load-report")]
    LoadReport(LoadReportArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct ReportArgs {
    /// Root directory of the data store.
    #[arg(long)]
    data_path: PathBuf,

    /// Start of the log window: YYYY-MM-DD, Nd (days ago), or Nw (weeks ago).
    #[arg(long, default_value = "1d")]
    from: String,

    /// End of the log window, same formats; defaults to now.
    #[arg(long)]
    to: Option<String>,

    /// Format the report as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Verbose diagnostics on stderr.
    #[arg(short = 'v')]
    verbose: bool,
}

#[derive(Args)]
struct LoadReportArgs {
    /// Root directory of the data store.
    #[arg(long)]
    data_path: PathBuf,

    /// Path to the sonalyze executable.
    #[arg(long)]
    sonalyze: PathBuf,

    /// Host hardware configuration file, passed through to sonalyze.
    #[arg(long)]
    config_file: PathBuf,

    /// Directory receiving the per-host JSON files.
    #[arg(long, default_value = ".")]
    output_path: PathBuf,

    /// Suffix for the generated filenames.
    #[arg(long, default_value = "")]
    tag: String,

    /// Start of the query window: YYYY-MM-DD, Nd (days ago), or Nw (weeks ago).
    #[arg(long, default_value = "1d")]
    from: String,

    /// End of the query window, same formats; defaults to now.
    #[arg(long)]
    to: Option<String>,

    /// Bucket load samples by hour (the default).
    #[arg(long, conflicts_with = "daily")]
    hourly: bool,

    /// Bucket load samples by day.
    #[arg(long)]
    daily: bool,

    /// Verbose diagnostics on stderr.
    #[arg(short = 'v')]
    verbose: bool,
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle the version verb before anything else.
    if let Command::Version = &cli.command {
        println!("fleetreport {}", version::full());
        return Ok(());
    }

    let verbose = match &cli.command {
        Command::Cpuhog(args) | Command::Deadweight(args) => args.verbose,
        Command::LoadReport(args) => args.verbose,
        Command::Version => false,
    };
    init_tracing(verbose)?;

    // One wall-clock reading per invocation; every state row inserted in
    // this run shares it as its firstViolation.
    let now = Utc::now();

    match cli.command {
        Command::Cpuhog(args) => cpuhog::run(&report_options(args)?, now),
        Command::Deadweight(args) => deadweight::run(&report_options(args)?, now),
        Command::LoadReport(args) => load::run(&load_options(args)?, now),
        Command::Version => unreachable!("handled above"),
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_new(if verbose { "debug" } else { "info" })
        .context("building log filter")?;
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
    Ok(())
}

fn report_options(args: ReportArgs) -> Result<ReportOptions> {
    Ok(ReportOptions {
        data_path: absolute(args.data_path)?,
        from: args.from,
        to: args.to,
        json: args.json,
    })
}

fn load_options(args: LoadReportArgs) -> Result<LoadOptions> {
    let bucketing = match (args.hourly, args.daily) {
        (_, true) => Bucketing::Daily,
        _ => Bucketing::Hourly,
    };
    Ok(LoadOptions {
        data_path: absolute(args.data_path)?,
        sonalyze: args.sonalyze,
        config_file: args.config_file,
        output_path: absolute(args.output_path)?,
        tag: args.tag,
        from: args.from,
        to: args.to,
        bucketing,
    })
}

/// Anchor a relative path at the current working directory.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = std::env::current_dir().context("resolving current directory")?;
        Ok(cwd.join(path))
    }
}
