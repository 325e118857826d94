#![warn(missing_docs)]
//! rankmap CLI Library
//!
//! Everything above the wire format: the rank [`transport`], the collective
//! reductions, the ordered gather, report sinks, the report cycle, the
//! launcher for rank processes and the command line.
//!
//! # Example
//!
//! ```ignore
//! fn main() -> std::process::ExitCode {
//!     match rankmap_cli::run() {
//!         Ok(()) => std::process::ExitCode::SUCCESS,
//!         Err(e) => std::process::ExitCode::from(rankmap_cli::exit_code(&e) as u8),
//!     }
//! }
//! ```

mod config;
mod cycle;
mod gather;
mod launcher;
mod reducer;
mod report;
pub mod transport;
mod worker;

pub use config::{CONFIG_FILE, IsolationMode, LaunchConfig, OutputConfig, RankmapConfig, TeamSizes};
pub use cycle::{CycleError, CycleOutcome, run_cycle, run_local};
pub use gather::{GatherCoordinator, GatherError, GatherState, GatherStats};
pub use launcher::{
    BIND_ENV, HubStream, LaunchError, Launcher, RANK_ENV, RANK_WORKER_FLAG, RankProcess, SIZE_ENV,
    THREADS_ENV, wait_all,
};
pub use reducer::{CollectiveReducer, TeamTotals};
pub use report::{
    CollectSink, HumanSink, JsonSink, LEGEND, NullSink, OutputFormat, ReportError, ReportLine,
    ReportMeta, ReportSink, Summary, format_line, format_summary,
};
pub use worker::{WorkerEnv, WorkerEnvError, run_rank_worker};

use clap::{Parser, Subcommand};
use rankmap_core::{
    BindPolicy, COORDINATOR, CoreLocator, HostName, SchedLocator, ThreadTeam, available_cpus,
    team_size_from_env,
};
use std::io::Write;
use std::path::PathBuf;
use transport::HubTransport;

/// rankmap CLI arguments
#[derive(Parser, Debug)]
#[command(name = "rankmap")]
#[command(
    author,
    version,
    about = "rankmap - report where every thread of every rank ran"
)]
pub struct Cli {
    /// Optional subcommand (Run, Init, Info); defaults to Run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Number of ranks
    #[arg(short = 'n', long)]
    pub processes: Option<usize>,

    /// Threads per rank: one count, or a comma-separated list per rank
    /// (e.g. 2,1,3; the last entry repeats)
    #[arg(short, long)]
    pub threads: Option<TeamSizes>,

    /// Rank isolation: process or thread
    #[arg(long)]
    pub isolation: Option<IsolationMode>,

    /// Thread binding: none, compact or spread
    #[arg(long)]
    pub bind: Option<BindPolicy>,

    /// Output format: human or json
    #[arg(long)]
    pub format: Option<OutputFormat>,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: Run as rank worker process (used by the launcher)
    #[arg(long, hide = true)]
    pub rank_worker: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the placement report (default)
    Run,
    /// Print a commented default rankmap.toml
    Init,
    /// Show host, CPU count and current core of this process
    Info,
}

/// Run the rankmap CLI with the process arguments.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the rankmap CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    // Logs go to stderr: stdout carries the report
    let filter = if cli.verbose {
        "rankmap=debug"
    } else {
        "rankmap=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if cli.rank_worker {
        return run_worker_mode();
    }

    // Discover rankmap.toml configuration (CLI flags override)
    let config = RankmapConfig::discover().unwrap_or_default();

    match cli.command {
        Some(Commands::Init) => {
            print!("{}", RankmapConfig::default_toml());
            Ok(())
        }
        Some(Commands::Info) => show_info(),
        Some(Commands::Run) | None => run_report(&cli, &config),
    }
}

/// Process exit code for an error returned by [`run`].
pub fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<CycleError>()
        .map(CycleError::exit_code)
        .unwrap_or(1)
}

/// Run as a rank worker process (IPC mode)
fn run_worker_mode() -> anyhow::Result<()> {
    let env = WorkerEnv::from_env()?;
    let outcome = run_rank_worker(env)?;
    tracing::debug!(
        rank = outcome.rank,
        threads = outcome.team_size,
        "rank worker finished"
    );
    Ok(())
}

fn show_info() -> anyhow::Result<()> {
    let team = match team_size_from_env() {
        Some(n) => n.to_string(),
        None => format!("{} (CPU count)", available_cpus()),
    };
    println!("rankmap {}", env!("CARGO_PKG_VERSION"));
    println!("  host:         {}", HostName::local());
    println!("  cpus:         {}", available_cpus());
    println!("  current cpu:  {}", SchedLocator.current());
    println!("  team size:    {}", team);
    Ok(())
}

fn run_report(cli: &Cli, config: &RankmapConfig) -> anyhow::Result<()> {
    let processes = cli.processes.unwrap_or(config.launch.processes);
    if processes == 0 {
        anyhow::bail!("A job needs at least one rank");
    }
    let isolation = cli.isolation.unwrap_or(config.launch.isolation);
    let bind = cli.bind.unwrap_or(config.launch.bind);
    let format = cli.format.unwrap_or(config.output.format);
    let output = cli.output.clone().or_else(|| config.output.path.clone());
    let sizes = config.team_sizes(cli.threads.as_ref());
    let team_sizes = sizes.expand(processes);

    tracing::info!(
        processes,
        threads = %sizes,
        %isolation,
        %bind,
        "starting placement report"
    );

    let writer: Box<dyn Write> = match &output {
        Some(path) => Box::new(std::io::BufWriter::new(std::fs::File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut sink: Box<dyn ReportSink> = match format {
        OutputFormat::Human => Box::new(HumanSink::new(writer)),
        OutputFormat::Json => Box::new(JsonSink::new(
            writer,
            ReportMeta::new(isolation.to_string()),
        )),
    };

    match isolation {
        IsolationMode::Thread => {
            run_local(
                &team_sizes,
                bind,
                &SchedLocator,
                HostName::local(),
                sink.as_mut(),
            )?;
        }
        IsolationMode::Process => {
            run_processes(&team_sizes, bind, cli.verbose, sink.as_mut())?;
        }
    }
    drop(sink);

    if let Some(path) = output {
        println!("Report written to: {}", path.display());
    }
    Ok(())
}

/// Coordinate a job whose other ranks are child processes.
fn run_processes(
    team_sizes: &[usize],
    bind: BindPolicy,
    verbose: bool,
    sink: &mut dyn ReportSink,
) -> anyhow::Result<()> {
    let launcher = Launcher::current()?.verbose(verbose);
    let (processes, links) = launcher.spawn_ranks(team_sizes, bind)?;

    let team = ThreadTeam::new(team_sizes[COORDINATOR], COORDINATOR, bind).map_err(CycleError::from)?;
    let mut hub = HubTransport::connect(links).map_err(CycleError::from)?;
    let result = run_cycle(&mut hub, &team, &SchedLocator, HostName::local(), sink);

    // Closing the links lets any rank still waiting on us see the end
    drop(hub);
    let outcome = result?;
    wait_all(processes)?;

    tracing::debug!(
        ranks = team_sizes.len(),
        lines = outcome.stats.map(|s| s.lines).unwrap_or(0),
        "report complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "rankmap",
            "-n",
            "3",
            "-t",
            "2,1,3",
            "--isolation",
            "thread",
            "--bind",
            "compact",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.processes, Some(3));
        assert_eq!(cli.threads.unwrap().expand(3), vec![2, 1, 3]);
        assert_eq!(cli.isolation, Some(IsolationMode::Thread));
        assert_eq!(cli.bind, Some(BindPolicy::Compact));
        assert_eq!(cli.format, Some(OutputFormat::Json));
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["rankmap", "init"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Init)));
        let cli = Cli::try_parse_from(["rankmap", "--rank-worker", "--verbose"]).unwrap();
        assert!(cli.rank_worker && cli.verbose);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Cli::try_parse_from(["rankmap", "-t", "0"]).is_err());
        assert!(Cli::try_parse_from(["rankmap", "--isolation", "vm"]).is_err());
        assert!(Cli::try_parse_from(["rankmap", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_exit_code_from_anyhow() {
        let err = anyhow::Error::from(CycleError::NoRanks);
        assert_eq!(exit_code(&err), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
