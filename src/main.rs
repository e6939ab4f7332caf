mod config;
mod console;
mod exit_reason;
mod hang;
mod monitor;
mod procfs;
mod report;
mod retry;
mod supervisor;

use clap::Parser;
use config::{Overrides, ResolvedConfig, YoyoConfig};
use console::Console;
use monitor::KillSignaller;
use procfs::ProcSampler;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::{CommandLauncher, Outcome, Supervisor};
use tracing_subscriber::EnvFilter;

/// Runs a program and watches its threads in /proc. If the counters say
/// the process looks hung, yoyo terminates it and starts it again.
#[derive(Parser, Debug)]
#[command(name = "yoyo", version, about)]
pub struct Cli {
    /// Output additional information (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Seconds to sleep between hang checks (default: 60)
    #[arg(short = 'w', long = "wait-interval", value_name = "SECONDS")]
    wait_interval: Option<u64>,

    /// Number of consecutive hang checks answered with SIGTERM before SIGKILL (default: 5)
    #[arg(short = 'm', long, value_name = "NUM")]
    max_hangs: Option<u32>,

    /// Total number of times to run the program (default: 5)
    #[arg(short = 'r', long, value_name = "NUM")]
    max_retries: Option<u32>,

    /// Clock ticks of CPU time a thread may gain and still count as idle (default: 5)
    #[arg(short, long, value_name = "TICKS")]
    tolerance: Option<u64>,

    /// Path to look for /proc files under
    #[arg(short, long, value_name = "PATH", env = "YOYO_FAKE_ROOT")]
    fakeroot: Option<PathBuf>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a JSON report of every attempt to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Program to run, followed by its arguments
    #[arg(
        value_name = "PROGRAM",
        required = true,
        trailing_var_arg = true
    )]
    command: Vec<String>,
}

const DEFAULT_CONFIG_FILE: &str = "yoyo.toml";
const VERBOSE_ENV: &str = "VERBOSE";

impl Cli {
    fn verbosity(&self) -> i8 {
        self.verbosity_with(std::env::var(VERBOSE_ENV).ok().as_deref())
    }

    /// `-q` and `-v` win over the environment level.
    fn verbosity_with(&self, env_level: Option<&str>) -> i8 {
        if self.quiet {
            return -1;
        }
        if self.verbose > 0 {
            return i8::try_from(self.verbose).unwrap_or(i8::MAX);
        }
        env_level
            .and_then(|level| level.trim().parse::<i8>().ok())
            .unwrap_or(0)
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            interval_secs: self.wait_interval,
            max_hangs: self.max_hangs,
            max_retries: self.max_retries,
            tolerance_ticks: self.tolerance,
            root: self.fakeroot.clone(),
        }
    }
}

fn log_filter(verbosity: i8) -> EnvFilter {
    let level = match verbosity {
        i8::MIN..=-1 => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn load_config(cli: &Cli) -> Result<ResolvedConfig, config::ConfigError> {
    let file = match &cli.config {
        Some(path) => YoyoConfig::load(path, true)?,
        None => YoyoConfig::load(&PathBuf::from(DEFAULT_CONFIG_FILE), false)?,
    };
    Ok(file.resolve(cli.overrides(), cli.command.clone()))
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let verbosity = cli.verbosity();
    let config = load_config(&cli)?;
    tracing::debug!(?config, "resolved configuration");

    if cli.dry_run {
        println!("command:        {}", config.command.join(" "));
        println!("wait interval:  {}s", config.monitor.interval.as_secs());
        println!("max hangs:      {}", config.monitor.max_hangs);
        println!("tolerance:      {} ticks", config.monitor.tolerance);
        println!("max retries:    {}", config.max_retries);
        match &config.root {
            Some(root) => println!("proc root:      {}", root.display()),
            None => println!("proc root:      /"),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut supervisor = Supervisor::new(
        config.command.clone(),
        config.monitor,
        config.max_retries,
        CommandLauncher,
        ProcSampler::new(config.root.clone()),
        KillSignaller,
        Console::stdio(verbosity),
    );
    let summary = supervisor.run().await?;

    if let Some(path) = &cli.report {
        let report = report::RunReport {
            command: &config.command,
            outcome: summary.outcome,
            attempts: &summary.attempts,
        };
        if let Err(e) = report::write_report(path, &report) {
            tracing::warn!(error = %e, "failed to write run report");
        }
    }

    Ok(match summary.outcome {
        Outcome::Succeeded => ExitCode::SUCCESS,
        Outcome::RetriesExhausted => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbosity()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "yoyo failed");
            ExitCode::FAILURE
        }
    }
}
