/// Supervisor: launch the child, monitor it for hangs, evaluate how it ended,
/// and re-launch it until it succeeds or the retry budget runs out.
use crate::console::Console;
use crate::exit_reason::{ExitReason, ExitTracker};
use crate::monitor::{monitor_child, ExitAwareSleeper, MonitorReport, MonitorSettings, Signaller};
use crate::procfs::Sampler;
use crate::retry::{RetryBudget, RetryDecision};
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::Serialize;
use std::time::Instant;
use tokio::process::Command;

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    ChildRunning,
    Evaluating,
    Succeeded,
    RetriesExhausted,
}

/// How the whole run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    RetriesExhausted,
}

/// One fork/monitor/evaluate cycle.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt: u32,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub exit_reason: ExitReason,
    #[serde(flatten)]
    pub monitor: MonitorReport,
}

impl std::fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempt {}: {} after {}ms, {} hang verdicts ({} SIGTERM, {} SIGKILL)",
            self.attempt,
            self.exit_reason,
            self.duration_ms,
            self.monitor.hang_verdicts,
            self.monitor.terminate_signals,
            self.monitor.kill_signals
        )
    }
}

/// Result of a completed supervision run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: Outcome,
    pub attempts: Vec<AttemptRecord>,
}

/// Errors that can occur launching the child.
#[derive(Debug)]
pub enum LaunchError {
    /// No program to run.
    EmptyCommand,
    /// Failed to fork/exec the child.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The spawned child had no usable pid.
    NoPid { program: String },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::EmptyCommand => write!(f, "no child command given"),
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            LaunchError::NoPid { program } => write!(f, "spawned {} but it has no pid", program),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::EmptyCommand | LaunchError::NoPid { .. } => None,
        }
    }
}

/// Errors that end supervision without a verdict.
#[derive(Debug)]
pub enum SupervisorError {
    Launch { attempt: u32, source: LaunchError },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Launch { attempt, source } => {
                write!(f, "attempt {attempt}: {source}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Launch { source, .. } => Some(source),
        }
    }
}

/// Starts one child lifecycle.
pub trait Launcher {
    fn launch(&mut self, argv: &[String]) -> Result<ExitTracker, LaunchError>;
}

/// Executes argv directly (no shell) with a reaper task per child.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&mut self, argv: &[String]) -> Result<ExitTracker, LaunchError> {
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;

        let child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| LaunchError::NoPid {
                program: program.clone(),
            })?;
        tracing::info!(pid = pid.as_raw(), command = ?argv, "child started");

        Ok(ExitTracker::reap(pid, child))
    }
}

/// Retry state machine around [`monitor_child`].
pub struct Supervisor<L, S, K> {
    command: Vec<String>,
    settings: MonitorSettings,
    max_retries: u32,
    launcher: L,
    sampler: S,
    signaller: K,
    console: Console,
    state: SupervisorState,
}

impl<L, S, K> Supervisor<L, S, K>
where
    L: Launcher,
    S: Sampler,
    K: Signaller,
{
    pub fn new(
        command: Vec<String>,
        settings: MonitorSettings,
        max_retries: u32,
        launcher: L,
        sampler: S,
        signaller: K,
        console: Console,
    ) -> Self {
        Self {
            command,
            settings,
            max_retries,
            launcher,
            sampler,
            signaller,
            console,
            state: SupervisorState::Idle,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::trace!(from = ?self.state, to = ?next, "supervisor state change");
        self.state = next;
    }

    /// Run lifecycles until one succeeds or the budget is spent.
    ///
    /// A launch failure ends the run immediately, without retrying.
    pub async fn run(&mut self) -> Result<RunSummary, SupervisorError> {
        let mut budget = RetryBudget::new(self.max_retries);
        let mut attempts = Vec::new();
        let mut attempt = 1;

        loop {
            self.console
                .say(1, format_args!("{}", self.command.join(" ")));

            let started_at = Utc::now();
            let start = Instant::now();
            let tracker = self
                .launcher
                .launch(&self.command)
                .map_err(|source| SupervisorError::Launch { attempt, source })?;
            let pid = tracker.pid();
            self.transition(SupervisorState::ChildRunning);
            self.console
                .say(1, format_args!("child_pid: {}", pid.as_raw()));

            let mut sleeper = ExitAwareSleeper::new(tracker.gone());
            let monitor = monitor_child(
                pid,
                &self.settings,
                &self.sampler,
                &self.signaller,
                &mut sleeper,
            )
            .await;

            self.transition(SupervisorState::Evaluating);
            let exit_reason = tracker.finish().await;
            self.describe(&exit_reason);

            attempts.push(AttemptRecord {
                attempt,
                pid: pid.as_raw(),
                started_at,
                duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                exit_reason,
                monitor,
            });

            match budget.evaluate(&exit_reason) {
                RetryDecision::Succeeded => {
                    self.transition(SupervisorState::Succeeded);
                    tracing::info!(attempt, "child completed successfully");
                    return Ok(RunSummary {
                        outcome: Outcome::Succeeded,
                        attempts,
                    });
                }
                RetryDecision::Retry { attempt: next } => {
                    tracing::info!(
                        attempt = next,
                        remaining = budget.remaining(),
                        "relaunching child"
                    );
                    attempt = next;
                }
                RetryDecision::Exhausted => {
                    self.transition(SupervisorState::RetriesExhausted);
                    self.console.complain(format_args!("Retries limit reached."));
                    for record in &attempts {
                        self.console.complain(format_args!("  {record}"));
                    }
                    return Ok(RunSummary {
                        outcome: Outcome::RetriesExhausted,
                        attempts,
                    });
                }
            }
        }
    }

    fn describe(&mut self, reason: &ExitReason) {
        if reason.exited && reason.exit_code != 0 {
            self.console.say(
                0,
                format_args!("Child exited with status {}", reason.exit_code),
            );
        } else if reason.succeeded() {
            self.console
                .say(0, format_args!("Child completed successfully"));
        } else {
            self.console
                .say(0, format_args!("child {}:\n{}", reason.pid, reason));
        }
    }
}
