/// Hang monitor for a running child.
///
/// Runs alongside the child, sampling its thread states every interval.
/// Consecutive hang verdicts are answered with SIGTERM up to `max_hangs`,
/// then SIGKILL. Returns once the liveness probe says the pid is gone.
use crate::hang::HangDetector;
use crate::procfs::{Sampler, Snapshot};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Sends signals to the monitored pid.
pub trait Signaller {
    /// Null-signal probe: does `pid` still name a live process?
    fn is_alive(&self, pid: Pid) -> bool;

    fn send(&self, pid: Pid, signal: Signal) -> Result<(), Errno>;
}

/// Signals delivered with `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillSignaller;

impl Signaller for KillSignaller {
    fn is_alive(&self, pid: Pid) -> bool {
        kill(pid, None::<Signal>).is_ok()
    }

    fn send(&self, pid: Pid, signal: Signal) -> Result<(), Errno> {
        kill(pid, signal)
    }
}

/// The monitor's only suspension point.
pub trait Sleeper {
    /// Sleep for up to `interval`; may return early.
    fn sleep(&mut self, interval: Duration) -> impl Future<Output = ()>;

    /// True once the child has been reaped and its pid may name another process.
    fn child_gone(&self) -> bool {
        false
    }
}

/// Tokio sleep that ends early when the child is reaped.
pub struct ExitAwareSleeper {
    gone: watch::Receiver<bool>,
}

impl ExitAwareSleeper {
    pub fn new(gone: watch::Receiver<bool>) -> Self {
        Self { gone }
    }
}

impl Sleeper for ExitAwareSleeper {
    fn sleep(&mut self, interval: Duration) -> impl Future<Output = ()> {
        async move {
            let gone = &mut self.gone;
            let exited = async move {
                if gone.wait_for(|gone| *gone).await.is_err() {
                    // publisher dropped without a reason; fall back to the full interval
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = exited => {
                    tracing::trace!("interval sleep cut short by child exit");
                }
            }
        }
    }

    fn child_gone(&self) -> bool {
        *self.gone.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Consecutive hangs answered with SIGTERM before switching to SIGKILL.
    pub max_hangs: u32,
    pub tolerance: u64,
}

/// Per-lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub samples: u32,
    pub hang_verdicts: u32,
    pub terminate_signals: u32,
    pub kill_signals: u32,
}

/// Consecutive-hang counter driving SIGTERM → SIGKILL.
#[derive(Debug, Clone, Copy)]
pub struct Escalation {
    max_hangs: u32,
    consecutive: u32,
}

impl Escalation {
    pub fn new(max_hangs: u32) -> Self {
        Self {
            max_hangs,
            consecutive: 0,
        }
    }

    /// Record a verdict; returns the signal to send, if any.
    pub fn record(&mut self, hung: bool) -> Option<Signal> {
        if !hung {
            self.consecutive = 0;
            return None;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive <= self.max_hangs {
            Some(Signal::SIGTERM)
        } else {
            Some(Signal::SIGKILL)
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Monitor `pid` until it is gone.
pub async fn monitor_child<S, K, Z>(
    pid: Pid,
    settings: &MonitorSettings,
    sampler: &S,
    signaller: &K,
    sleeper: &mut Z,
) -> MonitorReport
where
    S: Sampler,
    K: Signaller,
    Z: Sleeper,
{
    let detector = HangDetector::new(settings.tolerance);
    let mut escalation = Escalation::new(settings.max_hangs);
    let mut baseline: Option<Snapshot> = None;
    let mut report = MonitorReport::default();

    while signaller.is_alive(pid) {
        sleeper.sleep(settings.interval).await;
        if sleeper.child_gone() {
            break;
        }

        let current = sampler.sample(pid);
        report.samples += 1;
        let verdict = detector.judge(baseline.as_ref(), current);

        match escalation.record(verdict.hung()) {
            Some(signal) if sleeper.child_gone() => {
                tracing::debug!(
                    pid = pid.as_raw(),
                    signal = %signal,
                    "child reaped before it could be signalled"
                );
                break;
            }
            Some(signal) => {
                report.hang_verdicts += 1;
                if signal == Signal::SIGKILL {
                    report.kill_signals += 1;
                } else {
                    report.terminate_signals += 1;
                }
                match signaller.send(pid, signal) {
                    Ok(()) => tracing::info!(
                        pid = pid.as_raw(),
                        signal = %signal,
                        consecutive_hangs = escalation.consecutive(),
                        "child looks hung, signalled"
                    ),
                    Err(Errno::ESRCH) => tracing::debug!(
                        pid = pid.as_raw(),
                        signal = %signal,
                        "child vanished before it could be signalled"
                    ),
                    Err(e) => tracing::warn!(
                        pid = pid.as_raw(),
                        signal = %signal,
                        error = %e,
                        "failed to signal hung child"
                    ),
                }
                tokio::task::yield_now().await;
            }
            None => {
                if let Some(liveness) = &verdict.liveness {
                    tracing::debug!(
                        pid = pid.as_raw(),
                        %liveness,
                        "child still appears to be doing something worthwhile"
                    );
                }
            }
        }

        // the previous baseline is dropped here
        baseline = Some(verdict.baseline);
    }

    tracing::debug!(pid = pid.as_raw(), ?report, "child no longer running");
    report
}
