/// Exit-reason tracking for the supervised child.
///
/// A reaper task owns the child, waits for it (reaping it exactly once), and
/// hands the decoded wait status to the supervisor over a oneshot channel.
/// A watch flag flips when the child is gone so the monitor's interval sleep
/// can end early.
use nix::libc;
use nix::unistd::Pid;
use serde::Serialize;
use std::os::unix::process::ExitStatusExt;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};

/// Decoded wait status for one child lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitReason {
    pub pid: i32,
    pub wait_status: i32,
    pub exited: bool,
    pub exit_code: i32,
    pub signaled: bool,
    pub termsig: i32,
    pub coredump: bool,
    pub stopped: bool,
    pub stopsig: i32,
    pub continued: bool,
}

impl ExitReason {
    /// A reason for a lifecycle whose status was never observed.
    pub fn unresolved(pid: i32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    /// Decode a raw status with the platform's wait-status macros.
    pub fn from_wait_status(pid: i32, wait_status: i32) -> Self {
        let mut reason = Self {
            pid,
            wait_status,
            ..Self::default()
        };

        reason.exited = libc::WIFEXITED(wait_status);
        if reason.exited {
            reason.exit_code = libc::WEXITSTATUS(wait_status);
        }

        reason.signaled = libc::WIFSIGNALED(wait_status);
        if reason.signaled {
            reason.termsig = libc::WTERMSIG(wait_status);
            reason.coredump = libc::WCOREDUMP(wait_status);
        }

        reason.stopped = libc::WIFSTOPPED(wait_status);
        if reason.stopped {
            reason.stopsig = libc::WSTOPSIG(wait_status);
        }

        reason.continued = libc::WIFCONTINUED(wait_status);
        reason
    }

    /// Normal termination with exit code 0.
    pub fn succeeded(&self) -> bool {
        self.exited && self.exit_code == 0
    }

    /// No flag was decoded.
    pub fn is_unresolved(&self) -> bool {
        !(self.exited || self.signaled || self.stopped || self.continued)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "child pid {}", self.pid)?;
        if self.exited {
            write!(f, " terminated normally exit code: {}", self.exit_code)?;
        }
        if self.signaled {
            write!(f, " terminated by a signal {}", self.termsig)?;
            if self.coredump {
                write!(f, " produced a core dump")?;
            }
        }
        if self.stopped {
            write!(f, " stopped stop signal: {}", self.stopsig)?;
        }
        if self.continued {
            write!(f, " was resumed by SIGCONT")?;
        }
        if self.is_unresolved() {
            write!(f, " ended without an observed wait status")?;
        }
        Ok(())
    }
}

/// Writing half of the exit-reason handoff. Publishes at most once.
pub struct ExitPublisher {
    pid: Pid,
    reason: Option<oneshot::Sender<ExitReason>>,
    gone: watch::Sender<bool>,
}

impl ExitPublisher {
    /// Publish `reason` if it belongs to the supervised pid.
    ///
    /// Returns false for a stale pid or a second publication.
    pub fn publish(&mut self, reason: ExitReason) -> bool {
        if reason.pid != self.pid.as_raw() {
            tracing::warn!(
                expected = self.pid.as_raw(),
                reaped = reason.pid,
                "ignoring wait status for a child that is not under supervision"
            );
            return false;
        }
        let Some(tx) = self.reason.take() else {
            tracing::warn!(pid = reason.pid, "exit reason already published");
            return false;
        };
        // the supervisor may have stopped listening; the flag still matters
        let _ = tx.send(reason);
        self.gone.send_replace(true);
        true
    }
}

/// Reading half of the exit-reason handoff.
pub struct ExitTracker {
    pid: Pid,
    reason: oneshot::Receiver<ExitReason>,
    gone: watch::Receiver<bool>,
}

impl ExitTracker {
    /// Spawn a reaper task for `child`.
    pub fn reap(pid: Pid, mut child: Child) -> Self {
        let (mut publisher, tracker) = channel(pid);
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => ExitReason::from_wait_status(pid.as_raw(), status.into_raw()),
                Err(e) => {
                    tracing::warn!(pid = pid.as_raw(), error = %e, "failed to wait for child");
                    ExitReason::unresolved(pid.as_raw())
                }
            };
            tracing::debug!(pid = pid.as_raw(), wait_status = reason.wait_status, %reason, "child reaped");
            publisher.publish(reason);
        });
        tracker
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Flag that turns true once the child has been reaped.
    pub fn gone(&self) -> watch::Receiver<bool> {
        self.gone.clone()
    }

    /// Wait for the published reason; unresolved if the publisher went away.
    pub async fn finish(self) -> ExitReason {
        match self.reason.await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!(pid = self.pid.as_raw(), "exit reason was never published");
                ExitReason::unresolved(self.pid.as_raw())
            }
        }
    }
}

/// Create a connected publisher/tracker pair for `pid`.
pub fn channel(pid: Pid) -> (ExitPublisher, ExitTracker) {
    let (reason_tx, reason_rx) = oneshot::channel();
    let (gone_tx, gone_rx) = watch::channel(false);
    (
        ExitPublisher {
            pid,
            reason: Some(reason_tx),
            gone: gone_tx,
        },
        ExitTracker {
            pid,
            reason: reason_rx,
            gone: gone_rx,
        },
    )
}
