/// Hang heuristic: a process looks hung when every thread is sleeping and no
/// thread's scheduler counters moved by more than a small tolerance since the
/// previous snapshot.
use crate::procfs::Snapshot;

/// Default per-thread utime/stime drift, in clock ticks, that still counts as idle.
pub const DEFAULT_TOLERANCE_TICKS: u64 = 5;

/// Why a snapshot was judged live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// A thread is in some state other than sleeping.
    ThreadActive { tid: i32, state: char },
    /// Nothing to compare against yet.
    NoBaseline,
    /// Threads were created or destroyed.
    ThreadCountChanged { previous: usize, current: usize },
    /// A thread in the current snapshot is absent from the baseline.
    ThreadReplaced { tid: i32 },
    /// A thread accumulated CPU time beyond the tolerance.
    CpuAdvanced { tid: i32 },
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::ThreadActive { tid, state } => write!(f, "thread {tid} in state {state}"),
            Liveness::NoBaseline => write!(f, "first sample"),
            Liveness::ThreadCountChanged { previous, current } => {
                write!(f, "thread count changed from {previous} to {current}")
            }
            Liveness::ThreadReplaced { tid } => write!(f, "thread {tid} is new"),
            Liveness::CpuAdvanced { tid } => write!(f, "thread {tid} used CPU time"),
        }
    }
}

/// Outcome of one comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// `None` means the process looks hung.
    pub liveness: Option<Liveness>,
    /// The snapshot to compare the next sample against.
    pub baseline: Snapshot,
}

impl Verdict {
    pub fn hung(&self) -> bool {
        self.liveness.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HangDetector {
    tolerance: u64,
}

impl HangDetector {
    pub fn new(tolerance: u64) -> Self {
        Self { tolerance }
    }

    /// Compare `current` against `previous`.
    ///
    /// `current` always becomes the next baseline; the caller drops
    /// `previous` once it has been replaced.
    pub fn judge(&self, previous: Option<&Snapshot>, current: Snapshot) -> Verdict {
        let liveness = self.liveness(previous, &current);
        Verdict {
            liveness,
            baseline: current,
        }
    }

    fn liveness(&self, previous: Option<&Snapshot>, current: &Snapshot) -> Option<Liveness> {
        if let Some(active) = current.threads().iter().find(|t| !t.is_sleeping()) {
            return Some(Liveness::ThreadActive {
                tid: active.tid,
                state: active.state,
            });
        }

        let previous = match previous {
            Some(previous) => previous,
            None => return Some(Liveness::NoBaseline),
        };
        if previous.len() != current.len() {
            return Some(Liveness::ThreadCountChanged {
                previous: previous.len(),
                current: current.len(),
            });
        }

        for now in current.threads() {
            let Some(before) = previous.thread(now.tid) else {
                return Some(Liveness::ThreadReplaced { tid: now.tid });
            };
            if now.utime > before.utime.saturating_add(self.tolerance)
                || now.stime > before.stime.saturating_add(self.tolerance)
            {
                return Some(Liveness::CpuAdvanced { tid: now.tid });
            }
        }

        None
    }
}

impl Default for HangDetector {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_TICKS)
    }
}
