/// Per-thread scheduling snapshots read from `<root>/proc/<pid>/task/*/stat`.
///
/// Only four fields of each stat record are consumed: tid (1), state (3),
/// utime (14) and stime (15). Everything else is skipped.
use nix::unistd::Pid;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Upper bound on bytes read from a single stat file.
const STAT_READ_LIMIT: u64 = 4096;

/// One thread's scheduler counters at the moment it was sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadState {
    pub tid: i32,
    /// Kernel state letter: `R`, `S`, `D`, `T`, `Z`, ...
    pub state: char,
    /// User-mode time, clock ticks.
    pub utime: u64,
    /// Kernel-mode time, clock ticks.
    pub stime: u64,
}

impl ThreadState {
    #[allow(dead_code)]
    pub fn new(tid: i32, state: char, utime: u64, stime: u64) -> Self {
        Self {
            tid,
            state,
            utime,
            stime,
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.state == 'S'
    }
}

/// All threads of a process at one instant, in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    threads: Vec<ThreadState>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn threads(&self) -> &[ThreadState] {
        &self.threads
    }

    /// Look up a thread by tid.
    pub fn thread(&self, tid: i32) -> Option<&ThreadState> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    fn push(&mut self, thread: ThreadState) {
        self.threads.push(thread);
    }
}

impl From<Vec<ThreadState>> for Snapshot {
    fn from(threads: Vec<ThreadState>) -> Self {
        Self { threads }
    }
}

/// Errors from reading or parsing one thread's stat record.
#[derive(Debug)]
pub enum StatError {
    Io(std::io::Error),
    Parse(String),
}

impl std::fmt::Display for StatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatError::Io(e) => write!(f, "I/O error: {e}"),
            StatError::Parse(msg) => write!(f, "parse error: {msg}"),
        }
    }
}

impl std::error::Error for StatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatError::Io(e) => Some(e),
            StatError::Parse(_) => None,
        }
    }
}

impl From<std::io::Error> for StatError {
    fn from(e: std::io::Error) -> Self {
        StatError::Io(e)
    }
}

/// Source of snapshots for a pid.
pub trait Sampler {
    /// Best-effort snapshot; never fails as a whole.
    fn sample(&self, pid: Pid) -> Snapshot;
}

/// Samples the `/proc` filesystem, optionally under a substitute root.
#[derive(Debug, Clone)]
pub struct ProcSampler {
    root: PathBuf,
}

impl ProcSampler {
    /// `root` replaces `/` as the directory holding `proc/`.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: root.unwrap_or_else(|| PathBuf::from("/")),
        }
    }

    fn task_pattern(&self, pid: Pid) -> String {
        let task_dir = self
            .root
            .join("proc")
            .join(pid.as_raw().to_string())
            .join("task");
        format!(
            "{}/*/stat",
            glob::Pattern::escape(&task_dir.to_string_lossy())
        )
    }
}

impl Sampler for ProcSampler {
    fn sample(&self, pid: Pid) -> Snapshot {
        let pattern = self.task_pattern(pid);
        tracing::trace!(pattern = %pattern, "sampling thread states");

        let mut snapshot = Snapshot::default();
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, pattern = %pattern, "invalid thread stat pattern");
                return snapshot;
            }
        };

        let mut errors = 0usize;
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    if !thread_vanished(e.error()) {
                        errors += 1;
                        tracing::warn!(error = %e, "failed to enumerate thread stat file");
                    }
                    continue;
                }
            };

            match read_thread_state(&path) {
                Ok(thread) => snapshot.push(thread),
                Err(StatError::Io(e)) if thread_vanished(&e) => {
                    tracing::trace!(path = %path.display(), "thread exited before it was read");
                }
                Err(e) => {
                    errors += 1;
                    tracing::warn!(error = %e, path = %path.display(), "failed to read thread state");
                    snapshot.push(ThreadState::default());
                }
            }
        }

        if errors > 0 {
            tracing::warn!(
                pid = pid.as_raw(),
                root = %self.root.display(),
                errors,
                "thread snapshot is incomplete"
            );
        }
        tracing::debug!(pid = pid.as_raw(), threads = snapshot.len(), "sampled thread states");
        snapshot
    }
}

/// A thread that exits mid-sample surfaces as ENOENT or ESRCH.
fn thread_vanished(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound || e.raw_os_error() == Some(nix::libc::ESRCH)
}

/// Read and parse one `task/<tid>/stat` file.
pub fn read_thread_state(path: &Path) -> Result<ThreadState, StatError> {
    let mut buf = Vec::new();
    std::fs::File::open(path)?
        .take(STAT_READ_LIMIT)
        .read_to_end(&mut buf)?;
    parse_stat(&String::from_utf8_lossy(&buf))
}

/// Parse a stat record into a [`ThreadState`].
///
/// The command name (field 2) is delimited by the first `(` and the last `)`,
/// so names containing spaces or parentheses do not shift later fields.
/// Records without parentheses are split purely on whitespace.
pub fn parse_stat(text: &str) -> Result<ThreadState, StatError> {
    let (tid, rest) = split_stat(text.trim())
        .ok_or_else(|| StatError::Parse(format!("truncated stat record: {text:?}")))?;

    let tid = tid
        .parse::<i32>()
        .map_err(|e| StatError::Parse(format!("bad tid {tid:?}: {e}")))?;

    // `rest` starts at field 3
    let field = |n: usize| {
        rest.get(n - 3)
            .copied()
            .ok_or_else(|| StatError::Parse(format!("missing field {n} for tid {tid}")))
    };
    let counter = |n: usize| -> Result<u64, StatError> {
        let raw = field(n)?;
        raw.parse::<u64>()
            .map_err(|e| StatError::Parse(format!("bad field {n} {raw:?} for tid {tid}: {e}")))
    };

    let state = field(3)?
        .chars()
        .next()
        .ok_or_else(|| StatError::Parse(format!("empty state for tid {tid}")))?;

    Ok(ThreadState {
        tid,
        state,
        utime: counter(14)?,
        stime: counter(15)?,
    })
}

fn split_stat(text: &str) -> Option<(&str, Vec<&str>)> {
    match (text.find('('), text.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            let tid = text[..open].trim();
            Some((tid, text[close + 1..].split_whitespace().collect()))
        }
        _ => {
            let mut fields = text.split_whitespace();
            let tid = fields.next()?;
            fields.next()?;
            Some((tid, fields.collect()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stat_line(tid: i32, name: &str, state: char, utime: u64, stime: u64) -> String {
        format!(
            "{tid} ({name}) {state} 1 {tid} {tid} 0 -1 4194560 1024 0 0 0 {utime} {stime} 0 0 20 0 3 0 1000 1000000 200 18446744073709551615 0 0 0 0 0 0 0 4096 17410 0 0 0 17 2 0 0 0 0 0"
        )
    }

    fn write_thread(root: &Path, pid: i32, tid: i32, contents: &str) {
        let dir = root
            .join("proc")
            .join(pid.to_string())
            .join("task")
            .join(tid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stat"), contents).unwrap();
    }

    #[test]
    fn test_parse_stat_extracts_fields() {
        let ts = parse_stat(&stat_line(10007, "qemu-system", 'S', 3217, 3259)).unwrap();
        assert_eq!(ts, ThreadState::new(10007, 'S', 3217, 3259));
    }

    #[test]
    fn test_parse_stat_name_with_spaces_and_parens() {
        let ts = parse_stat(&stat_line(42, "evil ) name (x", 'R', 7, 9)).unwrap();
        assert_eq!(ts, ThreadState::new(42, 'R', 7, 9));
    }

    #[test]
    fn test_parse_stat_without_parens() {
        let ts = parse_stat("17 worker D 1 2 3 4 5 6 7 8 9 10 300 400 0").unwrap();
        assert_eq!(ts, ThreadState::new(17, 'D', 300, 400));
    }

    #[test]
    fn test_parse_stat_truncated_record() {
        let err = parse_stat("17 (worker) S 1 2 3").unwrap_err();
        assert!(matches!(err, StatError::Parse(_)));
        assert!(err.to_string().contains("missing field 14"));
    }

    #[test]
    fn test_parse_stat_garbage() {
        assert!(parse_stat("").is_err());
        assert!(parse_stat("abc (x) S").is_err());
        assert!(parse_stat("1 (x) S 1 1 1 0 -1 0 0 0 0 0 one 1").is_err());
    }

    #[test]
    fn test_sample_reads_every_thread_under_fakeroot() {
        let dir = tempdir().unwrap();
        write_thread(dir.path(), 500, 500, &stat_line(500, "main", 'S', 10, 20));
        write_thread(dir.path(), 500, 501, &stat_line(501, "worker", 'R', 30, 40));
        write_thread(dir.path(), 500, 502, &stat_line(502, "io", 'D', 50, 60));

        let sampler = ProcSampler::new(Some(dir.path().to_path_buf()));
        let snapshot = sampler.sample(Pid::from_raw(500));

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.thread(501), Some(&ThreadState::new(501, 'R', 30, 40)));
        assert_eq!(snapshot.thread(502).map(|t| t.state), Some('D'));
    }

    #[test]
    fn test_sample_missing_process_is_empty() {
        let dir = tempdir().unwrap();
        let sampler = ProcSampler::new(Some(dir.path().to_path_buf()));
        assert!(sampler.sample(Pid::from_raw(999)).is_empty());
    }

    #[test]
    fn test_sample_keeps_placeholder_for_unparseable_thread() {
        let dir = tempdir().unwrap();
        write_thread(dir.path(), 600, 600, &stat_line(600, "main", 'S', 1, 2));
        write_thread(dir.path(), 600, 601, "not a stat record");

        let sampler = ProcSampler::new(Some(dir.path().to_path_buf()));
        let snapshot = sampler.sample(Pid::from_raw(600));

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.threads().contains(&ThreadState::default()));
    }

    #[test]
    fn test_sample_skips_thread_that_vanished() {
        let dir = tempdir().unwrap();
        write_thread(dir.path(), 800, 800, &stat_line(800, "main", 'S', 5, 6));
        let gone = dir.path().join("proc/800/task/801");
        std::fs::create_dir_all(&gone).unwrap();
        std::os::unix::fs::symlink(dir.path().join("no-such-thread"), gone.join("stat")).unwrap();

        let sampler = ProcSampler::new(Some(dir.path().to_path_buf()));
        let snapshot = sampler.sample(Pid::from_raw(800));

        assert_eq!(snapshot.threads(), &[ThreadState::new(800, 'S', 5, 6)]);
        assert!(!snapshot.threads().contains(&ThreadState::default()));
    }

    #[test]
    fn test_sample_root_with_glob_metacharacters() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("fake[root]");
        write_thread(&root, 700, 700, &stat_line(700, "main", 'S', 1, 2));

        let sampler = ProcSampler::new(Some(root));
        assert_eq!(sampler.sample(Pid::from_raw(700)).len(), 1);
    }

    #[test]
    fn test_sample_own_process() {
        let sampler = ProcSampler::new(None);
        let pid = Pid::this();
        let snapshot = sampler.sample(pid);
        assert!(!snapshot.is_empty());
        assert!(snapshot.thread(pid.as_raw()).is_some());
    }
}
