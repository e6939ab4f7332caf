/// Run report: writes a JSON summary of every attempt when the supervisor finishes.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::supervisor::{AttemptRecord, Outcome};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// The JSON payload written to the report path.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<'a> {
    pub command: &'a [String],
    pub outcome: Outcome,
    pub attempts: &'a [AttemptRecord],
}

/// Errors that can occur while writing the report.
#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => write!(f, "failed to serialize run report: {source}"),
            ReportError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            ReportError::Rename { from, to, source } => write!(
                f,
                "failed to rename {} to {}: {}",
                from.display(),
                to.display(),
                source
            ),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}

/// Atomically write `report` to `path`.
///
/// Readers never see a partial write.
pub fn write_report(path: &Path, report: &RunReport<'_>) -> Result<(), ReportError> {
    let json =
        serde_json::to_string_pretty(report).map_err(|e| ReportError::Serialize { source: e })?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".yoyo-report.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ReportError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
            tracing::debug!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp report");
        }
        return Err(ReportError::Rename {
            from: tmp_path,
            to: path.to_path_buf(),
            source: e,
        });
    }

    tracing::debug!(path = %path.display(), "run report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_reason::ExitReason;
    use crate::monitor::MonitorReport;
    use tempfile::tempdir;

    fn attempt(n: u32, wait_status: i32) -> AttemptRecord {
        AttemptRecord {
            attempt: n,
            pid: 4000 + n as i32,
            started_at: chrono::Utc::now(),
            duration_ms: 12,
            exit_reason: ExitReason::from_wait_status(4000 + n as i32, wait_status),
            monitor: MonitorReport {
                samples: 3,
                hang_verdicts: 2,
                terminate_signals: 2,
                kill_signals: 0,
            },
        }
    }

    #[test]
    fn test_write_report_round_trips_as_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        let command = vec!["./faux-rogue".to_string(), "2".to_string()];
        let attempts = vec![attempt(1, 15), attempt(2, 0)];

        write_report(
            &path,
            &RunReport {
                command: &command,
                outcome: Outcome::Succeeded,
                attempts: &attempts,
            },
        )
        .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["outcome"], "succeeded");
        assert_eq!(value["command"][0], "./faux-rogue");
        assert_eq!(value["attempts"].as_array().unwrap().len(), 2);
        assert_eq!(value["attempts"][0]["exit_reason"]["signaled"], true);
        assert_eq!(value["attempts"][0]["exit_reason"]["termsig"], 15);
        assert_eq!(value["attempts"][0]["hang_verdicts"], 2);
        assert_eq!(value["attempts"][0]["terminate_signals"], 2);
        assert_eq!(value["attempts"][0]["kill_signals"], 0);
        assert!(value["attempts"][0].get("monitor").is_none());
        assert_eq!(value["attempts"][1]["exit_reason"]["exited"], true);
    }

    #[test]
    fn test_write_report_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(
            &path,
            &RunReport {
                command: &[],
                outcome: Outcome::RetriesExhausted,
                attempts: &[],
            },
        )
        .unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("report.json")]);
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taken");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupant"), "x").unwrap();

        let err = write_report(
            &path,
            &RunReport {
                command: &[],
                outcome: Outcome::RetriesExhausted,
                attempts: &[],
            },
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::Rename { .. }));

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("taken")]);
    }

    #[test]
    fn test_write_report_bad_directory() {
        let err = write_report(
            Path::new("/nonexistent-dir/impossible/report.json"),
            &RunReport {
                command: &[],
                outcome: Outcome::RetriesExhausted,
                attempts: &[],
            },
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::Write { .. }));
    }
}
