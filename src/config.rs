use crate::hang::DEFAULT_TOLERANCE_TICKS;
use crate::monitor::MonitorSettings;
use crate::retry::DEFAULT_MAX_RETRIES;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HANG_CHECK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_HANGS: u32 = 5;

/// Top-level configuration loaded from yoyo.toml.
#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct YoyoConfig {
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
    pub proc: ProcConfig,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub max_hangs: u32,
    pub tolerance_ticks: u64,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total lifecycle attempts, including the first.
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProcConfig {
    /// Directory that stands in for `/` when reading `proc/`.
    pub root: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HANG_CHECK_INTERVAL_SECS,
            max_hangs: DEFAULT_MAX_HANGS,
            tolerance_ticks: DEFAULT_TOLERANCE_TICKS,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Settings given on the command line; `None` defers to the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub interval_secs: Option<u64>,
    pub max_hangs: Option<u32>,
    pub max_retries: Option<u32>,
    pub tolerance_ticks: Option<u64>,
    pub root: Option<PathBuf>,
}

/// Everything the supervisor needs, after defaults, file and flags are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub monitor: MonitorSettings,
    pub max_retries: u32,
    pub root: Option<PathBuf>,
    pub command: Vec<String>,
}

impl YoyoConfig {
    /// Load a config file.
    ///
    /// A missing file is only an error when `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Merge CLI overrides over the file; values below 1 fall back to defaults.
    pub fn resolve(self, overrides: Overrides, command: Vec<String>) -> ResolvedConfig {
        let interval_secs = at_least_one(
            "interval_secs",
            overrides.interval_secs.unwrap_or(self.monitor.interval_secs),
            DEFAULT_HANG_CHECK_INTERVAL_SECS,
        );
        let max_hangs = at_least_one(
            "max_hangs",
            overrides.max_hangs.unwrap_or(self.monitor.max_hangs),
            DEFAULT_MAX_HANGS,
        );
        let max_retries = at_least_one(
            "max_retries",
            overrides.max_retries.unwrap_or(self.retry.max_retries),
            DEFAULT_MAX_RETRIES,
        );
        let tolerance = overrides
            .tolerance_ticks
            .unwrap_or(self.monitor.tolerance_ticks);
        let root = overrides
            .root
            .or(self.proc.root)
            .filter(|root| !root.as_os_str().is_empty());

        ResolvedConfig {
            monitor: MonitorSettings {
                interval: Duration::from_secs(interval_secs),
                max_hangs,
                tolerance,
            },
            max_retries,
            root,
            command,
        }
    }
}

fn at_least_one<T>(name: &str, value: T, default: T) -> T
where
    T: PartialOrd + From<u8> + std::fmt::Display + Copy,
{
    if value < T::from(1) {
        tracing::warn!(setting = name, %value, %default, "value below 1, using default");
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let resolved = YoyoConfig::default().resolve(Overrides::default(), vec!["true".into()]);
        assert_eq!(resolved.monitor.interval, Duration::from_secs(60));
        assert_eq!(resolved.monitor.max_hangs, 5);
        assert_eq!(resolved.monitor.tolerance, 5);
        assert_eq!(resolved.max_retries, 5);
        assert_eq!(resolved.root, None);
        assert_eq!(resolved.command, vec!["true"]);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yoyo.toml");
        std::fs::write(
            &path,
            "[monitor]\ninterval_secs = 10\n\n[proc]\nroot = \"./fake\"\n",
        )
        .unwrap();

        let config = YoyoConfig::load(&path, true).unwrap();
        assert_eq!(config.monitor.interval_secs, 10);
        assert_eq!(config.monitor.max_hangs, DEFAULT_MAX_HANGS);
        assert_eq!(config.retry.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.proc.root, Some(PathBuf::from("./fake")));
    }

    #[test]
    fn test_missing_default_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = YoyoConfig::load(&dir.path().join("yoyo.toml"), false).unwrap();
        assert_eq!(config, YoyoConfig::default());
    }

    #[test]
    fn test_missing_required_file_is_error() {
        let dir = tempdir().unwrap();
        let err = YoyoConfig::load(&dir.path().join("nope.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yoyo.toml");
        std::fs::write(&path, "[monitor]\ninterval_secs = \"soon\"\n").unwrap();
        let err = YoyoConfig::load(&path, false).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let config = YoyoConfig {
            monitor: MonitorConfig {
                interval_secs: 10,
                max_hangs: 2,
                tolerance_ticks: 1,
            },
            retry: RetryConfig { max_retries: 9 },
            proc: ProcConfig {
                root: Some(PathBuf::from("/from/file")),
            },
        };
        let overrides = Overrides {
            interval_secs: Some(3),
            max_retries: Some(2),
            root: Some(PathBuf::from("/from/cli")),
            ..Default::default()
        };

        let resolved = config.resolve(overrides, vec![]);
        assert_eq!(resolved.monitor.interval, Duration::from_secs(3));
        assert_eq!(resolved.monitor.max_hangs, 2);
        assert_eq!(resolved.monitor.tolerance, 1);
        assert_eq!(resolved.max_retries, 2);
        assert_eq!(resolved.root, Some(PathBuf::from("/from/cli")));
    }

    #[test]
    fn test_values_below_one_fall_back_to_defaults() {
        let overrides = Overrides {
            interval_secs: Some(0),
            max_hangs: Some(0),
            max_retries: Some(0),
            tolerance_ticks: Some(0),
            root: Some(PathBuf::new()),
        };
        let resolved = YoyoConfig::default().resolve(overrides, vec![]);
        assert_eq!(resolved.monitor.interval, Duration::from_secs(60));
        assert_eq!(resolved.monitor.max_hangs, 5);
        assert_eq!(resolved.max_retries, 5);
        // zero tolerance is meaningful: any tick of progress counts
        assert_eq!(resolved.monitor.tolerance, 0);
        assert_eq!(resolved.root, None);
    }
}
