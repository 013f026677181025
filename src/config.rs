use crate::process::MonitorSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from harness.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct HarnessConfig {
    pub monitor: MonitorConfig,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub crash: CrashConfig,
    pub bloat: BloatConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    pub launch_grace_ms: u64,
    pub marker_tag: String,
    pub initial_marker: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub app_name: String,
    pub product: String,
    pub remote_profile: Option<String>,
    pub remote_log: Option<String>,
    pub crash_reporter: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Where process logs go when no explicit log path is given.
    pub log_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct CrashConfig {
    pub symbols_path: Option<PathBuf>,
    /// Keep found minidumps here instead of deleting them.
    pub save_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BloatConfig {
    pub distdir: PathBuf,
    pub bin: String,
    pub brand: String,
    pub extra_arg: String,
    pub mac_bundle: bool,
    pub step_timeout_secs: u64,
}

/// Errors loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io {
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
            ConfigError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl HarnessConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
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
}

impl MonitorConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            launch_grace: Duration::from_millis(self.launch_grace_ms),
            marker_tag: self.marker_tag.clone(),
            initial_marker: self.initial_marker.clone(),
        }
    }
}

// --- Default implementations ---

impl Default for MonitorConfig {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            poll_interval_secs: settings.poll_interval.as_secs(),
            timeout_secs: settings.timeout.as_secs(),
            launch_grace_ms: settings.launch_grace.as_millis() as u64,
            marker_tag: settings.marker_tag,
            initial_marker: settings.initial_marker,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            product: "fennec".to_string(),
            remote_profile: None,
            remote_log: None,
            crash_reporter: true,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir().join("remote-harness"),
        }
    }
}

impl Default for BloatConfig {
    fn default() -> Self {
        Self {
            distdir: PathBuf::from("distdir-tb"),
            bin: "thunderbird".to_string(),
            brand: "Daily".to_string(),
            extra_arg: String::new(),
            mac_bundle: cfg!(target_os = "macos"),
            step_timeout_secs: 3600,
        }
    }
}
