/// Device-management primitives the monitor drives a process through.
///
/// Implementations talk to a phone, an emulator or the local host. Methods
/// take `&self`; an implementation serializes its own remote operations.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment passed to a launched process, kept sorted by variable name.
pub type Environment = BTreeMap<String, String>;

/// Merge `overrides` onto a copy of `base`. Overrides win on key collision.
pub fn merge_env(base: &Environment, overrides: &Environment) -> Environment {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Errors reported by a device controller.
#[derive(Debug)]
pub enum ControllerError {
    /// No tracked process with this name.
    NotRunning { name: String },
    /// Local filesystem or process I/O failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The device rejected or failed the request.
    Device(String),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::NotRunning { name } => write!(f, "process {name} is not running"),
            ControllerError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            ControllerError::Device(msg) => write!(f, "device error: {msg}"),
        }
    }
}

impl std::error::Error for ControllerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControllerError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Process lifecycle and file transfer on a device.
pub trait DeviceController: Send + Sync {
    /// Start `cmd` asynchronously with its output captured at `output`.
    ///
    /// Returns a reference to the captured output (usually the remote log
    /// path), or `None` when the device did not start the process.
    fn launch_process(
        &self,
        cmd: &[String],
        output: Option<&str>,
        cwd: Option<&Path>,
        env: &Environment,
        fail_if_running: bool,
    ) -> Option<String>;

    /// Identifier (typically a hex pid) of the live process called `name`.
    fn process_exist(&self, name: &str) -> Option<String>;

    /// Full contents of a device file, or `None` if it cannot be read.
    fn get_file(&self, remote_path: &str) -> Option<String>;

    /// Copy a device directory's files into `local_dir`.
    fn get_directory(&self, remote_path: &str, local_dir: &Path) -> Result<(), ControllerError>;

    /// Kill the process called `name`.
    fn kill_process(&self, name: &str) -> Result<(), ControllerError>;

    /// Exit code of a finished process, when the device exposes one.
    fn exit_code(&self, _name: &str) -> Option<i32> {
        None
    }
}

/// Parse a process identifier as reported by `process_exist`.
///
/// Accepts `0x`-prefixed hex or plain decimal; anything else is 0.
pub fn parse_pid(id: &str) -> u32 {
    let id = id.trim();
    let parsed = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => id.parse(),
    };
    parsed.unwrap_or(0)
}
