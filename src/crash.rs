/// Post-mortem crash detection over a directory of minidumps.
///
/// Symbolication is someone else's job; this module only finds dumps,
/// reports them against a label, and either keeps them or clears them out.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Errors from a crash check.
#[derive(Debug)]
pub enum CrashError {
    /// Could not create the local scratch directory.
    TempDir(std::io::Error),
    /// Dump directory could not be listed.
    Pattern(String),
    /// Could not save or remove a dump file.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CrashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashError::TempDir(e) => write!(f, "failed to create minidump directory: {e}"),
            CrashError::Pattern(msg) => write!(f, "invalid minidump pattern: {msg}"),
            CrashError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for CrashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrashError::TempDir(e) => Some(e),
            CrashError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Inspects a local directory of crash dumps.
pub trait CrashReporter {
    /// Returns `true` if a crash was found. `label` names the test unit the
    /// crash is attributed to.
    fn check_for_crashes(
        &self,
        dump_dir: &Path,
        symbols_path: Option<&Path>,
        label: &str,
    ) -> Result<bool, CrashError>;
}

/// Reports every `*.dmp` file in the dump directory.
///
/// With a `save_path`, dumps and their `.extra` files are copied there;
/// otherwise they are deleted so the next check starts clean.
pub struct MinidumpReporter {
    save_path: Option<PathBuf>,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl MinidumpReporter {
    pub fn new(save_path: Option<PathBuf>, sink: Box<dyn Write + Send>) -> Self {
        Self {
            save_path,
            sink: Mutex::new(sink),
        }
    }

    fn report(&self, line: &str) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(sink, "{line}") {
            tracing::warn!(error = %e, "failed to write crash report");
        }
    }

    fn find_dumps(dump_dir: &Path) -> Result<Vec<PathBuf>, CrashError> {
        let dir = glob::Pattern::escape(&dump_dir.to_string_lossy());
        let pattern = Path::new(&dir).join("*.dmp");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern).map_err(|e| CrashError::Pattern(e.to_string()))?;
        let mut dumps: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
        dumps.sort();
        Ok(dumps)
    }

    fn dispose(&self, dump: &Path) -> Result<(), CrashError> {
        let extra = dump.with_extension("extra");
        let companions = [dump.to_path_buf(), extra];

        for file in companions.iter().filter(|p| p.exists()) {
            if let Some(save_dir) = &self.save_path {
                let Some(name) = file.file_name() else {
                    continue;
                };
                let dest = save_dir.join(name);
                std::fs::create_dir_all(save_dir)
                    .and_then(|_| std::fs::copy(file, &dest))
                    .map_err(|e| CrashError::Io {
                        path: dest.clone(),
                        source: e,
                    })?;
                tracing::info!(dest = %dest.display(), "saved crash dump file");
            }
            std::fs::remove_file(file).map_err(|e| CrashError::Io {
                path: file.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl CrashReporter for MinidumpReporter {
    fn check_for_crashes(
        &self,
        dump_dir: &Path,
        symbols_path: Option<&Path>,
        label: &str,
    ) -> Result<bool, CrashError> {
        let dumps = Self::find_dumps(dump_dir)?;
        if dumps.is_empty() {
            tracing::debug!(dir = %dump_dir.display(), "no minidumps found");
            return Ok(false);
        }

        for dump in &dumps {
            self.report(&format!(
                "PROCESS-CRASH | {label} | application crashed (minidump found)"
            ));
            self.report(&format!("Crash dump filename: {}", dump.display()));
            match symbols_path {
                Some(symbols) => tracing::info!(
                    dump = %dump.display(),
                    symbols = %symbols.display(),
                    "minidump left for external symbolication"
                ),
                None => self.report("No symbols path given, can't process dump."),
            }
            self.dispose(dump)?;
        }

        Ok(true)
    }
}
