/// Remote process monitor: launch a command through a device controller,
/// poll it for liveness, tail its log, and enforce a timeout.
use crate::controller::{parse_pid, ControllerError, DeviceController, Environment};
use crate::crash::{CrashError, CrashReporter};
use crate::marker::{trim_log, MarkerScanner};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Launcher binary for on-device instrumentation runs.
const INSTRUMENT_LAUNCHER: &str = "am";

/// Floor for the poll interval; a zero interval would never advance the
/// timeout clock.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Status returned by `wait` when the process was seen to exit.
pub const STATUS_EXITED: i32 = 0;
/// Status returned by `wait` when the timeout expired first.
pub const STATUS_TIMED_OUT: i32 = 1;

/// Destination for log output forwarded while a process runs.
pub type LogSink = Box<dyn Write + Send>;

/// Cloneable writer shared by everything that reports to one stream.
#[derive(Clone)]
pub struct SharedSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    /// Write one line, logging rather than failing on error.
    pub fn line(&self, text: &str) {
        let mut writer = self.clone();
        if let Err(e) = writeln!(writer, "{text}").and_then(|_| writer.flush()) {
            tracing::warn!(error = %e, "failed to write harness output");
        }
    }

    pub fn boxed(&self) -> LogSink {
        Box::new(self.clone())
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut writer = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut writer = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.flush()
    }
}

/// Timing and marker settings for one monitored process.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Sleep between liveness polls.
    pub poll_interval: Duration,
    /// Default `wait` timeout. Remote runs are slow, so this is generous.
    pub timeout: Duration,
    /// Delay after launch before the first poll, so the device has
    /// registered the process.
    pub launch_grace: Duration,
    /// Tag of marker lines (`<tag> | <value>`).
    pub marker_tag: String,
    /// Marker reported before any marker line has been seen.
    pub initial_marker: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3600),
            launch_grace: Duration::from_secs(1),
            marker_tag: crate::marker::DEFAULT_TAG.to_string(),
            initial_marker: "remoteautomation".to_string(),
        }
    }
}

/// Errors that abort a monitored invocation.
#[derive(Debug)]
pub enum ProcessError {
    /// The command had no binary.
    EmptyCommand,
    /// The controller did not start the process.
    LaunchFailure { command: String },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::EmptyCommand => write!(f, "cannot launch an empty command"),
            ProcessError::LaunchFailure { command } => {
                write!(f, "unable to launch process: {command}")
            }
        }
    }
}

impl std::error::Error for ProcessError {}

/// Derive the name the device knows the process by.
///
/// Normally the last path segment of the binary. For an instrumentation run
/// such as
/// `am instrument -w -e class org.mozilla.fennec.tests.testBookmark ...`
/// the application package is the part of the class name before the
/// `tests` component: `org.mozilla.fennec`.
pub fn derive_process_name(cmd: &[String]) -> String {
    let binary = cmd.first().map(String::as_str).unwrap_or_default();
    let fallback = binary.rsplit('/').next().unwrap_or(binary).to_string();

    if binary != INSTRUMENT_LAUNCHER || cmd.get(1).map(String::as_str) != Some("instrument") {
        return fallback;
    }

    // "class" as the very first token is the binary, not an argument.
    let Some(class_idx) = cmd.iter().position(|arg| arg == "class").filter(|&i| i > 0) else {
        return fallback;
    };
    let Some(class_name) = cmd.get(class_idx + 1) else {
        return fallback;
    };
    let parts: Vec<&str> = class_name.split('.').collect();
    match parts.iter().position(|p| *p == "tests") {
        Some(i) if i > 0 => parts[..i].join("."),
        _ => fallback,
    }
}

/// Handle to one process launched through a `DeviceController`.
///
/// `poll_log` mutates the handle (it consumes new log output); `pid`,
/// `exit_code` and the accessors are pure queries.
pub struct RemoteProcess {
    controller: Arc<dyn DeviceController>,
    log_ref: Option<String>,
    process_name: String,
    log_offset: usize,
    /// Unterminated last line of the log, rescanned with the next fetch.
    partial_line: String,
    last_marker: String,
    scanner: MarkerScanner,
    settings: MonitorSettings,
    sink: LogSink,
}

impl RemoteProcess {
    /// Launch `cmd` on the device and wait out the launch grace period.
    ///
    /// `log_ref` is where the device should capture the process output.
    pub async fn launch(
        controller: Arc<dyn DeviceController>,
        cmd: &[String],
        env: &Environment,
        cwd: Option<&Path>,
        log_ref: Option<&str>,
        sink: LogSink,
        settings: MonitorSettings,
    ) -> Result<RemoteProcess, ProcessError> {
        let binary = cmd.first().ok_or(ProcessError::EmptyCommand)?;

        let launched = controller.launch_process(cmd, log_ref, cwd, env, true);
        let log_ref = match launched {
            Some(reference) => Some(reference),
            // Instrumentation runs report nothing back; their output lands
            // in the requested log.
            None if binary == INSTRUMENT_LAUNCHER => log_ref.map(str::to_string),
            None => {
                return Err(ProcessError::LaunchFailure {
                    command: cmd.join(" "),
                })
            }
        };

        let process_name = derive_process_name(cmd);
        if binary == INSTRUMENT_LAUNCHER {
            tracing::info!(process_name = %process_name, "derived instrumentation process name");
        }
        tracing::debug!(
            process_name = %process_name,
            log = ?log_ref,
            "remote process launched"
        );

        tokio::time::sleep(settings.launch_grace).await;

        Ok(RemoteProcess {
            controller,
            log_ref,
            process_name,
            log_offset: 0,
            partial_line: String::new(),
            last_marker: settings.initial_marker.clone(),
            scanner: MarkerScanner::new(&settings.marker_tag),
            settings,
            sink,
        })
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Last marker value seen in the log, or the initial marker.
    pub fn last_marker(&self) -> &str {
        &self.last_marker
    }

    /// Bytes of the remote log consumed so far.
    pub fn log_offset(&self) -> usize {
        self.log_offset
    }

    /// Device pid of the process, 0 when it is not running.
    pub fn pid(&self) -> u32 {
        self.controller
            .process_exist(&self.process_name)
            .map(|id| parse_pid(&id))
            .unwrap_or(0)
    }

    /// Exit code, when the controller knows it.
    pub fn exit_code(&self) -> Option<i32> {
        self.controller.exit_code(&self.process_name)
    }

    fn is_alive(&self) -> bool {
        self.controller.process_exist(&self.process_name).is_some()
    }

    /// Fetch the remote log and return only what was added since the last
    /// call, trimmed. Updates the last marker from the new content.
    pub fn poll_log(&mut self) -> String {
        let Some(log_ref) = self.log_ref.as_deref() else {
            return String::new();
        };
        let Some(content) = self.controller.get_file(log_ref) else {
            return String::new();
        };

        if content.len() < self.log_offset {
            // Log was truncated underneath us; skip ahead rather than re-emit.
            tracing::warn!(
                previous = self.log_offset,
                current = content.len(),
                "remote log shrank, resetting offset"
            );
            self.log_offset = content.len();
            self.partial_line.clear();
            return String::new();
        }

        let mut start = self.log_offset;
        while !content.is_char_boundary(start) {
            start += 1;
        }
        let new_content = &content[start..];
        self.log_offset = content.len();

        // A marker line can straddle two fetches.
        let mut scan = std::mem::take(&mut self.partial_line);
        scan.push_str(new_content);
        if let Some(marker) = self.scanner.last_match(&scan) {
            self.last_marker = marker.to_string();
        }
        self.partial_line = match scan.rfind('\n') {
            Some(i) => scan[i + 1..].to_string(),
            None => scan,
        };
        trim_log(new_content).to_string()
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = writeln!(self.sink, "{text}").and_then(|_| self.sink.flush()) {
            tracing::warn!(error = %e, "failed to write process output");
        }
    }

    fn forward_log(&mut self) {
        let text = self.poll_log();
        if !text.is_empty() {
            self.emit(&text);
        }
    }

    /// Poll until the process exits or the timeout expires, forwarding log
    /// output as it appears.
    ///
    /// Returns `STATUS_EXITED` or `STATUS_TIMED_OUT`. This says nothing about
    /// the process's own exit code. On timeout the process is left running.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> i32 {
        let timeout = timeout.unwrap_or(self.settings.timeout);
        let interval = self.settings.poll_interval.max(MIN_POLL_INTERVAL);
        let mut elapsed = Duration::ZERO;

        let timed_out = loop {
            if !self.is_alive() {
                break false;
            }
            if elapsed >= timeout {
                break true;
            }
            self.forward_log();
            tokio::time::sleep(interval).await;
            elapsed += interval;
        };

        // Flush anything written during the last sleep.
        self.forward_log();

        tracing::debug!(
            process_name = %self.process_name,
            elapsed_secs = elapsed.as_secs(),
            log_offset = self.log_offset(),
            timed_out,
            "wait finished"
        );
        if timed_out {
            STATUS_TIMED_OUT
        } else {
            STATUS_EXITED
        }
    }

    /// Wait up to `max_time`; if the process is still alive afterwards,
    /// report the timeout against the last marker and kill it.
    pub async fn finish(&mut self, max_time: Duration) -> i32 {
        let status = self.wait(Some(max_time)).await;

        if status == STATUS_TIMED_OUT && self.is_alive() {
            let line = format!(
                "TEST-UNEXPECTED-FAIL | {} | application ran for longer than allowed maximum time of {} seconds",
                self.last_marker,
                max_time.as_secs()
            );
            self.emit(&line);
            if let Err(e) = self.kill() {
                tracing::warn!(
                    process_name = %self.process_name,
                    error = %e,
                    "failed to kill timed-out process"
                );
            }
        }

        status
    }

    /// Fetch the device's minidump directory and hand it to `reporter`,
    /// attributing any crash to the last marker.
    ///
    /// The local scratch directory is always removed afterwards.
    pub fn check_for_crashes(
        &self,
        minidump_remote_dir: &str,
        symbols_path: Option<&Path>,
        reporter: &dyn CrashReporter,
    ) -> Result<bool, CrashError> {
        let dump_dir = tempfile::Builder::new()
            .prefix("minidumps-")
            .tempdir()
            .map_err(CrashError::TempDir)?;

        if let Err(e) = self
            .controller
            .get_directory(minidump_remote_dir, dump_dir.path())
        {
            tracing::warn!(
                remote = minidump_remote_dir,
                error = %e,
                "failed to fetch minidumps"
            );
        }

        let result = reporter.check_for_crashes(dump_dir.path(), symbols_path, &self.last_marker);

        let local = dump_dir.path().to_path_buf();
        if let Err(e) = dump_dir.close() {
            tracing::warn!(
                path = %local.display(),
                error = %e,
                "unable to remove directory"
            );
        }

        result
    }

    /// Ask the controller to kill the process. Not retried.
    pub fn kill(&self) -> Result<(), ControllerError> {
        self.controller.kill_process(&self.process_name)
    }
}
