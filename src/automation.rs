/// Remote automation: the per-run configuration that sits above the monitor.
///
/// Holds the device controller, the remote profile and log locations, and
/// the monitor settings. Builds environments and command lines for the
/// remote application, hands out `RemoteProcess` handles, and applies the
/// finish and crash-check policies to them.
use crate::config::{HarnessConfig, RemoteConfig};
use crate::controller::{DeviceController, Environment};
use crate::crash::{CrashError, CrashReporter};
use crate::process::{LogSink, MonitorSettings, ProcessError, RemoteProcess};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Host variable forwarded to the device so result tables can be hidden.
const HIDE_RESULTS_TABLE: &str = "MOZ_HIDE_RESULTS_TABLE";

/// Settings for one remote automation run.
#[derive(Debug, Clone, Default)]
pub struct RemoteSettings {
    pub app_name: String,
    pub product: String,
    pub remote_profile: Option<String>,
    pub remote_log: Option<String>,
    pub monitor: MonitorSettings,
}

impl RemoteSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        let RemoteConfig {
            app_name,
            product,
            remote_profile,
            remote_log,
            ..
        } = &config.remote;
        Self {
            app_name: app_name.clone(),
            product: product.clone(),
            remote_profile: remote_profile.clone(),
            remote_log: remote_log.clone(),
            monitor: config.monitor.settings(),
        }
    }
}

/// Errors from the automation layer.
#[derive(Debug)]
pub enum AutomationError {
    /// Crash checks need to know where the remote profile lives.
    NoRemoteProfile,
    Process(ProcessError),
    Crash(CrashError),
}

impl std::fmt::Display for AutomationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutomationError::NoRemoteProfile => write!(f, "no remote profile configured"),
            AutomationError::Process(e) => write!(f, "{e}"),
            AutomationError::Crash(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AutomationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AutomationError::NoRemoteProfile => None,
            AutomationError::Process(e) => Some(e),
            AutomationError::Crash(e) => Some(e),
        }
    }
}

impl From<ProcessError> for AutomationError {
    fn from(e: ProcessError) -> Self {
        AutomationError::Process(e)
    }
}

impl From<CrashError> for AutomationError {
    fn from(e: CrashError) -> Self {
        AutomationError::Crash(e)
    }
}

pub struct RemoteAutomation {
    controller: Arc<dyn DeviceController>,
    settings: RemoteSettings,
    last_marker: String,
}

impl RemoteAutomation {
    pub fn new(controller: Arc<dyn DeviceController>, settings: RemoteSettings) -> Self {
        let last_marker = settings.monitor.initial_marker.clone();
        Self {
            controller,
            settings,
            last_marker,
        }
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// Marker recorded by the last `wait_for_finish`.
    pub fn last_marker(&self) -> &str {
        &self.last_marker
    }

    /// Environment for the remote application.
    ///
    /// The host environment is not copied to the device; only the
    /// results-table switch is passed through.
    pub fn environment(&self, env: Option<Environment>, crash_reporter: bool) -> Environment {
        build_environment(
            env,
            std::env::var(HIDE_RESULTS_TABLE).ok(),
            crash_reporter,
        )
    }

    /// Binary and arguments to launch `app` with.
    ///
    /// `am instrument` runs already carry their full argument list and are
    /// passed through untouched.
    pub fn build_command_line(
        &self,
        app: &str,
        profile_dir: &str,
        test_url: Option<&str>,
        extra_args: &[String],
    ) -> (String, Vec<String>) {
        if app == "am" && extra_args.first().map(String::as_str) == Some("instrument") {
            return (app.to_string(), extra_args.to_vec());
        }

        let profile_dir = self.settings.remote_profile.as_deref().unwrap_or(profile_dir);
        let mut args = vec![
            "-no-remote".to_string(),
            "-profile".to_string(),
            profile_dir.to_string(),
        ];
        args.extend(extra_args.iter().cloned());
        if let Some(url) = test_url {
            args.push(url.to_string());
        }
        // The device has no window server to foreground into.
        args.retain(|arg| arg != "-foreground");
        (app.to_string(), args)
    }

    /// Launch `cmd` on the device. Output goes to the remote log unless
    /// `output` names another file.
    pub async fn process(
        &self,
        cmd: &[String],
        output: Option<&str>,
        env: &Environment,
        cwd: Option<&Path>,
        sink: LogSink,
    ) -> Result<RemoteProcess, AutomationError> {
        let output = output.or(self.settings.remote_log.as_deref());
        let proc = RemoteProcess::launch(
            Arc::clone(&self.controller),
            cmd,
            env,
            cwd,
            output,
            sink,
            self.settings.monitor.clone(),
        )
        .await?;
        Ok(proc)
    }

    /// Wait for the tests to finish, or kill the application once
    /// `max_time` has passed.
    pub async fn wait_for_finish(&mut self, proc: &mut RemoteProcess, max_time: Duration) -> i32 {
        let status = proc.finish(max_time).await;
        self.last_marker = proc.last_marker().to_string();
        status
    }

    /// Pull the remote profile's minidumps and check them for crashes.
    pub fn check_for_crashes(
        &self,
        proc: &RemoteProcess,
        symbols_path: Option<&Path>,
        reporter: &dyn CrashReporter,
    ) -> Result<bool, AutomationError> {
        let profile = self
            .settings
            .remote_profile
            .as_deref()
            .ok_or(AutomationError::NoRemoteProfile)?;
        let remote_dir = format!("{}/minidumps/", profile.trim_end_matches('/'));
        Ok(proc.check_for_crashes(&remote_dir, symbols_path, reporter)?)
    }
}

fn build_environment(
    env: Option<Environment>,
    hide_results_table: Option<String>,
    crash_reporter: bool,
) -> Environment {
    let mut env = env.unwrap_or_default();
    if let Some(value) = hide_results_table {
        env.insert(HIDE_RESULTS_TABLE.to_string(), value);
    }
    if crash_reporter {
        env.insert("MOZ_CRASHREPORTER_NO_REPORT".to_string(), "1".to_string());
        env.insert("MOZ_CRASHREPORTER".to_string(), "1".to_string());
    } else {
        env.insert("MOZ_CRASHREPORTER_DISABLE".to_string(), "1".to_string());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{cmd, fast_settings, CaptureSink, FakeController};
    use crate::process::STATUS_TIMED_OUT;

    fn automation(controller: Arc<FakeController>, remote_profile: Option<&str>) -> RemoteAutomation {
        RemoteAutomation::new(
            controller,
            RemoteSettings {
                app_name: "org.mozilla.fennec".to_string(),
                product: "fennec".to_string(),
                remote_profile: remote_profile.map(str::to_string),
                remote_log: Some("/mnt/sdcard/tests/log.txt".to_string()),
                monitor: fast_settings(),
            },
        )
    }

    #[test]
    fn test_environment_with_crash_reporter() {
        let env = build_environment(None, None, true);
        assert_eq!(env.get("MOZ_CRASHREPORTER").map(String::as_str), Some("1"));
        assert_eq!(
            env.get("MOZ_CRASHREPORTER_NO_REPORT").map(String::as_str),
            Some("1")
        );
        assert!(!env.contains_key("MOZ_CRASHREPORTER_DISABLE"));
        assert!(!env.contains_key(HIDE_RESULTS_TABLE));
    }

    #[test]
    fn test_environment_without_crash_reporter_keeps_given_vars() {
        let mut given = Environment::new();
        given.insert("XPCOM_DEBUG_BREAK".to_string(), "stack".to_string());
        let env = build_environment(Some(given), Some("1".to_string()), false);
        assert_eq!(env.get("MOZ_CRASHREPORTER_DISABLE").map(String::as_str), Some("1"));
        assert_eq!(env.get("XPCOM_DEBUG_BREAK").map(String::as_str), Some("stack"));
        assert_eq!(env.get(HIDE_RESULTS_TABLE).map(String::as_str), Some("1"));
        assert!(!env.contains_key("MOZ_CRASHREPORTER"));
    }

    #[test]
    fn test_command_line_uses_remote_profile_and_drops_foreground() {
        let auto = automation(Arc::new(FakeController::new()), Some("/mnt/sdcard/tests/profile"));
        let (app, args) = auto.build_command_line(
            "org.mozilla.fennec",
            "/local/profile",
            Some("http://mochi.test:8888/tests"),
            &cmd(&["-foreground", "-jsconsole"]),
        );
        assert_eq!(app, "org.mozilla.fennec");
        assert_eq!(
            args,
            cmd(&[
                "-no-remote",
                "-profile",
                "/mnt/sdcard/tests/profile",
                "-jsconsole",
                "http://mochi.test:8888/tests"
            ])
        );
    }

    #[test]
    fn test_command_line_without_remote_profile_or_foreground() {
        let auto = automation(Arc::new(FakeController::new()), None);
        let (_, args) = auto.build_command_line("fennec", "/local/profile", None, &[]);
        assert_eq!(args, cmd(&["-no-remote", "-profile", "/local/profile"]));
    }

    #[test]
    fn test_command_line_passes_instrumentation_through() {
        let auto = automation(Arc::new(FakeController::new()), Some("/mnt/sdcard/profile"));
        let extra = cmd(&[
            "instrument",
            "-w",
            "-e",
            "class",
            "org.mozilla.fennec.tests.testBookmark",
            "-foreground",
        ]);
        let (app, args) = auto.build_command_line("am", "/ignored", Some("http://x"), &extra);
        assert_eq!(app, "am");
        assert_eq!(args, extra);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_defaults_to_remote_log() {
        let controller = Arc::new(FakeController::new());
        let auto = automation(controller.clone(), None);
        let proc = auto
            .process(
                &cmd(&["org.mozilla.fennec"]),
                None,
                &Environment::new(),
                None,
                CaptureSink::default().boxed(),
            )
            .await
            .unwrap();
        assert_eq!(proc.process_name(), "org.mozilla.fennec");
        assert_eq!(controller.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_launch_failure_is_fatal() {
        let controller = Arc::new(FakeController::new().with_launch_result(None));
        let auto = automation(controller, None);
        let result = auto
            .process(
                &cmd(&["fennec"]),
                None,
                &Environment::new(),
                None,
                CaptureSink::default().boxed(),
            )
            .await;
        assert!(matches!(
            result,
            Err(AutomationError::Process(ProcessError::LaunchFailure { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_finish_records_marker() {
        let controller = Arc::new(
            FakeController::new()
                .alive_forever()
                .with_chunks(&["TEST-START | /tests/test_hang.html\n"]),
        );
        let mut auto = automation(controller.clone(), None);
        let sink = CaptureSink::default();
        let mut proc = auto
            .process(&cmd(&["fennec"]), None, &Environment::new(), None, sink.boxed())
            .await
            .unwrap();

        let status = auto.wait_for_finish(&mut proc, Duration::from_secs(10)).await;

        assert_eq!(status, STATUS_TIMED_OUT);
        assert_eq!(auto.last_marker(), "/tests/test_hang.html");
        assert_eq!(*controller.killed.lock().unwrap(), vec!["fennec".to_string()]);
    }

    struct NeverCrashes;

    impl CrashReporter for NeverCrashes {
        fn check_for_crashes(
            &self,
            _dump_dir: &Path,
            _symbols_path: Option<&Path>,
            _label: &str,
        ) -> Result<bool, CrashError> {
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_for_crashes_uses_profile_minidumps() {
        let controller = Arc::new(FakeController::new());
        let auto = automation(controller.clone(), Some("/mnt/sdcard/tests/profile/"));
        let proc = auto
            .process(
                &cmd(&["fennec"]),
                None,
                &Environment::new(),
                None,
                CaptureSink::default().boxed(),
            )
            .await
            .unwrap();

        assert!(!auto.check_for_crashes(&proc, None, &NeverCrashes).unwrap());
        assert_eq!(
            controller.fetched_dirs.lock().unwrap()[0].0,
            "/mnt/sdcard/tests/profile/minidumps/"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_for_crashes_requires_remote_profile() {
        let controller = Arc::new(FakeController::new());
        let auto = automation(controller, None);
        let proc = auto
            .process(
                &cmd(&["fennec"]),
                None,
                &Environment::new(),
                None,
                CaptureSink::default().boxed(),
            )
            .await
            .unwrap();
        assert!(matches!(
            auto.check_for_crashes(&proc, None, &NeverCrashes),
            Err(AutomationError::NoRemoteProfile)
        ));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = HarnessConfig::default();
        config.remote.remote_log = Some("/sdcard/log.txt".to_string());
        config.monitor.timeout_secs = 60;
        let settings = RemoteSettings::from_config(&config);
        assert_eq!(settings.product, "fennec");
        assert_eq!(settings.remote_log.as_deref(), Some("/sdcard/log.txt"));
        assert_eq!(settings.monitor.timeout, Duration::from_secs(60));
    }
}
