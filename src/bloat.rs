/// Bloat/leak test runner.
///
/// Runs the application through a fixed sequence (register, create a
/// profile, bloat run, leak run), checking each step for a bad exit and for
/// crash dumps in the leak profile. The first failing step stops the run.
use crate::config::BloatConfig;
use crate::controller::{merge_env, DeviceController, Environment};
use crate::crash::CrashReporter;
use crate::process::{MonitorSettings, RemoteProcess, SharedSink, STATUS_TIMED_OUT};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Errors that stop a bloat run.
#[derive(Debug)]
pub enum BloatError {
    InvalidConfig(String),
    Profile {
        path: PathBuf,
        source: std::io::Error,
    },
    Launch {
        step: String,
        source: crate::process::ProcessError,
    },
    StepFailed {
        step: String,
        status: i32,
    },
}

impl std::fmt::Display for BloatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BloatError::InvalidConfig(msg) => write!(f, "invalid bloat config: {msg}"),
            BloatError::Profile { path, source } => {
                write!(f, "failed to reset profile {}: {}", path.display(), source)
            }
            BloatError::Launch { step, source } => write!(f, "step {step}: {source}"),
            BloatError::StepFailed { step, status } => {
                write!(f, "step {step} failed with status {status}")
            }
        }
    }
}

impl std::error::Error for BloatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BloatError::Profile { source, .. } => Some(source),
            BloatError::Launch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One application invocation in the sequence.
#[derive(Debug, Clone)]
pub struct BloatStep {
    pub name: &'static str,
    pub args: Vec<String>,
    pub env: Environment,
}

/// Resolved binary, profile, arguments and environment for a run.
#[derive(Debug, Clone)]
pub struct BloatPlan {
    pub binary: PathBuf,
    pub profile: PathBuf,
    pub default_args: Vec<String>,
    pub extra_arg: Option<String>,
    pub base_env: Environment,
    pub steps: Vec<BloatStep>,
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn env_of(pairs: &[(&str, &str)]) -> Environment {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl BloatPlan {
    /// Resolve a plan. `base_env` is the environment every step starts from
    /// (normally the host environment).
    pub fn new(config: &BloatConfig, base_env: Environment) -> Result<Self, BloatError> {
        if config.distdir.as_os_str().is_empty() {
            return Err(BloatError::InvalidConfig("distdir is empty".to_string()));
        }
        if config.bin.is_empty() {
            return Err(BloatError::InvalidConfig("bin is empty".to_string()));
        }
        if config.brand.is_empty() {
            return Err(BloatError::InvalidConfig("brand is empty".to_string()));
        }

        let distdir = std::path::absolute(&config.distdir).unwrap_or_else(|_| config.distdir.clone());
        let bindir = if config.mac_bundle {
            distdir
                .join(format!("{}.app", config.brand))
                .join("Contents")
                .join("MacOS")
        } else {
            distdir.join("bin")
        };
        let binary = bindir.join(&config.bin);
        let profile = distdir
            .join("..")
            .join("_tests")
            .join("mailbloat")
            .join("leakprofile");

        let mut env = base_env;
        env.insert("MOZ_CRASHREPORTER_NO_REPORT".to_string(), "1".to_string());
        env.insert("MOZ_CRASHREPORTER".to_string(), "1".to_string());
        env.insert("NO_EM_RESTART".to_string(), "1".to_string());
        env.entry("XPCOM_DEBUG_BREAK".to_string())
            .or_insert_with(|| "stack".to_string());

        let mut default_args = strings(&["-no-remote"]);
        if config.mac_bundle {
            default_args.push("-foreground".to_string());
        }

        let profile_str = profile.to_string_lossy().into_owned();
        let steps = vec![
            BloatStep {
                name: "register",
                args: strings(&["-register"]),
                env: Environment::new(),
            },
            BloatStep {
                name: "createProfile",
                args: vec!["-CreateProfile".to_string(), format!("bloat {profile_str}")],
                env: Environment::new(),
            },
            BloatStep {
                name: "bloatTests",
                args: strings(&["-profile", profile_str.as_str()]),
                env: env_of(&[("XPCOM_MEM_BLOAT_LOG", "bloat.log")]),
            },
            BloatStep {
                name: "leakTests",
                args: strings(&[
                    "-profile",
                    profile_str.as_str(),
                    "--trace-malloc",
                    "malloc.log",
                    "--shutdown-leaks",
                    "sdleak.log",
                ]),
                env: env_of(&[("XPCOM_MEM_BLOAT_LOG", "trace-bloat.log")]),
            },
        ];

        Ok(Self {
            binary,
            profile,
            default_args,
            extra_arg: Some(config.extra_arg.clone()).filter(|a| !a.is_empty()),
            base_env: env,
            steps,
        })
    }

    /// Full command line for `step`.
    pub fn command(&self, step: &BloatStep) -> Vec<String> {
        let mut cmd = vec![self.binary.to_string_lossy().into_owned()];
        cmd.extend(self.default_args.iter().cloned());
        cmd.extend(step.args.iter().cloned());
        cmd.extend(self.extra_arg.iter().cloned());
        cmd
    }

    /// Environment for `step`: the base environment with the step's
    /// variables on top.
    pub fn env(&self, step: &BloatStep) -> Environment {
        merge_env(&self.base_env, &step.env)
    }

    pub fn minidump_dir(&self) -> PathBuf {
        self.profile.join("minidumps")
    }
}

/// Wipe the leak profile and recreate it empty.
pub fn reset_profile(profile: &Path) -> Result<(), BloatError> {
    let io_err = |source: std::io::Error| BloatError::Profile {
        path: profile.to_path_buf(),
        source,
    };
    if profile.exists() {
        std::fs::remove_dir_all(profile).map_err(io_err)?;
    }
    std::fs::create_dir_all(profile).map_err(io_err)
}

pub struct BloatRunner {
    controller: Arc<dyn DeviceController>,
    reporter: Box<dyn CrashReporter>,
    settings: MonitorSettings,
    step_timeout: Duration,
    symbols_path: Option<PathBuf>,
    out: SharedSink,
}

impl BloatRunner {
    pub fn new(
        controller: Arc<dyn DeviceController>,
        reporter: Box<dyn CrashReporter>,
        settings: MonitorSettings,
        step_timeout: Duration,
        symbols_path: Option<PathBuf>,
        out: SharedSink,
    ) -> Self {
        Self {
            controller,
            reporter,
            settings,
            step_timeout,
            symbols_path,
            out,
        }
    }

    /// Run every step of `plan` in order.
    pub async fn run(&self, plan: &BloatPlan) -> Result<(), BloatError> {
        reset_profile(&plan.profile)?;

        for step in &plan.steps {
            self.run_step(plan, step).await?;
            self.out
                .line(&format!("INFO | runtest | {} executed successfully.", step.name));
        }

        self.out.line("INFO | runtest | All tests executed successfully.");
        Ok(())
    }

    async fn run_step(&self, plan: &BloatPlan, step: &BloatStep) -> Result<(), BloatError> {
        let cmd = plan.command(step);
        let env = plan.env(step);
        let cwd = std::env::current_dir().unwrap_or_default();

        self.out.line(&format!(
            "INFO | runtest | Running {} in {} : ",
            step.name,
            cwd.display()
        ));
        self.out.line(&format!("INFO | runtest | {} {:?}", cmd[0], &cmd[1..]));
        for (key, value) in &env {
            self.out.line(&format!("{key}={value}"));
        }

        let mut proc = RemoteProcess::launch(
            Arc::clone(&self.controller),
            &cmd,
            &env,
            None,
            None,
            self.out.boxed(),
            self.settings.clone(),
        )
        .await
        .map_err(|source| BloatError::Launch {
            step: step.name.to_string(),
            source,
        })?;

        let mut status = match proc.finish(self.step_timeout).await {
            STATUS_TIMED_OUT => STATUS_TIMED_OUT,
            _ => proc.exit_code().unwrap_or(0),
        };
        if status != 0 {
            self.out.line(&format!(
                "TEST-UNEXPECTED-FAIL | runtest | Exited with code {status} during test run"
            ));
        }

        let crashed = self
            .reporter
            .check_for_crashes(&plan.minidump_dir(), self.symbols_path.as_deref(), step.name)
            .unwrap_or_else(|e| {
                tracing::warn!(step = step.name, error = %e, "crash check failed");
                false
            });
        if crashed {
            self.out.line(&format!(
                "TinderboxPrint: {}<br/><em class=\"testfail\">CRASH</em>",
                step.name
            ));
            status = 1;
        }

        if status != 0 {
            return Err(BloatError::StepFailed {
                step: step.name.to_string(),
                status,
            });
        }
        Ok(())
    }
}
