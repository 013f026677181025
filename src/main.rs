mod automation;
mod bloat;
mod config;
mod controller;
mod crash;
mod local;
mod marker;
mod process;

use automation::{AutomationError, RemoteAutomation, RemoteSettings};
use bloat::{BloatPlan, BloatRunner};
use clap::{Parser, Subcommand};
use config::HarnessConfig;
use controller::Environment;
use crash::MinidumpReporter;
use local::LocalController;
use process::SharedSink;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Test-harness automation: launch an application through a device
/// controller, tail its log, enforce a time limit, and check for crashes.
#[derive(Parser, Debug)]
#[command(name = "remote-harness", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "harness.toml", global = true)]
    config: PathBuf,

    /// Extra logging (poll decisions, process lifecycle)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an application under the monitor until it exits or times out
    Run {
        /// Application binary
        app: String,

        /// Profile directory passed to the application
        #[arg(long, default_value = "profile")]
        profile: String,

        /// Test URL appended to the command line
        #[arg(long)]
        url: Option<String>,

        /// Kill the application after this many seconds (default: from config)
        #[arg(long, visible_alias = "timeout")]
        max_time: Option<u64>,

        /// Log file the application output is captured to
        #[arg(long)]
        log: Option<String>,

        /// Minidump directory to check after the run (default: <profile>/minidumps/)
        #[arg(long)]
        minidumps: Option<String>,

        /// Extra application arguments
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Run the bloat/leak test sequence
    Bloat {
        /// Print the resolved steps, don't run
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the resolved configuration and exit
    Config,
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

fn status_code(status: i32) -> ExitCode {
    ExitCode::from(u8::try_from(status).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match HarnessConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run {
            app,
            profile,
            url,
            max_time,
            log,
            minidumps,
            args,
        } => {
            let max_time = Duration::from_secs(max_time.unwrap_or(config.monitor.timeout_secs));
            run_app(
                &config,
                &app,
                &profile,
                url.as_deref(),
                max_time,
                log.as_deref(),
                minidumps.as_deref(),
                &args,
            )
            .await
        }
        Commands::Bloat { dry_run } => run_bloat(&config, dry_run).await,
        Commands::Config => {
            println!("{config:#?}");
            ExitCode::SUCCESS
        }
    }
}

async fn run_app(
    config: &HarnessConfig,
    app: &str,
    profile: &str,
    url: Option<&str>,
    max_time: Duration,
    log: Option<&str>,
    minidumps: Option<&str>,
    extra_args: &[String],
) -> ExitCode {
    let controller = Arc::new(LocalController::new(&config.local.log_dir));
    let mut settings = RemoteSettings::from_config(config);
    if settings.remote_profile.is_none() {
        settings.remote_profile = Some(profile.to_string());
    }
    let mut automation = RemoteAutomation::new(controller, settings);
    tracing::info!(
        app_name = %automation.settings().app_name,
        product = %automation.settings().product,
        "starting monitored run"
    );

    let (binary, args) = automation.build_command_line(app, profile, url, extra_args);
    let mut cmd = vec![binary];
    cmd.extend(args);

    let host_env: Environment = std::env::vars().collect();
    let env = automation.environment(Some(host_env), config.remote.crash_reporter);

    let mut proc = match automation
        .process(&cmd, log, &env, None, SharedSink::stdout().boxed())
        .await
    {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "launch failed");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(pid = proc.pid(), name = proc.process_name(), "monitoring process");

    let mut status = automation.wait_for_finish(&mut proc, max_time).await;

    let reporter = MinidumpReporter::new(config.crash.save_path.clone(), Box::new(std::io::stdout()));
    let symbols = config.crash.symbols_path.as_deref();
    let crashed = match minidumps {
        Some(dir) => proc
            .check_for_crashes(dir, symbols, &reporter)
            .map_err(AutomationError::from),
        None => automation.check_for_crashes(&proc, symbols, &reporter),
    };
    match crashed {
        Ok(true) => status = 1,
        Ok(false) => {}
        Err(e) => tracing::warn!(error = %e, "crash check failed"),
    }

    tracing::info!(status, last_marker = automation.last_marker(), "run finished");
    status_code(status)
}

async fn run_bloat(config: &HarnessConfig, dry_run: bool) -> ExitCode {
    let host_env: Environment = std::env::vars().collect();
    let plan = match BloatPlan::new(&config.bloat, host_env) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "invalid bloat configuration");
            return ExitCode::FAILURE;
        }
    };
    println!("{}", plan.binary.display());

    if dry_run {
        for step in &plan.steps {
            println!("{}: {}", step.name, plan.command(step).join(" "));
        }
        return ExitCode::SUCCESS;
    }

    let out = SharedSink::stderr();
    let runner = BloatRunner::new(
        Arc::new(LocalController::new(&config.local.log_dir)),
        Box::new(MinidumpReporter::new(
            config.crash.save_path.clone(),
            out.boxed(),
        )),
        config.monitor.settings(),
        Duration::from_secs(config.bloat.step_timeout_secs),
        config.crash.symbols_path.clone(),
        out,
    );

    match runner.run(&plan).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(bloat::BloatError::StepFailed { step, status }) => {
            tracing::error!(step = %step, status, "bloat step failed");
            status_code(status)
        }
        Err(e) => {
            tracing::error!(error = %e, "bloat run aborted");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_trailing_args() {
        let cli = Cli::parse_from([
            "remote-harness",
            "run",
            "/data/local/app/fennec",
            "--max-time",
            "120",
            "--",
            "-jsconsole",
            "-foreground",
        ]);
        match cli.command {
            Commands::Run {
                app, max_time, args, ..
            } => {
                assert_eq!(app, "/data/local/app/fennec");
                assert_eq!(max_time, Some(120));
                assert_eq!(args, vec!["-jsconsole", "-foreground"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("harness.toml"));
    }

    #[test]
    fn test_parse_run_timeout_log_and_minidumps() {
        let cli = Cli::parse_from([
            "remote-harness",
            "run",
            "/usr/bin/fennec",
            "--timeout",
            "45",
            "--log",
            "/tmp/fennec.log",
            "--minidumps",
            "/tmp/profile/minidumps",
        ]);
        match cli.command {
            Commands::Run {
                max_time,
                log,
                minidumps,
                args,
                ..
            } => {
                assert_eq!(max_time, Some(45));
                assert_eq!(log.as_deref(), Some("/tmp/fennec.log"));
                assert_eq!(minidumps.as_deref(), Some("/tmp/profile/minidumps"));
                assert!(args.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_bloat_dry_run() {
        let cli = Cli::parse_from(["remote-harness", "-c", "ci.toml", "bloat", "--dry-run"]);
        assert!(matches!(cli.command, Commands::Bloat { dry_run: true }));
        assert_eq!(cli.config, PathBuf::from("ci.toml"));
    }
}
