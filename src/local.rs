/// `DeviceController` for processes on this machine.
///
/// Children are spawned with stdout+stderr redirected to a log file, each in
/// its own process group on unix so a kill takes the whole tree down.
/// Children are tracked by process name; exit codes are kept after reaping.
use crate::controller::{ControllerError, DeviceController, Environment};
use crate::process::derive_process_name;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Children {
    running: HashMap<String, Child>,
    exited: HashMap<String, Option<i32>>,
}

pub struct LocalController {
    log_dir: PathBuf,
    children: Mutex<Children>,
}

impl LocalController {
    /// `log_dir` holds logs for launches that don't name an output path.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            children: Mutex::new(Children::default()),
        }
    }

    fn children(&self) -> MutexGuard<'_, Children> {
        match self.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn(
        &self,
        cmd: &[String],
        log_path: &Path,
        cwd: Option<&Path>,
        env: &Environment,
    ) -> Result<Child, ControllerError> {
        let io_err = |source: std::io::Error| ControllerError::Io {
            path: log_path.to_path_buf(),
            source,
        };
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let stdout = File::create(log_path).map_err(io_err)?;
        let stderr = stdout.try_clone().map_err(io_err)?;

        let mut command = Command::new(&cmd[0]);
        command
            .args(&cmd[1..])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command.spawn().map_err(|source| ControllerError::Io {
            path: PathBuf::from(&cmd[0]),
            source,
        })
    }
}

impl DeviceController for LocalController {
    fn launch_process(
        &self,
        cmd: &[String],
        output: Option<&str>,
        cwd: Option<&Path>,
        env: &Environment,
        fail_if_running: bool,
    ) -> Option<String> {
        if cmd.is_empty() {
            return None;
        }
        let name = derive_process_name(cmd);
        if fail_if_running && self.process_exist(&name).is_some() {
            tracing::warn!(name = %name, "process already running, not launching");
            return None;
        }

        let log_path = match output {
            Some(path) => PathBuf::from(path),
            None => self.log_dir.join(format!("{name}.log")),
        };

        match self.spawn(cmd, &log_path, cwd, env) {
            Ok(child) => {
                tracing::info!(pid = child.id(), name = %name, log = %log_path.display(), "local process started");
                let mut children = self.children();
                children.exited.remove(&name);
                children.running.insert(name, child);
                Some(log_path.to_string_lossy().into_owned())
            }
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "failed to launch local process");
                None
            }
        }
    }

    fn process_exist(&self, name: &str) -> Option<String> {
        let mut children = self.children();
        let child = children.running.get_mut(name)?;
        match child.try_wait() {
            Ok(None) => Some(format!("{:#x}", child.id())),
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                tracing::debug!(name, exit_code = ?code, "local process exited");
                children.running.remove(name);
                children.exited.insert(name.to_string(), code);
                None
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "failed to poll local process");
                None
            }
        }
    }

    fn get_file(&self, remote_path: &str) -> Option<String> {
        std::fs::read(remote_path)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn get_directory(&self, remote_path: &str, local_dir: &Path) -> Result<(), ControllerError> {
        let source = Path::new(remote_path);
        if !source.is_dir() {
            tracing::debug!(path = remote_path, "source directory missing, nothing to copy");
            return Ok(());
        }
        let entries = std::fs::read_dir(source).map_err(|e| ControllerError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        std::fs::create_dir_all(local_dir).map_err(|e| ControllerError::Io {
            path: local_dir.to_path_buf(),
            source: e,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let dest = local_dir.join(entry.file_name());
            std::fs::copy(&path, &dest).map_err(|e| ControllerError::Io { path, source: e })?;
        }
        Ok(())
    }

    fn kill_process(&self, name: &str) -> Result<(), ControllerError> {
        let mut children = self.children();
        let mut child = children
            .running
            .remove(name)
            .ok_or_else(|| ControllerError::NotRunning {
                name: name.to_string(),
            })?;

        let killed = kill_child(&mut child);
        let code = child.wait().ok().and_then(exit_code_of);
        children.exited.insert(name.to_string(), code);
        killed
    }

    fn exit_code(&self, name: &str) -> Option<i32> {
        self.children().exited.get(name).copied().flatten()
    }
}

/// Exit code of a reaped child. A child killed by a signal reports the
/// negated signal number (SIGSEGV is -11).
#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
fn kill_child(child: &mut Child) -> Result<(), ControllerError> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        // Group already gone; fall back to the child itself.
        Err(nix::errno::Errno::ESRCH) => child.kill().or_else(ignore_exited),
        Err(e) => Err(ControllerError::Device(format!("killpg({pgid}) failed: {e}"))),
    }
}

#[cfg(not(unix))]
fn kill_child(child: &mut Child) -> Result<(), ControllerError> {
    child.kill().or_else(ignore_exited)
}

fn ignore_exited(e: std::io::Error) -> Result<(), ControllerError> {
    if e.kind() == std::io::ErrorKind::InvalidInput {
        Ok(())
    } else {
        Err(ControllerError::Device(format!("kill failed: {e}")))
    }
}
