use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command, Stdio};
use std::thread;
use std::time::Instant;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::{ExecutionMode, JobConfiguration, VolumeBinding};
use crate::error::{FailureReason, JobError, JobResult, SystemCallError};
use crate::util::{command_line_string, container_user, truncate};

/// Prefix singularity strips from host variables to set them in the container.
pub const SINGULARITY_ENV_PREFIX: &str = "SINGULARITYENV_";

/// How much trailing stderr a failed call keeps.
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Per-call knobs for [`crate::ContainerJob::call`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Capture and return stdout instead of the exit code.
    pub check_output: bool,
    /// Working directory, inside the container for container modes.
    pub cwd: Option<PathBuf>,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_output(mut self) -> Self {
        self.check_output = true;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutput {
    /// Captured stdout with trailing line breaks removed.
    Output(String),
    ExitCode(i32),
}

impl CallOutput {
    pub fn output(&self) -> Option<&str> {
        match self {
            CallOutput::Output(out) => Some(out),
            CallOutput::ExitCode(_) => None,
        }
    }

    pub fn into_output(self) -> Option<String> {
        match self {
            CallOutput::Output(out) => Some(out),
            CallOutput::ExitCode(_) => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CallOutput::Output(_) => None,
            CallOutput::ExitCode(code) => Some(*code),
        }
    }
}

/// A fully wrapped command, ready to spawn.
///
/// Holds the per-call scratch directory, which is removed when this value is
/// dropped.
#[derive(Debug)]
pub struct PreparedCommand {
    command: Command,
    original: Vec<String>,
    cwd: Option<PathBuf>,
    image: Option<String>,
    scratch: Option<TempDir>,
}

impl PreparedCommand {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn command_line(&self) -> String {
        command_line_string(&self.command)
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Spawns the command and waits for it.
    ///
    /// Stderr is drained on a helper thread. Only its last
    /// [`STDERR_TAIL_BYTES`] are kept for the error; when stdout is inherited
    /// it is also echoed to this process's stderr as it arrives.
    pub(crate) fn run(mut self, check_output: bool) -> JobResult<CallOutput> {
        let command_line = self.command_line();
        self.command.stdin(Stdio::null());
        self.command.stderr(Stdio::piped());
        if check_output {
            self.command.stdout(Stdio::piped());
        } else {
            self.command.stdout(Stdio::inherit());
        }

        debug!(command = %command_line, "spawning");
        let start = Instant::now();
        let mut child = match self.command.spawn() {
            Ok(child) => child,
            Err(source) => return Err(self.spawn_failure(command_line, source)),
        };

        let echo = !check_output;
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || drain_stderr(pipe, echo)));

        let mut stdout = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            if let Err(err) = pipe.read_to_end(&mut stdout) {
                warn!(error = %err, "failed to read stdout");
            }
        }

        let status = child.wait();
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let status = match status {
            Ok(status) => status,
            Err(source) => return Err(self.spawn_failure(command_line, source)),
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let stderr = String::from_utf8_lossy(&stderr).to_string();
        debug!(status = ?status.code(), elapsed_ms, "process exited");

        if !status.success() {
            warn!(
                status = ?status.code(),
                stderr = %truncate(stderr.trim(), 512),
                "command failed"
            );
            return Err(self.failure(
                command_line,
                FailureReason::NonZeroExit {
                    code: status.code(),
                    stderr,
                },
            ));
        }

        if check_output && !stderr.trim().is_empty() {
            debug!(stderr = %truncate(stderr.trim(), 2048), "command stderr");
        }

        if check_output {
            let stdout = String::from_utf8_lossy(&stdout);
            Ok(CallOutput::Output(
                stdout.trim_end_matches(|c: char| c == '\n' || c == '\r').to_string(),
            ))
        } else {
            Ok(CallOutput::ExitCode(status.code().unwrap_or(0)))
        }
    }

    fn spawn_failure(&mut self, command_line: String, source: io::Error) -> JobError {
        let program = self.command.get_program().to_string_lossy().to_string();
        warn!(%program, error = %source, "spawn failed");
        self.failure(command_line, FailureReason::Spawn { program, source })
    }

    fn failure(&mut self, command_line: String, reason: FailureReason) -> JobError {
        JobError::SystemCall(SystemCallError {
            command: std::mem::take(&mut self.original),
            command_line,
            cwd: self.cwd.take(),
            image: self.image.take(),
            reason,
        })
    }
}

/// Reads `pipe` to the end, keeping at most [`STDERR_TAIL_BYTES`] of the most
/// recent output.
fn drain_stderr(mut pipe: ChildStderr, echo: bool) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let read = match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "failed to read stderr");
                break;
            }
        };
        if echo {
            let _ = io::stderr().write_all(&chunk[..read]);
        }
        tail.extend_from_slice(&chunk[..read]);
        if tail.len() > STDERR_TAIL_BYTES {
            let excess = tail.len() - STDERR_TAIL_BYTES;
            tail.drain(..excess);
        }
    }
    tail
}

/// Wraps `command` for the configured runtime.
pub(crate) fn prepare<S: AsRef<str>>(
    config: &JobConfiguration,
    command: &[S],
    options: &CallOptions,
) -> JobResult<PreparedCommand> {
    let original: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
    let Some((program, args)) = original.split_first() else {
        return Err(JobError::usage("command cannot be empty"));
    };
    if program.is_empty() {
        return Err(JobError::usage("command program cannot be empty"));
    }

    let (command, scratch) = match config.mode() {
        ExecutionMode::Host => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            if let Some(cwd) = &options.cwd {
                cmd.current_dir(cwd);
            }
            cmd.envs(&options.env);
            (cmd, None)
        }
        ExecutionMode::Docker { image } => {
            let volumes = resolve_volumes(config.volumes())?;
            let scratch = scratch_dir(config.work_dir(), "docker_")?;
            let mut cmd = Command::new(config.docker_bin());
            configure_docker(
                &mut cmd,
                image,
                &volumes,
                scratch.as_ref().map(TempDir::path),
                options,
                &original,
            );
            (cmd, scratch)
        }
        ExecutionMode::Singularity { image } => {
            let volumes = resolve_volumes(config.volumes())?;
            let scratch = scratch_dir(config.work_dir(), "singularity_")?;
            let mut cmd = Command::new(config.singularity_bin());
            configure_singularity(
                &mut cmd,
                image,
                &volumes,
                scratch.as_ref().map(TempDir::path),
                options,
                &original,
            );
            (cmd, scratch)
        }
    };

    Ok(PreparedCommand {
        command,
        original,
        cwd: options.cwd.clone(),
        image: config.mode().image().map(str::to_string),
        scratch,
    })
}

/// Checks that every volume source exists and makes it absolute, since both
/// runtimes reject relative bind sources.
fn resolve_volumes(volumes: &[VolumeBinding]) -> JobResult<Vec<VolumeBinding>> {
    volumes
        .iter()
        .map(|volume| {
            let host_path = fs::canonicalize(&volume.host_path).map_err(|err| {
                JobError::usage(format!(
                    "volume source '{}' for '{}' is not accessible: {}",
                    volume.host_path.display(),
                    volume.container_path,
                    err
                ))
            })?;
            Ok(VolumeBinding::new(host_path, volume.container_path.clone()))
        })
        .collect()
}

fn scratch_dir(work_dir: Option<&Path>, prefix: &str) -> JobResult<Option<TempDir>> {
    let Some(work_dir) = work_dir else {
        return Ok(None);
    };
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(work_dir)
        .map(Some)
        .map_err(|err| JobError::Io {
            message: format!(
                "Failed to create scratch directory under {}: {}",
                work_dir.display(),
                err
            ),
        })
}

fn configure_docker(
    command: &mut Command,
    image: &str,
    volumes: &[VolumeBinding],
    scratch: Option<&Path>,
    options: &CallOptions,
    original: &[String],
) {
    command.arg("run");
    command.arg("--rm");
    command.arg("--entrypoint").arg("");
    command.arg("--user").arg(container_user());

    if let Some(scratch) = scratch {
        command
            .arg("--volume")
            .arg(format!("{}:/tmp", scratch.display()));
    }

    for volume in volumes {
        command.arg("--volume").arg(format!(
            "{}:{}",
            volume.host_path.display(),
            volume.container_path
        ));
    }

    if let Some(cwd) = &options.cwd {
        command.arg("--workdir").arg(cwd);
    }

    for (key, value) in &options.env {
        command.arg("--env").arg(format!("{}={}", key, value));
    }

    command.arg(image);
    command.args(original);
}

fn configure_singularity(
    command: &mut Command,
    image: &str,
    volumes: &[VolumeBinding],
    scratch: Option<&Path>,
    options: &CallOptions,
    original: &[String],
) {
    command.arg("exec");

    if let Some(scratch) = scratch {
        command.arg("--contain");
        command.arg("--workdir").arg(scratch);
    }

    for volume in volumes {
        command.arg("--bind").arg(format!(
            "{}:{}",
            volume.host_path.display(),
            volume.container_path
        ));
    }

    if let Some(cwd) = &options.cwd {
        command.arg("--pwd").arg(cwd);
    }

    // Singularity copies SINGULARITYENV_<KEY> from its own environment into
    // the container as <KEY>.
    for (key, value) in &options.env {
        command.env(format!("{}{}", SINGULARITY_ENV_PREFIX, key), value);
    }

    command.arg(image);
    command.args(original);
}
