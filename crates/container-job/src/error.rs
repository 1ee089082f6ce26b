use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::util::truncate;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    /// The caller asked for something that can never work: conflicting
    /// runtimes, an empty command, a missing volume source.
    #[error("Usage error: {message}")]
    Usage { message: String },

    #[error("Invalid job configuration: {message}")]
    Config { message: String },

    #[error("Failed to prepare scratch directory: {message}")]
    Io { message: String },

    #[error(transparent)]
    SystemCall(#[from] SystemCallError),
}

impl JobError {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        JobError::Usage {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            JobError::Usage { .. } => "CONTAINER_JOB_USAGE",
            JobError::Config { .. } => "CONTAINER_JOB_INVALID_CONFIG",
            JobError::Io { .. } => "CONTAINER_JOB_IO_ERROR",
            JobError::SystemCall(err) => match err.reason {
                FailureReason::NonZeroExit { .. } => "CONTAINER_JOB_NON_ZERO_EXIT",
                FailureReason::Spawn { .. } => "CONTAINER_JOB_SPAWN_FAILED",
            },
        }
    }

    pub fn as_system_call(&self) -> Option<&SystemCallError> {
        match self {
            JobError::SystemCall(err) => Some(err),
            _ => None,
        }
    }
}

impl From<resource_tag::TagError> for JobError {
    fn from(err: resource_tag::TagError) -> Self {
        JobError::usage(err.to_string())
    }
}

/// A command that was attempted and did not succeed, whether the process ran
/// and failed or never started.
#[derive(Debug)]
pub struct SystemCallError {
    /// Command as given by the caller, before any runtime wrapping.
    pub command: Vec<String>,
    /// Shell-escaped command line that was actually spawned.
    pub command_line: String,
    pub cwd: Option<PathBuf>,
    pub image: Option<String>,
    pub reason: FailureReason,
}

#[derive(Debug, Error)]
pub enum FailureReason {
    #[error("{}", describe_exit(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl SystemCallError {
    /// Exit code of the process. `None` for spawn failures and signals.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.reason {
            FailureReason::NonZeroExit { code, .. } => *code,
            FailureReason::Spawn { .. } => None,
        }
    }

    pub fn is_spawn_failure(&self) -> bool {
        matches!(self.reason, FailureReason::Spawn { .. })
    }

    pub fn stderr(&self) -> Option<&str> {
        match &self.reason {
            FailureReason::NonZeroExit { stderr, .. } => Some(stderr.as_str()),
            FailureReason::Spawn { .. } => None,
        }
    }
}

impl fmt::Display for SystemCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "System call failed: {}", self.command_line)?;
        if let Some(image) = &self.image {
            write!(f, " [image: {}]", image)?;
        }
        if let Some(cwd) = &self.cwd {
            write!(f, " [cwd: {}]", cwd.display())?;
        }
        write!(f, ": {}", self.reason)?;
        if let Some(stderr) = self.stderr().map(str::trim).filter(|s| !s.is_empty()) {
            write!(f, "\nstderr: {}", truncate(stderr, 2048))?;
        }
        Ok(())
    }
}

impl std::error::Error for SystemCallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(code: Option<i32>, stderr: &str) -> SystemCallError {
        SystemCallError {
            command: vec!["rm".into(), "/bin".into()],
            command_line: "rm /bin".into(),
            cwd: Some(PathBuf::from("/tmp")),
            image: Some("ubuntu:22.04".into()),
            reason: FailureReason::NonZeroExit {
                code,
                stderr: stderr.into(),
            },
        }
    }

    #[test]
    fn display_includes_context() {
        let message = failed(Some(1), "rm: cannot remove '/bin'\n").to_string();
        assert!(message.contains("rm /bin"));
        assert!(message.contains("ubuntu:22.04"));
        assert!(message.contains("/tmp"));
        assert!(message.contains("exited with code 1"));
        assert!(message.contains("cannot remove"));
    }

    #[test]
    fn signal_has_no_exit_code() {
        let err = failed(None, "");
        assert_eq!(err.exit_code(), None);
        assert!(!err.is_spawn_failure());
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn error_codes_distinguish_reasons() {
        let exit = JobError::from(failed(Some(2), ""));
        assert_eq!(exit.code(), "CONTAINER_JOB_NON_ZERO_EXIT");

        let spawn = JobError::from(SystemCallError {
            command: vec!["missing".into()],
            command_line: "missing".into(),
            cwd: None,
            image: None,
            reason: FailureReason::Spawn {
                program: "missing".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
        });
        assert_eq!(spawn.code(), "CONTAINER_JOB_SPAWN_FAILED");
        assert!(spawn.as_system_call().unwrap().is_spawn_failure());
    }

    #[test]
    fn tag_errors_become_usage_errors() {
        let err = JobError::from(resource_tag::TagError::Empty);
        assert!(matches!(err, JobError::Usage { .. }));
    }
}
