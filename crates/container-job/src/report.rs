use tracing::error;

use crate::error::JobError;
use crate::job::JobInfo;

/// Receives every failed call before the error is returned to the caller.
///
/// Implementations must not panic; the error still propagates regardless of
/// what the reporter does with it.
pub trait FailureReporter: Send + Sync {
    fn report(&self, job: &JobInfo, error: &JobError);
}

/// Logs failures as `error` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, job: &JobInfo, error: &JobError) {
        let exit_code = error.as_system_call().and_then(|e| e.exit_code());
        error!(
            job = %job.display_name,
            unit = %job.unit_name,
            tool = job.tool_name.as_deref().unwrap_or("-"),
            release = job.tool_release.as_deref().unwrap_or("-"),
            code = error.code(),
            exit_code = ?exit_code,
            "{}",
            error
        );
    }
}
