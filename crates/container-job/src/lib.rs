//! Run a workflow job's commands on the host, in Docker or in Singularity.
//!
//! A [`ContainerJob`] owns a [`JobConfiguration`] that fixes the execution
//! mode up front. Each [`ContainerJob::call`] wraps the command for that mode,
//! runs it to completion and reports any failure as a single
//! [`JobError::SystemCall`] kind, whether the process exited non-zero or
//! could not be started.
//!
//! ```no_run
//! use container_job::{CallOptions, ContainerJob, JobConfiguration};
//!
//! let config = JobConfiguration::docker("ubuntu:22.04").with_volume("/data", "/vol1");
//! let job = ContainerJob::new(config)?;
//! let out = job.call(&["cat", "/vol1/foo"], &CallOptions::new().check_output())?;
//! assert_eq!(out.output(), Some("bar"));
//! # Ok::<(), container_job::JobError>(())
//! ```

pub mod config;
mod dispatch;
mod error;
mod job;
mod report;
mod util;

pub use config::{ExecutionMode, JobConfigSpec, JobConfiguration, VolumeBinding};
pub use dispatch::{
    CallOptions, CallOutput, PreparedCommand, SINGULARITY_ENV_PREFIX, STDERR_TAIL_BYTES,
};
pub use error::{FailureReason, JobError, JobResult, SystemCallError};
pub use job::{ContainerJob, JobInfo, JobOptions, DEFAULT_DISPLAY_NAME};
pub use report::{FailureReporter, TracingReporter};
pub use util::{command_line_string, CONTAINER_USER_ENV};

pub use resource_tag::{self, ResourceTag};

pub mod prelude {
    pub use crate::{
        CallOptions, CallOutput, ContainerJob, ExecutionMode, JobConfiguration, JobError,
        JobOptions, ResourceTag,
    };
}
