use std::fmt;
use std::sync::Arc;

use resource_tag::ResourceTag;
use tracing::{debug, instrument};

use crate::config::JobConfiguration;
use crate::dispatch::{self, CallOptions, CallOutput, PreparedCommand};
use crate::error::{JobError, JobResult};
use crate::report::{FailureReporter, TracingReporter};

/// Display name used when the caller does not supply one.
pub const DEFAULT_DISPLAY_NAME: &str = "ContainerJob";

/// Construction-time overrides for a [`ContainerJob`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub display_name: Option<String>,
    /// Scheduler-facing name. Falls back to the configuration's unit name.
    pub unit_name: Option<String>,
    /// Falls back to the configuration's runtime estimate.
    pub runtime_minutes: Option<u64>,
    pub cores: Option<u32>,
    pub memory_mb: Option<u64>,
    /// Setting a tool name enables failure reporting through [`TracingReporter`].
    pub tool_name: Option<String>,
    pub tool_release: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn unit_name(mut self, name: impl Into<String>) -> Self {
        self.unit_name = Some(name.into());
        self
    }

    pub fn runtime_minutes(mut self, minutes: u64) -> Self {
        self.runtime_minutes = Some(minutes);
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn tool(mut self, name: impl Into<String>, release: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_release = Some(release.into());
        self
    }
}

/// Identity of a job as seen by reporters and schedulers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub display_name: String,
    /// Scheduler-facing name, carrying the resource annotation when the batch
    /// system expects one.
    pub unit_name: String,
    pub resources: ResourceTag,
    pub tool_name: Option<String>,
    pub tool_release: Option<String>,
}

/// A workflow job whose commands run on the host or in a container.
pub struct ContainerJob {
    config: JobConfiguration,
    info: JobInfo,
    reporter: Option<Arc<dyn FailureReporter>>,
}

impl fmt::Debug for ContainerJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerJob")
            .field("config", &self.config)
            .field("info", &self.info)
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

impl ContainerJob {
    pub fn new(config: JobConfiguration) -> JobResult<Self> {
        Self::with_options(config, JobOptions::default())
    }

    /// Builds the job and fixes its names.
    ///
    /// The resource annotation is computed here, once. It is only written
    /// into the unit name when the configured batch system reads it.
    pub fn with_options(config: JobConfiguration, options: JobOptions) -> JobResult<Self> {
        config.validate()?;

        let resources = ResourceTag::new(
            options.runtime_minutes.or(config.runtime_minutes()),
            options.cores,
            options.memory_mb,
        );

        let base = options
            .unit_name
            .or_else(|| config.unit_name().map(str::to_string))
            .unwrap_or_default();
        if resource_tag::contains_sentinel(&base) {
            return Err(JobError::usage(format!(
                "unit name '{}' contains a reserved resource marker",
                base
            )));
        }
        let unit_name = if config.annotates_unit_name() {
            resources.annotate(&base)?
        } else {
            base
        };

        let display_name = options
            .display_name
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());
        if display_name.trim().is_empty() {
            return Err(JobError::usage("display name cannot be empty"));
        }

        let reporter: Option<Arc<dyn FailureReporter>> = options
            .tool_name
            .is_some()
            .then(|| Arc::new(TracingReporter) as Arc<dyn FailureReporter>);

        debug!(%display_name, %unit_name, mode = config.mode().name(), "job created");

        Ok(Self {
            config,
            info: JobInfo {
                display_name,
                unit_name,
                resources,
                tool_name: options.tool_name,
                tool_release: options.tool_release,
            },
            reporter,
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn config(&self) -> &JobConfiguration {
        &self.config
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn display_name(&self) -> &str {
        &self.info.display_name
    }

    pub fn unit_name(&self) -> &str {
        &self.info.unit_name
    }

    pub fn resources(&self) -> &ResourceTag {
        &self.info.resources
    }

    /// Runs `command` and blocks until it exits.
    ///
    /// Returns the captured stdout when `options.check_output` is set and the
    /// exit code otherwise. A non-zero exit is an error in both cases.
    #[instrument(
        skip(self, command, options),
        fields(job = %self.info.display_name, mode = self.config.mode().name())
    )]
    pub fn call<S: AsRef<str>>(
        &self,
        command: &[S],
        options: &CallOptions,
    ) -> JobResult<CallOutput> {
        let result = dispatch::prepare(&self.config, command, options)
            .and_then(|prepared| prepared.run(options.check_output));

        if let (Err(error), Some(reporter)) = (&result, &self.reporter) {
            reporter.report(&self.info, error);
        }
        result
    }

    /// Runs `command` with inherited stdout, returning its exit code.
    pub fn run<S: AsRef<str>>(&self, command: &[S]) -> JobResult<i32> {
        let out = self.call(command, &CallOptions::new())?;
        Ok(out.exit_code().unwrap_or(0))
    }

    /// Runs `command` and returns its stdout without trailing line breaks.
    pub fn check_output<S: AsRef<str>>(&self, command: &[S]) -> JobResult<String> {
        let out = self.call(command, &CallOptions::new().check_output())?;
        Ok(out.into_output().unwrap_or_default())
    }

    /// Resolves the command that [`ContainerJob::call`] would spawn, without
    /// running it. Any scratch directory lives as long as the returned value.
    pub fn build_command<S: AsRef<str>>(
        &self,
        command: &[S],
        options: &CallOptions,
    ) -> JobResult<PreparedCommand> {
        dispatch::prepare(&self.config, command, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl FailureReporter for Recorder {
        fn report(&self, job: &JobInfo, error: &JobError) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{}:{}", job.display_name, error.code()));
        }
    }

    #[test]
    fn display_name_defaults_to_type_tag() {
        let job = ContainerJob::new(JobConfiguration::host()).unwrap();
        assert_eq!(job.display_name(), "ContainerJob");
        assert_eq!(job.unit_name(), "");
    }

    #[test]
    fn runtime_falls_back_to_configuration() {
        let config = JobConfiguration::host()
            .with_batch_system("CustomLSF")
            .with_runtime_minutes(20)
            .with_unit_name("sort");
        let job = ContainerJob::new(config).unwrap();
        assert_eq!(job.resources().runtime_minutes, Some(20));
        assert_eq!(job.unit_name(), "sort__rsrcruntime=20rsrc__");
    }

    #[test]
    fn explicit_overrides_win() {
        let config = JobConfiguration::host()
            .with_batch_system("CustomLSF")
            .with_runtime_minutes(20)
            .with_unit_name("sort");
        let options = JobOptions::new()
            .unit_name("merge")
            .runtime_minutes(5)
            .cores(2);
        let job = ContainerJob::with_options(config, options).unwrap();
        assert_eq!(job.unit_name(), "merge__rsrcruntime=5;cores=2rsrc__");
    }

    #[test]
    fn other_batch_systems_keep_plain_names() {
        let config = JobConfiguration::host().with_batch_system("slurm");
        let job =
            ContainerJob::with_options(config, JobOptions::new().unit_name("foo").cores(4))
                .unwrap();
        assert_eq!(job.unit_name(), "foo");
        assert_eq!(job.resources().cores, Some(4));
    }

    #[test]
    fn reserved_marker_in_unit_name_is_a_usage_error() {
        let config = JobConfiguration::host().with_batch_system("CustomLSF");
        let err = ContainerJob::with_options(
            config,
            JobOptions::new().unit_name("bad__rsrc").runtime_minutes(1),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Usage { .. }));
    }

    #[test]
    fn reserved_marker_is_rejected_for_any_batch_system() {
        for config in [
            JobConfiguration::host(),
            JobConfiguration::host().with_batch_system("slurm"),
        ] {
            let err = ContainerJob::with_options(config, JobOptions::new().unit_name("a__rsrc"))
                .unwrap_err();
            assert!(matches!(err, JobError::Usage { .. }));
        }
    }

    #[test]
    fn builder_configuration_is_validated_before_any_call() {
        let config = JobConfiguration::docker("img").with_volume("/tmp", "vol1");
        let err = ContainerJob::new(config).unwrap_err();
        assert!(matches!(err, JobError::Config { .. }));
        assert!(err.to_string().contains("absolute container path"));

        let err = ContainerJob::new(JobConfiguration::docker("")).unwrap_err();
        assert!(matches!(err, JobError::Config { .. }));
    }

    #[test]
    fn empty_display_name_is_rejected() {
        let err = ContainerJob::with_options(
            JobConfiguration::host(),
            JobOptions::new().display_name("  "),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Usage { .. }));
    }

    #[test]
    fn reporter_sees_failures_and_error_still_propagates() {
        let recorder = Arc::new(Recorder::default());
        let job = ContainerJob::new(JobConfiguration::host())
            .unwrap()
            .with_reporter(recorder.clone());

        let empty: [&str; 0] = [];
        assert!(job.call(&empty, &CallOptions::new()).is_err());
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            &["ContainerJob:CONTAINER_JOB_USAGE".to_string()]
        );
    }

    #[test]
    fn tool_name_installs_tracing_reporter() {
        let job = ContainerJob::with_options(
            JobConfiguration::host(),
            JobOptions::new().tool("toolkit", "1.0"),
        )
        .unwrap();
        assert!(job.reporter.is_some());
        assert_eq!(job.info().tool_release.as_deref(), Some("1.0"));
    }

    #[test]
    fn container_job_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ContainerJob>();
    }
}
