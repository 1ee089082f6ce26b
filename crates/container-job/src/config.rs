use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{JobError, JobResult};

/// Batch system whose job names carry resource annotations.
pub const CUSTOM_LSF_BATCH_SYSTEM: &str = "CustomLSF";

pub const DEFAULT_DOCKER_BIN: &str = "docker";
pub const DEFAULT_SINGULARITY_BIN: &str = "singularity";

const BOTH_RUNTIMES_MESSAGE: &str = "use docker or singularity, not both.";

/// Where a job's commands run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Host,
    Docker { image: String },
    Singularity { image: String },
}

impl ExecutionMode {
    pub fn image(&self) -> Option<&str> {
        match self {
            ExecutionMode::Host => None,
            ExecutionMode::Docker { image } | ExecutionMode::Singularity { image } => Some(image),
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, ExecutionMode::Host)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMode::Host => "host",
            ExecutionMode::Docker { .. } => "docker",
            ExecutionMode::Singularity { .. } => "singularity",
        }
    }
}

/// A host directory exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl VolumeBinding {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
        }
    }
}

/// Serialized form of a job configuration, as read from YAML/JSON.
///
/// Both `docker` and `singularity` may appear here; the conflict is rejected
/// when this is converted into a [`JobConfiguration`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfigSpec {
    #[serde(default)]
    pub docker: Option<String>,
    #[serde(default)]
    pub singularity: Option<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub volumes: Vec<(PathBuf, String)>,
    #[serde(default)]
    pub batch_system: Option<String>,
    /// Runtime estimate in minutes.
    #[serde(default)]
    pub runtime: Option<u64>,
    #[serde(default)]
    pub unit_name: Option<String>,
    #[serde(default)]
    pub docker_bin: Option<String>,
    #[serde(default)]
    pub singularity_bin: Option<String>,
}

impl JobConfigSpec {
    fn execution_mode(&self) -> JobResult<ExecutionMode> {
        match (&self.docker, &self.singularity) {
            (Some(_), Some(_)) => Err(JobError::usage(BOTH_RUNTIMES_MESSAGE)),
            (Some(image), None) => Ok(ExecutionMode::Docker {
                image: image.clone(),
            }),
            (None, Some(image)) => Ok(ExecutionMode::Singularity {
                image: image.clone(),
            }),
            (None, None) => Ok(ExecutionMode::Host),
        }
    }
}

impl TryFrom<JobConfigSpec> for JobConfiguration {
    type Error = JobError;

    fn try_from(spec: JobConfigSpec) -> JobResult<Self> {
        let mode = spec.execution_mode()?;
        let config = JobConfiguration {
            mode,
            work_dir: spec.work_dir,
            volumes: spec
                .volumes
                .into_iter()
                .map(|(host, container)| VolumeBinding::new(host, container))
                .collect(),
            batch_system: spec.batch_system,
            runtime_minutes: spec.runtime,
            unit_name: spec.unit_name,
            docker_bin: spec
                .docker_bin
                .unwrap_or_else(|| DEFAULT_DOCKER_BIN.to_string()),
            singularity_bin: spec
                .singularity_bin
                .unwrap_or_else(|| DEFAULT_SINGULARITY_BIN.to_string()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Everything a [`crate::ContainerJob`] needs to know about where and how its
/// commands run. Read-only once the job is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfiguration {
    mode: ExecutionMode,
    work_dir: Option<PathBuf>,
    volumes: Vec<VolumeBinding>,
    batch_system: Option<String>,
    runtime_minutes: Option<u64>,
    unit_name: Option<String>,
    docker_bin: String,
    singularity_bin: String,
}

impl Default for JobConfiguration {
    fn default() -> Self {
        Self::host()
    }
}

impl JobConfiguration {
    pub fn host() -> Self {
        Self::with_mode(ExecutionMode::Host)
    }

    pub fn docker(image: impl Into<String>) -> Self {
        Self::with_mode(ExecutionMode::Docker {
            image: image.into(),
        })
    }

    pub fn singularity(image: impl Into<String>) -> Self {
        Self::with_mode(ExecutionMode::Singularity {
            image: image.into(),
        })
    }

    fn with_mode(mode: ExecutionMode) -> Self {
        Self {
            mode,
            work_dir: None,
            volumes: Vec::new(),
            batch_system: None,
            runtime_minutes: None,
            unit_name: None,
            docker_bin: DEFAULT_DOCKER_BIN.to_string(),
            singularity_bin: DEFAULT_SINGULARITY_BIN.to_string(),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_volume(
        mut self,
        host_path: impl Into<PathBuf>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push(VolumeBinding::new(host_path, container_path));
        self
    }

    pub fn with_batch_system(mut self, batch_system: impl Into<String>) -> Self {
        self.batch_system = Some(batch_system.into());
        self
    }

    pub fn with_runtime_minutes(mut self, minutes: u64) -> Self {
        self.runtime_minutes = Some(minutes);
        self
    }

    pub fn with_unit_name(mut self, unit_name: impl Into<String>) -> Self {
        self.unit_name = Some(unit_name.into());
        self
    }

    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    pub fn with_singularity_bin(mut self, bin: impl Into<String>) -> Self {
        self.singularity_bin = bin.into();
        self
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn volumes(&self) -> &[VolumeBinding] {
        &self.volumes
    }

    pub fn batch_system(&self) -> Option<&str> {
        self.batch_system.as_deref()
    }

    pub fn runtime_minutes(&self) -> Option<u64> {
        self.runtime_minutes
    }

    pub fn unit_name(&self) -> Option<&str> {
        self.unit_name.as_deref()
    }

    pub fn docker_bin(&self) -> &str {
        &self.docker_bin
    }

    pub fn singularity_bin(&self) -> &str {
        &self.singularity_bin
    }

    /// Rejects configurations that could only fail once a command runs.
    ///
    /// Runs for every loaded configuration and again when a
    /// [`crate::ContainerJob`] is built, so builder-made values get the same
    /// checks.
    pub fn validate(&self) -> JobResult<()> {
        self.check().map_err(|err| JobError::Config {
            message: err.to_string(),
        })
    }

    fn check(&self) -> Result<()> {
        if let Some(image) = self.mode.image() {
            if image.trim().is_empty() {
                anyhow::bail!("{} image reference cannot be empty", self.mode.name());
            }
        }

        for volume in &self.volumes {
            if volume.host_path.as_os_str().is_empty() {
                anyhow::bail!(
                    "Volume for '{}' has an empty host path",
                    volume.container_path
                );
            }
            if !volume.container_path.starts_with('/') {
                anyhow::bail!(
                    "Volume target '{}' must be an absolute container path",
                    volume.container_path
                );
            }
        }

        for (field, bin) in [
            ("dockerBin", &self.docker_bin),
            ("singularityBin", &self.singularity_bin),
        ] {
            if bin.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", field);
            }
        }

        if let Some(name) = &self.unit_name {
            if resource_tag::contains_sentinel(name) {
                anyhow::bail!("unitName '{}' contains a reserved resource marker", name);
            }
        }

        Ok(())
    }

    /// Whether job names should carry resource annotations.
    pub fn annotates_unit_name(&self) -> bool {
        self.batch_system.as_deref() == Some(CUSTOM_LSF_BATCH_SYSTEM)
    }

    pub fn from_yaml_str(raw: &str) -> JobResult<Self> {
        let spec: JobConfigSpec = serde_yaml::from_str(raw).map_err(|e| JobError::Config {
            message: format!("YAML parsing failed: {}", e),
        })?;
        spec.try_into()
    }

    pub fn from_json_str(raw: &str) -> JobResult<Self> {
        let spec: JobConfigSpec = serde_json::from_str(raw).map_err(|e| JobError::Config {
            message: format!("JSON parsing failed: {}", e),
        })?;
        spec.try_into()
    }

    /// Loads a configuration file; `.json` files are read as JSON, anything
    /// else as YAML.
    #[instrument]
    pub fn from_path(path: &Path) -> JobResult<Self> {
        debug!("Loading job configuration from {}", path.display());
        let raw = fs::read_to_string(path).map_err(|e| JobError::Config {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    /// Builds a configuration from `CONTAINER_JOB_*` environment variables.
    pub fn from_env() -> JobResult<Self> {
        let spec = spec_from_env().map_err(|err| JobError::Config {
            message: err.to_string(),
        })?;
        spec.try_into()
    }
}

pub const DOCKER_ENV: &str = "CONTAINER_JOB_DOCKER";
pub const SINGULARITY_ENV: &str = "CONTAINER_JOB_SINGULARITY";
pub const WORK_DIR_ENV: &str = "CONTAINER_JOB_WORK_DIR";
pub const VOLUMES_ENV: &str = "CONTAINER_JOB_VOLUMES";
pub const BATCH_SYSTEM_ENV: &str = "CONTAINER_JOB_BATCH_SYSTEM";
pub const RUNTIME_ENV: &str = "CONTAINER_JOB_RUNTIME";
pub const UNIT_NAME_ENV: &str = "CONTAINER_JOB_UNIT_NAME";
pub const DOCKER_BIN_ENV: &str = "CONTAINER_JOB_DOCKER_BIN";
pub const SINGULARITY_BIN_ENV: &str = "CONTAINER_JOB_SINGULARITY_BIN";

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn spec_from_env() -> Result<JobConfigSpec> {
    let runtime = match non_empty_var(RUNTIME_ENV) {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            anyhow::anyhow!("{} must be a whole number of minutes, got '{}'", RUNTIME_ENV, raw)
        })?),
        None => None,
    };
    let volumes = match non_empty_var(VOLUMES_ENV) {
        Some(raw) => parse_volumes(&raw)?,
        None => Vec::new(),
    };

    Ok(JobConfigSpec {
        docker: non_empty_var(DOCKER_ENV),
        singularity: non_empty_var(SINGULARITY_ENV),
        work_dir: non_empty_var(WORK_DIR_ENV).map(PathBuf::from),
        volumes,
        batch_system: non_empty_var(BATCH_SYSTEM_ENV),
        runtime,
        unit_name: non_empty_var(UNIT_NAME_ENV),
        docker_bin: non_empty_var(DOCKER_BIN_ENV),
        singularity_bin: non_empty_var(SINGULARITY_BIN_ENV),
    })
}

/// Parses the compact volume list: `<host>:<container>,<host>:<container>`.
fn parse_volumes(raw: &str) -> Result<Vec<(PathBuf, String)>> {
    let mut volumes = Vec::new();
    for (idx, entry) in raw.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (host, container) = entry
            .rsplit_once(':')
            .map(|(h, c)| (h.trim(), c.trim()))
            .filter(|(h, c)| !h.is_empty() && !c.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{} entry #{} must look like '<host>:<container>', got '{}'",
                    VOLUMES_ENV,
                    idx + 1,
                    entry
                )
            })?;
        volumes.push((PathBuf::from(host), container.to_string()));
    }
    Ok(volumes)
}
