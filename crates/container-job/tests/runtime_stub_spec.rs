//! Container modes against stub runtime binaries that echo their invocation,
//! so the wrapping can be checked without docker or singularity installed.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use container_job::{CallOptions, ContainerJob, JobConfiguration, JobError, CONTAINER_USER_ENV};
use serial_test::serial;

const ECHO_STUB: &str = r#"#!/bin/sh
for arg in "$@"; do
  printf '%s\n' "$arg"
done
env | grep '^SINGULARITYENV_' || true
"#;

const FAILING_STUB: &str = r#"#!/bin/sh
echo "stub runtime refused" >&2
exit 125
"#;

fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
#[serial]
fn docker_invocation_wraps_command() {
    std::env::set_var(CONTAINER_USER_ENV, "1000:1000");
    let bin = tempfile::tempdir().unwrap();
    let stub = write_stub(bin.path(), "docker", ECHO_STUB);
    let vol = tempfile::tempdir().unwrap();
    fs::write(vol.path().join("foo"), "bar").unwrap();

    let config = JobConfiguration::docker("ubuntu:22.04")
        .with_docker_bin(stub.to_string_lossy())
        .with_volume(vol.path(), "/vol1");
    let job = ContainerJob::new(config).unwrap();

    let out = job
        .call(
            &["cat", "/vol1/foo"],
            &CallOptions::new().check_output().cwd("/bin").env("FOO", "BAR"),
        )
        .unwrap()
        .into_output()
        .unwrap();
    std::env::remove_var(CONTAINER_USER_ENV);

    let host = fs::canonicalize(vol.path()).unwrap();
    let expected = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--entrypoint".to_string(),
        String::new(),
        "--user".to_string(),
        "1000:1000".to_string(),
        "--volume".to_string(),
        format!("{}:/vol1", host.display()),
        "--workdir".to_string(),
        "/bin".to_string(),
        "--env".to_string(),
        "FOO=BAR".to_string(),
        "ubuntu:22.04".to_string(),
        "cat".to_string(),
        "/vol1/foo".to_string(),
    ];
    assert_eq!(out.lines().collect::<Vec<_>>(), expected);
}

#[test]
#[serial]
fn docker_exit_code_zero_without_check_output() {
    let bin = tempfile::tempdir().unwrap();
    let stub = write_stub(bin.path(), "docker", "#!/bin/sh\nexit 0\n");
    let job = ContainerJob::new(
        JobConfiguration::docker("img").with_docker_bin(stub.to_string_lossy()),
    )
    .unwrap();
    assert_eq!(job.run(&["ls"]).unwrap(), 0);
}

#[test]
#[serial]
fn singularity_invocation_passes_env_through_prefix() {
    let bin = tempfile::tempdir().unwrap();
    let stub = write_stub(bin.path(), "singularity", ECHO_STUB);
    let work = tempfile::tempdir().unwrap();

    let config = JobConfiguration::singularity("docker://ubuntu:22.04")
        .with_singularity_bin(stub.to_string_lossy())
        .with_work_dir(work.path());
    let job = ContainerJob::new(config).unwrap();

    let out = job
        .call(
            &["bash", "-c", "echo $FOO"],
            &CallOptions::new().check_output().env("FOO", "BAR"),
        )
        .unwrap()
        .into_output()
        .unwrap();
    let lines: Vec<&str> = out.lines().collect();

    assert_eq!(lines[0], "exec");
    assert_eq!(lines[1], "--contain");
    assert_eq!(lines[2], "--workdir");
    assert!(Path::new(lines[3]).starts_with(work.path()));
    assert!(lines.contains(&"SINGULARITYENV_FOO=BAR"));

    let image = lines
        .iter()
        .position(|l| *l == "docker://ubuntu:22.04")
        .unwrap();
    assert_eq!(&lines[image + 1..image + 4], &["bash", "-c", "echo $FOO"]);

    // scratch directory is gone once the call returns
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
}

#[test]
#[serial]
fn runtime_failure_carries_image_and_stderr() {
    let bin = tempfile::tempdir().unwrap();
    let stub = write_stub(bin.path(), "docker", FAILING_STUB);
    let job = ContainerJob::new(
        JobConfiguration::docker("ubuntu:22.04").with_docker_bin(stub.to_string_lossy()),
    )
    .unwrap();

    let err = job
        .call(&["florentino-ariza"], &CallOptions::new().check_output())
        .unwrap_err();
    let call = err.as_system_call().unwrap();
    assert_eq!(call.exit_code(), Some(125));
    assert_eq!(call.image.as_deref(), Some("ubuntu:22.04"));
    assert!(call.stderr().unwrap().contains("stub runtime refused"));
    assert!(err.to_string().contains("ubuntu:22.04"));
}

#[test]
fn missing_runtime_binary_is_a_spawn_failure() {
    let job = ContainerJob::new(
        JobConfiguration::singularity("img").with_singularity_bin("/definitely/not/singularity"),
    )
    .unwrap();
    let err = job.run(&["ls"]).unwrap_err();
    assert!(err.as_system_call().unwrap().is_spawn_failure());
}

#[test]
fn missing_volume_source_is_rejected_before_spawn() {
    let job = ContainerJob::new(
        JobConfiguration::docker("img")
            .with_docker_bin("/definitely/not/docker")
            .with_volume("/definitely/not/here", "/vol1"),
    )
    .unwrap();
    let err = job.run(&["ls"]).unwrap_err();
    assert!(matches!(err, JobError::Usage { .. }));
}

#[test]
fn both_runtimes_rejected_before_any_command() {
    let err = JobConfiguration::from_yaml_str("docker: foo\nsingularity: bar\n").unwrap_err();
    assert!(matches!(err, JobError::Usage { .. }));
    assert!(err
        .to_string()
        .contains("use docker or singularity, not both."));
}

#[test]
fn build_command_renders_without_running() {
    let job = ContainerJob::new(
        JobConfiguration::docker("img").with_docker_bin("/definitely/not/docker"),
    )
    .unwrap();
    let prepared = job
        .build_command(&["bash", "-c", "echo $FOO"], &CallOptions::new())
        .unwrap();
    let line = prepared.command_line();
    assert!(line.starts_with("/definitely/not/docker run --rm --entrypoint ''"));
    assert!(line.ends_with("img bash -c 'echo $FOO'"));
}
