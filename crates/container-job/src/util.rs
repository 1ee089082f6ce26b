use std::env;
use std::process::Command;

/// Overrides the `--user` passed to docker.
pub const CONTAINER_USER_ENV: &str = "CONTAINER_JOB_USER";

/// Docker runs as the invoking user so files written to bound volumes stay
/// owned by that user.
pub(crate) fn container_user() -> String {
    if let Ok(value) = env::var(CONTAINER_USER_ENV) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    #[cfg(unix)]
    {
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        format!("{}:{}", uid, gid)
    }
    #[cfg(not(unix))]
    {
        "65534:65534".to_string()
    }
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = text[..end].to_string();
    truncated.push_str("… (truncated)");
    truncated
}

pub(crate) fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

fn needs_quoting(arg: &str) -> bool {
    arg.is_empty()
        || arg.chars().any(|c| {
            c.is_whitespace() || matches!(c, '"' | '\'' | '$' | '`' | '\\' | ';' | '&' | '|')
        })
}

/// Renders a spawned command the way it would be typed in a shell.
///
/// Environment set on the command itself is shown as `KEY=value` prefixes so
/// singularity invocations, which carry overrides in the environment, read
/// back in full.
pub fn command_line_string(cmd: &Command) -> String {
    let mut parts = Vec::new();
    for (key, value) in cmd.get_envs() {
        if let Some(value) = value {
            parts.push(format!(
                "{}={}",
                key.to_string_lossy(),
                quote(&value.to_string_lossy())
            ));
        }
    }
    parts.push(quote(&cmd.get_program().to_string_lossy()));
    for arg in cmd.get_args() {
        parts.push(quote(&arg.to_string_lossy()));
    }
    parts.join(" ")
}

fn quote(arg: &str) -> String {
    if needs_quoting(arg) {
        shell_escape(arg)
    } else {
        arg.to_string()
    }
}
