//! Command Executor: local and remote (SSH) command execution (Section 4.2).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

const LOCAL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Outcome of a command execution. `error` is set whenever the exit code was
/// non-zero; `output` is always populated with whatever stdout/stderr was
/// captured, even on failure (Section 4.2: "partial output is still
/// returned").
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub output: String,
    pub error: Option<String>,
}

/// Run `command` under a shell in `working_dir` with `env` merged over the
/// caller's own environment. Hard timeout of 30 minutes.
pub async fn execute(
    command: &str,
    working_dir: &std::path::Path,
    env: &HashMap<String, String>,
) -> Result<ExecResult> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn()?;

    let output = match timeout(LOCAL_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(command, timeout_secs = LOCAL_TIMEOUT.as_secs(), "local command timed out");
            return Err(ExecutorError::Timeout(LOCAL_TIMEOUT));
        }
    };

    Ok(combine(&output.stdout, &output.stderr, output.status.code()))
}

/// Remote execution target.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub deploy_path: String,
    pub connect_timeout_secs: u32,
}

/// Run `command` on `target` over `ssh`, using `keyPath` for authentication.
/// `env` entries are exported before `cd`-ing into the deploy path and
/// running the command (Section 4.2).
pub async fn execute_remote(
    command: &str,
    target: &RemoteTarget,
    key_path: &std::path::Path,
    env: &HashMap<String, String>,
) -> Result<ExecResult> {
    let exports: String = env
        .iter()
        .map(|(k, v)| format!("export {}={}; ", k, shell_quote(v)))
        .collect();
    let remote_command = format!(
        "{}cd {} && {}",
        exports,
        shell_quote(&target.deploy_path),
        command
    );

    let mut cmd = Command::new("ssh");
    cmd.args(ssh_flags(target, key_path))
        .arg(format!("{}@{}", target.user, target.host))
        .arg(remote_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = cmd.output().await?;
    Ok(combine(&output.stdout, &output.stderr, output.status.code()))
}

/// Upload `local_path` to `<deployPath>/` on `target` via `scp`.
pub async fn scp_upload(
    local_path: &std::path::Path,
    target: &RemoteTarget,
    key_path: &std::path::Path,
) -> Result<ExecResult> {
    let destination = format!(
        "{}@{}:{}/",
        target.user, target.host, target.deploy_path
    );

    let mut cmd = Command::new("scp");
    cmd.args(ssh_flags(target, key_path))
        .arg(local_path)
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = cmd.output().await?;
    Ok(combine(&output.stdout, &output.stderr, output.status.code()))
}

/// Launch `command` in the background on `target`, surviving the SSH
/// session, killing any prior listener on `port` first (Section 4.2: "a
/// cleanup that kills any prior listener on the application port").
pub async fn execute_remote_background(
    command: &str,
    port: u16,
    target: &RemoteTarget,
    key_path: &std::path::Path,
    env: &HashMap<String, String>,
) -> Result<ExecResult> {
    let kill_prior = format!(
        "fuser -k {port}/tcp 2>/dev/null || true; sleep 1;",
        port = port
    );
    let wrapped = format!(
        "{kill_prior} nohup {command} > nohup.out 2>&1 & disown",
        kill_prior = kill_prior,
        command = command
    );
    execute_remote(&wrapped, target, key_path, env).await
}

fn ssh_flags(target: &RemoteTarget, key_path: &std::path::Path) -> Vec<String> {
    vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "IdentitiesOnly=yes".into(),
        "-o".into(),
        format!("ConnectTimeout={}", target.connect_timeout_secs),
        "-i".into(),
        key_path.display().to_string(),
    ]
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn combine(stdout: &[u8], stderr: &[u8], exit_code: Option<i32>) -> ExecResult {
    let stdout_str = String::from_utf8_lossy(stdout);
    let stderr_str = String::from_utf8_lossy(stderr);
    let output = if stderr_str.is_empty() {
        stdout_str.to_string()
    } else {
        format!("{stdout_str}\n--- STDERR ---\n{stderr_str}")
    };

    let error = match exit_code {
        Some(0) => None,
        Some(code) => Some(format!("command exited with status {code}")),
        None => Some("command terminated by signal".to_string()),
    };

    ExecResult { output, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn execute_captures_stdout_on_success() {
        let result = execute("echo hello", &PathBuf::from("/tmp"), &HashMap::new())
            .await
            .unwrap();
        assert!(result.output.contains("hello"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn execute_reports_error_on_nonzero_exit() {
        let result = execute("exit 3", &PathBuf::from("/tmp"), &HashMap::new())
            .await
            .unwrap();
        assert!(result.error.unwrap().contains("3"));
    }

    #[tokio::test]
    async fn execute_returns_partial_output_on_failure() {
        let result = execute("echo partial; exit 1", &PathBuf::from("/tmp"), &HashMap::new())
            .await
            .unwrap();
        assert!(result.output.contains("partial"));
        assert!(result.error.is_some());
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
