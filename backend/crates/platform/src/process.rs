//! Subprocess Execution
//!
//! Runs an external tool to completion. Standard output and standard error
//! are inherited so the tool's diagnostics land in the host's streams; only
//! the exit status is inspected.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {}", describe_code(.code))]
    NonZeroExit { program: String, code: Option<i32> },

    #[error("`{program}` did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Description of a single tool invocation
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Added on top of the host environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

/// Run the command and succeed only on exit status 0
///
/// On timeout the child is killed before returning.
pub async fn run(spec: &CommandSpec) -> Result<(), ProcessError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }

    tracing::debug!(program = %spec.program, args = ?spec.args, "Spawning subprocess");

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let status = match spec.timeout {
        Some(after) => match tokio::time::timeout(after, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(program = %spec.program, error = %e, "Failed to kill timed out subprocess");
                }
                return Err(ProcessError::TimedOut {
                    program: spec.program.clone(),
                    after,
                });
            }
        },
        None => child.wait().await,
    }
    .map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::NonZeroExit {
            program: spec.program.clone(),
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_records_invocation() {
        let spec = CommandSpec::new("docker-compose")
            .args(["-p", "demo"])
            .arg("up")
            .env("PORT", "2048")
            .env("PORT", "4096")
            .current_dir("/srv/problem");

        assert_eq!(spec.program(), "docker-compose");
        assert_eq!(spec.get_args(), ["-p", "demo", "up"]);
        assert_eq!(spec.get_env("PORT"), Some("4096"));
        assert_eq!(spec.get_env("FLAG"), None);
        assert_eq!(spec.get_current_dir(), Some(Path::new("/srv/problem")));
    }

    #[tokio::test]
    async fn test_run_success() {
        assert!(run(&CommandSpec::new("true")).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_non_zero_exit() {
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        match run(&spec).await {
            Err(ProcessError::NonZeroExit { code, .. }) => assert_eq!(code, Some(3)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_passes_environment() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "test \"$PORT\" = 2048"])
            .env("PORT", "2048");
        assert!(run(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-4f1c");
        assert!(matches!(run(&spec).await, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(50)));
        assert!(matches!(run(&spec).await, Err(ProcessError::TimedOut { .. })));
    }
}
