//! docker-compose Container Runtime
//!
//! One compose project per job, named `<prefix>_<job id>`. Images must be
//! built on the host beforehand; `up` never builds.

use crate::application::config::HarnessConfig;
use crate::domain::runtime::ContainerRuntime;
use crate::domain::value_objects::Port;
use crate::error::{HarnessError, HarnessResult};
use kernel::id::JobId;
use platform::process::{self, CommandSpec};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    program: String,
    base_args: Vec<String>,
    dir: PathBuf,
    project_prefix: String,
    flag: Option<String>,
    timeout: Option<Duration>,
}

impl ComposeRuntime {
    pub fn from_config(config: &HarnessConfig) -> Self {
        let mut words = config.compose_command.split_whitespace().map(str::to_string);
        let program = words.next().unwrap_or_else(|| "docker-compose".to_string());

        Self {
            program,
            base_args: words.collect(),
            dir: config.compose_dir.clone(),
            project_prefix: config.compose_project_prefix.clone(),
            flag: config.flag.clone(),
            timeout: config.compose_timeout,
        }
    }

    pub fn project_name(&self, job_id: JobId) -> String {
        format!("{}_{}", self.project_prefix, job_id)
    }

    fn command(&self, job_id: JobId) -> CommandSpec {
        CommandSpec::new(&self.program)
            .args(self.base_args.iter().cloned())
            .args(["-p".to_string(), self.project_name(job_id)])
            .current_dir(&self.dir)
            .timeout(self.timeout)
    }

    pub fn up_command(&self, job_id: JobId, port: Port) -> CommandSpec {
        self.command(job_id)
            .args(["up", "-d", "--no-build"])
            .env("PORT", port.to_string())
            .env("FLAG", self.flag.clone().unwrap_or_default())
    }

    pub fn down_command(&self, job_id: JobId) -> CommandSpec {
        self.command(job_id).args(["down", "-t", "0"])
    }
}

impl ContainerRuntime for ComposeRuntime {
    async fn up(&self, job_id: JobId, port: Port) -> HarnessResult<()> {
        process::run(&self.up_command(job_id, port))
            .await
            .map_err(|e| HarnessError::LaunchFailure(e.to_string()))
    }

    async fn down(&self, job_id: JobId) -> HarnessResult<()> {
        process::run(&self.down_command(job_id))
            .await
            .map_err(|e| HarnessError::TeardownFailure(e.to_string()))
    }
}
