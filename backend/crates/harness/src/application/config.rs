//! Application Configuration
//!
//! Configuration for the harness application layer, read from the
//! environment by the server binary.

use crate::error::{HarnessError, HarnessResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Harness configuration
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// HTTP / WebSocket listen port
    pub listen_port: u16,
    /// Number of concurrent worker loops
    pub max_workers: usize,
    /// Global ceiling on leased, non-completed jobs
    pub max_instances: u64,
    /// Pause between `accepted` and the container start
    pub launch_delay: Duration,
    /// Lease granted to a running job
    pub lease: Duration,
    /// Challenge lifetime
    pub challenge_ttl: Duration,
    /// Interval between `position` updates for a queued connection
    pub position_interval: Duration,
    /// Sleep when a worker or the reaper finds nothing to do
    pub idle_poll: Duration,
    /// Port candidates tried before giving up
    pub max_port_attempts: u32,
    /// Base of the URL handed to clients, port appended
    pub target_host: String,
    /// Secret injected into every container as `FLAG`
    pub flag: Option<String>,
    /// Compose executable, optionally followed by a subcommand (`docker compose`)
    pub compose_command: String,
    /// Directory holding the compose file
    pub compose_dir: PathBuf,
    pub compose_project_prefix: String,
    /// `None` waits for the compose tool indefinitely
    pub compose_timeout: Option<Duration>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            listen_port: 1064,
            max_workers: 4,
            max_instances: 32,
            launch_delay: Duration::from_millis(2000),
            lease: Duration::from_secs(15 * 60),
            challenge_ttl: Duration::from_secs(5 * 60),
            position_interval: Duration::from_millis(5000),
            idle_poll: Duration::from_millis(1000),
            max_port_attempts: 64,
            target_host: "http://localhost".to_string(),
            flag: None,
            compose_command: "docker-compose".to_string(),
            compose_dir: PathBuf::from("problem"),
            compose_project_prefix: "problem_harness".to_string(),
            compose_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl HarnessConfig {
    /// Load from process environment, falling back to defaults
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> HarnessResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let compose_timeout_secs: u64 = parse_or(&lookup, "COMPOSE_TIMEOUT_SECS", 120)?;

        Ok(Self {
            listen_port: parse_or(&lookup, "PORT", defaults.listen_port)?,
            max_workers: positive(
                "MAX_WORKERS",
                parse_or(&lookup, "MAX_WORKERS", defaults.max_workers)?,
            )?,
            max_instances: parse_or(&lookup, "MAX_INSTANCES", defaults.max_instances)?,
            launch_delay: Duration::from_millis(parse_or(&lookup, "LAUNCH_DELAY_MS", 2000)?),
            lease: Duration::from_secs(parse_or(&lookup, "LEASE_SECS", 900)?),
            challenge_ttl: Duration::from_secs(parse_or(&lookup, "CHALLENGE_TTL_SECS", 300)?),
            position_interval: Duration::from_millis(positive(
                "POSITION_INTERVAL_MS",
                parse_or(&lookup, "POSITION_INTERVAL_MS", 5000)?,
            )?),
            idle_poll: Duration::from_millis(positive(
                "IDLE_POLL_MS",
                parse_or(&lookup, "IDLE_POLL_MS", 1000u64)?,
            )?),
            max_port_attempts: positive(
                "MAX_PORT_ATTEMPTS",
                parse_or(&lookup, "MAX_PORT_ATTEMPTS", defaults.max_port_attempts)?,
            )?,
            target_host: lookup("TARGET_HOST").unwrap_or(defaults.target_host),
            flag: lookup("FLAG").filter(|flag| !flag.is_empty()),
            compose_command: lookup("COMPOSE_COMMAND").unwrap_or(defaults.compose_command),
            compose_dir: lookup("COMPOSE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.compose_dir),
            compose_project_prefix: lookup("COMPOSE_PROJECT_PREFIX")
                .unwrap_or(defaults.compose_project_prefix),
            compose_timeout: (compose_timeout_secs > 0)
                .then(|| Duration::from_secs(compose_timeout_secs)),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> HarnessResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| HarnessError::InvalidConfig {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn positive<T>(key: &str, value: T) -> HarnessResult<T>
where
    T: Default + PartialEq + ToString,
{
    if value == T::default() {
        Err(HarnessError::InvalidConfig {
            key: key.to_string(),
            value: value.to_string(),
        })
    } else {
        Ok(value)
    }
}
