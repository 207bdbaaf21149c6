//! Harness configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration shared by every harness operation.
///
/// Per-call options (see [`ActivateOptions`](crate::ActivateOptions)) override
/// these values for a single call, so slow scenarios do not require global
/// reconfiguration.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ironcheck::HarnessConfig;
///
/// let config = HarnessConfig {
///     activate_request_timeout: Duration::from_secs(2),
///     poll_interval: Duration::from_millis(10),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Default deadline for job activation and completion polling.
    ///
    /// Default: 5 seconds.
    pub activate_request_timeout: Duration,

    /// Sleep between two probe attempts while polling.
    ///
    /// Keep this small relative to the timeout. Default: 25ms.
    pub poll_interval: Duration,

    /// Prefix for generated worker identities.
    ///
    /// A random suffix is appended per activation. Default: `harness-worker-`.
    pub default_worker_prefix: String,

    /// How long an activated job stays leased to the harness worker.
    ///
    /// After this the broker may hand the job to another worker.
    /// Default: 5 minutes.
    pub job_timeout: Duration,

    /// Directory searched for `<process>.bpmn` when a process is auto-deployed.
    ///
    /// Default: `fixtures`.
    pub workflow_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            activate_request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(25),
            default_worker_prefix: "harness-worker-".to_string(),
            job_timeout: Duration::from_secs(300), // 5 minutes
            workflow_dir: PathBuf::from("fixtures"),
        }
    }
}

impl HarnessConfig {
    /// Build a configuration from defaults overlaid with environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `IRONCHECK_TIMEOUT_MS` | `activate_request_timeout` |
    /// | `IRONCHECK_POLL_INTERVAL_MS` | `poll_interval` |
    /// | `IRONCHECK_WORKER_PREFIX` | `default_worker_prefix` |
    /// | `IRONCHECK_JOB_TIMEOUT_MS` | `job_timeout` |
    /// | `IRONCHECK_WORKFLOW_DIR` | `workflow_dir` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = millis(&lookup, "IRONCHECK_TIMEOUT_MS")? {
            config.activate_request_timeout = ms;
        }
        if let Some(ms) = millis(&lookup, "IRONCHECK_POLL_INTERVAL_MS")? {
            config.poll_interval = ms;
        }
        if let Some(ms) = millis(&lookup, "IRONCHECK_JOB_TIMEOUT_MS")? {
            config.job_timeout = ms;
        }
        if let Some(prefix) = lookup("IRONCHECK_WORKER_PREFIX") {
            if prefix.trim().is_empty() {
                return Err(Error::Config(
                    "IRONCHECK_WORKER_PREFIX must not be blank".into(),
                ));
            }
            config.default_worker_prefix = prefix;
        }
        if let Some(dir) = lookup("IRONCHECK_WORKFLOW_DIR") {
            config.workflow_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}
