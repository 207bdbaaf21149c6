//! Job activation engine.
//!
//! Wraps the gateway's activate-jobs call with worker identity, variable
//! filtering and bounded polling. A request that finds no job before its
//! deadline is not an error: [`Harness::activate_job`] returns a pending
//! [`JobHandle`] and the caller decides whether absence is a failure.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::{ActivateJobsRequest, ActivatedJob};
use crate::harness::Harness;
use crate::job::JobHandle;
use crate::poll::PollPolicy;
use crate::variables::FetchVariables;

const BLANK_WORKER: &str = "'worker' cannot be blank";

/// Worker identity used for an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Worker {
    /// The configured worker prefix plus a random suffix.
    #[default]
    Generated,
    /// An explicit identity.
    Named(String),
    /// No identity. Always rejected, whether or not validation is enabled.
    Missing,
}

impl From<&str> for Worker {
    fn from(name: &str) -> Self {
        Worker::Named(name.to_string())
    }
}

impl From<String> for Worker {
    fn from(name: String) -> Self {
        Worker::Named(name)
    }
}

/// Per-call activation options.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ironcheck::ActivateOptions;
///
/// let options = ActivateOptions::default()
///     .worker("billing-worker")
///     .timeout(Duration::from_millis(500))
///     .fetch_variables(["orderId", "amount"])
///     .max_jobs(3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOptions {
    /// Worker identity. Default: generated.
    pub worker: Worker,
    /// Activation deadline. Default: the configured `activate_request_timeout`.
    pub timeout: Option<Duration>,
    /// Variables to fetch. Default: all.
    pub fetch_variables: FetchVariables,
    /// Upper bound on jobs returned by [`Harness::activate_jobs`]. Default: 1.
    pub max_jobs: u32,
    /// Reject blank worker identities before any request. Default: true.
    pub validate: bool,
}

impl Default for ActivateOptions {
    fn default() -> Self {
        Self {
            worker: Worker::Generated,
            timeout: None,
            fetch_variables: FetchVariables::All,
            max_jobs: 1,
            validate: true,
        }
    }
}

impl ActivateOptions {
    pub fn worker(mut self, worker: impl Into<Worker>) -> Self {
        self.worker = worker.into();
        self
    }

    /// Activate without any worker identity.
    pub fn no_worker(mut self) -> Self {
        self.worker = Worker::Missing;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fetch_variables(mut self, fetch: impl Into<FetchVariables>) -> Self {
        self.fetch_variables = fetch.into();
        self
    }

    pub fn max_jobs(mut self, max_jobs: u32) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }
}

/// The resolved parameters an activation was issued with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationQuery {
    /// Requested job type.
    pub job_type: String,
    /// Resolved worker identity.
    pub worker: String,
    /// Activation deadline.
    pub timeout: Duration,
    /// Variable filter applied to the returned jobs.
    pub fetch_variables: FetchVariables,
}

impl Harness {
    /// Activate a single job of `job_type`.
    ///
    /// Polls until a job is returned or the deadline elapses. On timeout the
    /// returned handle is pending; no error is raised. When several jobs are
    /// activatable, the one with the lowest key is returned.
    pub async fn activate_job(&self, job_type: &str, options: ActivateOptions) -> Result<JobHandle> {
        let query = self.resolve_query(job_type, &options)?;
        let mut jobs = self.poll_jobs(&query, 1).await?;

        Ok(match jobs.pop() {
            Some(job) => JobHandle::activated(self.clone(), query, job),
            None => JobHandle::pending(self.clone(), query),
        })
    }

    /// Activate up to `options.max_jobs` jobs of `job_type`.
    ///
    /// Waits for at least one job, then returns whatever the broker handed
    /// out, ordered by job key. `max_jobs == 0` returns immediately without
    /// contacting the broker.
    pub async fn activate_jobs(&self, job_type: &str, options: ActivateOptions) -> Result<Vec<JobHandle>> {
        let query = self.resolve_query(job_type, &options)?;
        if options.max_jobs == 0 {
            debug!(job_type, "Skipping activation, max_jobs is 0");
            return Ok(Vec::new());
        }

        let jobs = self.poll_jobs(&query, options.max_jobs).await?;
        Ok(jobs
            .into_iter()
            .map(|job| JobHandle::activated(self.clone(), query.clone(), job))
            .collect())
    }

    /// Activate one job of `job_type` with default options, failing if none shows up.
    pub async fn job_with_type(&self, job_type: &str) -> Result<JobHandle> {
        let handle = self.activate_job(job_type, ActivateOptions::default()).await?;
        if handle.is_pending() {
            return Err(Error::NoJob {
                job_type: job_type.to_string(),
                waited: handle.query().timeout,
            });
        }
        Ok(handle)
    }

    fn resolve_query(&self, job_type: &str, options: &ActivateOptions) -> Result<ActivationQuery> {
        let worker = match &options.worker {
            Worker::Missing => return Err(Error::invalid_argument(BLANK_WORKER)),
            Worker::Named(name) if options.validate && name.trim().is_empty() => {
                return Err(Error::invalid_argument(BLANK_WORKER));
            }
            Worker::Named(name) => name.clone(),
            Worker::Generated => format!(
                "{}{}",
                self.config().default_worker_prefix,
                Uuid::new_v4().simple()
            ),
        };

        Ok(ActivationQuery {
            job_type: job_type.to_string(),
            worker,
            timeout: options
                .timeout
                .unwrap_or(self.config().activate_request_timeout),
            fetch_variables: options.fetch_variables.clone(),
        })
    }

    async fn poll_jobs(&self, query: &ActivationQuery, max_jobs: u32) -> Result<Vec<ActivatedJob>> {
        let request = ActivateJobsRequest {
            job_type: query.job_type.clone(),
            worker: query.worker.clone(),
            timeout: self.config().job_timeout,
            max_jobs_to_activate: max_jobs,
            fetch_variables: query.fetch_variables.keys().to_vec(),
        };
        let policy = PollPolicy::new(query.timeout, self.config().poll_interval);
        let gateway = self.gateway();
        let started = Instant::now();

        let jobs = policy
            .until(
                || gateway.activate_jobs(&request),
                |jobs: &Vec<ActivatedJob>| !jobs.is_empty(),
            )
            .await?;

        // The broker is trusted for leasing, not for ordering or filtering.
        let mut jobs = jobs.unwrap_or_default();
        jobs.sort_by_key(|job| job.key);
        jobs.truncate(max_jobs as usize);
        for job in &mut jobs {
            job.variables = query
                .fetch_variables
                .project(std::mem::take(&mut job.variables));
        }

        debug!(
            job_type = %query.job_type,
            worker = %query.worker,
            activated = jobs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Activation finished"
        );
        Ok(jobs)
    }
}
