//! Job handles and their lifecycle.
//!
//! ```text
//!   Pending ──(fresh activation only)
//!
//!   Activated ──complete──────▶ Completed
//!       │  ▲ ──fail─────────▶ Failed
//!       │  │ ──throw_error──▶ ErrorThrown
//!       └──┘ update_retries / set_variables
//! ```
//!
//! Every operation consults one guard ([`JobHandle::guard`]); a handle that
//! is not `Activated` rejects all operations with [`Error::StateConflict`].

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::activation::ActivationQuery;
use crate::error::{Error, Result};
use crate::gateway::{ActivatedJob, InstanceKey, JobKey};
use crate::harness::Harness;
use crate::variables::{Headers, Variables, to_variables};

/// Lifecycle state of a [`JobHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// No job was activated before the deadline.
    Pending,
    /// A job is leased and may transition.
    Activated,
    Completed,
    Failed,
    ErrorThrown,
}

impl JobState {
    /// The upper-case token used in error messages, e.g. `ERROR_THROWN`.
    pub fn token(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Activated => "ACTIVATED",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::ErrorThrown => "ERROR_THROWN",
        }
    }

    /// Returns `true` once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::ErrorThrown
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Harness-side wrapper around zero or one activated job.
///
/// Accessors read from the job payload as it was activated: retries are not
/// refreshed after [`update_retries`](Self::update_retries), and
/// [`workflow_instance_key`](Self::workflow_instance_key) is the job's own
/// instance, which need not be the bound one.
pub struct JobHandle {
    harness: Harness,
    query: ActivationQuery,
    job: Option<ActivatedJob>,
    state: JobState,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("query", &self.query)
            .field("job", &self.job)
            .field("state", &self.state)
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn activated(harness: Harness, query: ActivationQuery, job: ActivatedJob) -> Self {
        debug!(job_key = %job.key, job_type = %job.job_type, instance_key = %job.workflow_instance_key, "Job activated");
        Self {
            harness,
            query,
            job: Some(job),
            state: JobState::Activated,
        }
    }

    pub(crate) fn pending(harness: Harness, query: ActivationQuery) -> Self {
        debug!(job_type = %query.job_type, timeout_ms = query.timeout.as_millis() as u64, "No job activated before deadline");
        Self {
            harness,
            query,
            job: None,
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    /// The parameters this handle was activated with.
    pub fn query(&self) -> &ActivationQuery {
        &self.query
    }

    /// The raw job payload, `None` when pending.
    pub fn job(&self) -> Option<&ActivatedJob> {
        self.job.as_ref()
    }

    /// Consume the handle, returning the raw job payload.
    pub fn into_job(self) -> Option<ActivatedJob> {
        self.job
    }

    /// The requested job type (available even when pending).
    pub fn job_type(&self) -> &str {
        &self.query.job_type
    }

    pub fn key(&self) -> Option<JobKey> {
        self.job.as_ref().map(|job| job.key)
    }

    /// Variables as activated, after fetch filtering.
    pub fn variables(&self) -> Option<&Variables> {
        self.job.as_ref().map(|job| &job.variables)
    }

    /// Custom headers of the service task, never filtered.
    pub fn headers(&self) -> Option<&Headers> {
        self.job.as_ref().map(|job| &job.custom_headers)
    }

    pub fn workflow_instance_key(&self) -> Option<InstanceKey> {
        self.job.as_ref().map(|job| job.workflow_instance_key)
    }

    /// Retries remaining at activation time.
    pub fn retries(&self) -> Option<u32> {
        self.job.as_ref().map(|job| job.retries)
    }

    pub fn element_instance_key(&self) -> Option<i64> {
        self.job.as_ref().map(|job| job.element_instance_key)
    }

    /// Complete the job, merging `variables` into the instance.
    ///
    /// Pass `()` to complete without variables.
    pub async fn complete(&mut self, variables: impl Serialize) -> Result<()> {
        let key = self.guard("complete")?.key;
        let variables = to_variables(variables)?;

        self.harness.gateway().complete_job(key, variables).await?;
        self.transition(JobState::Completed);
        Ok(())
    }

    /// Fail the job, leaving it one retry fewer than it was activated with.
    pub async fn fail(&mut self, message: Option<&str>) -> Result<()> {
        let retries = self.guard("fail")?.retries.saturating_sub(1);
        self.fail_with_retries(message, retries).await
    }

    /// Fail the job with an explicit number of remaining retries.
    ///
    /// Zero retries raises an incident on the broker.
    pub async fn fail_with_retries(&mut self, message: Option<&str>, retries: u32) -> Result<()> {
        let key = self.guard("fail")?.key;

        self.harness
            .gateway()
            .fail_job(key, retries, message)
            .await?;
        self.transition(JobState::Failed);
        Ok(())
    }

    /// Throw a BPMN error from the job.
    pub async fn throw_error(&mut self, error_code: &str, message: Option<&str>) -> Result<()> {
        let key = self.guard("throw error from")?.key;

        self.harness
            .gateway()
            .throw_error(key, error_code, message)
            .await?;
        self.transition(JobState::ErrorThrown);
        Ok(())
    }

    /// Overwrite the job's remaining retries on the broker.
    ///
    /// The handle stays `Activated` and [`retries`](Self::retries) keeps the
    /// activation-time value.
    pub async fn update_retries(&mut self, retries: u32) -> Result<()> {
        let key = self.guard("update retries of")?.key;

        self.harness
            .gateway()
            .update_job_retries(key, retries)
            .await?;
        debug!(job_key = %key, retries, "Updated job retries");
        Ok(())
    }

    /// Set variables on the job's element instance.
    ///
    /// With `local` the update is visible to this job only; otherwise it
    /// propagates to the enclosing instance.
    pub async fn set_variables(&self, variables: impl Serialize, local: bool) -> Result<()> {
        let element_instance_key = self.guard("set variables on")?.element_instance_key;
        let variables = to_variables(variables)?;

        self.harness
            .gateway()
            .set_variables(element_instance_key, variables, local)
            .await?;
        Ok(())
    }

    /// [`complete`](Self::complete), returning the handle for chaining.
    pub async fn and_complete(mut self, variables: impl Serialize) -> Result<Self> {
        self.complete(variables).await?;
        Ok(self)
    }

    /// [`fail`](Self::fail) with a message, returning the handle for chaining.
    pub async fn and_fail(mut self, message: &str) -> Result<Self> {
        self.fail(Some(message)).await?;
        Ok(self)
    }

    /// [`throw_error`](Self::throw_error) without a message, returning the handle.
    pub async fn and_throw_error(mut self, error_code: &str) -> Result<Self> {
        self.throw_error(error_code, None).await?;
        Ok(self)
    }

    /// Single transition guard: only an activated handle may act.
    fn guard(&self, operation: &'static str) -> Result<&ActivatedJob> {
        match (&self.job, self.state) {
            (Some(job), JobState::Activated) => Ok(job),
            (_, state) => Err(Error::StateConflict {
                operation,
                job: self.describe(),
                state: state.token(),
            }),
        }
    }

    fn transition(&mut self, to: JobState) {
        debug!(job = %self.describe(), from = %self.state, to = %to, "Job transition");
        self.state = to;
    }

    fn describe(&self) -> String {
        match &self.job {
            Some(job) => format!("job {} ({})", job.key, job.job_type),
            None => format!("pending job ({})", self.query.job_type),
        }
    }
}
