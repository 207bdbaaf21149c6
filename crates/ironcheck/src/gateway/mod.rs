//! Engine gateway abstraction.
//!
//! The [`Gateway`] trait is the only way the harness talks to a broker. It
//! mirrors the broker's job/message/variable surface one call at a time; the
//! harness issues at most one outstanding request and layers all waiting on
//! top with [`PollPolicy`](crate::PollPolicy).
//!
//! - [`InMemoryBroker`]: deterministic in-process broker for tests

mod memory;
mod model;

use std::time::Duration;

use async_trait::async_trait;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub use memory::{InMemoryBroker, InMemoryBrokerBuilder};

use crate::variables::{Headers, Variables};

/// A `Result` alias for gateway calls.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors reported by the engine gateway.
///
/// The harness propagates these unchanged; it never reinterprets a broker
/// failure as a polling timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The referenced job, instance, definition or scope does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity exists but is not in a state that allows the request.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The request itself was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The entity already exists (e.g. a buffered message with the same id).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A deployment resource was rejected.
    #[error("deployment rejected: {0}")]
    Deployment(String),

    /// The broker could not be reached.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Broker-assigned workflow instance key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(i64);

impl InstanceKey {
    /// Wrap a raw broker key.
    pub fn new(key: i64) -> Self {
        Self(key)
    }

    /// The raw broker key.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Broker-assigned job (task) key, unique per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(i64);

impl JobKey {
    /// Wrap a raw broker key.
    pub fn new(key: i64) -> Self {
        Self(key)
    }

    /// The raw broker key.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A process definition resource to deploy. Content is passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Resource name (usually the file name).
    pub name: String,
    /// Raw definition bytes.
    pub content: Vec<u8>,
}

impl Resource {
    /// Create a resource from a name and raw bytes.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Acknowledgement of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAck {
    /// Deployment key.
    pub key: i64,
    /// One entry per deployed process definition.
    pub deployed_workflows: Vec<DeployedWorkflow>,
}

impl DeploymentAck {
    /// Resource names of every deployed definition.
    pub fn resource_names(&self) -> Vec<&str> {
        self.deployed_workflows
            .iter()
            .map(|w| w.resource_name.as_str())
            .collect()
    }
}

/// A single deployed process definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedWorkflow {
    /// The BPMN process id (used to create instances).
    pub bpmn_process_id: String,
    /// The resource the definition came from.
    pub resource_name: String,
    /// Unique key of this definition version.
    pub process_definition_key: i64,
    /// Version, incremented per redeployment of changed content.
    pub version: u32,
}

/// Parameters of an activate-jobs call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateJobsRequest {
    /// Job type to activate.
    pub job_type: String,
    /// Worker identity leasing the jobs.
    pub worker: String,
    /// Lease duration of the activated jobs.
    pub timeout: Duration,
    /// Upper bound on the number of jobs returned.
    pub max_jobs_to_activate: u32,
    /// Variables to fetch; empty fetches all.
    pub fetch_variables: Vec<String>,
}

/// A job leased to a worker, as returned by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivatedJob {
    /// Unique job key.
    pub key: JobKey,
    /// Job type the job was matched on.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Instance the job belongs to.
    pub workflow_instance_key: InstanceKey,
    /// Process id of the owning definition.
    pub bpmn_process_id: String,
    /// BPMN element id of the service task.
    pub element_id: String,
    /// Key of the element instance (the job's local variable scope).
    pub element_instance_key: i64,
    /// Custom headers of the service task, never filtered.
    pub custom_headers: Headers,
    /// Worker holding the lease.
    pub worker: String,
    /// Retries remaining.
    pub retries: u32,
    /// When the lease expires and other workers may activate the job.
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    /// Variables visible to the job (possibly filtered).
    pub variables: Variables,
}

/// A message to publish for correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    /// Message name, matched against message catch events.
    pub name: String,
    /// Correlation key, matched against the subscription's key.
    pub correlation_key: String,
    /// Variables merged into the instance on correlation.
    pub variables: Variables,
    /// How long an uncorrelated message stays buffered.
    pub time_to_live: Duration,
    /// Optional id; a buffered message with the same name and id is rejected.
    pub message_id: Option<String>,
}

impl PublishMessage {
    /// Create a message with no variables and no buffering.
    pub fn new(name: impl Into<String>, correlation_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_key: correlation_key.into(),
            variables: Variables::new(),
            time_to_live: Duration::ZERO,
            message_id: None,
        }
    }

    /// Attach variables to the message.
    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Buffer the message for `ttl` if no subscription is open yet.
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = ttl;
        self
    }

    /// Set a message id for deduplication.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Acknowledgement of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageAck {
    /// Broker-assigned message key.
    pub key: i64,
}

/// Observable status of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstanceStatus {
    /// The instance reached an end event.
    pub completed: bool,
    /// Open incident blocking the instance, if any.
    pub incident: Option<String>,
}

/// Operations a broker exposes to the harness.
///
/// Every call is an independent synchronous round-trip. Implementations may
/// report "no jobs" even though jobs will shortly become available; callers
/// poll rather than assume immediate visibility.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Deploy one or more process definition resources.
    async fn deploy(&self, resources: NonEmpty<Resource>) -> GatewayResult<DeploymentAck>;

    /// Create an instance of the latest version of `bpmn_process_id`.
    async fn create_instance(
        &self,
        bpmn_process_id: &str,
        variables: Variables,
    ) -> GatewayResult<InstanceKey>;

    /// Lease up to `max_jobs_to_activate` activatable jobs of a type.
    async fn activate_jobs(&self, request: &ActivateJobsRequest) -> GatewayResult<Vec<ActivatedJob>>;

    /// Complete a job, merging `variables` into the instance.
    async fn complete_job(&self, key: JobKey, variables: Variables) -> GatewayResult<()>;

    /// Fail a job, setting its remaining retries.
    async fn fail_job(
        &self,
        key: JobKey,
        retries: u32,
        error_message: Option<&str>,
    ) -> GatewayResult<()>;

    /// Throw a BPMN error from a job.
    async fn throw_error(
        &self,
        key: JobKey,
        error_code: &str,
        error_message: Option<&str>,
    ) -> GatewayResult<()>;

    /// Overwrite a job's remaining retries.
    async fn update_job_retries(&self, key: JobKey, retries: u32) -> GatewayResult<()>;

    /// Set variables on an element instance scope (or the instance itself).
    async fn set_variables(
        &self,
        element_instance_key: i64,
        variables: Variables,
        local: bool,
    ) -> GatewayResult<()>;

    /// Publish a message for correlation.
    async fn publish_message(&self, message: &PublishMessage) -> GatewayResult<MessageAck>;

    /// Report whether an instance has completed.
    async fn instance_status(&self, key: InstanceKey) -> GatewayResult<InstanceStatus>;
}
