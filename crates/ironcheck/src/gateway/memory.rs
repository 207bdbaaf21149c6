//! In-process broker for deterministic tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nonempty::NonEmpty;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::model::{Element, ElementKind, MessageDefinition, ProcessModel, TaskDefinition};
use super::{
    ActivateJobsRequest, ActivatedJob, DeployedWorkflow, DeploymentAck, Gateway, GatewayError,
    GatewayResult, InstanceKey, InstanceStatus, JobKey, MessageAck, PublishMessage, Resource,
};
use crate::variables::{FetchVariables, Headers, Variables};

/// Keys start where a real partition-1 broker starts handing them out.
const FIRST_KEY: i64 = 2_251_799_813_685_249;

/// Builder for [`InMemoryBroker`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryBrokerBuilder {
    propagation_delay: Duration,
}

impl InMemoryBrokerBuilder {
    /// Delay before a newly created job becomes activatable.
    ///
    /// Models the broker's internal propagation: an activation issued right
    /// after the job was created sees "no jobs". Default: zero.
    pub fn propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Build the broker.
    pub fn build(self) -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::new())),
            propagation_delay: self.propagation_delay,
        }
    }
}

/// An in-process [`Gateway`] that executes linear BPMN processes.
///
/// Clones share state, so a test can keep a handle for introspection while
/// the harness owns another.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ironcheck::InMemoryBroker;
///
/// let broker = InMemoryBroker::builder()
///     .propagation_delay(Duration::from_millis(50))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    propagation_delay: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl InMemoryBroker {
    /// Create a broker with no propagation delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a broker.
    pub fn builder() -> InMemoryBrokerBuilder {
        InMemoryBrokerBuilder::default()
    }

    /// Root-scope variables of an instance.
    pub fn instance_variables(&self, key: InstanceKey) -> Option<Variables> {
        self.state()
            .instances
            .get(&key)
            .map(|instance| instance.variables.clone())
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct Definition {
    key: i64,
    version: u32,
    content: Vec<u8>,
    model: Arc<ProcessModel>,
}

#[derive(Debug)]
struct Instance {
    model: Arc<ProcessModel>,
    variables: Variables,
    completed: bool,
    incident: Option<String>,
}

/// Local variable scope of an active element instance.
#[derive(Debug)]
struct Scope {
    instance_key: InstanceKey,
    variables: Variables,
}

#[derive(Debug)]
struct Job {
    key: JobKey,
    job_type: String,
    instance_key: InstanceKey,
    bpmn_process_id: String,
    element_id: String,
    element_instance_key: i64,
    headers: Headers,
    retries: u32,
    status: JobStatus,
}

#[derive(Debug)]
enum JobStatus {
    Activatable {
        visible_at: Instant,
    },
    Activated {
        worker: String,
        lease_until: Instant,
        deadline: OffsetDateTime,
    },
    /// Failed with no retries left; waits for a retries update.
    Failed,
    /// Threw an error no boundary event caught.
    ErrorThrown,
}

impl JobStatus {
    fn name(&self) -> &'static str {
        match self {
            JobStatus::Activatable { .. } => "activatable",
            JobStatus::Activated { .. } => "activated",
            JobStatus::Failed => "failed",
            JobStatus::ErrorThrown => "error thrown",
        }
    }
}

#[derive(Debug)]
struct Subscription {
    instance_key: InstanceKey,
    element_id: String,
    element_instance_key: i64,
    message_name: String,
    correlation_key: String,
}

#[derive(Debug)]
struct BufferedMessage {
    name: String,
    correlation_key: String,
    variables: Variables,
    message_id: Option<String>,
    expires_at: Instant,
}

/// Outcome of entering a message catch event.
enum CatchOutcome {
    Waiting,
    Correlated,
    Blocked,
}

#[derive(Debug)]
struct BrokerState {
    next_key: i64,
    definitions: HashMap<String, Vec<Definition>>,
    instances: HashMap<InstanceKey, Instance>,
    scopes: HashMap<i64, Scope>,
    jobs: BTreeMap<JobKey, Job>,
    subscriptions: Vec<Subscription>,
    messages: Vec<BufferedMessage>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            next_key: FIRST_KEY,
            definitions: HashMap::new(),
            instances: HashMap::new(),
            scopes: HashMap::new(),
            jobs: BTreeMap::new(),
            subscriptions: Vec::new(),
            messages: Vec::new(),
        }
    }

    fn next_key(&mut self) -> i64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn job(&self, key: JobKey) -> GatewayResult<&Job> {
        self.jobs
            .get(&key)
            .ok_or_else(|| GatewayError::NotFound(format!("job {key}")))
    }

    fn job_mut(&mut self, key: JobKey) -> GatewayResult<&mut Job> {
        self.jobs
            .get_mut(&key)
            .ok_or_else(|| GatewayError::NotFound(format!("job {key}")))
    }

    fn model(&self, instance_key: InstanceKey) -> Option<Arc<ProcessModel>> {
        self.instances
            .get(&instance_key)
            .map(|instance| Arc::clone(&instance.model))
    }

    /// Move the instance token forward starting at `next` until it waits.
    fn advance(&mut self, instance_key: InstanceKey, mut next: Option<String>, delay: Duration) {
        let Some(model) = self.model(instance_key) else {
            return;
        };

        while let Some(element_id) = next.take() {
            let Some(element) = model.element(&element_id) else {
                self.raise_incident(instance_key, format!("unknown element '{element_id}'"));
                return;
            };
            match &element.kind {
                ElementKind::Start | ElementKind::Pass | ElementKind::ErrorBoundary { .. } => {
                    next = element.outgoing.clone();
                }
                ElementKind::End => {}
                ElementKind::ServiceTask(task) => {
                    self.create_job(instance_key, model.id(), element, task, delay);
                    return;
                }
                ElementKind::MessageCatch(message) => {
                    match self.enter_catch_event(instance_key, element, message) {
                        CatchOutcome::Correlated => next = element.outgoing.clone(),
                        CatchOutcome::Waiting | CatchOutcome::Blocked => return,
                    }
                }
            }
        }

        if let Some(instance) = self.instances.get_mut(&instance_key) {
            instance.completed = true;
            info!(instance_key = %instance_key, process = model.id(), "Workflow instance completed");
        }
    }

    fn create_job(
        &mut self,
        instance_key: InstanceKey,
        bpmn_process_id: &str,
        element: &Element,
        task: &TaskDefinition,
        delay: Duration,
    ) {
        let element_instance_key = self.next_key();
        self.scopes.insert(
            element_instance_key,
            Scope {
                instance_key,
                variables: Variables::new(),
            },
        );

        let key = JobKey::new(self.next_key());
        self.jobs.insert(
            key,
            Job {
                key,
                job_type: task.job_type.clone(),
                instance_key,
                bpmn_process_id: bpmn_process_id.to_string(),
                element_id: element.id.clone(),
                element_instance_key,
                headers: task.headers.clone(),
                retries: task.retries,
                status: JobStatus::Activatable {
                    visible_at: Instant::now() + delay,
                },
            },
        );
        debug!(job_key = %key, job_type = %task.job_type, instance_key = %instance_key, "Created job");
    }

    fn enter_catch_event(
        &mut self,
        instance_key: InstanceKey,
        element: &Element,
        message: &MessageDefinition,
    ) -> CatchOutcome {
        let Some(instance) = self.instances.get(&instance_key) else {
            return CatchOutcome::Blocked;
        };
        let correlation_key =
            match evaluate_correlation_key(&instance.variables, &message.correlation_key) {
                Ok(key) => key,
                Err(reason) => {
                    self.raise_incident(instance_key, reason);
                    return CatchOutcome::Blocked;
                }
            };

        let now = Instant::now();
        self.messages.retain(|m| m.expires_at > now);
        let buffered = self
            .messages
            .iter()
            .position(|m| m.name == message.name && m.correlation_key == correlation_key);
        if let Some(position) = buffered {
            let buffered = self.messages.remove(position);
            if let Some(instance) = self.instances.get_mut(&instance_key) {
                instance.variables.extend(buffered.variables);
            }
            debug!(instance_key = %instance_key, message = %message.name, "Correlated buffered message");
            return CatchOutcome::Correlated;
        }

        let element_instance_key = self.next_key();
        self.scopes.insert(
            element_instance_key,
            Scope {
                instance_key,
                variables: Variables::new(),
            },
        );
        self.subscriptions.push(Subscription {
            instance_key,
            element_id: element.id.clone(),
            element_instance_key,
            message_name: message.name.clone(),
            correlation_key,
        });
        debug!(instance_key = %instance_key, message = %message.name, "Opened message subscription");
        CatchOutcome::Waiting
    }

    fn raise_incident(&mut self, instance_key: InstanceKey, reason: String) {
        warn!(instance_key = %instance_key, reason = %reason, "Incident raised");
        if let Some(instance) = self.instances.get_mut(&instance_key) {
            instance.incident = Some(reason);
        }
    }

    /// Remove a job and its scope, returning where the token continues.
    fn leave_job(&mut self, key: JobKey) -> Option<(InstanceKey, Arc<ProcessModel>, String)> {
        let job = self.jobs.remove(&key)?;
        self.scopes.remove(&job.element_instance_key);
        let model = self.model(job.instance_key)?;
        Some((job.instance_key, model, job.element_id))
    }

    fn activated_job(
        &self,
        job: &Job,
        fetch: &FetchVariables,
    ) -> Option<ActivatedJob> {
        let JobStatus::Activated {
            worker, deadline, ..
        } = &job.status
        else {
            return None;
        };

        let mut variables = self
            .instances
            .get(&job.instance_key)
            .map(|instance| instance.variables.clone())
            .unwrap_or_default();
        if let Some(scope) = self.scopes.get(&job.element_instance_key) {
            variables.extend(scope.variables.clone());
        }

        Some(ActivatedJob {
            key: job.key,
            job_type: job.job_type.clone(),
            workflow_instance_key: job.instance_key,
            bpmn_process_id: job.bpmn_process_id.clone(),
            element_id: job.element_id.clone(),
            element_instance_key: job.element_instance_key,
            custom_headers: job.headers.clone(),
            worker: worker.clone(),
            retries: job.retries,
            deadline: *deadline,
            variables: fetch.project(variables),
        })
    }
}

/// Resolve a correlation key: `=a.b` reads a variable path, anything else is a literal.
fn evaluate_correlation_key(variables: &Variables, expression: &str) -> Result<String, String> {
    let Some(path) = expression.strip_prefix('=') else {
        return Ok(expression.to_string());
    };
    let path = path.trim();

    let mut segments = path.split('.');
    let mut value = segments
        .next()
        .and_then(|root| variables.get(root))
        .ok_or_else(|| format!("failed to evaluate correlation key '{path}': no such variable"))?;
    for segment in segments {
        value = value
            .get(segment)
            .ok_or_else(|| format!("failed to evaluate correlation key '{path}': no such variable"))?;
    }

    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(format!(
            "correlation key '{path}' must be a string or number, got {other}"
        )),
    }
}

#[async_trait]
impl Gateway for InMemoryBroker {
    async fn deploy(&self, resources: NonEmpty<Resource>) -> GatewayResult<DeploymentAck> {
        // Parse everything first: a deployment is all-or-nothing.
        let parsed = resources
            .iter()
            .map(|resource| ProcessModel::parse(&resource.content).map(|model| (resource, model)))
            .collect::<GatewayResult<Vec<_>>>()?;

        let mut guard = self.state();
        let state = &mut *guard;
        let deployment_key = state.next_key();

        let mut deployed_workflows = Vec::with_capacity(parsed.len());
        for (resource, model) in parsed {
            let id = model.id().to_string();
            let latest = state
                .definitions
                .get(&id)
                .and_then(|versions| versions.last())
                .map(|d| (d.key, d.version, d.content == resource.content));

            let (key, version) = match latest {
                // Unchanged content keeps the existing definition.
                Some((key, version, true)) => (key, version),
                other => {
                    let key = state.next_key();
                    let version = other.map_or(1, |(_, version, _)| version + 1);
                    state.definitions.entry(id.clone()).or_default().push(Definition {
                        key,
                        version,
                        content: resource.content.clone(),
                        model: Arc::new(model),
                    });
                    (key, version)
                }
            };

            info!(process = %id, resource = %resource.name, version, "Deployed process definition");
            deployed_workflows.push(DeployedWorkflow {
                bpmn_process_id: id,
                resource_name: resource.name.clone(),
                process_definition_key: key,
                version,
            });
        }

        Ok(DeploymentAck {
            key: deployment_key,
            deployed_workflows,
        })
    }

    async fn create_instance(
        &self,
        bpmn_process_id: &str,
        variables: Variables,
    ) -> GatewayResult<InstanceKey> {
        let mut guard = self.state();
        let state = &mut *guard;

        let model = state
            .definitions
            .get(bpmn_process_id)
            .and_then(|versions| versions.last())
            .map(|d| Arc::clone(&d.model))
            .ok_or_else(|| {
                GatewayError::NotFound(format!("process definition '{bpmn_process_id}'"))
            })?;

        let key = InstanceKey::new(state.next_key());
        let start = model.start().to_string();
        state.instances.insert(
            key,
            Instance {
                model,
                variables,
                completed: false,
                incident: None,
            },
        );
        info!(instance_key = %key, process = %bpmn_process_id, "Created workflow instance");

        state.advance(key, Some(start), self.propagation_delay);
        Ok(key)
    }

    async fn activate_jobs(&self, request: &ActivateJobsRequest) -> GatewayResult<Vec<ActivatedJob>> {
        if request.job_type.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "job type must not be blank".into(),
            ));
        }
        if request.worker.trim().is_empty() {
            return Err(GatewayError::InvalidArgument("worker must not be blank".into()));
        }
        if request.max_jobs_to_activate == 0 {
            return Err(GatewayError::InvalidArgument(
                "max jobs to activate must be greater than 0".into(),
            ));
        }

        let mut guard = self.state();
        let state = &mut *guard;
        let now = Instant::now();
        let lease_until = now + request.timeout;
        let deadline = OffsetDateTime::now_utc() + request.timeout;
        let limit = request.max_jobs_to_activate as usize;

        let mut leased = Vec::new();
        for job in state.jobs.values_mut() {
            if leased.len() >= limit {
                break;
            }
            if job.job_type != request.job_type || job.retries == 0 {
                continue;
            }
            let available = match &job.status {
                JobStatus::Activatable { visible_at } => *visible_at <= now,
                JobStatus::Activated { lease_until, .. } => *lease_until <= now,
                JobStatus::Failed | JobStatus::ErrorThrown => false,
            };
            if !available {
                continue;
            }
            job.status = JobStatus::Activated {
                worker: request.worker.clone(),
                lease_until,
                deadline,
            };
            leased.push(job.key);
        }

        let fetch = if request.fetch_variables.is_empty() {
            FetchVariables::All
        } else {
            FetchVariables::Only(request.fetch_variables.clone())
        };
        let jobs: Vec<ActivatedJob> = leased
            .iter()
            .filter_map(|key| state.jobs.get(key))
            .filter_map(|job| state.activated_job(job, &fetch))
            .collect();

        debug!(
            job_type = %request.job_type,
            worker = %request.worker,
            activated = jobs.len(),
            "Activated jobs"
        );
        Ok(jobs)
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> GatewayResult<()> {
        let mut guard = self.state();
        let state = &mut *guard;

        let job = state.job(key)?;
        if matches!(job.status, JobStatus::Failed | JobStatus::ErrorThrown) {
            return Err(GatewayError::InvalidState(format!(
                "job {key} cannot be completed, it is {}",
                job.status.name()
            )));
        }

        let Some((instance_key, model, element_id)) = state.leave_job(key) else {
            return Err(GatewayError::NotFound(format!("job {key}")));
        };
        if let Some(instance) = state.instances.get_mut(&instance_key) {
            instance.variables.extend(variables);
        }
        debug!(job_key = %key, instance_key = %instance_key, "Completed job");

        let outgoing = model.element(&element_id).and_then(|e| e.outgoing.clone());
        state.advance(instance_key, outgoing, self.propagation_delay);
        Ok(())
    }

    async fn fail_job(
        &self,
        key: JobKey,
        retries: u32,
        error_message: Option<&str>,
    ) -> GatewayResult<()> {
        let mut guard = self.state();
        let state = &mut *guard;

        let job = state.job_mut(key)?;
        if !matches!(job.status, JobStatus::Activated { .. }) {
            return Err(GatewayError::InvalidState(format!(
                "job {key} cannot be failed, it is {}",
                job.status.name()
            )));
        }

        job.retries = retries;
        let instance_key = job.instance_key;
        let job_type = job.job_type.clone();
        if retries > 0 {
            job.status = JobStatus::Activatable {
                visible_at: Instant::now(),
            };
            debug!(job_key = %key, retries, "Failed job, will be retried");
        } else {
            job.status = JobStatus::Failed;
            let reason = format!(
                "job {key} ({job_type}) failed with no retries left: {}",
                error_message.unwrap_or("no error message")
            );
            state.raise_incident(instance_key, reason);
        }
        Ok(())
    }

    async fn throw_error(
        &self,
        key: JobKey,
        error_code: &str,
        error_message: Option<&str>,
    ) -> GatewayResult<()> {
        if error_code.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "error code must not be blank".into(),
            ));
        }

        let mut guard = self.state();
        let state = &mut *guard;

        let job = state.job(key)?;
        if matches!(job.status, JobStatus::Failed | JobStatus::ErrorThrown) {
            return Err(GatewayError::InvalidState(format!(
                "job {key} cannot throw an error, it is {}",
                job.status.name()
            )));
        }
        let instance_key = job.instance_key;
        let boundary = state
            .model(instance_key)
            .and_then(|model| model.error_boundary(&job.element_id, error_code).cloned());

        match boundary {
            Some(boundary) => {
                state.leave_job(key);
                debug!(job_key = %key, error_code, boundary = %boundary.id, "Error caught by boundary event");
                state.advance(instance_key, boundary.outgoing, self.propagation_delay);
            }
            None => {
                state.job_mut(key)?.status = JobStatus::ErrorThrown;
                let reason = match error_message {
                    Some(message) => format!("unhandled error event '{error_code}': {message}"),
                    None => format!("unhandled error event '{error_code}'"),
                };
                state.raise_incident(instance_key, reason);
            }
        }
        Ok(())
    }

    async fn update_job_retries(&self, key: JobKey, retries: u32) -> GatewayResult<()> {
        if retries == 0 {
            return Err(GatewayError::InvalidArgument(
                "retries must be greater than 0".into(),
            ));
        }

        let mut guard = self.state();
        let state = &mut *guard;

        let job = state.job_mut(key)?;
        job.retries = retries;
        let instance_key = job.instance_key;
        if matches!(job.status, JobStatus::Failed) {
            job.status = JobStatus::Activatable {
                visible_at: Instant::now(),
            };
            if let Some(instance) = state.instances.get_mut(&instance_key) {
                instance.incident = None;
            }
        }
        debug!(job_key = %key, retries, "Updated job retries");
        Ok(())
    }

    async fn set_variables(
        &self,
        element_instance_key: i64,
        variables: Variables,
        local: bool,
    ) -> GatewayResult<()> {
        let mut guard = self.state();
        let state = &mut *guard;

        if let Some(instance) = state
            .instances
            .get_mut(&InstanceKey::new(element_instance_key))
        {
            instance.variables.extend(variables);
            return Ok(());
        }

        let scope = state.scopes.get_mut(&element_instance_key).ok_or_else(|| {
            GatewayError::NotFound(format!("element instance {element_instance_key}"))
        })?;
        if local {
            scope.variables.extend(variables);
            return Ok(());
        }

        let instance = state.instances.get_mut(&scope.instance_key).ok_or_else(|| {
            GatewayError::NotFound(format!("workflow instance {}", scope.instance_key))
        })?;
        // Non-local updates land where the variable is already defined.
        for (name, value) in variables {
            if scope.variables.contains_key(&name) {
                scope.variables.insert(name, value);
            } else {
                instance.variables.insert(name, value);
            }
        }
        Ok(())
    }

    async fn publish_message(&self, message: &PublishMessage) -> GatewayResult<MessageAck> {
        if message.name.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "message name must not be blank".into(),
            ));
        }

        let mut guard = self.state();
        let state = &mut *guard;
        let now = Instant::now();
        state.messages.retain(|m| m.expires_at > now);

        if let Some(id) = &message.message_id {
            let duplicate = state
                .messages
                .iter()
                .any(|m| m.name == message.name && m.message_id.as_deref() == Some(id.as_str()));
            if duplicate {
                return Err(GatewayError::AlreadyExists(format!(
                    "message '{}' with id '{id}'",
                    message.name
                )));
            }
        }

        let key = state.next_key();
        let subscription = state.subscriptions.iter().position(|s| {
            s.message_name == message.name && s.correlation_key == message.correlation_key
        });

        match subscription {
            Some(position) => {
                let subscription = state.subscriptions.remove(position);
                state.scopes.remove(&subscription.element_instance_key);
                if let Some(instance) = state.instances.get_mut(&subscription.instance_key) {
                    instance.variables.extend(message.variables.clone());
                }
                debug!(
                    message = %message.name,
                    instance_key = %subscription.instance_key,
                    "Correlated message"
                );
                let outgoing = state
                    .model(subscription.instance_key)
                    .and_then(|model| model.element(&subscription.element_id).and_then(|e| e.outgoing.clone()));
                state.advance(subscription.instance_key, outgoing, self.propagation_delay);
            }
            None if !message.time_to_live.is_zero() => {
                state.messages.push(BufferedMessage {
                    name: message.name.clone(),
                    correlation_key: message.correlation_key.clone(),
                    variables: message.variables.clone(),
                    message_id: message.message_id.clone(),
                    expires_at: now + message.time_to_live,
                });
                debug!(message = %message.name, "Buffered message");
            }
            None => {
                debug!(message = %message.name, "Message dropped, no subscription and no ttl");
            }
        }

        Ok(MessageAck { key })
    }

    async fn instance_status(&self, key: InstanceKey) -> GatewayResult<InstanceStatus> {
        self.state()
            .instances
            .get(&key)
            .map(|instance| InstanceStatus {
                completed: instance.completed,
                incident: instance.incident.clone(),
            })
            .ok_or_else(|| GatewayError::NotFound(format!("workflow instance {key}")))
    }
}
