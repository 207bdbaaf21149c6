//! Harness entry point: deployment and instance creation.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nonempty::NonEmpty;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::context::BoundInstance;
use crate::error::{Error, Result};
use crate::gateway::{DeploymentAck, Gateway, InstanceKey, MessageAck, PublishMessage, Resource};
use crate::variables::to_variables;

/// Synchronous test driver over a [`Gateway`].
///
/// Cheap to clone; clones share the gateway, the set of processes deployed
/// in this session and the currently bound instance.
///
/// # Example
///
/// ```no_run
/// use ironcheck::{ActivateOptions, Harness, HarnessConfig, InMemoryBroker, workflow_complete};
/// use serde_json::json;
///
/// # async fn run() -> ironcheck::Result<()> {
/// let harness = Harness::new(InMemoryBroker::new(), HarnessConfig::default());
/// harness.deploy_workflow("fixtures/one_task.bpmn", None).await?;
///
/// let instance = harness.create_instance("one_task", json!({"input": 1})).await?;
/// instance
///     .activate_job("do_something", ActivateOptions::default())
///     .await?
///     .expect_input(json!({"input": 1}))?
///     .and_complete(())
///     .await?;
/// workflow_complete!(instance);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Harness {
    inner: Arc<Inner>,
}

struct Inner {
    gateway: Arc<dyn Gateway>,
    config: HarnessConfig,
    deployed: Mutex<HashSet<String>>,
    bound: Mutex<Option<InstanceKey>>,
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.inner.config)
            .field("bound", &self.bound_instance())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Harness {
    pub fn new(gateway: impl Gateway, config: HarnessConfig) -> Self {
        Self::from_arc(Arc::new(gateway), config)
    }

    /// Create a harness over a shared gateway.
    pub fn from_arc(gateway: Arc<dyn Gateway>, config: HarnessConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                config,
                deployed: Mutex::new(HashSet::new()),
                bound: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    pub fn gateway(&self) -> &dyn Gateway {
        self.inner.gateway.as_ref()
    }

    /// The instance currently bound, if any.
    pub fn bound_instance(&self) -> Option<InstanceKey> {
        *lock(&self.inner.bound)
    }

    /// Read a process definition from `path` and deploy it.
    ///
    /// The resource is deployed under `name` if given, otherwise under the
    /// file name. The acknowledgement is returned unchanged so callers can
    /// assert on the deployed resource names.
    pub async fn deploy_workflow(&self, path: impl AsRef<Path>, name: Option<&str>) -> Result<DeploymentAck> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        };
        self.deploy_resource(name, content).await
    }

    /// Deploy in-memory definition bytes.
    pub async fn deploy_resource(
        &self,
        name: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Result<DeploymentAck> {
        let resource = Resource::new(name, content);
        let ack = self.gateway().deploy(NonEmpty::new(resource)).await?;

        let mut deployed = lock(&self.inner.deployed);
        for workflow in &ack.deployed_workflows {
            deployed.insert(workflow.bpmn_process_id.clone());
        }
        info!(resources = ?ack.resource_names(), deployment_key = ack.key, "Deployed workflow");
        Ok(ack)
    }

    /// Create an instance of `process` and bind it as the current instance.
    ///
    /// The process must already be deployed. Fails with
    /// [`Error::InstanceAlreadyBound`] while another instance is bound.
    pub async fn create_instance(&self, process: &str, variables: impl Serialize) -> Result<BoundInstance> {
        let variables = to_variables(variables)?;
        if let Some(current) = self.bound_instance() {
            return Err(Error::InstanceAlreadyBound { current });
        }

        let key = self
            .gateway()
            .create_instance(process, variables.clone())
            .await?;
        self.bind(key)?;
        Ok(BoundInstance::new(self.clone(), key, process, variables))
    }

    /// Run `body` against a fresh instance of `process`.
    ///
    /// The process is deployed from the workflow directory if this harness
    /// has not deployed it yet. The instance is unbound when `body` returns,
    /// fails or panics.
    pub async fn with_workflow_instance<T, E, F>(
        &self,
        process: &str,
        variables: impl Serialize,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'a> FnOnce(&'a BoundInstance) -> Pin<Box<dyn Future<Output = std::result::Result<T, E>> + 'a>>,
        E: From<Error>,
    {
        self.ensure_deployed(process).await?;
        let instance = self.create_instance(process, variables).await?;
        body(&instance).await
    }

    /// Deploy if needed, create an instance and release it immediately.
    pub async fn create_and_release(&self, process: &str, variables: impl Serialize) -> Result<InstanceKey> {
        self.ensure_deployed(process).await?;
        let instance = self.create_instance(process, variables).await?;
        Ok(instance.key())
    }

    /// Publish a message for correlation.
    ///
    /// One round-trip; correlation is observed through later activations.
    pub async fn publish_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: impl Serialize,
        time_to_live: std::time::Duration,
    ) -> Result<MessageAck> {
        let message = PublishMessage::new(name, correlation_key)
            .variables(to_variables(variables)?)
            .time_to_live(time_to_live);
        let ack = self.gateway().publish_message(&message).await?;
        debug!(message = name, correlation_key, message_key = ack.key, "Published message");
        Ok(ack)
    }

    async fn ensure_deployed(&self, process: &str) -> Result<()> {
        if lock(&self.inner.deployed).contains(process) {
            return Ok(());
        }
        let path = self.config().workflow_dir.join(format!("{process}.bpmn"));
        self.deploy_workflow(path, None).await?;
        Ok(())
    }

    fn bind(&self, key: InstanceKey) -> Result<()> {
        let mut bound = lock(&self.inner.bound);
        if let Some(current) = *bound {
            return Err(Error::InstanceAlreadyBound { current });
        }
        *bound = Some(key);
        debug!(instance_key = %key, "Bound workflow instance");
        Ok(())
    }

    pub(crate) fn unbind(&self, key: InstanceKey) {
        let mut bound = lock(&self.inner.bound);
        if *bound == Some(key) {
            *bound = None;
            debug!(instance_key = %key, "Unbound workflow instance");
        }
    }
}
