use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ironcheck::gateway::{
    ActivateJobsRequest, ActivatedJob, DeploymentAck, GatewayResult, InstanceKey, InstanceStatus,
    JobKey, MessageAck, PublishMessage, Resource,
};
use ironcheck::{Gateway, GatewayError, Harness, HarnessConfig, InMemoryBroker, NonEmpty, Variables};

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Path of a BPMN fixture.
pub fn fixture(name: &str) -> PathBuf {
    test_utils::fixtures_dir().join(name)
}

/// A harness whose default deadline is [`SHORT_TIMEOUT`], for absence tests.
pub fn impatient_harness(gateway: impl Gateway) -> Harness {
    test_utils::init_test_tracing();
    Harness::new(
        gateway,
        HarnessConfig {
            activate_request_timeout: SHORT_TIMEOUT,
            poll_interval: Duration::from_millis(10),
            workflow_dir: test_utils::fixtures_dir(),
            ..Default::default()
        },
    )
}

/// Gateway wrapper counting activation requests, able to simulate an outage.
#[derive(Clone, Default)]
pub struct CountingGateway {
    inner: InMemoryBroker,
    activations: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl CountingGateway {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    /// Make every subsequent activation fail with `Unavailable`.
    pub fn go_down(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Gateway for CountingGateway {
    async fn deploy(&self, resources: NonEmpty<Resource>) -> GatewayResult<DeploymentAck> {
        self.inner.deploy(resources).await
    }

    async fn create_instance(
        &self,
        bpmn_process_id: &str,
        variables: Variables,
    ) -> GatewayResult<InstanceKey> {
        self.inner.create_instance(bpmn_process_id, variables).await
    }

    async fn activate_jobs(&self, request: &ActivateJobsRequest) -> GatewayResult<Vec<ActivatedJob>> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("connection refused".into()));
        }
        self.inner.activate_jobs(request).await
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> GatewayResult<()> {
        self.inner.complete_job(key, variables).await
    }

    async fn fail_job(
        &self,
        key: JobKey,
        retries: u32,
        error_message: Option<&str>,
    ) -> GatewayResult<()> {
        self.inner.fail_job(key, retries, error_message).await
    }

    async fn throw_error(
        &self,
        key: JobKey,
        error_code: &str,
        error_message: Option<&str>,
    ) -> GatewayResult<()> {
        self.inner.throw_error(key, error_code, error_message).await
    }

    async fn update_job_retries(&self, key: JobKey, retries: u32) -> GatewayResult<()> {
        self.inner.update_job_retries(key, retries).await
    }

    async fn set_variables(
        &self,
        element_instance_key: i64,
        variables: Variables,
        local: bool,
    ) -> GatewayResult<()> {
        self.inner
            .set_variables(element_instance_key, variables, local)
            .await
    }

    async fn publish_message(&self, message: &PublishMessage) -> GatewayResult<MessageAck> {
        self.inner.publish_message(message).await
    }

    async fn instance_status(&self, key: InstanceKey) -> GatewayResult<InstanceStatus> {
        self.inner.instance_status(key).await
    }
}
