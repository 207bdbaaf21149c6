//! Completion observer.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::context::BoundInstance;
use crate::error::{Error, Result};
use crate::gateway::{InstanceKey, InstanceStatus};
use crate::harness::Harness;
use crate::poll::PollPolicy;

impl Harness {
    /// Poll the status of `key` until it completes or `timeout` elapses.
    ///
    /// On timeout the error carries the elapsed time and any incident the
    /// broker reports for the instance.
    pub async fn wait_for_completion(&self, key: InstanceKey, timeout: Duration) -> Result<()> {
        let policy = PollPolicy::new(timeout, self.config().poll_interval);
        let gateway = self.gateway();
        let started = Instant::now();

        let completed = policy
            .until(
                || gateway.instance_status(key),
                |status: &InstanceStatus| status.completed,
            )
            .await?;
        if completed.is_some() {
            debug!(instance_key = %key, elapsed_ms = started.elapsed().as_millis() as u64, "Workflow instance complete");
            return Ok(());
        }

        // One last look so the error can name the incident.
        let last = gateway.instance_status(key).await?;
        if last.completed {
            return Ok(());
        }
        Err(Error::CompletionTimeout {
            instance_key: key,
            elapsed: started.elapsed(),
            incident: last.incident,
        })
    }
}

impl BoundInstance {
    /// Wait for this instance to complete within the configured timeout.
    pub async fn workflow_complete(&self) -> Result<()> {
        self.workflow_complete_within(self.config().activate_request_timeout)
            .await
    }

    pub async fn workflow_complete_within(&self, timeout: Duration) -> Result<()> {
        self.wait_for_completion(self.key(), timeout).await
    }
}

/// Assert that a [`BoundInstance`] completes, panicking with the failure otherwise.
///
/// Must be used in an async context.
///
/// ```ignore
/// workflow_complete!(instance);
/// workflow_complete!(instance, Duration::from_secs(10));
/// ```
#[macro_export]
macro_rules! workflow_complete {
    ($instance:expr $(,)?) => {
        if let Err(err) = $instance.workflow_complete().await {
            panic!("workflow_complete! failed: {err}");
        }
    };
    ($instance:expr, $timeout:expr $(,)?) => {
        if let Err(err) = $instance.workflow_complete_within($timeout).await {
            panic!("workflow_complete! failed: {err}");
        }
    };
}
