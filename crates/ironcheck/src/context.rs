//! The bound workflow instance.

use std::ops::Deref;

use serde::Serialize;

use crate::error::Result;
use crate::gateway::{InstanceKey, InstanceStatus};
use crate::harness::Harness;
use crate::variables::{Variables, to_variables};

/// A workflow instance bound to its [`Harness`] for the lifetime of the value.
///
/// Dropping the value unbinds the instance; the broker-side instance is left
/// untouched. Harness operations are reachable through `Deref`.
#[derive(Debug)]
pub struct BoundInstance {
    harness: Harness,
    key: InstanceKey,
    process: String,
    variables: Variables,
}

impl BoundInstance {
    pub(crate) fn new(harness: Harness, key: InstanceKey, process: &str, variables: Variables) -> Self {
        Self {
            harness,
            key,
            process: process.to_string(),
            variables,
        }
    }

    pub fn key(&self) -> InstanceKey {
        self.key
    }

    /// BPMN process id the instance was created from.
    pub fn process(&self) -> &str {
        &self.process
    }

    /// Variables the instance was started with.
    pub fn start_variables(&self) -> &Variables {
        &self.variables
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// Current broker-side status of the instance.
    pub async fn status(&self) -> Result<InstanceStatus> {
        Ok(self.harness.gateway().instance_status(self.key).await?)
    }

    /// Set variables on an element instance of this workflow instance.
    ///
    /// Passing the instance key itself updates the root scope.
    pub async fn set_variables(
        &self,
        element_instance_key: i64,
        variables: impl Serialize,
        local: bool,
    ) -> Result<()> {
        let variables = to_variables(variables)?;
        self.harness
            .gateway()
            .set_variables(element_instance_key, variables, local)
            .await?;
        Ok(())
    }
}

impl Deref for BoundInstance {
    type Target = Harness;

    fn deref(&self) -> &Harness {
        &self.harness
    }
}

impl Drop for BoundInstance {
    fn drop(&mut self) {
        self.harness.unbind(self.key);
    }
}
