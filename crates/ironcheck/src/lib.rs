//! Deterministic, timeout-bounded test harness for BPMN job brokers.
//!
//! A broker executes process instances asynchronously and hands out jobs to
//! polling workers with no guarantee of immediate visibility. Ironcheck turns
//! that protocol into blocking, test-friendly steps:
//!
//! - **Bounded polling**: every wait goes through [`PollPolicy`]; nothing
//!   waits past its deadline
//! - **Absence is not an error**: a timed-out activation yields a pending
//!   [`JobHandle`]; callers decide whether that fails the test
//! - **Guarded job lifecycle**: [`JobHandle`] is a small state machine; a
//!   finished job rejects further transitions with a state conflict
//! - **Scoped instances**: [`BoundInstance`] binds one instance to the
//!   harness and unbinds it on drop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Harness ── deploy / create_instance / with_workflow_instance     │
//! │    │                                                             │
//! │    ├── activate_job(s) ──▶ PollPolicy ──▶ Gateway::activate_jobs │
//! │    │        └─▶ JobHandle ── complete / fail / throw_error       │
//! │    │                                                             │
//! │    └── wait_for_completion ──▶ PollPolicy ──▶ instance_status    │
//! └──────────────────────────────────────────────────────────────────┘
//!                                │
//!                      dyn Gateway (InMemoryBroker, ...)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ironcheck::{ActivateOptions, Harness, HarnessConfig, InMemoryBroker, workflow_complete};
//! use serde_json::json;
//!
//! # async fn run() -> ironcheck::Result<()> {
//! let harness = Harness::new(InMemoryBroker::new(), HarnessConfig::from_env()?);
//!
//! harness
//!     .with_workflow_instance("one_task", json!({"input": 1}), |instance| {
//!         Box::pin(async move {
//!             instance
//!                 .activate_job("do_something", ActivateOptions::default())
//!                 .await?
//!                 .expect_headers(json!({"what_to_do": "nothing"}))?
//!                 .and_complete(())
//!                 .await?;
//!             workflow_complete!(instance);
//!             Ok::<_, ironcheck::Error>(())
//!         })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod activation;
mod config;
mod context;
mod error;
mod expect;
pub mod gateway;
mod harness;
mod job;
mod observer;
mod poll;
mod variables;

pub use activation::{ActivateOptions, ActivationQuery, Worker};
pub use config::HarnessConfig;
pub use context::BoundInstance;
pub use error::{Error, Result};
pub use expect::{Expectation, HaveVariables, all_have_variables, have_activated, have_variables};
pub use gateway::{
    ActivatedJob, DeploymentAck, Gateway, GatewayError, InMemoryBroker, InMemoryBrokerBuilder,
    InstanceKey, InstanceStatus, JobKey, PublishMessage,
};
pub use harness::Harness;
pub use job::{JobHandle, JobState};
pub use nonempty::NonEmpty;
pub use poll::PollPolicy;
pub use variables::{FetchVariables, Headers, Variables, to_variables};
