//! Assertions over job variables and headers.
//!
//! All comparisons are exact mapping equality. A mismatch is reported as
//! [`Error::AssertionMismatch`] carrying both mappings rendered as JSON.

use serde::Serialize;
use serde_json::Value;

use crate::activation::ActivateOptions;
use crate::error::{Error, Result};
use crate::harness::Harness;
use crate::job::JobHandle;
use crate::variables::{headers_to_value, to_variables};

const VARIABLES: &str = "job variables";
const HEADERS: &str = "job headers";

fn actual_variables(job: &JobHandle) -> Value {
    job.variables()
        .map(|variables| Value::Object(variables.clone()))
        .unwrap_or(Value::Null)
}

fn actual_headers(job: &JobHandle) -> Value {
    job.headers().map(headers_to_value).unwrap_or(Value::Null)
}

fn check(subject: &str, expected: &Value, actual: &Value) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::mismatch(subject, expected, actual))
    }
}

impl JobHandle {
    /// Assert the job's (filtered) variables equal `expected` exactly.
    pub fn expect_input(self, expected: impl Serialize) -> Result<Self> {
        let expected = Value::Object(to_variables(expected)?);
        check(VARIABLES, &expected, &actual_variables(&self))?;
        Ok(self)
    }

    /// Assert the job's custom headers equal `expected` exactly.
    pub fn expect_headers(self, expected: impl Serialize) -> Result<Self> {
        let expected = Value::Object(to_variables(expected)?);
        check(HEADERS, &expected, &actual_headers(&self))?;
        Ok(self)
    }
}

/// Matcher for "has exactly these variables".
///
/// # Example
///
/// ```
/// use ironcheck::have_variables;
/// use serde_json::json;
///
/// let matcher = have_variables(json!({"input": 1}));
/// # let _ = matcher;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HaveVariables {
    expected: Value,
}

/// Build a [`HaveVariables`] matcher.
pub fn have_variables(expected: Value) -> HaveVariables {
    HaveVariables { expected }
}

impl HaveVariables {
    /// Returns `true` if the job's variables equal the expected mapping.
    pub fn matches(&self, job: &JobHandle) -> bool {
        self.expected == actual_variables(job)
    }

    /// Like [`matches`](Self::matches) but reports the mismatch.
    pub fn check(&self, job: &JobHandle) -> Result<()> {
        check(VARIABLES, &self.expected, &actual_variables(job))
    }
}

/// Assert every job in `jobs` has exactly the `expected` variables.
///
/// The first mismatching job is reported.
pub fn all_have_variables<'a>(
    jobs: impl IntoIterator<Item = &'a JobHandle>,
    expected: Value,
) -> Result<()> {
    let matcher = have_variables(expected);
    jobs.into_iter().try_for_each(|job| matcher.check(job))
}

/// A composed "activate, check, then complete" expectation.
///
/// Evaluated by [`Harness::verify`]. Built with [`have_activated`].
///
/// # Example
///
/// ```
/// use ironcheck::have_activated;
/// use serde_json::json;
///
/// let expectation = have_activated("do_something")
///     .with_variables(json!({"input": 1}))
///     .and_complete();
/// # let _ = expectation;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    job_type: String,
    options: ActivateOptions,
    variables: Option<Value>,
    headers: Option<Value>,
    completion: Option<Value>,
}

/// Expect the next job of `job_type` to be activated.
pub fn have_activated(job_type: impl Into<String>) -> Expectation {
    Expectation {
        job_type: job_type.into(),
        options: ActivateOptions::default(),
        variables: None,
        headers: None,
        completion: None,
    }
}

impl Expectation {
    /// Activate with these options instead of the defaults.
    pub fn with_options(mut self, options: ActivateOptions) -> Self {
        self.options = options;
        self
    }

    /// Require exactly these variables.
    pub fn with_variables(mut self, expected: Value) -> Self {
        self.variables = Some(expected);
        self
    }

    /// Require exactly these custom headers.
    pub fn with_headers(mut self, expected: Value) -> Self {
        self.headers = Some(expected);
        self
    }

    /// Complete the job without variables once the checks pass.
    pub fn and_complete(self) -> Self {
        self.and_complete_with(Value::Null)
    }

    /// Complete the job with `variables` once the checks pass.
    pub fn and_complete_with(mut self, variables: Value) -> Self {
        self.completion = Some(variables);
        self
    }
}

impl Harness {
    /// Evaluate an [`Expectation`]: activate, check, and optionally complete.
    ///
    /// Fails with [`Error::NoJob`] if nothing was activated in time.
    pub async fn verify(&self, expectation: Expectation) -> Result<JobHandle> {
        let Expectation {
            job_type,
            options,
            variables,
            headers,
            completion,
        } = expectation;

        let mut job = self.activate_job(&job_type, options).await?;
        if job.is_pending() {
            return Err(Error::NoJob {
                job_type,
                waited: job.query().timeout,
            });
        }

        if let Some(expected) = &variables {
            check(VARIABLES, expected, &actual_variables(&job))?;
        }
        if let Some(expected) = &headers {
            check(HEADERS, expected, &actual_headers(&job))?;
        }
        if let Some(variables) = completion {
            job.complete(variables).await?;
        }
        Ok(job)
    }
}
