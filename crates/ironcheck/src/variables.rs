//! Variable and header payload types.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// JSON-compatible key/value payload attached to instances and jobs.
pub type Variables = Map<String, Value>;

/// Custom headers declared on a service task.
pub type Headers = BTreeMap<String, String>;

/// Serialize a value into a variables mapping.
///
/// `null` (e.g. `()` or `None`) is treated as an empty mapping. Anything that
/// does not serialize to a JSON object is rejected.
pub fn to_variables(value: impl Serialize) -> Result<Variables> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Variables::new()),
        other => Err(Error::invalid_argument(format!(
            "variables must serialize to a JSON object, got {other}"
        ))),
    }
}

/// Which variables an activation should fetch.
///
/// # Example
///
/// ```
/// use ironcheck::FetchVariables;
///
/// assert_eq!(FetchVariables::from("input"), FetchVariables::Only(vec!["input".into()]));
/// assert_eq!(
///     FetchVariables::from(["a", "b"]),
///     FetchVariables::Only(vec!["a".into(), "b".into()])
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FetchVariables {
    /// Fetch every variable visible to the job.
    #[default]
    All,
    /// Fetch only the listed keys; missing keys are silently omitted.
    Only(Vec<String>),
}

impl FetchVariables {
    /// The key list sent to the gateway (empty means all).
    pub fn keys(&self) -> &[String] {
        match self {
            FetchVariables::All => &[],
            FetchVariables::Only(keys) => keys,
        }
    }

    /// Project a variables mapping onto the requested keys.
    pub fn project(&self, mut variables: Variables) -> Variables {
        match self {
            FetchVariables::All => variables,
            FetchVariables::Only(keys) => keys
                .iter()
                .filter_map(|key| variables.remove_entry(key))
                .collect(),
        }
    }
}

impl From<&str> for FetchVariables {
    fn from(key: &str) -> Self {
        FetchVariables::Only(vec![key.to_string()])
    }
}

impl From<String> for FetchVariables {
    fn from(key: String) -> Self {
        FetchVariables::Only(vec![key])
    }
}

impl From<Vec<String>> for FetchVariables {
    fn from(keys: Vec<String>) -> Self {
        FetchVariables::Only(keys)
    }
}

impl From<Vec<&str>> for FetchVariables {
    fn from(keys: Vec<&str>) -> Self {
        FetchVariables::Only(keys.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for FetchVariables {
    fn from(keys: [&str; N]) -> Self {
        FetchVariables::Only(keys.into_iter().map(str::to_string).collect())
    }
}

/// Render headers as a JSON object for comparisons and messages.
pub(crate) fn headers_to_value(headers: &Headers) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}
