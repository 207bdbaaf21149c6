//! Test utilities for ironcheck.
//!
//! Features:
//! - Per-test harness over a fresh [`InMemoryBroker`].
//! - Configuration from the environment, with `.env` support.
//! - Worker identities prefixed with the test name, so broker logs show
//!   which test leased a job.
//!
//! The workflow directory defaults to the ironcheck fixtures unless
//! `IRONCHECK_WORKFLOW_DIR` is set.

use std::{future::Future, path::PathBuf, pin::Pin};

use anyhow::Result;
use ironcheck::{Gateway, Harness, HarnessConfig, InMemoryBroker};

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ironcheck=debug")
        .with_test_writer()
        .try_init();
}

/// Directory holding the BPMN fixtures shipped with ironcheck.
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../ironcheck/fixtures"))
}

/// Harness configuration for tests.
///
/// Loads `.env`, overlays `IRONCHECK_*` variables and points the workflow
/// directory at [`fixtures_dir`] unless overridden.
pub fn test_config() -> Result<HarnessConfig> {
    dotenvy::from_filename(".env").ok();

    let mut config = HarnessConfig::from_env()?;
    if std::env::var_os("IRONCHECK_WORKFLOW_DIR").is_none() {
        config.workflow_dir = fixtures_dir();
    }
    Ok(config)
}

/// Build a test harness over `gateway`.
pub fn test_harness(gateway: impl Gateway, test_name: &str) -> Result<Harness> {
    init_test_tracing();

    let mut config = test_config()?;
    config.default_worker_prefix = format!(
        "{}{}-",
        config.default_worker_prefix,
        make_worker_tag(test_name)
    );
    Ok(Harness::new(gateway, config))
}

/// Run `f` with a harness over a fresh in-memory broker.
pub async fn with_test_harness<F, T>(test_name: &str, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a Harness) -> Pin<Box<dyn Future<Output = Result<T>> + 'a>>,
{
    let harness = test_harness(InMemoryBroker::new(), test_name)?;

    let result = f(&harness).await;
    if let Err(err) = &result {
        eprintln!("[with_test_harness] '{test_name}' failed: {err:#}");
    }
    result
}

/// Build a worker tag from a test name.
///
/// - lowercases
/// - replaces non-ascii-alphanumeric with '-'
/// - truncates to keep worker identities short
fn make_worker_tag(test_name: &str) -> String {
    let sanitized: String = test_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();

    let mut tag = sanitized.trim_matches('-').to_string();
    tag.truncate(32);
    tag
}

/// Macro to define a harness-backed async test.
///
/// Usage:
///
/// ```ignore
/// use test_utils::harness_test;
///
/// harness_test!(one_task_completes, |harness| {
///     // `harness` is &Harness
///     harness.create_and_release("one_task", ()).await?;
///     Ok(())
/// });
/// ```
///
/// This expands to:
/// - `#[tokio::test]`
/// - a call to `with_test_harness(stringify!(test_name), |harness| async move { ... })`
#[macro_export]
macro_rules! harness_test {
    ($name:ident, |$harness:ident| $body:block) => {
        #[tokio::test]
        async fn $name() -> anyhow::Result<()> {
            use $crate::with_test_harness;

            let test_name = stringify!($name);

            with_test_harness(test_name, |$harness| {
                let fut = async move { $body };
                Box::pin(fut)
            })
            .await
        }
    };
}
