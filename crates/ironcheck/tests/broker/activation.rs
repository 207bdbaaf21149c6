//! Job activation engine behavior.

use std::time::{Duration, Instant};

use ironcheck::{ActivateOptions, Error, GatewayError, InMemoryBroker};
use serde_json::{Value, json};
use test_utils::{harness_test, test_harness};

use crate::support::helpers::{CountingGateway, SHORT_TIMEOUT, fixture, impatient_harness};

#[tokio::test]
async fn zero_max_jobs_returns_empty_without_a_request() -> anyhow::Result<()> {
    let gateway = CountingGateway::new(InMemoryBroker::new());
    let harness = test_harness(gateway.clone(), "zero_max_jobs")?;
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    let started = Instant::now();
    let jobs = harness
        .activate_jobs("do_something", ActivateOptions::default().max_jobs(0))
        .await?;

    assert!(jobs.is_empty());
    assert_eq!(gateway.activations(), 0);
    assert!(started.elapsed() < SHORT_TIMEOUT);
    Ok(())
}

#[tokio::test]
async fn zero_max_jobs_still_checks_the_worker() -> anyhow::Result<()> {
    let harness = test_harness(InMemoryBroker::new(), "zero_max_jobs_worker")?;

    let err = harness
        .activate_jobs(
            "do_something",
            ActivateOptions::default().max_jobs(0).worker("  "),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    Ok(())
}

#[tokio::test]
async fn zero_timeout_probes_exactly_once() -> anyhow::Result<()> {
    let gateway = CountingGateway::new(InMemoryBroker::new());
    let harness = test_harness(gateway.clone(), "zero_timeout")?;

    let job = harness
        .activate_job(
            "do_something",
            ActivateOptions::default().timeout(Duration::ZERO),
        )
        .await?;

    assert!(job.is_pending());
    assert_eq!(gateway.activations(), 1);
    Ok(())
}

#[tokio::test]
async fn activation_polls_through_propagation_delay() -> anyhow::Result<()> {
    let broker = InMemoryBroker::builder()
        .propagation_delay(Duration::from_millis(150))
        .build();
    let gateway = CountingGateway::new(broker);
    let harness = test_harness(gateway.clone(), "propagation_delay")?;
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    let started = Instant::now();
    let job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;

    assert!(!job.is_pending());
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert!(gateway.activations() > 1);
    Ok(())
}

#[tokio::test]
async fn gateway_errors_are_propagated_not_timed_out() -> anyhow::Result<()> {
    let gateway = CountingGateway::new(InMemoryBroker::new());
    let harness = test_harness(gateway.clone(), "gateway_errors")?;
    gateway.go_down();

    let err = harness
        .activate_job("do_something", ActivateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Gateway(GatewayError::Unavailable(_))), "{err}");
    assert_eq!(gateway.activations(), 1);
    Ok(())
}

harness_test!(blank_worker_fails_fast_when_validated, |harness| {
    let err = harness
        .activate_job("do_something", ActivateOptions::default().worker(""))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "'worker' cannot be blank");
    Ok(())
});

harness_test!(blank_worker_reaches_the_broker_without_validation, |harness| {
    let err = harness
        .activate_job(
            "do_something",
            ActivateOptions::default().worker(" ").validate(false),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Gateway(GatewayError::InvalidArgument(_))), "{err}");
    Ok(())
});

harness_test!(generated_workers_use_the_configured_prefix, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    let job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    let worker = &job.job().expect("job activated").worker;
    assert!(worker.starts_with(&harness.config().default_worker_prefix), "{worker}");
    assert!(worker.len() > harness.config().default_worker_prefix.len());
    Ok(())
});

harness_test!(explicit_worker_is_sent_to_the_broker, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    let job = harness
        .activate_job("do_something", ActivateOptions::default().worker("billing"))
        .await?;
    assert_eq!(job.query().worker, "billing");
    assert_eq!(job.job().expect("job activated").worker, "billing");
    Ok(())
});

harness_test!(activate_jobs_returns_what_is_available_up_to_max, |harness| {
    for input in 1..=3 {
        harness.create_and_release("one_task", json!({"input": input})).await?;
    }

    let first = harness
        .activate_jobs("do_something", ActivateOptions::default().max_jobs(2))
        .await?;
    let rest = harness
        .activate_jobs("do_something", ActivateOptions::default().max_jobs(5))
        .await?;

    assert_eq!(first.len(), 2);
    assert_eq!(rest.len(), 1);
    assert!(first[0].key() < first[1].key());
    assert!(first[1].key() < rest[0].key());
    assert_eq!(first[0].variables().map(|v| v["input"].clone()), Some(json!(1)));
    Ok(())
});

harness_test!(activate_job_picks_the_lowest_key, |harness| {
    let older = harness.create_and_release("one_task", json!({"input": 1})).await?;
    harness.create_and_release("one_task", json!({"input": 2})).await?;

    let job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    assert_eq!(job.workflow_instance_key(), Some(older));
    Ok(())
});

harness_test!(fetching_a_scalar_key, |harness| {
    harness
        .create_and_release("one_task", json!({"input": 1, "other": "x"}))
        .await?;

    let job = harness
        .activate_job(
            "do_something",
            ActivateOptions::default().fetch_variables("input"),
        )
        .await?;
    assert_eq!(job.variables().cloned().map(Value::Object), Some(json!({"input": 1})));
    Ok(())
});

harness_test!(fetching_a_missing_key_yields_an_empty_mapping, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    let job = harness
        .activate_job(
            "do_something",
            ActivateOptions::default().fetch_variables("missing"),
        )
        .await?;
    assert!(!job.is_pending());
    assert_eq!(job.variables().map(|v| v.is_empty()), Some(true));
    Ok(())
});

harness_test!(fetching_a_key_set_omits_missing_keys, |harness| {
    harness
        .create_and_release("one_task", json!({"a": 1, "b": 2, "c": 3}))
        .await?;

    let job = harness
        .activate_job(
            "do_something",
            ActivateOptions::default().fetch_variables(["a", "c", "zzz"]),
        )
        .await?;
    assert_eq!(
        job.variables().cloned().map(Value::Object),
        Some(json!({"a": 1, "c": 3}))
    );
    Ok(())
});

#[tokio::test]
async fn job_with_type_requires_a_job() -> anyhow::Result<()> {
    let harness = impatient_harness(InMemoryBroker::new());
    harness.deploy_workflow(fixture("one_task.bpmn"), None).await?;

    let err = harness.job_with_type("do_something").await.unwrap_err();
    assert!(matches!(&err, Error::NoJob { job_type, .. } if job_type == "do_something"), "{err}");

    harness.create_and_release("one_task", json!({"input": 1})).await?;
    let job = harness.job_with_type("do_something").await?;
    assert_eq!(job.job_type(), "do_something");
    Ok(())
}
