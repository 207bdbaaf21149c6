//! Job handle lifecycle.

use std::time::Duration;

use ironcheck::{ActivateOptions, Error, InMemoryBroker, JobState};
use serde_json::json;
use test_utils::harness_test;

use crate::support::helpers::{SHORT_TIMEOUT, impatient_harness};

harness_test!(completed_job_rejects_every_transition, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;
    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .and_complete(json!({"result": "done"}))
        .await?;

    for err in [
        job.complete(()).await.unwrap_err(),
        job.complete(5).await.unwrap_err(),
        job.set_variables(5, true).await.unwrap_err(),
        job.fail(Some("late")).await.unwrap_err(),
        job.throw_error("ERROR_BOOM", None).await.unwrap_err(),
        job.update_retries(1).await.unwrap_err(),
    ] {
        assert!(err.is_state_conflict(), "{err}");
        assert!(err.to_string().contains("'COMPLETED'"), "{err}");
    }
    assert_eq!(job.state(), JobState::Completed);
    Ok(())
});

harness_test!(failed_job_rejects_completion, |harness| {
    harness.create_and_release("two_tasks", json!({"input": 1})).await?;
    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .and_fail("first attempt")
        .await?;

    let err = job.complete(()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "cannot complete job {} (do_something): job is in state 'FAILED'",
            job.key().expect("job activated")
        )
    );
    Ok(())
});

harness_test!(failing_decrements_retries_for_the_next_activation, |harness| {
    harness.create_and_release("two_tasks", json!({"input": 1})).await?;
    let first = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    assert_eq!(first.retries(), Some(3));
    let first = first.and_fail("try again").await?;

    let second = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    assert_eq!(second.key(), first.key());
    assert_eq!(second.retries(), Some(2));
    assert_eq!(second.state(), JobState::Activated);
    Ok(())
});

harness_test!(failing_without_a_message_still_consumes_a_retry, |harness| {
    let instance = harness.create_and_release("one_task", json!({"input": 1})).await?;
    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    assert_eq!(job.retries(), Some(3));

    job.fail(None).await?;
    assert_eq!(job.state(), JobState::Failed);

    let mut retried = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    assert_eq!(retried.retries(), Some(2));
    retried.fail_with_retries(None, 0).await?;

    let err = harness
        .wait_for_completion(instance, SHORT_TIMEOUT)
        .await
        .unwrap_err();
    match err {
        Error::CompletionTimeout { incident, .. } => {
            assert!(incident.is_some_and(|i| i.contains("no error message")));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
});

harness_test!(updating_retries_keeps_the_handle_activated, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;
    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;

    job.update_retries(7).await?;
    assert_eq!(job.state(), JobState::Activated);
    assert_eq!(job.retries(), Some(3));

    job.complete(()).await?;
    assert_eq!(job.state(), JobState::Completed);
    Ok(())
});

harness_test!(error_boundary_moves_the_instance_along, |harness| {
    let instance = harness
        .create_and_release("error_boundary", json!({"input": 1}))
        .await?;

    let thrown = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .and_throw_error("ERROR_BOOM")
        .await?;
    assert_eq!(thrown.state(), JobState::ErrorThrown);

    // A fresh activation after the throw is a new, independent handle.
    let handler = harness
        .activate_job("handle_error", ActivateOptions::default())
        .await?
        .expect_input(json!({"input": 1}))?
        .and_complete(())
        .await?;
    assert_ne!(handler.key(), thrown.key());

    harness
        .wait_for_completion(instance, Duration::from_secs(5))
        .await?;
    Ok(())
});

harness_test!(job_instance_key_comes_from_the_job, |harness| {
    let earlier = harness.create_and_release("one_task", json!({"input": 1})).await?;
    let instance = harness.create_instance("one_task", json!({"input": 2})).await?;

    let job = instance
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    assert_eq!(job.workflow_instance_key(), Some(earlier));
    assert_ne!(job.workflow_instance_key(), Some(instance.key()));
    Ok(())
});

#[tokio::test]
async fn pending_handle_rejects_operations() -> anyhow::Result<()> {
    let harness = impatient_harness(InMemoryBroker::new());

    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;

    assert!(job.is_pending());
    assert_eq!(job.job_type(), "do_something");
    assert!(job.key().is_none());
    assert!(job.variables().is_none());
    assert!(job.headers().is_none());
    assert!(job.workflow_instance_key().is_none());
    assert!(job.retries().is_none());

    let err = job.complete(()).await.unwrap_err();
    assert!(err.to_string().contains("'PENDING'"), "{err}");
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_block_completion_with_an_incident() -> anyhow::Result<()> {
    let harness = impatient_harness(InMemoryBroker::new());
    let instance = harness
        .create_and_release("one_task", json!({"input": 1}))
        .await?;

    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    job.fail_with_retries(Some("database down"), 0).await?;

    let err = harness
        .wait_for_completion(instance, SHORT_TIMEOUT)
        .await
        .unwrap_err();
    match &err {
        Error::CompletionTimeout {
            instance_key,
            elapsed,
            incident,
        } => {
            assert_eq!(*instance_key, instance);
            assert!(*elapsed >= SHORT_TIMEOUT);
            assert!(incident.as_deref().is_some_and(|i| i.contains("database down")));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Giving the job retries back lets it run again.
    let key = job.key().expect("job activated");
    harness.gateway().update_job_retries(key, 1).await?;
    harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .and_complete(())
        .await?;
    harness.wait_for_completion(instance, SHORT_TIMEOUT).await?;
    Ok(())
}

#[tokio::test]
async fn unhandled_error_is_reported_by_the_completion_observer() -> anyhow::Result<()> {
    let harness = impatient_harness(InMemoryBroker::new());

    harness
        .with_workflow_instance("one_task", json!({"input": 1}), |instance| {
            Box::pin(async move {
                instance
                    .activate_job("do_something", ActivateOptions::default())
                    .await?
                    .and_throw_error("ERROR_BOOM")
                    .await?;

                let err = instance.workflow_complete().await.unwrap_err();
                let message = err.to_string();
                assert!(message.contains(&instance.key().to_string()), "{message}");
                assert!(message.contains("unhandled error event 'ERROR_BOOM'"), "{message}");
                Ok::<_, anyhow::Error>(())
            })
        })
        .await
}
