//! Variable scoping and assertion helpers.

use ironcheck::{
    ActivateOptions, Error, InMemoryBroker, all_have_variables, have_activated, have_variables,
    workflow_complete,
};
use serde_json::json;
use test_utils::harness_test;

use crate::support::helpers::impatient_harness;

harness_test!(local_variables_stay_in_their_element, |harness| {
    let instance = harness
        .create_and_release("two_tasks", json!({"input": 1}))
        .await?;

    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    job.set_variables(json!({"scratch": "local"}), true).await?;
    job.complete(()).await?;

    let next = harness
        .activate_job("next_step", ActivateOptions::default())
        .await?
        .expect_input(json!({"input": 1}))?;
    assert_eq!(next.workflow_instance_key(), Some(instance));
    Ok(())
});

harness_test!(non_local_variables_reach_later_elements, |harness| {
    harness
        .create_and_release("two_tasks", json!({"input": 1}))
        .await?;

    let mut job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    job.set_variables(json!({"shared": "yes"}), false).await?;
    job.complete(()).await?;

    harness
        .activate_job("next_step", ActivateOptions::default())
        .await?
        .expect_input(json!({"input": 1, "shared": "yes"}))?;
    Ok(())
});

harness_test!(local_variables_shadow_instance_variables_for_their_job, |harness| {
    harness
        .create_and_release("two_tasks", json!({"input": 1}))
        .await?;

    let job = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?;
    job.set_variables(json!({"input": 2}), true).await?;
    job.and_fail("retry with local input").await?;

    // The retried job sees its local scope over the instance scope.
    harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .expect_input(json!({"input": 2}))?;
    Ok(())
});

harness_test!(completion_variables_merge_into_the_instance, |harness| {
    harness
        .create_and_release("two_tasks", json!({"input": 1}))
        .await?;

    harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .and_complete(json!({"input": 5, "output": [1, 2]}))
        .await?;

    harness
        .activate_job("next_step", ActivateOptions::default())
        .await?
        .expect_input(json!({"input": 5, "output": [1, 2]}))?;
    Ok(())
});

harness_test!(instance_level_set_variables_update_the_root_scope, |harness| {
    harness
        .with_workflow_instance("one_task", json!({"input": 1}), |instance| {
            Box::pin(async move {
                instance
                    .set_variables(instance.key().get(), json!({"added": true}), false)
                    .await?;

                instance
                    .activate_job("do_something", ActivateOptions::default())
                    .await?
                    .expect_input(json!({"input": 1, "added": true}))?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .await?;
    Ok(())
});

harness_test!(input_mismatch_names_both_mappings, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    let err = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .expect_input(json!({"input": 2}))
        .unwrap_err();

    assert!(matches!(err, Error::AssertionMismatch { .. }));
    assert_eq!(
        err.to_string(),
        r#"expected job variables to be {"input":2} but got {"input":1}"#
    );
    Ok(())
});

harness_test!(header_mismatch_names_both_mappings, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    let err = harness
        .activate_job("do_something", ActivateOptions::default())
        .await?
        .expect_headers(json!({"what_to_do": "everything"}))
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        r#"expected job headers to be {"what_to_do":"everything"} but got {"what_to_do":"nothing"}"#
    );
    Ok(())
});

harness_test!(headers_ignore_the_fetch_filter, |harness| {
    harness.create_and_release("one_task", json!({"input": 1})).await?;

    harness
        .activate_job(
            "do_something",
            ActivateOptions::default().fetch_variables("missing"),
        )
        .await?
        .expect_input(json!({}))?
        .expect_headers(json!({"what_to_do": "nothing"}))?;
    Ok(())
});

harness_test!(every_job_in_a_batch_has_the_same_variables, |harness| {
    for _ in 0..2 {
        harness.create_and_release("one_task", json!({"input": 1})).await?;
    }
    harness.create_and_release("one_task", json!({"input": 2})).await?;

    let jobs = harness
        .activate_jobs("do_something", ActivateOptions::default().max_jobs(3))
        .await?;
    assert_eq!(jobs.len(), 3);

    all_have_variables(&jobs[..2], json!({"input": 1}))?;
    let err = all_have_variables(&jobs, json!({"input": 1})).unwrap_err();
    assert!(err.to_string().contains(r#"but got {"input":2}"#), "{err}");

    let matcher = have_variables(json!({"input": 2}));
    assert_eq!(jobs.iter().filter(|job| matcher.matches(job)).count(), 1);
    Ok(())
});

harness_test!(composed_expectation_activates_checks_and_completes, |harness| {
    harness
        .with_workflow_instance("one_task", json!({"input": 1}), |instance| {
            Box::pin(async move {
                let job = instance
                    .verify(
                        have_activated("do_something")
                            .with_variables(json!({"input": 1}))
                            .with_headers(json!({"what_to_do": "nothing"}))
                            .and_complete(),
                    )
                    .await?;
                assert!(job.state().is_terminal());
                workflow_complete!(instance);
                Ok::<_, anyhow::Error>(())
            })
        })
        .await?;
    Ok(())
});

#[tokio::test]
async fn composed_expectation_fails_without_a_job() -> anyhow::Result<()> {
    let harness = impatient_harness(InMemoryBroker::new());

    let err = harness
        .verify(have_activated("do_something").with_variables(json!({"input": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoJob { .. }), "{err}");
    Ok(())
}

#[tokio::test]
async fn composed_expectation_does_not_complete_on_mismatch() -> anyhow::Result<()> {
    let harness = impatient_harness(InMemoryBroker::new());
    let instance = harness
        .create_and_release("one_task", json!({"input": 1}))
        .await?;

    let err = harness
        .verify(
            have_activated("do_something")
                .with_variables(json!({"input": 99}))
                .and_complete(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AssertionMismatch { .. }), "{err}");

    let status = harness.gateway().instance_status(instance).await?;
    assert!(!status.completed);
    assert!(status.incident.is_none());
    Ok(())
}
