//! Application registry behavior over the control channel.

mod support;

use std::time::Duration;

use kite_client::{DenyReason, SessionError};
use kite_proto::{ControlRequest, OpenAppResponse};
use support::{decode_request, ready_session, wait_until};

#[tokio::test]
async fn duplicate_and_cached_names_cost_one_request_each() {
    let mut harness = ready_session().await;
    let control = &harness.control;

    let (result, ()) = tokio::join!(
        harness.session.request_apps(&["files", "files", "cam"]),
        async {
            wait_until(|| control.sent_count() == 1).await;
            assert_eq!(
                decode_request(&control.sent()[0]),
                ControlRequest::OpenApp {
                    name: "files".into()
                }
            );
            control.inject(OpenAppResponse(Ok(1)).encode());

            wait_until(|| control.sent_count() == 2).await;
            assert_eq!(
                decode_request(&control.sent()[1]),
                ControlRequest::OpenApp { name: "cam".into() }
            );
            control.inject(OpenAppResponse(Ok(2)).encode());
        }
    );
    result.unwrap();
    assert_eq!(control.sent_count(), 2, "one OpenApp per distinct name");

    // Every name is registered now: no further wire traffic.
    harness.session.request_apps(&["files", "cam"]).await.unwrap();
    assert_eq!(control.sent_count(), 2);
}

#[tokio::test]
async fn denied_app_aborts_the_rest_of_the_batch() {
    let mut harness = ready_session().await;
    let control = &harness.control;

    let (result, ()) = tokio::join!(harness.session.request_apps(&["vault", "cam"]), async {
        wait_until(|| control.sent_count() == 1).await;
        control.inject(OpenAppResponse(Err(13)).encode());
    });

    match result.unwrap_err() {
        SessionError::ApplicationDenied { name, reason } => {
            assert_eq!(name, "vault");
            assert_eq!(reason, DenyReason::Error(13));
        }
        other => panic!("expected ApplicationDenied, got {other}"),
    }
    // "cam" was never requested.
    assert_eq!(control.sent_count(), 1);

    // The denial is scoped to the batch; a later request still works.
    let (result, ()) = tokio::join!(harness.session.request_apps(&["cam"]), async {
        wait_until(|| control.sent_count() == 2).await;
        control.inject(OpenAppResponse(Ok(2)).encode());
    });
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_app_times_out_after_thirty_seconds() {
    let mut harness = ready_session().await;
    let started = tokio::time::Instant::now();

    let err = harness.session.request_apps(&["slow"]).await.unwrap_err();
    match err {
        SessionError::ApplicationDenied { name, reason } => {
            assert_eq!(name, "slow");
            assert_eq!(reason, DenyReason::Timeout);
        }
        other => panic!("expected ApplicationDenied, got {other}"),
    }
    assert_eq!(started.elapsed(), Duration::from_secs(30));

    // A response arriving after the timeout is dropped, not misapplied.
    harness.control.inject(OpenAppResponse(Ok(9)).encode());
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(harness.events.try_recv().is_err(), "no error event after the batch already failed");

    // The session is still healthy for new batches.
    let control = &harness.control;
    let (result, ()) = tokio::join!(harness.session.request_apps(&["ok"]), async {
        wait_until(|| control.sent_count() == 2).await;
        control.inject(OpenAppResponse(Ok(3)).encode());
    });
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn timely_response_leaves_no_stale_timer() {
    let mut harness = ready_session().await;
    let control = &harness.control;

    let (result, ()) = tokio::join!(harness.session.request_apps(&["files"]), async {
        wait_until(|| control.sent_count() == 1).await;
        control.inject(OpenAppResponse(Ok(1)).encode());
    });
    result.unwrap();

    // Long after the would-be deadline, nothing fires.
    tokio::time::advance(Duration::from_secs(60)).await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test]
async fn batches_are_serialized_in_submission_order() {
    let mut harness = ready_session().await;
    let control = &harness.control;
    let session = &harness.session;

    let (first, second, ()) = tokio::join!(
        session.request_apps(&["alpha"]),
        session.request_apps(&["beta"]),
        async {
            wait_until(|| control.sent_count() == 1).await;
            assert_eq!(
                decode_request(&control.sent()[0]),
                ControlRequest::OpenApp {
                    name: "alpha".into()
                }
            );
            control.inject(OpenAppResponse(Ok(1)).encode());

            wait_until(|| control.sent_count() == 2).await;
            assert_eq!(
                decode_request(&control.sent()[1]),
                ControlRequest::OpenApp {
                    name: "beta".into()
                }
            );
            control.inject(OpenAppResponse(Ok(2)).encode());
        }
    );
    first.unwrap();
    second.unwrap();
}
