//! Failure and cancellation tests.
//!
//! Tests for how one failing computation affects its readers, the rest of
//! the run, and what gets persisted.

use std::time::Duration;

use crate::{BoxError, CellOutcome, Failure, LogStore, RunError, ROOT_IDENTITY};

use super::common::{memory, Counters, TestError};

/// Test that every reader of a failed computation sees the same failure and
/// the run reports it once.
#[tokio::test]
async fn failure_fans_out_to_readers() {
    let (recall, store) = memory();

    let (result, report) = recall
        .run_with_report(|ctx| async move {
            let a = ctx.log("a", |_| async {
                Err::<i64, BoxError>(TestError::DiskFull.into())
            });
            let b = ctx.log("b", {
                let a = a.clone();
                move |ctx| async move { Ok::<_, BoxError>(ctx.read(&a).await? + 1) }
            });
            let c = ctx.log("c", move |ctx| async move {
                Ok::<_, BoxError>(ctx.read(&a).await? + 2)
            });
            let b = ctx.read(&b).await?;
            let c = ctx.read(&c).await?;
            Ok::<_, BoxError>(b + c)
        })
        .await;

    let err = result.expect_err("run should fail");
    assert_eq!(err.failures().len(), 1);
    assert!(err.contains("a"));
    match &err.failures()[0] {
        Failure::Compute { identity, cause } => {
            assert_eq!(identity, "a");
            assert_eq!(cause.to_string(), "disk full");
        }
        other => panic!("Expected Compute, got {:?}", other),
    }
    assert!(err.to_string().starts_with("run failed:"));

    for identity in ["a", "b", "c"] {
        assert_eq!(report.outcome_of(identity), Some(CellOutcome::Failed));
    }
    assert!(store.is_empty());
}

/// Test that a long body racing against `cancel_alt` stops after a failure.
#[tokio::test]
async fn long_body_is_cancelled() {
    let (recall, _store) = memory();

    let (result, report) = recall
        .run_with_report(|ctx| async move {
            ctx.log("slow", |ctx| async move {
                ctx.cancellable(tokio::time::sleep(Duration::from_secs(30)))
                    .await?;
                Ok::<_, BoxError>(1)
            });
            let bad = ctx.log("bad", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<i64, BoxError>(TestError::BadInput(-1).into())
            });
            Ok::<_, BoxError>(ctx.read(&bad).await?)
        })
        .await;

    let err = result.expect_err("run should fail");
    assert!(err.contains("bad"));
    assert!(!err.contains("slow"));
    assert_eq!(report.outcome_of("slow"), Some(CellOutcome::Cancelled));
}

/// Test that a body polling `checkpoint` exits early.
#[tokio::test]
async fn checkpoint_stops_loop() {
    let (recall, _store) = memory();
    let counters = Counters::default();

    let counted = counters.clone();
    let result = recall
        .run(|ctx| async move {
            ctx.log("loop", move |ctx| async move {
                for _ in 0..1000 {
                    ctx.checkpoint()?;
                    counted.hit("loop");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok::<_, BoxError>(())
            });
            let bad = ctx.log("bad", |_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<(), BoxError>(TestError::DiskFull.into())
            });
            Ok::<_, BoxError>(ctx.read(&bad).await?)
        })
        .await;

    assert!(result.is_err());
    assert!(counters.get("loop") < 1000);
}

/// Test that computations finishing after a failure are not persisted.
#[tokio::test]
async fn late_results_are_not_persisted() {
    let (recall, store) = memory();

    let (result, report) = recall
        .run_with_report(|ctx| async move {
            ctx.log("late", |ctx| async move {
                ctx.cancel_alt().await;
                Ok::<_, BoxError>(5)
            });
            let bad = ctx.log("bad", |_| async {
                Err::<i64, BoxError>(TestError::DiskFull.into())
            });
            Ok::<_, BoxError>(ctx.read(&bad).await?)
        })
        .await;

    assert!(result.is_err());
    let late = report.timing_for("late").expect("late has a timing");
    assert_eq!(late.outcome, CellOutcome::Executed);
    assert!(!late.persisted);
    assert!(!store.contains("late").await.expect("contains"));
}

/// Test that `persist_after_failure` keeps entries completed after a failure.
#[tokio::test]
async fn persist_after_failure_keeps_late_results() {
    let (recall, store) = memory();
    let recall = recall.persist_after_failure(true);

    let result = recall
        .run(|ctx| async move {
            ctx.log("late", |ctx| async move {
                ctx.cancel_alt().await;
                Ok::<_, BoxError>(5)
            });
            let bad = ctx.log("bad", |_| async {
                Err::<i64, BoxError>(TestError::DiskFull.into())
            });
            Ok::<_, BoxError>(ctx.read(&bad).await?)
        })
        .await;

    assert!(result.is_err());
    let entry = store.get("late").await.expect("get").expect("stored");
    assert_eq!(entry.payload, b"5");
    assert!(!store.contains("bad").await.expect("contains"));
}

/// Test that a panicking body becomes a failure instead of aborting the run.
#[tokio::test]
async fn panic_is_captured() {
    let (recall, _store) = memory();

    let err = recall
        .run(|ctx| async move {
            let boom = ctx.log("boom", |_| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<i64, BoxError>(1)
            });
            Ok::<_, BoxError>(ctx.read(&boom).await?)
        })
        .await
        .expect_err("run should fail");

    match &err.failures()[0] {
        Failure::Panicked { identity, message } => {
            assert_eq!(identity, "boom");
            assert_eq!(message, "kaboom");
        }
        other => panic!("Expected Panicked, got {:?}", other),
    }
}

/// Test that a panic in the top-level body is attributed to the root.
#[tokio::test]
async fn top_level_panic_is_captured() {
    let (recall, _store) = memory();

    let err = recall
        .run(|_ctx| async move {
            if true {
                panic!("top");
            }
            Ok::<i64, BoxError>(0)
        })
        .await
        .expect_err("run should fail");

    assert!(err.contains(ROOT_IDENTITY));
}

/// Test that an error in the top-level body fails the run and is listed.
#[tokio::test]
async fn top_level_error_is_listed() {
    let (recall, _store) = memory();

    let err = recall
        .run(|_ctx| async move { Err::<(), BoxError>(TestError::BadInput(7).into()) })
        .await
        .expect_err("run should fail");

    let identities: Vec<_> = err.identities().map(|id| id.to_string()).collect();
    assert_eq!(identities, [ROOT_IDENTITY]);
}

/// Test that a failed run leaves the last good entries in place, and the next
/// run picks up from them.
#[tokio::test]
async fn next_run_recovers_after_failure() {
    let (recall, _store) = memory();
    let counters = Counters::default();

    for (input, should_fail) in [(1i64, false), (-1, true), (1, false)] {
        let counters = counters.clone();
        let result = recall
            .run(|ctx| async move {
                let input = ctx.log("input", move |_| async move { Ok::<_, BoxError>(input) });
                let checked = ctx.log("checked", move |ctx| async move {
                    counters.hit("checked");
                    let n = ctx.read(&input).await?;
                    if n < 0 {
                        return Err::<i64, BoxError>(TestError::BadInput(n).into());
                    }
                    Ok::<_, BoxError>(n * 2)
                });
                Ok::<_, BoxError>(ctx.read(&checked).await?)
            })
            .await;
        assert_eq!(result.is_err(), should_fail);
    }

    // The failed run did not overwrite the entry for input 1.
    assert_eq!(counters.get("checked"), 2);
}

/// Test that the `recall` entry point surfaces run failures.
#[tokio::test]
async fn recall_reports_run_failure() {
    let dir = tempfile::tempdir().expect("tempdir");

    let err = crate::recall(dir.path(), |ctx| async move {
        let bad = ctx.log("bad", |_| async {
            Err::<i64, BoxError>(TestError::DiskFull.into())
        });
        Ok::<_, BoxError>(ctx.read(&bad).await?)
    })
    .await
    .expect_err("run should fail");

    assert!(matches!(err, RunError::Failed(_)));
    let failure = err.as_failure().expect("aggregate failure");
    assert!(failure.contains("bad"));
}

/// Test that a body cancelling itself in a healthy run fails the run, even
/// when nobody reads it.
#[tokio::test]
async fn self_cancellation_fails_the_run() {
    let (recall, store) = memory();

    let (result, report) = recall
        .run_with_report(|ctx| async move {
            ctx.log("quits", |ctx| async move {
                Err::<i64, BoxError>(ctx.cancelled().into())
            });
            let fine = ctx.log("fine", |_| async { Ok::<_, BoxError>(1i64) });
            Ok::<_, BoxError>(ctx.read(&fine).await?)
        })
        .await;

    let err = result.expect_err("run should fail");
    assert!(err.contains("quits"));
    assert!(matches!(&err.failures()[0], Failure::Cancelled { identity } if identity == "quits"));
    assert_eq!(report.outcome_of("quits"), Some(CellOutcome::Failed));
    assert!(!store.contains("quits").await.expect("contains"));
}
