//! Staleness tests.
//!
//! Tests for which computations rerun after an input changes, for the
//! order-sensitive dependency digest, and for programs whose shape changes
//! between runs.

use std::time::Duration;

use crate::{BoxError, Digest, LogStore, Recall};

use super::common::{memory, Counters};

/// Two independent pipelines:
///
/// ```text
/// a(input) -> b = a * 10 -> c = b + 1
/// d(7)     -> e = d * 2
/// ```
async fn two_pipelines(recall: &Recall, input: i64, counters: &Counters) -> (i64, i64) {
    let counters = counters.clone();
    recall
        .run(|ctx| async move {
            let a = ctx.log("a", move |_| async move { Ok::<_, BoxError>(input) });
            let b = ctx.log("b", {
                let counters = counters.clone();
                move |ctx| async move {
                    counters.hit("b");
                    Ok::<_, BoxError>(ctx.read(&a).await? * 10)
                }
            });
            let c = ctx.log("c", {
                let counters = counters.clone();
                move |ctx| async move {
                    counters.hit("c");
                    Ok::<_, BoxError>(ctx.read(&b).await? + 1)
                }
            });

            let d = ctx.log("d", |_| async { Ok::<_, BoxError>(7i64) });
            let e = ctx.log("e", {
                let counters = counters.clone();
                move |ctx| async move {
                    counters.hit("e");
                    Ok::<_, BoxError>(ctx.read(&d).await? * 2)
                }
            });

            Ok::<_, BoxError>((ctx.read(&c).await?, ctx.read(&e).await?))
        })
        .await
        .expect("run should succeed")
}

/// Test that a change reruns its transitive readers and nothing else.
#[tokio::test]
async fn change_reruns_only_downstream() {
    let (recall, _store) = memory();
    let counters = Counters::default();

    assert_eq!(two_pipelines(&recall, 1, &counters).await, (11, 14));
    assert_eq!(two_pipelines(&recall, 2, &counters).await, (21, 14));

    assert_eq!(counters.get("b"), 2);
    assert_eq!(counters.get("c"), 2);
    assert_eq!(counters.get("e"), 1);
}

/// Test that an unchanged recomputed value does not rerun its readers.
#[tokio::test]
async fn equal_result_cuts_off_propagation() {
    let (recall, _store) = memory();
    let counters = Counters::default();

    for input in [1i64, 3, 5] {
        let counters = counters.clone();
        let parity = recall
            .run(|ctx| async move {
                let raw = ctx.log("raw", move |_| async move { Ok::<_, BoxError>(input) });
                let odd = ctx.log("odd", {
                    let counters = counters.clone();
                    move |ctx| async move {
                        counters.hit("odd");
                        Ok::<_, BoxError>(ctx.read(&raw).await? % 2 == 1)
                    }
                });
                let label = ctx.log("label", {
                    let counters = counters.clone();
                    move |ctx| async move {
                        counters.hit("label");
                        let odd = ctx.read(&odd).await?;
                        Ok::<_, BoxError>(if odd { "odd" } else { "even" }.to_string())
                    }
                });
                Ok::<_, BoxError>(ctx.read(&label).await?)
            })
            .await
            .expect("run should succeed");
        assert_eq!(parity, "odd");
    }

    assert_eq!(counters.get("odd"), 3);
    assert_eq!(counters.get("label"), 1);
}

/// Test that computations which read nothing run on every run.
#[tokio::test]
async fn leaves_always_run() {
    let (recall, _store) = memory();
    let counters = Counters::default();

    for _ in 0..4 {
        let counters = counters.clone();
        recall
            .run(|ctx| async move {
                let clock = ctx.log("clock", move |_| async move {
                    counters.hit("clock");
                    Ok::<_, BoxError>(42u32)
                });
                Ok::<_, BoxError>(ctx.read(&clock).await?)
            })
            .await
            .expect("run should succeed");
    }

    assert_eq!(counters.get("clock"), 4);
}

/// Test that the stored dependency list follows read order.
///
/// The same two reads issued in a different order give a different
/// dependency digest.
#[tokio::test]
async fn dependency_digest_depends_on_read_order() {
    async fn run_with_order(swap: bool) -> crate::Entry {
        let (recall, store) = memory();
        recall
            .run(|ctx| async move {
                let x = ctx.log("x", |_| async { Ok::<_, BoxError>(1) });
                let y = ctx.log("y", |_| async { Ok::<_, BoxError>(2) });
                let sum = ctx.log("sum", move |ctx| async move {
                    let (first, second) = if swap { (&y, &x) } else { (&x, &y) };
                    let a = ctx.read(first).await?;
                    let b = ctx.read(second).await?;
                    Ok::<_, BoxError>(a + b)
                });
                Ok::<_, BoxError>(ctx.read(&sum).await?)
            })
            .await
            .expect("run should succeed");
        store.get("sum").await.expect("get").expect("stored")
    }

    let forward = run_with_order(false).await;
    let backward = run_with_order(true).await;

    let names = |entry: &crate::Entry| {
        entry
            .dependencies
            .iter()
            .map(|dep| dep.identity.to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&forward), ["x", "y"]);
    assert_eq!(names(&backward), ["y", "x"]);
    assert_eq!(forward.result_digest, backward.result_digest);
    assert_ne!(forward.dependency_digest, backward.dependency_digest);
    assert_eq!(
        forward.dependency_digest,
        Digest::of_dependencies(&forward.dependencies)
    );
}

/// Test that slots are filled in issue order even when completions race.
#[tokio::test]
async fn reads_are_recorded_in_issue_order() {
    let (recall, store) = memory();

    recall
        .run(|ctx| async move {
            let slow = ctx.log("slow", |_| async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok::<_, BoxError>(1)
            });
            let fast = ctx.log("fast", |_| async { Ok::<_, BoxError>(2) });
            let both = ctx.log("both", move |ctx| async move {
                let (a, b) = tokio::join!(ctx.read(&slow), ctx.read(&fast));
                Ok::<_, BoxError>(a? + b?)
            });
            Ok::<_, BoxError>(ctx.read(&both).await?)
        })
        .await
        .expect("run should succeed");

    let entry = store.get("both").await.expect("get").expect("stored");
    let names: Vec<_> = entry
        .dependencies
        .iter()
        .map(|dep| dep.identity.to_string())
        .collect();
    assert_eq!(names, ["slow", "fast"]);
}

/// Test that an entry whose reader is not started this run is verified from
/// the store instead of being executed.
///
/// `outer` logs `inner` from its own body, so when `outer` is reused,
/// `inner` is never registered and must be checked against its stored
/// dependencies.
#[tokio::test]
async fn nested_dependency_is_verified_from_store() {
    let (recall, _store) = memory();
    let counters = Counters::default();

    let run = |input: i64| {
        let counters = counters.clone();
        let recall = recall.clone();
        async move {
            recall
                .run(|ctx| async move {
                    let x = ctx.log("x", move |_| async move { Ok::<_, BoxError>(input) });
                    let outer = ctx.log("outer", {
                        let counters = counters.clone();
                        move |ctx| async move {
                            counters.hit("outer");
                            let inner = ctx.log("inner", {
                                let counters = counters.clone();
                                move |ctx| async move {
                                    counters.hit("inner");
                                    Ok::<_, BoxError>(ctx.read(&x).await? + 100)
                                }
                            });
                            Ok::<_, BoxError>(ctx.read(&inner).await? * 2)
                        }
                    });
                    Ok::<_, BoxError>(ctx.read(&outer).await?)
                })
                .await
                .expect("run should succeed")
        }
    };

    assert_eq!(run(1).await, 202);
    assert_eq!(run(1).await, 202);
    assert_eq!(counters.get("outer"), 1);
    assert_eq!(counters.get("inner"), 1);

    assert_eq!(run(2).await, 204);
    assert_eq!(counters.get("outer"), 2);
    assert_eq!(counters.get("inner"), 2);
}

/// Test that a stored payload the reader can no longer decode is recomputed.
#[tokio::test]
async fn undecodable_payload_is_recomputed() {
    let (recall, _store) = memory();
    let counters = Counters::default();

    let first = recall
        .run(|ctx| async move {
            let src = ctx.log("src", |_| async { Ok::<_, BoxError>(3) });
            let out = ctx.log("out", move |ctx| async move {
                Ok::<_, BoxError>(format!("n={}", ctx.read(&src).await?))
            });
            Ok::<_, BoxError>(ctx.read(&out).await?)
        })
        .await
        .expect("run should succeed");
    assert_eq!(first, "n=3");

    let counted = counters.clone();
    let second = recall
        .run(|ctx| async move {
            let src = ctx.log("src", |_| async { Ok::<_, BoxError>(3) });
            let out = ctx.log("out", move |ctx| async move {
                counted.hit("out");
                Ok::<_, BoxError>(ctx.read(&src).await? * 3)
            });
            Ok::<_, BoxError>(ctx.read(&out).await?)
        })
        .await
        .expect("run should succeed");

    assert_eq!(second, 9);
    assert_eq!(counters.get("out"), 1);
}

fn dependency_names(entry: &crate::Entry) -> Vec<String> {
    entry
        .dependencies
        .iter()
        .map(|dep| dep.identity.to_string())
        .collect()
}

/// Test that a dependency reversed between runs does not deadlock.
///
/// The stored entry for `b` says it read `a`, so resolving `b` waits on `a`.
/// This run `a` reads `b` instead, and both must still finish.
#[tokio::test]
async fn reversed_dependency_does_not_hang() {
    let (recall, store) = memory();

    recall
        .run(|ctx| async move {
            let a = ctx.log("a", |_| async { Ok::<_, BoxError>(1i64) });
            let b = ctx.log("b", move |ctx| async move {
                Ok::<_, BoxError>(ctx.read(&a).await? + 1)
            });
            Ok::<_, BoxError>(ctx.read(&b).await?)
        })
        .await
        .expect("first run should succeed");

    let second = recall.run(|ctx| async move {
        let b = ctx.log("b", |_| async { Ok::<_, BoxError>(10i64) });
        let a = ctx.log("a", move |ctx| async move {
            Ok::<_, BoxError>(ctx.read(&b).await? + 1)
        });
        Ok::<_, BoxError>(ctx.read(&a).await?)
    });
    let value = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("second run should not hang")
        .expect("second run should succeed");

    assert_eq!(value, 11);
    let a = store.get("a").await.expect("get").expect("stored");
    let b = store.get("b").await.expect("get").expect("stored");
    assert_eq!(dependency_names(&a), ["b"]);
    assert!(b.dependencies.is_empty());
}

/// Test that reordering a body's reads alone does not rerun it.
///
/// Reuse replays the stored order, so the new order is stored only once an
/// input change makes the body execute.
#[tokio::test]
async fn reordered_reads_are_stored_on_next_execution() {
    let (recall, store) = memory();
    let counters = Counters::default();

    let steps = [
        (1i64, false, 3, 1, ["x", "y"]),
        (1, true, 3, 1, ["x", "y"]),
        (5, true, 7, 2, ["y", "x"]),
    ];
    for (input, swap, expected, executions, order) in steps {
        let counted = counters.clone();
        let sum = recall
            .run(|ctx| async move {
                let x = ctx.log("x", move |_| async move { Ok::<_, BoxError>(input) });
                let y = ctx.log("y", |_| async { Ok::<_, BoxError>(2i64) });
                let sum = ctx.log("sum", move |ctx| async move {
                    counted.hit("sum");
                    let (first, second) = if swap { (&y, &x) } else { (&x, &y) };
                    let a = ctx.read(first).await?;
                    let b = ctx.read(second).await?;
                    Ok::<_, BoxError>(a + b)
                });
                Ok::<_, BoxError>(ctx.read(&sum).await?)
            })
            .await
            .expect("run should succeed");

        assert_eq!(sum, expected);
        assert_eq!(counters.get("sum"), executions);
        let entry = store.get("sum").await.expect("get").expect("stored");
        assert_eq!(dependency_names(&entry), order);
    }
}
