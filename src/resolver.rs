//! Producer tasks: decide between reusing a stored entry and running the body.
//!
//! A stored entry is reused only when it has dependencies and every one of
//! them still resolves, in the stored order, to the dependency digest that was
//! persisted with it. Everything else runs the body.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;

use crate::cell::{CellState, Origin, Resolved, ResultCell};
use crate::codec::Codec;
use crate::context::Ctx;
use crate::digest::Digest;
use crate::error::{BodyResult, Failure};
use crate::report::{CellOutcome, CellTiming};
use crate::run::RunState;
use crate::store::{now_millis, Dependency, Entry, Identity};

/// Run the producer for one cell: `Unstarted -> Running -> terminal`.
pub(crate) async fn produce<T, F, Fut>(
    run: Arc<RunState>,
    cell: Arc<ResultCell>,
    codec: Arc<dyn Codec<T>>,
    body: F,
) where
    T: Send + Sync + 'static,
    F: FnOnce(Ctx) -> Fut + Send + 'static,
    Fut: Future<Output = BodyResult<T>> + Send + 'static,
{
    if !cell.try_start() {
        return;
    }

    let identity = cell.identity().clone();
    let started_at = now_millis();

    #[cfg(feature = "tracing")]
    tracing::debug!(run = %run.id, identity = %identity, "cell.start");

    let attempt = AssertUnwindSafe(recreate(&run, &identity, codec.as_ref(), body))
        .catch_unwind()
        .await;

    // A body that stops while the run is still healthy never produced its
    // value, so that counts as a failure of its own.
    let (state, persisted) = match attempt {
        Ok(Ok((resolved, persisted))) => (CellState::Succeeded(resolved), persisted),
        Ok(Err(failure)) if failure.is_cancellation() && run.is_failed() => {
            (CellState::Cancelled(failure), false)
        }
        Ok(Err(failure)) => (CellState::Failed(failure), false),
        Err(payload) => (
            CellState::Failed(Failure::Panicked {
                identity: identity.clone(),
                message: panic_message(payload),
            }),
            false,
        ),
    };

    let outcome = match &state {
        CellState::Succeeded(resolved) if resolved.origin == Origin::Reused => CellOutcome::Reused,
        CellState::Succeeded(_) => CellOutcome::Executed,
        CellState::Cancelled(_) => CellOutcome::Cancelled,
        _ => CellOutcome::Failed,
    };

    // Broadcast before waking readers, so anything that observes this
    // failure also observes the run as failed.
    if let CellState::Failed(failure) = &state {
        #[cfg(feature = "tracing")]
        tracing::error!(run = %run.id, identity = %identity, error = %failure, "cell.failed");

        run.fail(failure);
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        run = %run.id,
        identity = %identity,
        outcome = ?outcome,
        persisted,
        "cell.end"
    );

    run.record(CellTiming {
        identity,
        started_at,
        completed_at: now_millis(),
        outcome,
        persisted,
    });
    cell.complete(state);
}

/// Reuse the stored entry when it is provably current, otherwise execute.
///
/// Returns the resolved value and whether a new entry was persisted.
async fn recreate<T, F, Fut>(
    run: &Arc<RunState>,
    identity: &Identity,
    codec: &dyn Codec<T>,
    body: F,
) -> Result<(Resolved, bool), Failure>
where
    T: Send + Sync + 'static,
    F: FnOnce(Ctx) -> Fut + Send + 'static,
    Fut: Future<Output = BodyResult<T>> + Send + 'static,
{
    let stored = run
        .store
        .get(identity.as_str())
        .await
        .map_err(|source| Failure::Store {
            identity: identity.clone(),
            source,
        })?;

    if let Some(entry) = stored {
        if entry.is_leaf() {
            #[cfg(feature = "tracing")]
            tracing::debug!(run = %run.id, identity = %identity, "resolve.leaf");
        } else if run.dependencies_current(&entry).await {
            if codec.decode(&entry.payload).is_ok() {
                #[cfg(feature = "tracing")]
                tracing::debug!(run = %run.id, identity = %identity, "resolve.reuse");

                return Ok((
                    Resolved {
                        digest: entry.result_digest,
                        payload: Arc::from(entry.payload),
                        origin: Origin::Reused,
                    },
                    false,
                ));
            }

            #[cfg(feature = "tracing")]
            tracing::warn!(
                run = %run.id,
                identity = %identity,
                "stored payload no longer decodes, recomputing"
            );
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(run = %run.id, identity = %identity, "resolve.stale");
        }
    }

    execute(run, identity, codec, body).await
}

async fn execute<T, F, Fut>(
    run: &Arc<RunState>,
    identity: &Identity,
    codec: &dyn Codec<T>,
    body: F,
) -> Result<(Resolved, bool), Failure>
where
    T: Send + Sync + 'static,
    F: FnOnce(Ctx) -> Fut + Send + 'static,
    Fut: Future<Output = BodyResult<T>> + Send + 'static,
{
    let ctx = Ctx::new(run.clone(), identity.clone());
    let value = body(ctx.clone())
        .await
        .map_err(|err| Failure::from_body(identity, err))?;

    let payload = codec.encode(&value).map_err(|source| Failure::Codec {
        identity: identity.clone(),
        source,
    })?;
    drop(value);

    let (dependencies, _) = ctx.finish_recording();
    let entry = Entry::new(identity.clone(), dependencies, payload);
    let resolved = Resolved {
        digest: entry.result_digest,
        payload: Arc::from(entry.payload.as_slice()),
        origin: Origin::Executed,
    };

    if !run.should_persist() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            run = %run.id,
            identity = %identity,
            "run already failed, entry not persisted"
        );
        return Ok((resolved, false));
    }

    run.store.put(entry).await.map_err(|source| Failure::Store {
        identity: identity.clone(),
        source,
    })?;

    Ok((resolved, true))
}

impl RunState {
    /// Whether every stored dependency of `entry` still resolves to the
    /// stored dependency digest.
    pub(crate) async fn dependencies_current(self: &Arc<Self>, entry: &Entry) -> bool {
        let path = [entry.identity.clone()];
        let current = join_all(
            entry
                .dependencies
                .iter()
                .map(|dep| self.current_digest(&dep.identity, &path)),
        )
        .await;

        matches_stored(entry, current)
    }

    /// Current result digest of `identity`, or `None` when it cannot be
    /// established without running a body.
    ///
    /// A computation registered in this run is awaited, unless it is itself
    /// waiting on the computation being resolved. Anything else is verified
    /// against the store, recursively, and memoized for the run.
    fn current_digest<'a>(
        self: &'a Arc<Self>,
        identity: &'a Identity,
        path: &'a [Identity],
    ) -> BoxFuture<'a, Option<Digest>> {
        async move {
            if let Some(cell) = self.registry.get(identity.as_str()) {
                let waiter = path.first()?;
                let Some(mut waiting) = self.waits.enter_resolve(waiter, identity) else {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        run = %self.id,
                        identity = %waiter,
                        dependency = %identity,
                        "resolve.cycle"
                    );
                    return None;
                };
                return tokio::select! {
                    resolved = cell.wait() => resolved.ok().map(|resolved| resolved.digest),
                    _ = waiting.abandoned() => None,
                };
            }
            if path.contains(identity) {
                return None;
            }

            let memo = self.verified.lock().get(identity).copied();
            if let Some(digest) = memo {
                return digest;
            }

            let digest = self.verify_stored(identity, path).await;
            self.verified.lock().insert(identity.clone(), digest);
            digest
        }
        .boxed()
    }

    async fn verify_stored(self: &Arc<Self>, identity: &Identity, path: &[Identity]) -> Option<Digest> {
        let entry = self.store.get(identity.as_str()).await.ok()??;
        if entry.is_leaf() {
            return None;
        }

        let mut path = path.to_vec();
        path.push(identity.clone());

        let current = join_all(
            entry
                .dependencies
                .iter()
                .map(|dep| self.current_digest(&dep.identity, &path)),
        )
        .await;

        matches_stored(&entry, current).then_some(entry.result_digest)
    }
}

fn matches_stored(entry: &Entry, current: Vec<Option<Digest>>) -> bool {
    let dependencies: Option<Vec<Dependency>> = entry
        .dependencies
        .iter()
        .zip(current)
        .map(|(dep, digest)| digest.map(|digest| Dependency::new(dep.identity.clone(), digest)))
        .collect();

    match dependencies {
        Some(dependencies) => Digest::of_dependencies(&dependencies) == entry.dependency_digest,
        None => false,
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
