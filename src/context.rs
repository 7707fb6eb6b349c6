//! The handle a computation body uses to start, read and cancel work.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::cell::{CellState, ResultCell};
use crate::codec::{Codec, JsonCodec};
use crate::digest::Digest;
use crate::error::{BodyResult, Failure};
use crate::recorder::DependencyRecorder;
use crate::report::RunId;
use crate::resolver;
use crate::run::RunState;
use crate::store::{Dependency, Identity};

/// Identity of the top-level body of a run.
pub const ROOT_IDENTITY: &str = "<root>";

/// In-run reference to a logged computation.
///
/// Cloning is cheap. A handle does not own the producing task: dropping every
/// handle does not stop the computation, and the run still waits for it.
pub struct Logged<T> {
    cell: Arc<ResultCell>,
    codec: Arc<dyn Codec<T>>,
}

impl<T> Logged<T> {
    /// The identity this handle refers to.
    pub fn identity(&self) -> &Identity {
        self.cell.identity()
    }

    /// Snapshot of the computation's current state.
    pub fn state(&self) -> CellState {
        self.cell.state()
    }
}

impl<T> Clone for Logged<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Logged<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Logged").field(self.cell.identity()).finish()
    }
}

struct Frame {
    identity: Identity,
    recorder: Mutex<DependencyRecorder>,
}

/// Context passed to every computation body.
///
/// Each body gets its own context, with its own dependency recorder: reads
/// made through it become the dependencies of that body's entry.
#[derive(Clone)]
pub struct Ctx {
    run: Arc<RunState>,
    frame: Arc<Frame>,
}

impl Ctx {
    pub(crate) fn new(run: Arc<RunState>, identity: Identity) -> Self {
        Self {
            run,
            frame: Arc::new(Frame {
                identity,
                recorder: Mutex::new(DependencyRecorder::new()),
            }),
        }
    }

    /// Identity of the computation this body belongs to.
    pub fn identity(&self) -> &Identity {
        &self.frame.identity
    }

    /// The run this body executes in.
    pub fn run_id(&self) -> RunId {
        self.run.id
    }

    /// Start or join the logged computation `identity`, storing its result
    /// as JSON.
    ///
    /// The first call for an identity in a run spawns its producer; later
    /// calls return a handle to the same computation and drop their `body`.
    pub fn log<T, F, Fut>(&self, identity: impl Into<Identity>, body: F) -> Logged<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = BodyResult<T>> + Send + 'static,
    {
        self.log_with(identity, JsonCodec, body)
    }

    /// Like [`Ctx::log`], with an explicit codec for the result.
    pub fn log_with<T, C, F, Fut>(
        &self,
        identity: impl Into<Identity>,
        codec: C,
        body: F,
    ) -> Logged<T>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = BodyResult<T>> + Send + 'static,
    {
        let identity = identity.into();
        let (cell, created) = self.run.registry.get_or_insert(&identity);
        let codec: Arc<dyn Codec<T>> = Arc::new(codec);

        if created {
            self.run.spawn(resolver::produce(
                self.run.clone(),
                cell.clone(),
                codec.clone(),
                body,
            ));
        } else {
            #[cfg(feature = "tracing")]
            tracing::trace!(run = %self.run.id, identity = %identity, "cell.join");
        }

        Logged { cell, codec }
    }

    /// Wait for a logged computation and decode its value.
    ///
    /// The read is recorded as a dependency of this body, in the order reads
    /// are issued. A failed or cancelled computation returns the same
    /// [`Failure`] to every reader.
    pub async fn read<T: 'static>(&self, handle: &Logged<T>) -> Result<T, Failure> {
        let slot = self.frame.recorder.lock().reserve();
        let resolved = {
            let _waiting = self
                .run
                .waits
                .enter_read(&self.frame.identity, handle.identity());
            handle.cell.wait().await?
        };
        self.frame
            .recorder
            .lock()
            .fill(slot, handle.identity().clone(), resolved.digest);

        handle
            .codec
            .decode(&resolved.payload)
            .map_err(|source| Failure::Codec {
                identity: handle.identity().clone(),
                source,
            })
    }

    /// A future that completes once any computation in the run has failed.
    pub fn cancel_alt(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.run.subscribe_failed();
        async move {
            // A closed channel means the run is gone; treat it as cancelled.
            let _ = rx.wait_for(|failed| *failed).await;
        }
    }

    /// Whether any computation in the run has failed.
    pub fn is_cancelled(&self) -> bool {
        self.run.is_failed()
    }

    /// The failure a body returns when it stops early.
    pub fn cancelled(&self) -> Failure {
        Failure::Cancelled {
            identity: self.frame.identity.clone(),
        }
    }

    /// Return `Err(Failure::Cancelled)` if the run has failed.
    ///
    /// Call this between steps of a long body: `ctx.checkpoint()?;`
    pub fn checkpoint(&self) -> Result<(), Failure> {
        if self.is_cancelled() {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }

    /// Drive `fut` until it completes or the run fails, whichever is first.
    pub async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, Failure> {
        tokio::select! {
            biased;
            _ = self.cancel_alt() => Err(self.cancelled()),
            value = fut => Ok(value),
        }
    }

    /// Take the reads recorded so far and finalize them.
    pub(crate) fn finish_recording(&self) -> (Vec<Dependency>, Digest) {
        std::mem::take(&mut *self.frame.recorder.lock()).finish()
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("run", &self.run.id)
            .field("identity", &self.frame.identity)
            .finish()
    }
}
