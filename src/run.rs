//! Runs: one top-level execution over a log store.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cell::{Registry, WaitGraph};
use crate::context::{Ctx, ROOT_IDENTITY};
use crate::digest::Digest;
use crate::error::{AggregateRunFailure, BodyResult, Failure, RunError};
use crate::file_store::{FileLogStore, SyncMode};
use crate::report::{CellTiming, RunId, RunReport};
use crate::resolver::panic_message;
use crate::store::{Identity, LogStore, StoreError};

// ============================================================================
// Configuration
// ============================================================================

/// Settings for [`Recall::open`].
#[derive(Debug, Clone)]
pub struct RecallConfig {
    log_dir: PathBuf,
    sync: SyncMode,
    compact_on_open: bool,
    persist_after_failure: bool,
    worker_threads: Option<usize>,
}

impl RecallConfig {
    /// Configuration for a log store in `log_dir`, with defaults for
    /// everything else.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            sync: SyncMode::default(),
            compact_on_open: false,
            persist_after_failure: false,
            worker_threads: None,
        }
    }

    /// When entries are fsynced. Default: [`SyncMode::Always`].
    pub fn sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    /// Rewrite the log at open when superseded records outnumber live ones.
    pub fn compact_on_open(mut self, enabled: bool) -> Self {
        self.compact_on_open = enabled;
        self
    }

    /// Keep persisting entries that complete after the run has failed.
    /// Default: `false`.
    pub fn persist_after_failure(mut self, enabled: bool) -> Self {
        self.persist_after_failure = enabled;
        self
    }

    /// Worker threads for [`Recall::run_blocking`]. Default: one per core.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    /// The log directory.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

// ============================================================================
// Run State (Internal)
// ============================================================================

/// Ephemeral state of one run, shared by every task it spawns.
pub(crate) struct RunState {
    pub(crate) id: RunId,
    pub(crate) store: Arc<dyn LogStore>,
    pub(crate) registry: Registry,
    pub(crate) waits: WaitGraph,
    /// Results of verifying unregistered identities against the store.
    pub(crate) verified: Mutex<HashMap<Identity, Option<Digest>>>,
    failed: watch::Sender<bool>,
    failures: Mutex<Vec<Failure>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    report: Mutex<RunReport>,
    persist_after_failure: bool,
}

impl RunState {
    fn new(store: Arc<dyn LogStore>, persist_after_failure: bool) -> Arc<Self> {
        let id = RunId::new();
        let (failed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            store,
            registry: Registry::new(),
            waits: WaitGraph::new(),
            verified: Mutex::new(HashMap::new()),
            failed,
            failures: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            report: Mutex::new(RunReport::new(id)),
            persist_after_failure,
        })
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks.lock().push(handle);
    }

    /// Record an originating failure and broadcast cancellation.
    pub(crate) fn fail(&self, failure: &Failure) {
        {
            let mut failures = self.failures.lock();
            if !failures.iter().any(|f| f.identity() == failure.identity()) {
                failures.push(failure.clone());
            }
        }
        self.failed.send_replace(true);
    }

    pub(crate) fn is_failed(&self) -> bool {
        *self.failed.borrow()
    }

    pub(crate) fn subscribe_failed(&self) -> watch::Receiver<bool> {
        self.failed.subscribe()
    }

    pub(crate) fn should_persist(&self) -> bool {
        self.persist_after_failure || !self.is_failed()
    }

    pub(crate) fn record(&self, timing: CellTiming) {
        self.report.lock().cells.push(timing);
    }

    /// Wait for every spawned task, including ones spawned while waiting.
    async fn join(&self) {
        loop {
            let pending = std::mem::take(&mut *self.tasks.lock());
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(_err) = handle.await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(run = %self.id, error = %_err, "task did not finish");
                }
            }
        }
    }

    fn take_failures(&self) -> Vec<Failure> {
        std::mem::take(&mut *self.failures.lock())
    }

    fn finish_report(&self) -> RunReport {
        let mut report = self.report.lock();
        report.finish();
        report.clone()
    }
}

// ============================================================================
// Recall
// ============================================================================

/// Entry point: a log store plus the settings runs execute with.
#[derive(Clone)]
pub struct Recall {
    store: Arc<dyn LogStore>,
    persist_after_failure: bool,
    worker_threads: Option<usize>,
}

impl Recall {
    /// Open or create the file log store described by `config`.
    pub fn open(config: RecallConfig) -> Result<Self, StoreError> {
        let store = FileLogStore::open_with(&config.log_dir, config.sync)?;
        if config.compact_on_open {
            let stats = store.stats();
            if stats.superseded() > stats.live as u64 {
                store.compact()?;
            }
        }

        Ok(Self {
            store: Arc::new(store),
            persist_after_failure: config.persist_after_failure,
            worker_threads: config.worker_threads,
        })
    }

    /// Run over an already-open store.
    pub fn with_store(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            persist_after_failure: false,
            worker_threads: None,
        }
    }

    /// See [`RecallConfig::persist_after_failure`].
    pub fn persist_after_failure(mut self, enabled: bool) -> Self {
        self.persist_after_failure = enabled;
        self
    }

    /// The underlying log store.
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Execute `body` as a new run and wait for everything it started.
    pub async fn run<T, F, Fut>(&self, body: F) -> Result<T, AggregateRunFailure>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = BodyResult<T>>,
    {
        self.run_with_report(body).await.0
    }

    /// Like [`Recall::run`], also returning what each computation did.
    pub async fn run_with_report<T, F, Fut>(
        &self,
        body: F,
    ) -> (Result<T, AggregateRunFailure>, RunReport)
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = BodyResult<T>>,
    {
        let run = RunState::new(self.store.clone(), self.persist_after_failure);
        let root = Identity::from(ROOT_IDENTITY);

        #[cfg(feature = "tracing")]
        tracing::info!(run = %run.id, "run.start");

        let ctx = Ctx::new(run.clone(), root.clone());
        let outcome = AssertUnwindSafe(body(ctx)).catch_unwind().await;
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Failure::from_body(&root, err)),
            Err(payload) => Err(Failure::Panicked {
                identity: root,
                message: panic_message(payload),
            }),
        };
        if let Err(failure) = &result {
            if !failure.is_cancellation() {
                run.fail(failure);
            }
        }

        run.join().await;

        let mut failures = run.take_failures();
        let report = run.finish_report();
        let result = match result {
            Ok(value) if failures.is_empty() => Ok(value),
            Ok(_) => Err(AggregateRunFailure::new(failures)),
            Err(failure) => {
                if failures.is_empty() {
                    failures.push(failure);
                }
                Err(AggregateRunFailure::new(failures))
            }
        };

        #[cfg(feature = "tracing")]
        match &result {
            Ok(_) => tracing::info!(
                run = %report.run_id,
                executed = report.executed().count(),
                reused = report.reused().count(),
                "run.finish"
            ),
            Err(failure) => tracing::error!(run = %report.run_id, error = %failure, "run.failed"),
        }

        (result, report)
    }

    /// Execute `body` on a dedicated multi-threaded runtime, blocking the
    /// calling thread. Must not be called from inside a runtime.
    pub fn run_blocking<T, F, Fut>(&self, body: F) -> Result<T, RunError>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = BodyResult<T>>,
    {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();
        if let Some(threads) = self.worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder
            .build()
            .map_err(|err| RunError::Runtime(Arc::new(err)))?;

        Ok(runtime.block_on(self.run(body))?)
    }

    /// Flush and close the underlying store.
    pub async fn close(self) -> Result<(), StoreError> {
        self.store.close().await
    }
}

impl std::fmt::Debug for Recall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recall")
            .field("persist_after_failure", &self.persist_after_failure)
            .field("worker_threads", &self.worker_threads)
            .finish_non_exhaustive()
    }
}

/// Open the log store in `log_dir`, execute `body` as one run, and close the
/// store.
///
/// # Example
///
/// ```no_run
/// use recall::{recall, BoxError};
///
/// # async fn demo() -> Result<(), recall::RunError> {
/// let b = recall("/tmp/recall-demo", |ctx| async move {
///     let a = ctx.log("a", |_| async { Ok::<_, BoxError>(1) });
///     let b = ctx.log("b", move |ctx| async move {
///         let x: i32 = ctx.read(&a).await?;
///         Ok::<_, BoxError>(x + 1)
///     });
///     Ok::<_, BoxError>(ctx.read(&b).await?)
/// })
/// .await?;
/// assert_eq!(b, 2);
/// # Ok(())
/// # }
/// ```
pub async fn recall<T, F, Fut>(log_dir: impl AsRef<Path>, body: F) -> Result<T, RunError>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = BodyResult<T>>,
{
    let recall = Recall::open(RecallConfig::new(log_dir.as_ref()))?;
    let result = recall.run(body).await;
    recall.close().await?;
    Ok(result?)
}
