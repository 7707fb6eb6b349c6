#![deny(missing_docs)]

//! Recall: incremental, persistent, parallel computations.
//!
//! A program is a tree of named computations. Each one is started with
//! [`Ctx::log`], runs concurrently with its siblings, and reads the results of
//! others with [`Ctx::read`]. Every result is written to an append-only log
//! together with the results it read, so the next run can skip any
//! computation whose inputs have not changed.
//!
//! # Core Concepts
//!
//! - [`Recall`]: a log store plus run settings; [`Recall::run`] executes a
//!   top-level body.
//! - [`Ctx`]: handle given to every body, used to start, read and cancel work.
//! - [`Logged`]: in-run reference to one computation.
//! - [`LogStore`]: persistent map from identity to [`Entry`];
//!   [`FileLogStore`] is the crash-consistent implementation.
//!
//! # Reuse
//!
//! A stored entry is reused when it has dependencies and those dependencies,
//! in the order they were read, still produce the same digests. Computations
//! that read nothing always run, so inputs from the outside world are picked
//! up on every run. When a recomputed value equals the previous one, its
//! dependents are still reused.
//!
//! # Failure
//!
//! The first failing computation cancels the run: readers observe the same
//! [`Failure`], long-running bodies can watch [`Ctx::cancel_alt`], and the run
//! returns an [`AggregateRunFailure`] naming every computation that failed.
//!
//! ```no_run
//! use recall::{BoxError, Recall, RecallConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let recall = Recall::open(RecallConfig::new(".recall"))?;
//! let total = recall
//!     .run(|ctx| async move {
//!         let parts: Vec<_> = (1..=3)
//!             .map(|i| ctx.log(format!("part/{i}"), move |_| async move { Ok::<_, BoxError>(i * 10) }))
//!             .collect();
//!         let mut total = 0;
//!         for part in &parts {
//!             total += ctx.read(part).await?;
//!         }
//!         Ok::<_, BoxError>(total)
//!     })
//!     .await?;
//! assert_eq!(total, 60);
//! recall.close().await?;
//! # Ok(())
//! # }
//! ```

// Modules
pub mod cell;
pub mod codec;
pub mod context;
pub mod digest;
pub mod error;
pub mod file_store;
pub mod recorder;
pub mod report;
mod resolver;
pub mod run;
pub mod store;

// Re-exports for convenience
pub use cell::{CellState, Origin, Resolved};
pub use codec::{BincodeCodec, Codec, CodecError, JsonCodec};
pub use context::{Ctx, Logged, ROOT_IDENTITY};
pub use digest::Digest;
pub use error::{AggregateRunFailure, BodyResult, BoxError, Failure, RunError};
pub use file_store::{FileLogStore, LogStats, SyncMode};
pub use recorder::{BindSlot, DependencyRecorder};
pub use report::{CellOutcome, CellTiming, RunId, RunReport};
pub use run::{recall, Recall, RecallConfig};
pub use store::{Dependency, Entry, Identity, InMemoryLogStore, LogStore, StoreError};

#[cfg(test)]
mod tests;
