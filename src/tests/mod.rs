//! End-to-end tests for runs over a log store.
//!
//! ## Test Organization
//!
//! - `common`: Shared errors, execution counters and store helpers
//! - `basic`: Successful runs, persisted entries and reuse across runs
//! - `staleness`: Change propagation, early cutoff and dependency order
//! - `single_flight`: At most one producer per identity per run
//! - `failure`: Failure propagation, cancellation and persistence suppression
//!
//! ## Test Programs
//!
//! Most tests build small pipelines out of integer computations. Every body
//! bumps a named counter in [`common::Counters`] when it actually runs, so a
//! test can tell an executed computation from a reused one.

mod common;

mod failure;
mod staleness;
