//! Failure taxonomy for logged computations and runs.

use std::sync::Arc;

use crate::codec::CodecError;
use crate::store::{Identity, StoreError};

/// Error type returned by computation bodies.
///
/// Any error converts into it with `?`, including a [`Failure`] returned by
/// [`Ctx::read`](crate::Ctx::read).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by computation bodies.
pub type BodyResult<T> = Result<T, BoxError>;

/// Why a logged computation did not produce a value.
///
/// Failures are cheap to clone: every reader of a failed computation
/// observes the same value.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Failure {
    /// The body returned an error.
    #[error("computation `{identity}` failed: {cause}")]
    Compute {
        /// The computation whose body failed.
        identity: Identity,
        /// The error the body returned.
        #[source]
        cause: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The body panicked.
    #[error("computation `{identity}` panicked: {message}")]
    Panicked {
        /// The computation whose body panicked.
        identity: Identity,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// The result could not be encoded, or a stored payload could not be decoded.
    #[error("codec error for `{identity}`: {source}")]
    Codec {
        /// The computation whose value failed to convert.
        identity: Identity,
        /// The codec's error.
        #[source]
        source: CodecError,
    },

    /// The log store failed while reading or writing this computation's entry.
    #[error("log store error for `{identity}`: {source}")]
    Store {
        /// The computation being looked up or persisted.
        identity: Identity,
        /// The store's error.
        #[source]
        source: StoreError,
    },

    /// The body exited early, normally because another computation in the
    /// run failed.
    #[error("computation `{identity}` was cancelled")]
    Cancelled {
        /// The computation that stopped.
        identity: Identity,
    },
}

impl Failure {
    /// Wrap a body error, keeping an already-classified [`Failure`] intact so
    /// that it keeps naming the computation it came from.
    pub fn from_body(identity: &Identity, err: BoxError) -> Self {
        match err.downcast::<Failure>() {
            Ok(failure) => *failure,
            Err(other) => Self::Compute {
                identity: identity.clone(),
                cause: Arc::from(other),
            },
        }
    }

    /// The computation this failure originated in.
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Compute { identity, .. }
            | Self::Panicked { identity, .. }
            | Self::Codec { identity, .. }
            | Self::Store { identity, .. }
            | Self::Cancelled { identity } => identity,
        }
    }

    /// Returns `true` for cooperative cancellations.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Error surfaced by a failed run.
///
/// Lists every failure that originated in the run, once per identity, in the
/// order they were observed. Cancellations caused by another failure are not
/// listed; a body that cancels itself in a healthy run is.
#[derive(thiserror::Error, Debug, Clone)]
#[error("run failed: {}", summarize(.failures))]
pub struct AggregateRunFailure {
    failures: Vec<Failure>,
}

fn summarize(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl AggregateRunFailure {
    pub(crate) fn new(failures: Vec<Failure>) -> Self {
        Self { failures }
    }

    /// All originating failures.
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Identities of the computations that failed.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.failures.iter().map(Failure::identity)
    }

    /// Whether the computation named `identity` is among the failures.
    pub fn contains(&self, identity: &str) -> bool {
        self.identities().any(|id| id.as_str() == identity)
    }
}

/// Error returned by [`recall`](crate::recall).
#[derive(thiserror::Error, Debug, Clone)]
pub enum RunError {
    /// The log store could not be opened or closed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// One or more computations failed.
    #[error(transparent)]
    Failed(#[from] AggregateRunFailure),

    /// The worker pool for a blocking run could not be started.
    #[error("failed to start worker pool: {0}")]
    Runtime(#[source] Arc<std::io::Error>),
}

impl RunError {
    /// The aggregate failure, if the run itself failed.
    pub fn as_failure(&self) -> Option<&AggregateRunFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            Self::Store(_) | Self::Runtime(_) => None,
        }
    }
}
