//! Per-run record of what each logged computation did.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{now_millis, Identity};

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of one identity in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellOutcome {
    /// The body ran to completion.
    Executed,
    /// The stored entry was reused without running the body.
    Reused,
    /// The body failed, or a failure was propagated into it.
    Failed,
    /// The body stopped early after a failure elsewhere in the run.
    Cancelled,
}

/// Timing information for a single logged computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellTiming {
    /// The computation.
    pub identity: Identity,
    /// When its producer started (Unix timestamp ms).
    pub started_at: u64,
    /// When it reached a terminal state (Unix timestamp ms).
    pub completed_at: u64,
    /// What happened.
    pub outcome: CellOutcome,
    /// Whether a new entry was written to the log store.
    pub persisted: bool,
}

impl CellTiming {
    /// Get the duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.completed_at.saturating_sub(self.started_at)
    }
}

/// Summary of one run, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// The run.
    pub run_id: RunId,
    /// When the run started (Unix timestamp ms).
    pub started_at: u64,
    /// When the run finished joining (Unix timestamp ms).
    pub completed_at: Option<u64>,
    /// One record per logged computation that reached a terminal state.
    pub cells: Vec<CellTiming>,
}

impl RunReport {
    pub(crate) fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            started_at: now_millis(),
            completed_at: None,
            cells: Vec::new(),
        }
    }

    pub(crate) fn finish(&mut self) {
        self.completed_at = Some(now_millis());
    }

    /// Identities whose body ran.
    pub fn executed(&self) -> impl Iterator<Item = &Identity> {
        self.with_outcome(CellOutcome::Executed)
    }

    /// Identities whose stored entry was reused.
    pub fn reused(&self) -> impl Iterator<Item = &Identity> {
        self.with_outcome(CellOutcome::Reused)
    }

    fn with_outcome(&self, outcome: CellOutcome) -> impl Iterator<Item = &Identity> {
        self.cells
            .iter()
            .filter(move |c| c.outcome == outcome)
            .map(|c| &c.identity)
    }

    /// Outcome of a specific identity, if it was requested in this run.
    pub fn outcome_of(&self, identity: &str) -> Option<CellOutcome> {
        self.timing_for(identity).map(|c| c.outcome)
    }

    /// Timing record of a specific identity.
    pub fn timing_for(&self, identity: &str) -> Option<&CellTiming> {
        self.cells.iter().find(|c| c.identity.as_str() == identity)
    }

    /// Get the duration in milliseconds, if the run finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| end.saturating_sub(self.started_at))
    }
}
