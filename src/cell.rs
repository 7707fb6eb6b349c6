//! Per-identity result cells, the run's single-flight registry, and the
//! graph of who waits on whom.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::digest::Digest;
use crate::error::Failure;
use crate::store::Identity;

/// How a succeeded cell obtained its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The body ran in this run.
    Executed,
    /// The stored entry was still valid and the body was skipped.
    Reused,
}

/// A computed result as seen by readers: its digest and encoded bytes.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Digest of `payload`.
    pub digest: Digest,
    /// Encoded value.
    pub payload: Arc<[u8]>,
    /// Whether the value was computed or reused.
    pub origin: Origin,
}

/// Lifecycle of one identity within one run.
///
/// `Unstarted -> Running -> {Succeeded, Failed, Cancelled}`; the last three
/// are terminal.
#[derive(Debug, Clone)]
pub enum CellState {
    /// Registered, producer not yet running.
    Unstarted,
    /// The producer is resolving or running the body.
    Running,
    /// The body completed, or the stored entry was reused.
    Succeeded(Resolved),
    /// The body failed.
    Failed(Failure),
    /// The body exited early after a failure elsewhere in the run.
    Cancelled(Failure),
}

impl CellState {
    /// Returns `true` once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded(_) | Self::Failed(_) | Self::Cancelled(_)
        )
    }
}

/// The shared slot every reader of one identity waits on.
pub(crate) struct ResultCell {
    identity: Identity,
    state: watch::Sender<CellState>,
}

impl ResultCell {
    pub(crate) fn new(identity: Identity) -> Self {
        let (state, _) = watch::channel(CellState::Unstarted);
        Self { identity, state }
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    pub(crate) fn state(&self) -> CellState {
        self.state.borrow().clone()
    }

    /// Move `Unstarted -> Running`. Returns `false` if the cell already left
    /// `Unstarted`, in which case the caller must not produce a value.
    pub(crate) fn try_start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, CellState::Unstarted) {
                *state = CellState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Publish the terminal state and wake every reader.
    pub(crate) fn complete(&self, outcome: CellState) {
        debug_assert!(outcome.is_terminal());
        self.state.send_replace(outcome);
    }

    /// Suspend until the cell is terminal.
    pub(crate) async fn wait(&self) -> Result<Resolved, Failure> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(CellState::is_terminal).await {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`, so this cannot happen while
            // we hold a reference; report it as a cancellation regardless.
            Err(_) => {
                return Err(Failure::Cancelled {
                    identity: self.identity.clone(),
                })
            }
        };
        match state {
            CellState::Succeeded(resolved) => Ok(resolved),
            CellState::Failed(failure) | CellState::Cancelled(failure) => Err(failure),
            CellState::Unstarted | CellState::Running => unreachable!("waited for terminal state"),
        }
    }
}

impl std::fmt::Debug for ResultCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCell")
            .field("identity", &self.identity)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// At most one [`ResultCell`] per identity per run.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    cells: RwLock<HashMap<Identity, Arc<ResultCell>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, identity: &str) -> Option<Arc<ResultCell>> {
        self.cells.read().get(identity).cloned()
    }

    /// Get the cell for `identity`, creating it if needed. The flag is
    /// `true` only for the caller that created it.
    pub(crate) fn get_or_insert(&self, identity: &Identity) -> (Arc<ResultCell>, bool) {
        // Fast path: read lock
        if let Some(cell) = self.cells.read().get(identity) {
            return (cell.clone(), false);
        }

        // Slow path: write lock, double-check after acquiring lock
        let mut cells = self.cells.write();
        if let Some(cell) = cells.get(identity) {
            return (cell.clone(), false);
        }
        let cell = Arc::new(ResultCell::new(identity.clone()));
        cells.insert(identity.clone(), cell.clone());
        (cell, true)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cells.read().len()
    }
}

// ============================================================================
// Wait Graph
// ============================================================================

#[derive(Debug)]
struct WaitEdge {
    from: Identity,
    to: Identity,
    /// Present on resolution waits. Flipping it tells the resolver to give up.
    abandon: Option<watch::Sender<bool>>,
}

#[derive(Debug, Default)]
struct WaitEdges {
    next_id: u64,
    edges: HashMap<u64, WaitEdge>,
}

impl WaitEdges {
    fn insert(&mut self, edge: WaitEdge) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.edges.insert(id, edge);
        id
    }

    /// Identities reachable from `start`, following edges forward or backward.
    fn reachable(&self, start: &Identity, forward: bool) -> HashSet<Identity> {
        let mut seen = HashSet::new();
        let mut stack = vec![start.clone()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for edge in self.edges.values() {
                let (src, dst) = if forward {
                    (&edge.from, &edge.to)
                } else {
                    (&edge.to, &edge.from)
                };
                if *src == node && !seen.contains(dst) {
                    stack.push(dst.clone());
                }
            }
        }
        seen
    }
}

/// Who waits on whom in one run.
///
/// Body reads follow the program as it is written now. Resolution waits
/// follow dependency lists stored by an earlier run, which may point the
/// other way. A resolution wait never closes a cycle, and a read that closes
/// one abandons every resolution wait on it, so those cells recompute.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
    inner: Mutex<WaitEdges>,
}

impl WaitGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that the body of `from` reads `to`.
    pub(crate) fn enter_read(&self, from: &Identity, to: &Identity) -> WaitGuard<'_> {
        let mut inner = self.inner.lock();

        let ahead = inner.reachable(to, true);
        if ahead.contains(from) {
            let behind = inner.reachable(from, false);
            for edge in inner.edges.values() {
                if let Some(abandon) = &edge.abandon {
                    if ahead.contains(&edge.from) && behind.contains(&edge.to) {
                        abandon.send_replace(true);
                    }
                }
            }
        }

        let id = inner.insert(WaitEdge {
            from: from.clone(),
            to: to.clone(),
            abandon: None,
        });
        WaitGuard {
            graph: self,
            id,
            abandoned: None,
        }
    }

    /// Record that the resolver of `from` waits on `to`, or `None` if `to`
    /// already waits on `from`.
    pub(crate) fn enter_resolve(&self, from: &Identity, to: &Identity) -> Option<WaitGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.reachable(to, true).contains(from) {
            return None;
        }

        let (abandon, abandoned) = watch::channel(false);
        let id = inner.insert(WaitEdge {
            from: from.clone(),
            to: to.clone(),
            abandon: Some(abandon),
        });
        Some(WaitGuard {
            graph: self,
            id,
            abandoned: Some(abandoned),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().edges.len()
    }
}

/// One edge of the [`WaitGraph`], removed on drop.
pub(crate) struct WaitGuard<'a> {
    graph: &'a WaitGraph,
    id: u64,
    abandoned: Option<watch::Receiver<bool>>,
}

impl WaitGuard<'_> {
    /// Completes once a resolution wait has been abandoned. Never completes
    /// for reads.
    pub(crate) async fn abandoned(&mut self) {
        if let Some(rx) = &mut self.abandoned {
            if rx.wait_for(|abandoned| *abandoned).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.graph.inner.lock().edges.remove(&self.id);
    }
}
