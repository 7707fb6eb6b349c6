//! Ordered capture of the reads one body execution performs.

use crate::digest::Digest;
use crate::store::{Dependency, Identity};

/// Position of a read in a [`DependencyRecorder`], handed out when the read
/// is issued and filled in when it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindSlot(usize);

/// Append-only list of the reads performed by a single body execution.
///
/// Order is the order in which reads were *issued*, not the order in which
/// they resolved, so concurrently awaited reads still produce a stable list.
/// Duplicates are kept.
#[derive(Debug, Default)]
pub struct DependencyRecorder {
    slots: Vec<Option<Dependency>>,
}

impl DependencyRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next position for a read that has just been issued.
    pub fn reserve(&mut self) -> BindSlot {
        self.slots.push(None);
        BindSlot(self.slots.len() - 1)
    }

    /// Fill a reserved position with the dependency the read observed.
    pub fn fill(&mut self, slot: BindSlot, identity: Identity, digest: Digest) {
        if let Some(entry) = self.slots.get_mut(slot.0) {
            *entry = Some(Dependency { identity, digest });
        }
    }

    /// Append a read that resolved immediately.
    pub fn record(&mut self, identity: Identity, digest: Digest) {
        self.slots.push(Some(Dependency { identity, digest }));
    }

    /// Number of reads issued so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no read has been issued.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Finalize into the ordered dependency list and its digest.
    ///
    /// Reads that were issued but never resolved are skipped.
    pub fn finish(self) -> (Vec<Dependency>, Digest) {
        let dependencies: Vec<Dependency> = self.slots.into_iter().flatten().collect();
        let digest = Digest::of_dependencies(&dependencies);
        (dependencies, digest)
    }
}
