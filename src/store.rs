//! Core storage types and the [`LogStore`] trait for persisted entries.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Get the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Name of a logged computation, unique within one log store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Arc<str>);

impl Identity {
    /// Create an identity from any string-like value.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Get the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&String> for Identity {
    fn from(name: &String) -> Self {
        Self::new(name)
    }
}

impl From<&Identity> for Identity {
    fn from(identity: &Identity) -> Self {
        identity.clone()
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Identity {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for Identity {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recorded read: the identity that was read and the digest it had.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The identity that was read.
    pub identity: Identity,
    /// The result digest observed by the read.
    pub digest: Digest,
}

impl Dependency {
    /// Create a dependency record.
    pub fn new(identity: impl Into<Identity>, digest: Digest) -> Self {
        Self {
            identity: identity.into(),
            digest,
        }
    }
}

/// The persisted record of one logged computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The identity this entry belongs to.
    pub identity: Identity,

    /// Reads performed by the body, in the order they were issued.
    pub dependencies: Vec<Dependency>,

    /// Digest over `dependencies`, see [`Digest::of_dependencies`].
    pub dependency_digest: Digest,

    /// Digest of `payload`.
    pub result_digest: Digest,

    /// Encoded result. Opaque to the engine.
    pub payload: Vec<u8>,

    /// When the entry was written (Unix millis).
    pub persisted_at: u64,
}

impl Entry {
    /// Build an entry, computing both digests.
    pub fn new(identity: impl Into<Identity>, dependencies: Vec<Dependency>, payload: Vec<u8>) -> Self {
        let dependency_digest = Digest::of_dependencies(&dependencies);
        let result_digest = Digest::of_bytes(&payload);
        Self {
            identity: identity.into(),
            dependencies,
            dependency_digest,
            result_digest,
            payload,
            persisted_at: now_millis(),
        }
    }

    /// Whether the body of this entry read nothing, which makes it
    /// unverifiable and forces re-execution.
    pub fn is_leaf(&self) -> bool {
        self.dependencies.is_empty()
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Errors that can occur during storage operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StoreError {
    /// Persisted data is unreadable or in an unexpected format.
    #[error("log store at {} is corrupt: {reason}", path.display())]
    Corrupt {
        /// The file that failed to load.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// An I/O error from the underlying file system.
    #[error("log store I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// An entry could not be encoded for storage.
    #[error("failed to encode entry for `{identity}`: {message}")]
    Encode {
        /// The identity being written.
        identity: Identity,
        /// Encoder message.
        message: String,
    },

    /// The store was closed.
    #[error("log store is closed")]
    Closed,

    /// A failed append could not be rolled back; the store refuses further
    /// use until it is reopened.
    #[error("log store is unusable after a failed write could not be rolled back")]
    Poisoned,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Durable map from identity to [`Entry`].
///
/// Implementations must be thread-safe (`Send + Sync`) and must make each
/// `put` atomic: after a crash, an identity maps either to its previous
/// entry or to the new one, never to a torn record.
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    /// Look up the entry for an identity.
    async fn get(&self, identity: &str) -> Result<Option<Entry>, StoreError>;

    /// Insert or replace the entry for `entry.identity`.
    async fn put(&self, entry: Entry) -> Result<(), StoreError>;

    /// Check if an entry exists.
    async fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.get(identity).await?.is_some())
    }

    /// Flush everything written so far and release the store.
    async fn close(&self) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-memory storage backend for testing and single-process use.
///
/// Uses `parking_lot::RwLock` for thread-safe access.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    entries: RwLock<HashMap<Identity, Entry>>,
}

impl InMemoryLogStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait::async_trait]
impl LogStore for InMemoryLogStore {
    async fn get(&self, identity: &str) -> Result<Option<Entry>, StoreError> {
        Ok(self.entries.read().get(identity).cloned())
    }

    async fn put(&self, entry: Entry) -> Result<(), StoreError> {
        self.entries.write().insert(entry.identity.clone(), entry);
        Ok(())
    }

    async fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.entries.read().contains_key(identity))
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
