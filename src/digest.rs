//! Result and dependency fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::store::Dependency;

const DEPENDENCY_DOMAIN: &[u8] = b"recall.dependencies.v1";

/// A 32-byte SHA-256 fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of an encoded result payload.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::finish(hasher)
    }

    /// Digest of an ordered dependency list.
    ///
    /// Every element is length-prefixed, so the result changes with order,
    /// membership and multiplicity, and two different lists never hash the
    /// same input stream.
    pub fn of_dependencies(dependencies: &[Dependency]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DEPENDENCY_DOMAIN);
        hasher.update((dependencies.len() as u64).to_le_bytes());
        for dep in dependencies {
            let name = dep.identity.as_str().as_bytes();
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name);
            hasher.update(dep.digest.as_bytes());
        }
        Self::finish(hasher)
    }

    fn finish(hasher: Sha256) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Get the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Twelve hex digits are plenty to tell digests apart in logs.
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}
