//! Cache Key Derivation
//!
//! Maps a source URL to a short, fixed-width key. Keys are addressed by the
//! URL string, not by the fetched bytes, so the same link always lands on
//! the same artifact.

use std::fmt;

use sha1::{Digest, Sha1};

/// Number of hex characters kept from the digest
pub const KEY_LEN: usize = 7;

/// File extension of every artifact in the store
pub const ARTIFACT_EXT: &str = "mp4";

/// Truncated SHA-1 of a source URL.
///
/// Collisions at this width are not detected: two URLs sharing a key will
/// share one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a source URL
    pub fn derive(url: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(url.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..KEY_LEN].to_string())
    }

    /// Key as a hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Artifact file name for this key (`<key>.mp4`)
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.0, ARTIFACT_EXT)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
