use alloc::string::String;
use serde::{Deserialize, Serialize};

/// Configuration of a [`Session`](crate::Session).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobCacheConfig {
    /// Prefix of the generated names host snapshots are registered under.
    pub numpy_tmp_prefix: String,
    /// Skip boxing for blobs already replicated on the canonical device.
    ///
    /// Off by default: every snapshot records one boxing action, even a redundant one.
    pub skip_boxing_when_canonical: bool,
}

impl Default for BlobCacheConfig {
    fn default() -> Self {
        Self {
            numpy_tmp_prefix: String::from("numpy-tmp-"),
            skip_boxing_when_canonical: false,
        }
    }
}

impl BlobCacheConfig {
    /// Sets [`skip_boxing_when_canonical`](Self::skip_boxing_when_canonical).
    pub fn with_skip_boxing_when_canonical(mut self, skip: bool) -> Self {
        self.skip_boxing_when_canonical = skip;
        self
    }

    /// Sets [`numpy_tmp_prefix`](Self::numpy_tmp_prefix).
    pub fn with_numpy_tmp_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.numpy_tmp_prefix = prefix.into();
        self
    }
}
