use serde::{Deserialize, Serialize};

/// Sizing and policy for the object cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of object hash buckets.
    pub hash_buckets: usize,
    /// Number of node frames. Page frames come from the RAM regions of the
    /// physical memory map.
    pub node_frames: u32,
    /// Keep and verify checksums of clean pages.
    pub checksums: bool,
    /// The aging scan stops once this many frames are free.
    pub free_target: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hash_buckets: 1024,
            node_frames: 512,
            checksums: cfg!(debug_assertions),
            free_target: 1,
        }
    }
}

impl CacheConfig {
    /// A small cache for tests, with checksums on.
    pub fn small(node_frames: u32) -> Self {
        Self {
            hash_buckets: 64,
            node_frames,
            checksums: true,
            free_target: 1,
        }
    }
}
