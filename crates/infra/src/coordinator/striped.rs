//! Striped lock for per-key handler serialization.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

const DEFAULT_STRIPES: usize = 64;

/// Fixed pool of async mutexes, one selected by key hash.
///
/// Holding the guard for a partner id serializes all handling for that saga;
/// sagas hashing to different stripes proceed in parallel. Two keys sharing a
/// stripe serialize spuriously, which is harmless.
#[derive(Debug)]
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl StripedLock {
    pub fn new(stripes: usize) -> Self {
        assert!(stripes > 0, "stripe count must be non-zero");
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock().await
    }
}

impl Default for StripedLock {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
