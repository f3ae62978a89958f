//! Registry of live paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use salty_types::PublicKey;

use crate::path::Path;

/// All paths with at least one client, keyed by hex initiator key.
#[derive(Default)]
pub struct Paths {
    paths: DashMap<String, Arc<Path>>,
    sequence: AtomicU64,
}

impl Paths {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The live path for `key`, created if missing.
    ///
    /// A path that was pruned but is still referenced somewhere is never
    /// handed out again; a fresh one takes its place.
    pub fn get_or_create(&self, key: &PublicKey) -> Arc<Path> {
        let key_hex = hex::encode(key.as_bytes());
        match self.paths.entry(key_hex) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_orphan() {
                    let path = self.fresh(key);
                    occupied.insert(Arc::clone(&path));
                    path
                } else {
                    Arc::clone(occupied.get())
                }
            }
            Entry::Vacant(vacant) => {
                let path = self.fresh(key);
                vacant.insert(Arc::clone(&path));
                tracing::debug!("Created path {} ({})", path.number(), path.key_hex());
                path
            }
        }
    }

    /// Look up a path by hex key.
    pub fn get(&self, key_hex: &str) -> Option<Arc<Path>> {
        self.paths.get(key_hex).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `path` if it is still registered and empty. Returns true if
    /// it was removed; the path is then marked orphan.
    ///
    /// The flag is raised before the emptiness check so that a client
    /// installing itself concurrently either is counted here or sees the
    /// flag and moves to the live path.
    pub fn prune(&self, path: &Arc<Path>) -> bool {
        let removed = self
            .paths
            .remove_if(path.key_hex(), |_, current| {
                if !Arc::ptr_eq(current, path) {
                    return false;
                }
                current.mark_orphan();
                if current.is_empty() {
                    true
                } else {
                    current.clear_orphan();
                    false
                }
            })
            .is_some();
        if removed {
            tracing::debug!("Removed empty path {} ({})", path.number(), path.key_hex());
        }
        removed
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// True if no path is registered.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn fresh(&self, key: &PublicKey) -> Arc<Path> {
        let number = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(Path::new(key.clone(), number))
    }
}
