//! The available-child table and the per-URL cache registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info};

use lool_cache::TileCache;

use crate::session::MasterSession;

/// Worker sessions that have completed their `child` hello and are waiting
/// to be claimed by the client session with the same id.
///
/// Entries are short-lived: inserted on the worker handshake, removed on
/// claim. The notify wakes every waiter on insert; each re-checks for its
/// own id.
#[derive(Default)]
pub struct AvailableChildren {
    inner: Mutex<HashMap<String, Arc<MasterSession>>>,
    notify: Notify,
}

impl AvailableChildren {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: String, session: Arc<MasterSession>) {
        let size = {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(id.clone(), session);
            inner.len()
        };
        info!(%id, size, "child session registered");
        self.notify.notify_waiters();
    }

    /// Removes an entry without waiting, e.g. when the worker socket closes
    /// before anyone claimed it.
    pub fn remove(&self, id: &str) -> Option<Arc<MasterSession>> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `timeout` for the child with this id to register, and
    /// claims it.
    pub async fn wait_claim(&self, id: &str, timeout: Duration) -> Option<Arc<MasterSession>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the waiter before checking, so an insert between the check
            // and the await cannot be missed.
            let notified = self.notify.notified();

            if let Some(session) = self.remove(id) {
                debug!(%id, "claimed child session");
                return Some(session);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}

/// Per-document-URL caches, shared across sessions and reconnects for the
/// lifetime of the master.
#[derive(Default)]
pub struct CacheRegistry {
    inner: Mutex<HashMap<String, Arc<TileCache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, url: &str, timestamp: Option<String>) -> Arc<TileCache> {
        self.inner
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert_with(|| {
                info!(%url, "creating tile cache");
                Arc::new(TileCache::new(url, timestamp))
            })
            .clone()
    }

    /// Drops the cache for a URL, e.g. with its document.
    pub fn evict(&self, url: &str) {
        self.inner.lock().unwrap().remove(url);
    }
}
