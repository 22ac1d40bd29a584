//! Flush windows.
//!
//! A client announces outstanding writes on an inode with `BEGINFLUSH` and
//! retires them with `ENDFLUSH`. While a window is open, server-side
//! queries that depend on the file size poll [`FlushTracker::has_flush`]
//! and answer with a wait-or-retry policy. Windows expire after a
//! configurable TTL so a crashed client cannot stall queries forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::types::{InodeId, Timestamp};

/// Poll attempts of `has_flush`, with 1→128 ms doubling sleeps (≤ 255 ms).
const HAS_FLUSH_TRIES: u32 = 8;

/// Tracks open flush windows per `(inode, client uuid)`.
pub struct FlushTracker {
    ttl: u64,
    inner: Mutex<HashMap<u64, HashMap<String, Timestamp>>>,
}

impl FlushTracker {
    /// A tracker whose windows live `ttl` seconds.
    pub fn new(ttl: u64) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or refresh) the window of `(ino, client)`.
    pub fn begin_flush(&self, ino: InodeId, client: &str, now: Timestamp) {
        debug!(ino = %ino, client, "begin flush");
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(ino.as_u64())
            .or_default()
            .insert(client.to_string(), now.plus_secs(self.ttl));
    }

    /// Close the window of `(ino, client)`.
    pub fn end_flush(&self, ino: InodeId, client: &str) {
        debug!(ino = %ino, client, "end flush");
        let mut inner = self.inner.lock().unwrap();
        if let Some(clients) = inner.get_mut(&ino.as_u64()) {
            clients.remove(client);
            if clients.is_empty() {
                inner.remove(&ino.as_u64());
            }
        }
    }

    /// Single-shot check: does `ino` have an unexpired window? Expired
    /// entries for the inode are dropped on the way.
    pub fn validate_flush(&self, ino: InodeId, now: Timestamp) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(clients) = inner.get_mut(&ino.as_u64()) else {
            return false;
        };
        clients.retain(|_, expires_at| *expires_at > now);
        let has = !clients.is_empty();
        if !has {
            inner.remove(&ino.as_u64());
        }
        has
    }

    /// Poll for the window of `ino` to close. Waits at most ~255 ms; true
    /// means an unexpired window is still open.
    pub fn has_flush(&self, ino: InodeId) -> bool {
        let mut delay = Duration::from_millis(1);

        for _ in 0..HAS_FLUSH_TRIES {
            if !self.validate_flush(ino, Timestamp::now()) {
                return false;
            }
            std::thread::sleep(delay);
            delay *= 2;
        }

        true
    }

    /// Sweep every expired window. Run from the heartbeat monitor tick.
    pub fn expire_flush(&self, now: Timestamp) {
        let mut inner = self.inner.lock().unwrap();
        for clients in inner.values_mut() {
            clients.retain(|_, expires_at| *expires_at > now);
        }
        inner.retain(|_, clients| !clients.is_empty());
    }

    /// Open windows as `(inode, client, seconds until expiry)`.
    pub fn dump(&self, now: Timestamp) -> Vec<(u64, String, i64)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (ino, clients) in inner.iter() {
            for (client, expires_at) in clients.iter() {
                out.push((
                    *ino,
                    client.clone(),
                    expires_at.secs as i64 - now.secs as i64,
                ));
            }
        }
        out
    }

    /// Number of inodes with an open window.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True when no window is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
