//! The capability store.
//!
//! A capability is a lease authorising one client mount to act on one inode
//! until `vtime`. The store is an arena keyed by auth-id with four
//! non-owning secondary views: by client transport id, by client mount
//! uuid, by inode, and an ordered expiry index. Every mutation keeps all
//! views consistent; a missing entry in any view is a bug, not a
//! recoverable state.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use tracing::{debug, info};

use emberfs_proto::CapRecord;

use crate::types::{InodeId, Timestamp};

#[derive(Default)]
struct CapsInner {
    caps: HashMap<String, CapRecord>,
    client_caps: HashMap<String, HashSet<String>>,
    uuid_caps: HashMap<String, HashSet<String>>,
    inode_caps: HashMap<u64, HashSet<String>>,
    client_inos: HashMap<String, HashSet<u64>>,
    expiry: BTreeSet<(u64, String)>,
}

impl CapsInner {
    fn link(&mut self, cap: CapRecord) {
        let authid = cap.authid.clone();
        self.client_caps
            .entry(cap.clientid.clone())
            .or_default()
            .insert(authid.clone());
        self.uuid_caps
            .entry(cap.clientuuid.clone())
            .or_default()
            .insert(authid.clone());
        self.inode_caps
            .entry(cap.id)
            .or_default()
            .insert(authid.clone());
        self.client_inos
            .entry(cap.clientid.clone())
            .or_default()
            .insert(cap.id);
        self.expiry.insert((cap.vtime, authid.clone()));
        self.caps.insert(authid, cap);
    }

    fn unlink(&mut self, authid: &str) -> Option<CapRecord> {
        let cap = self.caps.remove(authid)?;

        if let Some(set) = self.client_caps.get_mut(&cap.clientid) {
            set.remove(authid);
            if set.is_empty() {
                self.client_caps.remove(&cap.clientid);
            }
        }
        if let Some(set) = self.uuid_caps.get_mut(&cap.clientuuid) {
            set.remove(authid);
            if set.is_empty() {
                self.uuid_caps.remove(&cap.clientuuid);
            }
        }
        if let Some(set) = self.inode_caps.get_mut(&cap.id) {
            set.remove(authid);
            if set.is_empty() {
                self.inode_caps.remove(&cap.id);
            }
        }
        self.expiry.remove(&(cap.vtime, authid.to_string()));

        // the client may hold other caps on the same inode
        let other = self
            .caps
            .values()
            .any(|c| c.clientid == cap.clientid && c.id == cap.id);
        if !other {
            if let Some(inos) = self.client_inos.get_mut(&cap.clientid) {
                inos.remove(&cap.id);
                if inos.is_empty() {
                    self.client_inos.remove(&cap.clientid);
                }
            }
        }

        Some(cap)
    }
}

/// Authoritative store of issued capabilities.
#[derive(Default)]
pub struct CapStore {
    inner: RwLock<CapsInner>,
}

impl CapStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a capability by auth-id, updating every view.
    pub fn store(&self, cap: CapRecord) {
        debug!(id = cap.id, clientid = %cap.clientid, authid = %cap.authid, "store cap");
        let mut inner = self.inner.write().unwrap();
        inner.unlink(&cap.authid.clone());
        inner.link(cap);
    }

    /// Fetch a capability by auth-id.
    pub fn get(&self, authid: &str) -> Option<CapRecord> {
        self.inner.read().unwrap().caps.get(authid).cloned()
    }

    /// Extend the lifetime of a capability by `extra` seconds, keeping the
    /// expiry index ordered. No-op on unknown or never-valid caps.
    pub fn extend(&self, authid: &str, extra: u64) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(cap) = inner.caps.get(authid) else {
            return false;
        };
        if cap.vtime == 0 {
            return false;
        }
        let old = cap.vtime;
        info!(authid, vtime_from = old, vtime_to = old + extra, "cap extension");
        let mut cap = inner.unlink(authid).expect("cap present above");
        cap.vtime = old + extra;
        inner.link(cap);
        true
    }

    /// Rewrite the quota fields of a capability, returning the updated cap.
    pub fn update_quota(&self, authid: &str, files: i64, bytes: i64) -> Option<CapRecord> {
        let mut inner = self.inner.write().unwrap();
        let cap = inner.caps.get_mut(authid)?;
        cap.quota.inode_quota = files;
        cap.quota.volume_quota = bytes;
        Some(cap.clone())
    }

    /// Derive a child capability from the parent's, pinned to `md_ino` with
    /// a fresh expiry. Fails when the parent cap is gone or the client sent
    /// no implied auth-id.
    pub fn imply(
        &self,
        md_ino: InodeId,
        authid: &str,
        implied_authid: &str,
        vtime: Timestamp,
    ) -> bool {
        if implied_authid.is_empty() {
            return false;
        }
        let Some(parent) = self.get(authid) else {
            return false;
        };
        if parent.id == 0 {
            return false;
        }
        info!(id = %md_ino, authid, implied_authid, "imply cap");

        let mut cap = parent;
        cap.authid = implied_authid.to_string();
        cap.id = md_ino.as_u64();
        cap.vtime = vtime.secs;
        cap.vtime_ns = vtime.nanos;
        self.store(cap);
        true
    }

    /// Remove every capability pinned to `ino` from every view.
    pub fn delete_inode(&self, ino: InodeId) -> Vec<CapRecord> {
        let mut inner = self.inner.write().unwrap();
        let authids: Vec<String> = inner
            .inode_caps
            .get(&ino.as_u64())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        authids
            .iter()
            .filter_map(|authid| inner.unlink(authid))
            .collect()
    }

    /// Remove one capability by auth-id.
    pub fn remove(&self, authid: &str) -> Option<CapRecord> {
        self.inner.write().unwrap().unlink(authid)
    }

    /// Remove every capability of one client mount.
    pub fn drop_client(&self, clientuuid: &str) -> Vec<CapRecord> {
        let mut inner = self.inner.write().unwrap();
        let authids: Vec<String> = inner
            .uuid_caps
            .get(clientuuid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        authids
            .iter()
            .filter_map(|authid| inner.unlink(authid))
            .collect()
    }

    /// True when the earliest capability has expired at `now`.
    pub fn expired_front(&self, now: Timestamp) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .expiry
            .iter()
            .next()
            .is_some_and(|(vtime, _)| *vtime <= now.secs)
    }

    /// Remove and return the capability closest to expiry.
    pub fn pop_front(&self) -> Option<CapRecord> {
        let mut inner = self.inner.write().unwrap();
        let authid = inner.expiry.iter().next()?.1.clone();
        inner.unlink(&authid)
    }

    /// All capabilities pinned to `ino`.
    pub fn caps_on_inode(&self, ino: InodeId) -> Vec<CapRecord> {
        let inner = self.inner.read().unwrap();
        inner
            .inode_caps
            .get(&ino.as_u64())
            .map(|set| {
                set.iter()
                    .filter_map(|authid| inner.caps.get(authid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when `clientid` already holds a capability on `ino`.
    pub fn client_has_cap_on(&self, clientid: &str, ino: InodeId) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .client_inos
            .get(clientid)
            .is_some_and(|inos| inos.contains(&ino.as_u64()))
    }

    /// Snapshot of every capability, for the quota sweep and dump helpers.
    pub fn all(&self) -> Vec<CapRecord> {
        self.inner.read().unwrap().caps.values().cloned().collect()
    }

    /// One line per capability for the operator console, optionally
    /// filtered by client transport id or path-of-inode.
    pub fn dump(&self, now: Timestamp, client_filter: Option<&str>) -> String {
        let inner = self.inner.read().unwrap();
        let mut out = String::new();
        for cap in inner.caps.values() {
            if let Some(filter) = client_filter {
                if !cap.clientid.contains(filter) {
                    continue;
                }
            }
            let left = cap.vtime as i64 - now.secs as i64;
            out.push_str(&format!(
                "cap: i:{:016x} a:{} client={} uuid={} mode={:#x} valid={}s\n",
                cap.id, cap.authid, cap.clientid, cap.clientuuid, cap.mode, left,
            ));
        }
        out
    }

    /// Number of live capabilities.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().caps.len()
    }

    /// True when no capability is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn check_views(&self) {
        let inner = self.inner.read().unwrap();
        for (authid, cap) in inner.caps.iter() {
            assert!(inner.client_caps[&cap.clientid].contains(authid));
            assert!(inner.uuid_caps[&cap.clientuuid].contains(authid));
            assert!(inner.inode_caps[&cap.id].contains(authid));
            assert!(inner.client_inos[&cap.clientid].contains(&cap.id));
            assert!(inner.expiry.contains(&(cap.vtime, authid.clone())));
        }
        assert_eq!(inner.expiry.len(), inner.caps.len());
    }
}
