//! Quota oracle seam.
//!
//! Quota accounting lives outside the broker; the broker only asks how many
//! files and bytes a `(quota node, uid, gid)` tuple may still create, both
//! when issuing capabilities and from the periodic cap refresh loop.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::types::InodeId;

/// Availability reported for caps not governed by any quota node.
pub const NO_QUOTA: i64 = i64::MAX / 2;

/// Quota availability for one identity under one quota node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuotaLookup {
    /// Files the identity may still create.
    pub avail_files: i64,
    /// Bytes the identity may still write.
    pub avail_bytes: i64,
    /// Inode of the governing quota node.
    pub quota_node: u64,
}

/// Answers quota questions for the broker.
pub trait QuotaOracle: Send + Sync {
    /// Whether quota is enforced for the named space.
    fn is_enabled(&self, space: &str) -> bool;

    /// Availability for the deepest quota node above `path`, or `None` when
    /// no quota node governs the path.
    fn quota_by_path(&self, path: &str, uid: u32, gid: u32) -> Option<QuotaLookup>;

    /// Availability under an explicit quota node, or `None` when the node is
    /// unknown.
    fn quota_by_node(&self, node: u64, uid: u32, gid: u32) -> Option<(i64, i64)>;
}

#[derive(Default)]
struct FixedQuotaInner {
    enabled_spaces: HashSet<String>,
    /// Quota node roots: path prefix to node inode.
    nodes: HashMap<String, u64>,
    /// Availability per (node, uid, gid).
    availability: HashMap<(u64, u32, u32), (i64, i64)>,
}

/// A table-driven oracle for tests and for instances without a quota store.
#[derive(Default)]
pub struct FixedQuota {
    inner: RwLock<FixedQuotaInner>,
}

impl FixedQuota {
    /// An oracle with quota disabled everywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable quota enforcement for a space.
    pub fn enable_space(&self, space: &str) {
        self.inner
            .write()
            .unwrap()
            .enabled_spaces
            .insert(space.to_string());
    }

    /// Declare a quota node rooted at `path_prefix`.
    pub fn add_node(&self, path_prefix: &str, node: InodeId) {
        self.inner
            .write()
            .unwrap()
            .nodes
            .insert(path_prefix.to_string(), node.as_u64());
    }

    /// Set the availability of `(node, uid, gid)`.
    pub fn set_availability(&self, node: InodeId, uid: u32, gid: u32, files: i64, bytes: i64) {
        self.inner
            .write()
            .unwrap()
            .availability
            .insert((node.as_u64(), uid, gid), (files, bytes));
    }
}

impl QuotaOracle for FixedQuota {
    fn is_enabled(&self, space: &str) -> bool {
        self.inner.read().unwrap().enabled_spaces.contains(space)
    }

    fn quota_by_path(&self, path: &str, uid: u32, gid: u32) -> Option<QuotaLookup> {
        let inner = self.inner.read().unwrap();
        // deepest matching quota node wins
        let node = inner
            .nodes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, node)| *node)?;
        let (avail_files, avail_bytes) = inner
            .availability
            .get(&(node, uid, gid))
            .copied()
            .unwrap_or((NO_QUOTA, NO_QUOTA));
        Some(QuotaLookup {
            avail_files,
            avail_bytes,
            quota_node: node,
        })
    }

    fn quota_by_node(&self, node: u64, uid: u32, gid: u32) -> Option<(i64, i64)> {
        let inner = self.inner.read().unwrap();
        if !inner.nodes.values().any(|n| *n == node) {
            return None;
        }
        Some(
            inner
                .availability
                .get(&(node, uid, gid))
                .copied()
                .unwrap_or((NO_QUOTA, NO_QUOTA)),
        )
    }
}
