//! Client heartbeat messages.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Periodic heartbeat sent by every client mount.
///
/// Besides the liveness clock, the heartbeat piggybacks capability lifetime
/// extensions and revocations the client accumulated since the last beat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Stable per-mount uuid.
    pub uuid: String,
    /// Client wall clock, seconds.
    pub clock: u64,
    /// Client wall clock, nanoseconds.
    pub clock_ns: u32,
    /// Protocol version the client speaks.
    pub protocol_version: u32,
    /// Cap lease time the client asks for, seconds.
    pub leasetime: u64,
    /// Set on the final heartbeat of a clean unmount.
    pub shutdown: bool,
    /// Requested cap lifetime extensions: auth-id to extra seconds.
    pub authextension: BTreeMap<String, u64>,
    /// Caps the client voluntarily gives up.
    pub authrevocation: BTreeSet<String>,
    /// Client-side statistics for the operator console.
    pub statistics: Option<Statistics>,
}

/// Client mount statistics, shown by the broker's dump helpers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Cached inodes on the client.
    pub inodes: u64,
    /// Inodes queued for deletion.
    pub inodes_todelete: u64,
    /// Inodes with a write backlog.
    pub inodes_backlog: u64,
    /// Inodes ever seen by this mount.
    pub inodes_ever: u64,
    /// Inodes ever deleted by this mount.
    pub inodes_ever_deleted: u64,
    /// Client threads.
    pub threads: u64,
    /// Virtual memory, MiB.
    pub vsize_mb: u64,
    /// Resident memory, MiB.
    pub rss_mb: u64,
    /// Open files on the mount.
    pub open_files: u64,
}
