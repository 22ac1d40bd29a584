//! Broker-to-client response messages.
//!
//! Every reply and every server-initiated broadcast is a [`Response`]
//! variant. Listing replies additionally wrap their metadata records in a
//! [`Container`] envelope so a single `LS` can be streamed as several
//! frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::md::MdOperation;

/// Outcome code of an acknowledgement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckCode {
    /// Operation applied.
    Ok,
    /// Operation failed and retrying will not help.
    PermanentFailure,
    /// Operation failed transiently.
    TemporaryFailure,
}

/// Acknowledgement for a mutation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Outcome.
    pub code: AckCode,
    /// POSIX errno for failures, 0 otherwise.
    pub err_no: i32,
    /// Human-readable failure description.
    pub err_msg: String,
    /// Echo of the request's `reqid`.
    pub transaction_id: u64,
    /// Inode the operation produced or touched.
    pub md_ino: u64,
}

impl Ack {
    /// A successful acknowledgement for `reqid`, reporting `md_ino`.
    pub fn ok(transaction_id: u64, md_ino: u64) -> Self {
        Self {
            code: AckCode::Ok,
            err_no: 0,
            err_msg: String::new(),
            transaction_id,
            md_ino,
        }
    }

    /// A permanent failure carrying `errno` and a description.
    pub fn failure(transaction_id: u64, err_no: i32, err_msg: impl Into<String>) -> Self {
        Self {
            code: AckCode::PermanentFailure,
            err_no,
            err_msg: err_msg.into(),
            transaction_id,
            md_ino: 0,
        }
    }
}

/// Quota availability attached to a capability.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    /// Inodes still available under the governing quota node.
    pub inode_quota: i64,
    /// Bytes still available under the governing quota node.
    pub volume_quota: i64,
    /// Inode of the governing quota node, 0 if none.
    pub quota_node: u64,
}

/// A capability: a lease authorising one client mount to act on one inode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapRecord {
    /// Inode the capability is pinned to.
    pub id: u64,
    /// Granted mode bits (see the broker's cap-mode constants).
    pub mode: u32,
    /// Absolute expiry, seconds.
    pub vtime: u64,
    /// Absolute expiry, nanoseconds.
    pub vtime_ns: u32,
    /// Effective uid the client should account under.
    pub uid: u32,
    /// Effective gid the client should account under.
    pub gid: u32,
    /// Opaque per-cap token, the primary key.
    pub authid: String,
    /// Transport identity of the owning client.
    pub clientid: String,
    /// Mount uuid of the owning client.
    pub clientuuid: String,
    /// Quota availability snapshot.
    pub quota: QuotaInfo,
    /// Per-file size ceiling for writes under this cap.
    pub max_file_size: u64,
    /// Errno when cap computation failed, 0 otherwise.
    pub errc: i32,
}

/// Discriminates plain records from records with children attached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdRecordKind {
    /// Metadata only.
    Md,
    /// Metadata plus the `children` map.
    MdLs,
}

impl Default for MdRecordKind {
    fn default() -> Self {
        MdRecordKind::Md
    }
}

/// A metadata record for one container or file, as returned to clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MdRecord {
    /// Record kind.
    pub kind: MdRecordKind,
    /// Operation this record answers, when relevant.
    pub operation: Option<MdOperation>,
    /// Inode.
    pub md_ino: u64,
    /// Parent inode.
    pub md_pino: u64,
    /// Change time.
    pub ctime: u64,
    /// Change time, nanoseconds.
    pub ctime_ns: u32,
    /// Modification time.
    pub mtime: u64,
    /// Modification time, nanoseconds.
    pub mtime_ns: u32,
    /// Access time (the broker reports mtime).
    pub atime: u64,
    /// Access time, nanoseconds.
    pub atime_ns: u32,
    /// Birth time.
    pub btime: u64,
    /// Birth time, nanoseconds.
    pub btime_ns: u32,
    /// Size: bytes for files, tree size for containers.
    pub size: u64,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full POSIX mode.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Entry name.
    pub name: String,
    /// Symlink target, empty otherwise.
    pub target: String,
    /// Full namespace path of the entry.
    pub fullpath: String,
    /// Transport identity the record is addressed to.
    pub clientid: String,
    /// Mount uuid the record is addressed to.
    pub clientuuid: String,
    /// Extended attributes.
    pub attr: BTreeMap<String, String>,
    /// Child name to inode map (listing records only).
    pub children: BTreeMap<String, u64>,
    /// Number of children of a container.
    pub nchildren: u64,
    /// Namespace modification clock of the record.
    pub clock: u64,
    /// Parent mtime to apply on the client, seconds.
    pub pt_mtime: u64,
    /// Parent mtime to apply on the client, nanoseconds.
    pub pt_mtime_ns: u32,
    /// Capability issued together with the record.
    pub capability: Option<CapRecord>,
    /// Errno when the record could not be filled, 0 otherwise.
    pub err: i32,
}

/// Reply to a lock probe or lock request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LockResponse {
    /// First byte of the conflicting range (probe replies).
    pub start: u64,
    /// Length of the conflicting range, -1 for infinite.
    pub len: i64,
    /// Pid holding the conflicting lock.
    pub pid: u64,
    /// Conflicting lock type, or `Unlock` when there is no conflict.
    pub kind: crate::md::LockKind,
    /// 0 on success, `EAGAIN` when the lock is busy.
    pub err_no: i32,
}

/// Server-initiated eviction notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evict {
    /// Human-readable reason, shown in the client log.
    pub reason: String,
}

/// Lease maintenance message kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseKind {
    /// The client must drop its capability on `md_ino`.
    ReleaseCap,
}

/// Lease maintenance broadcast.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaseMsg {
    /// Message kind.
    pub kind: LeaseKind,
    /// Inode whose cap is released.
    pub md_ino: u64,
    /// Transport identity of the addressed client.
    pub clientid: String,
}

/// Directory entry invalidation kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DentryKind {
    /// The named entry disappeared from the container.
    Remove,
}

/// Directory entry invalidation broadcast.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dentry {
    /// Message kind.
    pub kind: DentryKind,
    /// Name of the removed entry.
    pub name: String,
    /// Container the entry was removed from.
    pub md_ino: u64,
    /// Transport identity of the addressed client.
    pub clientid: String,
}

/// Broker configuration pushed to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Heartbeat interval the client should use, seconds.
    pub hb_rate: u64,
    /// Whether the broker emits dentry invalidation messages.
    pub dentry_messaging: bool,
}

/// Any message the broker sends to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Mutation acknowledgement.
    Ack(Ack),
    /// Metadata update broadcast.
    Md(Box<MdRecord>),
    /// Capability update.
    Cap(CapRecord),
    /// Lock reply.
    Lock(LockResponse),
    /// Eviction notice.
    Evict(Evict),
    /// Lease maintenance (cap release).
    Lease(LeaseMsg),
    /// Directory entry invalidation.
    Dentry(Dentry),
    /// Configuration push.
    Config(Config),
    /// The client must drop every cap it holds.
    Dropcaps,
    /// Empty reply (flush begin/end).
    None,
}

/// Payload kind of a [`Container`] envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerKind {
    /// A single file/link metadata record.
    Md,
    /// A map of metadata records keyed by inode.
    MdMap,
    /// A bare capability.
    Cap,
}

/// Envelope streamed in answer to `GET`, `LS` and `GETCAP`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Payload kind.
    pub kind: ContainerKind,
    /// Inode the request referred to.
    pub ref_inode: u64,
    /// Single record payload.
    pub md: Option<Box<MdRecord>>,
    /// Record map payload, keyed by inode.
    pub md_map: BTreeMap<u64, MdRecord>,
    /// Capability payload.
    pub cap: Option<CapRecord>,
}

impl Container {
    /// An empty envelope of the given kind for `ref_inode`.
    pub fn new(kind: ContainerKind, ref_inode: u64) -> Self {
        Self {
            kind,
            ref_inode,
            md: None,
            md_map: BTreeMap::new(),
            cap: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_ok() {
        let ack = Ack::ok(7, 42);
        assert_eq!(ack.code, AckCode::Ok);
        assert_eq!(ack.err_no, 0);
        assert_eq!(ack.transaction_id, 7);
        assert_eq!(ack.md_ino, 42);
    }

    #[test]
    fn test_ack_failure_carries_errno() {
        let ack = Ack::failure(9, 17, "file exists");
        assert_eq!(ack.code, AckCode::PermanentFailure);
        assert_eq!(ack.err_no, 17);
        assert_eq!(ack.err_msg, "file exists");
        assert_eq!(ack.md_ino, 0);
    }

    #[test]
    fn test_response_serde_roundtrip() {
        let rsp = Response::Dentry(Dentry {
            kind: DentryKind::Remove,
            name: "old".to_string(),
            md_ino: 5,
            clientid: "tcp://c2".to_string(),
        });
        let bytes = bincode::serialize(&rsp).unwrap();
        let back: Response = bincode::deserialize(&bytes).unwrap();
        assert_eq!(rsp, back);
    }

    #[test]
    fn test_container_new_is_empty() {
        let cont = Container::new(ContainerKind::MdMap, 3);
        assert_eq!(cont.ref_inode, 3);
        assert!(cont.md.is_none());
        assert!(cont.md_map.is_empty());
        assert!(cont.cap.is_none());
    }
}
