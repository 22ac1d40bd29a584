//! Metadata request messages sent by FUSE client mounts.
//!
//! A single [`MdRequest`] record carries every metadata operation; the
//! `operation` field selects the handler and the remaining fields are
//! interpreted per operation (a `SET` without `md_ino` is a create, with
//! `md_ino` an update/rename/move, and so on).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata operations understood by the broker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdOperation {
    /// Fetch one metadata record.
    Get,
    /// Fetch a directory record together with all children records.
    Ls,
    /// Create, update, rename or move an entry.
    Set,
    /// Remove an entry.
    Delete,
    /// Fetch only a capability for a directory.
    Getcap,
    /// Probe for a conflicting byte-range lock.
    Getlk,
    /// Install or remove a byte-range lock, non-blocking.
    Setlk,
    /// Install a byte-range lock with a bounded wait.
    Setlkw,
    /// Announce outstanding writes for an inode.
    Beginflush,
    /// Retire an outstanding-write announcement.
    Endflush,
}

/// Byte-range lock type on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Shared (read) lock.
    ReadLock,
    /// Exclusive (write) lock.
    WriteLock,
    /// Unlock request, or "no conflict" in a probe reply.
    #[default]
    Unlock,
}

/// A byte-range lock request. `len == 0` means "to the end of the file".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flock {
    /// Requesting process id on the client.
    pub pid: u64,
    /// First byte of the range.
    pub start: u64,
    /// Range length; `0` on the wire denotes an infinite range.
    pub len: i64,
    /// Lock type.
    pub kind: LockKind,
}

impl Default for Flock {
    fn default() -> Self {
        Self {
            pid: 0,
            start: 0,
            len: 0,
            kind: LockKind::Unlock,
        }
    }
}

/// A metadata request as sent by a client mount.
///
/// Times are split into seconds and nanoseconds like the POSIX timespec the
/// client derived them from. The `attr` map carries extended attributes for
/// create/update operations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MdRequest {
    /// Requested operation.
    pub operation: Option<MdOperation>,
    /// Inode of the entry the request is about (0 on create).
    pub md_ino: u64,
    /// Inode of the parent container.
    pub md_pino: u64,
    /// Entry name within the parent.
    pub name: String,
    /// Symlink target, or the hardlink magic `////hlnk<ino>`.
    pub target: String,
    /// Transport identity of the client connection.
    pub clientid: String,
    /// Stable per-mount uuid of the client.
    pub clientuuid: String,
    /// Capability auth-id the client acts under.
    pub authid: String,
    /// On create: auth-id the client pre-selected for the child cap.
    pub implied_authid: String,
    /// On move: auth-id used to invalidate source-parent subscribers.
    pub mv_authid: String,
    /// Client-chosen transaction id, echoed in acknowledgements.
    pub reqid: u64,
    /// Requested owner uid.
    pub uid: u32,
    /// Requested owner gid.
    pub gid: u32,
    /// Full POSIX mode (file type bits + permissions).
    pub mode: u32,
    /// File size (updates only).
    pub size: u64,
    /// `O_EXCL` create: fail if the name exists.
    pub exclusive: bool,
    /// Change time.
    pub ctime: u64,
    /// Change time, nanoseconds.
    pub ctime_ns: u32,
    /// Modification time.
    pub mtime: u64,
    /// Modification time, nanoseconds.
    pub mtime_ns: u32,
    /// Birth time.
    pub btime: u64,
    /// Birth time, nanoseconds.
    pub btime_ns: u32,
    /// New parent mtime to apply on create/rename/move.
    pub pmtime: u64,
    /// New parent mtime, nanoseconds.
    pub pmtime_ns: u32,
    /// Extended attributes supplied by the client.
    pub attr: BTreeMap<String, String>,
    /// Byte-range lock payload for the lock operations.
    pub flock: Option<Flock>,
}

impl MdRequest {
    /// Shorthand used all over the dispatcher.
    pub fn is_dir(&self) -> bool {
        self.mode & ifmt::S_IFMT == ifmt::S_IFDIR
    }

    /// True for regular-file requests.
    pub fn is_regular(&self) -> bool {
        self.mode & ifmt::S_IFMT == ifmt::S_IFREG
    }

    /// True for symlink requests.
    pub fn is_symlink(&self) -> bool {
        self.mode & ifmt::S_IFMT == ifmt::S_IFLNK
    }

    /// True for fifo requests.
    pub fn is_fifo(&self) -> bool {
        self.mode & ifmt::S_IFMT == ifmt::S_IFIFO
    }
}

/// File-type mode bits, spelled out so the proto crate stays libc-free.
pub mod ifmt {
    /// File type mask.
    pub const S_IFMT: u32 = 0o170000;
    /// Directory.
    pub const S_IFDIR: u32 = 0o040000;
    /// Regular file.
    pub const S_IFREG: u32 = 0o100000;
    /// Symbolic link.
    pub const S_IFLNK: u32 = 0o120000;
    /// Fifo.
    pub const S_IFIFO: u32 = 0o010000;
}
