//! Core identifier, time and error types of the broker.

use std::fmt;

use serde::{Deserialize, Serialize};

/// File inodes live above this bit; container inodes below it.
const FILE_INODE_SHIFT: u32 = 28;

/// An inode number.
///
/// Container ids and file ids occupy disjoint ranges: a file with id `fid`
/// is addressed by the inode `fid << 28`, containers use their id directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// The root container (always 1).
    pub const ROOT: InodeId = InodeId(1);

    /// Creates an InodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Raw u64 value of this inode.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// True when this inode addresses a file rather than a container.
    pub fn is_file(&self) -> bool {
        self.0 >= (1 << FILE_INODE_SHIFT)
    }

    /// The inode addressing file id `fid`.
    pub fn from_fid(fid: u64) -> Self {
        InodeId(fid << FILE_INODE_SHIFT)
    }

    /// File id of a file inode.
    pub fn fid(&self) -> u64 {
        self.0 >> FILE_INODE_SHIFT
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A point in time with second and nanosecond precision.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: u64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before epoch");
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// A timestamp from whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// This timestamp shifted `secs` seconds into the future.
    pub fn plus_secs(&self, secs: u64) -> Self {
        Self {
            secs: self.secs + secs,
            nanos: self.nanos,
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The virtual identity a request is executed under.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualIdentity {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
    /// True when the identity holds sudo rights on the instance.
    pub sudoer: bool,
    /// Authentication protocol ("sss", "gsi", "krb5", ...).
    pub protocol: String,
    /// Distinguished name for certificate-based protocols.
    pub dn: String,
    /// Textual user name.
    pub uid_string: String,
}

impl VirtualIdentity {
    /// The superuser identity.
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            sudoer: true,
            protocol: "sss".to_string(),
            dn: String::new(),
            uid_string: "root".to_string(),
        }
    }

    /// A plain user identity.
    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            sudoer: false,
            protocol: "sss".to_string(),
            dn: String::new(),
            uid_string: uid.to_string(),
        }
    }
}

/// Capability mode bits.
///
/// The low three bits follow the POSIX access() encoding; the broker adds
/// the finer-grained rights above them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapMode(pub u32);

impl CapMode {
    /// Read.
    pub const R: CapMode = CapMode(4);
    /// Write.
    pub const W: CapMode = CapMode(2);
    /// Browse (directory traversal).
    pub const X: CapMode = CapMode(1);
    /// Delete entries.
    pub const D: CapMode = CapMode(8);
    /// Change mode bits.
    pub const M: CapMode = CapMode(16);
    /// Change ownership.
    pub const C: CapMode = CapMode(32);
    /// Set extended attributes.
    pub const SA: CapMode = CapMode(64);
    /// Update file contents.
    pub const U: CapMode = CapMode(128);
    /// Set utimes.
    pub const SU: CapMode = CapMode(256);

    /// Every bit set.
    pub const ALL: CapMode = CapMode(0x1ff);

    /// True when every bit of `needed` is granted.
    pub fn grants(&self, needed: CapMode) -> bool {
        self.0 & needed.0 == needed.0
    }

    /// Raw bit value.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for CapMode {
    type Output = CapMode;

    fn bitor(self, rhs: CapMode) -> CapMode {
        CapMode(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CapMode {
    fn bitor_assign(&mut self, rhs: CapMode) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for CapMode {
    type Output = CapMode;

    fn bitand(self, rhs: CapMode) -> CapMode {
        CapMode(self.0 & rhs.0)
    }
}

impl std::ops::Not for CapMode {
    type Output = CapMode;

    fn not(self) -> CapMode {
        CapMode(!self.0 & CapMode::ALL.0)
    }
}

/// Errors of the broker, each mapped to the POSIX errno a client expects.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Unknown session, inode or entry name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Exclusive create over an existing name or inode.
    #[error("already exists: {0}")]
    Exists(String),

    /// Directory delete or replace over a non-empty directory.
    #[error("directory {0} not empty")]
    NotEmpty(InodeId),

    /// Capability mismatch and ACL fallback also denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Capability expired or within the revocation safety margin.
    #[error("capability expired")]
    CapExpired,

    /// Creation refused by the quota oracle.
    #[error("quota exhausted")]
    QuotaExceeded,

    /// Listing exceeds the protocol ceiling.
    #[error("listing of {0} children exceeds the protocol limit")]
    ListingTooLarge(u64),

    /// Byte-range lock conflict.
    #[error("lock busy")]
    LockBusy,

    /// Malformed request, or a capability bound to a different inode.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BrokerError {
    /// The POSIX errno this error surfaces as on the wire.
    pub fn errno(&self) -> i32 {
        match self {
            BrokerError::NotFound(_) => libc::ENOENT,
            BrokerError::Exists(_) => libc::EEXIST,
            BrokerError::NotEmpty(_) => libc::ENOTEMPTY,
            BrokerError::PermissionDenied(_) => libc::EPERM,
            BrokerError::CapExpired => libc::ETIMEDOUT,
            BrokerError::QuotaExceeded => libc::EDQUOT,
            BrokerError::ListingTooLarge(_) => libc::ENAMETOOLONG,
            BrokerError::LockBusy => libc::EAGAIN,
            BrokerError::InvalidRequest(_) => libc::EINVAL,
        }
    }
}

/// Broker result alias.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_file_range() {
        let dir = InodeId::new(42);
        assert!(!dir.is_file());

        let file = InodeId::from_fid(42);
        assert!(file.is_file());
        assert_eq!(file.fid(), 42);
        assert_eq!(file.as_u64(), 42 << 28);
    }

    #[test]
    fn test_fid_inode_conversions_are_inverse() {
        for fid in [1u64, 7, 1000, 1 << 20] {
            assert_eq!(InodeId::from_fid(fid).fid(), fid);
        }
    }

    #[test]
    fn test_root_is_container() {
        assert!(!InodeId::ROOT.is_file());
        assert_eq!(InodeId::ROOT.as_u64(), 1);
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp { secs: 10, nanos: 5 };
        let b = Timestamp { secs: 10, nanos: 6 };
        let c = Timestamp { secs: 11, nanos: 0 };
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.plus_secs(1), Timestamp { secs: 11, nanos: 5 });
    }

    #[test]
    fn test_cap_mode_grants() {
        let mode = CapMode::R | CapMode::X | CapMode::SU;
        assert!(mode.grants(CapMode::R));
        assert!(mode.grants(CapMode::R | CapMode::X));
        assert!(!mode.grants(CapMode::W));
        assert!(!mode.grants(CapMode::R | CapMode::W));
        assert!(CapMode::ALL.grants(CapMode::SA | CapMode::C | CapMode::M));
    }

    #[test]
    fn test_cap_mode_not_stays_in_range() {
        let inv = !CapMode::D;
        assert!(!inv.grants(CapMode::D));
        assert!(inv.grants(CapMode::R | CapMode::W | CapMode::X));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            BrokerError::NotFound("x".to_string()).errno(),
            libc::ENOENT
        );
        assert_eq!(BrokerError::CapExpired.errno(), libc::ETIMEDOUT);
        assert_eq!(BrokerError::LockBusy.errno(), libc::EAGAIN);
        assert_eq!(BrokerError::ListingTooLarge(40000).errno(), libc::ENAMETOOLONG);
        assert_eq!(BrokerError::NotEmpty(InodeId::new(2)).errno(), libc::ENOTEMPTY);
    }
}
