//! Per-inode POSIX byte-range locks.
//!
//! Each inode carries two range sets, read locks and write locks, keyed by
//! `(pid, owner uuid)`. A write lock conflicts with any overlapping range of
//! another holder; a read lock only with overlapping write ranges. Blocking
//! acquisition (`SETLKW`) is a bounded retry, not a wait: clients treat the
//! final `EAGAIN` as a hint to retry at a higher layer.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use emberfs_proto::{Flock, LockKind};

use crate::types::InodeId;

/// Retry attempts of a blocking `setlk`.
const SETLKW_TRIES: u32 = 8;

/// One held byte-range lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRange {
    /// First byte of the range.
    pub start: u64,
    /// Length; `-1` is the infinite range.
    pub len: i64,
    /// Holding process id.
    pub pid: u64,
    /// Holding client mount uuid.
    pub owner: String,
}

impl LockRange {
    fn end(&self) -> Option<u64> {
        if self.len < 0 {
            None
        } else {
            Some(self.start + self.len as u64)
        }
    }

    /// True when `[start, start+len)` intersects this range.
    pub fn overlaps(&self, start: u64, len: i64) -> bool {
        let other_end = if len < 0 { None } else { Some(start + len as u64) };
        let starts_before_other_ends = match other_end {
            Some(end) => self.start < end,
            None => true,
        };
        let other_starts_before_end = match self.end() {
            Some(end) => start < end,
            None => true,
        };
        starts_before_other_ends && other_starts_before_end
    }

    fn held_by(&self, pid: u64, owner: &str) -> bool {
        self.pid == pid && self.owner == owner
    }
}

/// The lock table of one inode.
#[derive(Debug, Default)]
pub struct LockTracker {
    rlocks: Vec<LockRange>,
    wlocks: Vec<LockRange>,
}

impl LockTracker {
    /// A tracker with no locks.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while any lock is held.
    pub fn in_use(&self) -> bool {
        !self.rlocks.is_empty() || !self.wlocks.is_empty()
    }

    /// The first lock that would block `probe` for `pid`, or an `Unlock`
    /// reply when nothing conflicts.
    pub fn getlk(&self, pid: u64, probe: &Flock) -> Flock {
        let candidates: Vec<(&LockRange, LockKind)> = match probe.kind {
            // a write probe conflicts with anything, a read probe only with writers
            LockKind::WriteLock => self
                .wlocks
                .iter()
                .map(|l| (l, LockKind::WriteLock))
                .chain(self.rlocks.iter().map(|l| (l, LockKind::ReadLock)))
                .collect(),
            _ => self.wlocks.iter().map(|l| (l, LockKind::WriteLock)).collect(),
        };

        for (lock, kind) in candidates {
            if lock.pid != pid && lock.overlaps(probe.start, normalize_len(probe.len)) {
                return Flock {
                    pid: lock.pid,
                    start: lock.start,
                    len: lock.len,
                    kind,
                };
            }
        }

        Flock {
            pid,
            start: 0,
            len: 0,
            kind: LockKind::Unlock,
        }
    }

    /// Install or remove a range for `(pid, owner)`. Returns false on
    /// conflict; unlock always succeeds.
    pub fn setlk(&mut self, pid: u64, owner: &str, flock: &Flock) -> bool {
        let len = normalize_len(flock.len);

        match flock.kind {
            LockKind::Unlock => {
                self.remove_overlapping(pid, owner, flock.start, len);
                true
            }
            LockKind::WriteLock => {
                let conflict = self
                    .wlocks
                    .iter()
                    .chain(self.rlocks.iter())
                    .any(|l| !l.held_by(pid, owner) && l.overlaps(flock.start, len));
                if conflict {
                    return false;
                }
                // re-grab by the same holder replaces the overlapping ranges
                self.remove_overlapping(pid, owner, flock.start, len);
                self.wlocks.push(LockRange {
                    start: flock.start,
                    len,
                    pid,
                    owner: owner.to_string(),
                });
                true
            }
            LockKind::ReadLock => {
                let conflict = self
                    .wlocks
                    .iter()
                    .any(|l| !l.held_by(pid, owner) && l.overlaps(flock.start, len));
                if conflict {
                    return false;
                }
                self.remove_overlapping(pid, owner, flock.start, len);
                self.rlocks.push(LockRange {
                    start: flock.start,
                    len,
                    pid,
                    owner: owner.to_string(),
                });
                true
            }
        }
    }

    /// Release every lock of `pid`.
    pub fn removelk_pid(&mut self, pid: u64) {
        self.rlocks.retain(|l| l.pid != pid);
        self.wlocks.retain(|l| l.pid != pid);
    }

    /// Release every lock of `owner`.
    pub fn removelk_owner(&mut self, owner: &str) {
        self.rlocks.retain(|l| l.owner != owner);
        self.wlocks.retain(|l| l.owner != owner);
    }

    /// Pids of the owner's read locks.
    pub fn rlock_pids(&self, owner: &str) -> HashSet<u64> {
        self.rlocks
            .iter()
            .filter(|l| l.owner == owner)
            .map(|l| l.pid)
            .collect()
    }

    /// Pids of the owner's write locks.
    pub fn wlock_pids(&self, owner: &str) -> HashSet<u64> {
        self.wlocks
            .iter()
            .filter(|l| l.owner == owner)
            .map(|l| l.pid)
            .collect()
    }

    fn remove_overlapping(&mut self, pid: u64, owner: &str, start: u64, len: i64) {
        self.rlocks
            .retain(|l| !(l.held_by(pid, owner) && l.overlaps(start, len)));
        self.wlocks
            .retain(|l| !(l.held_by(pid, owner) && l.overlaps(start, len)));
    }
}

/// `len == 0` on the wire means "to infinity".
fn normalize_len(len: i64) -> i64 {
    if len == 0 {
        -1
    } else {
        len
    }
}

/// The shared lock table over all inodes.
#[derive(Default)]
pub struct LockMap {
    inner: Mutex<HashMap<u64, LockTracker>>,
}

impl LockMap {
    /// An empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe for a conflicting lock on `ino`.
    pub fn getlk(&self, ino: InodeId, pid: u64, probe: &Flock) -> Flock {
        let inner = self.inner.lock().unwrap();
        match inner.get(&ino.as_u64()) {
            Some(tracker) => tracker.getlk(pid, probe),
            None => Flock {
                pid,
                start: 0,
                len: 0,
                kind: LockKind::Unlock,
            },
        }
    }

    /// Install or remove a lock. With `blocking`, retries up to 8 times with
    /// doubling sleeps (1 ms up to 128 ms) before giving up.
    pub fn setlk(&self, ino: InodeId, owner: &str, flock: &Flock, blocking: bool) -> bool {
        let tries = if blocking { SETLKW_TRIES } else { 1 };
        let mut delay = Duration::from_millis(1);

        for _ in 0..tries {
            {
                let mut inner = self.inner.lock().unwrap();
                let tracker = inner.entry(ino.as_u64()).or_default();
                if tracker.setlk(flock.pid, owner, flock) {
                    drop(inner);
                    if flock.kind == LockKind::Unlock {
                        self.purge();
                    }
                    return true;
                }
            }

            if blocking {
                std::thread::sleep(delay);
                delay *= 2;
            }
        }

        false
    }

    /// Release all locks of `pid` on `ino`.
    pub fn drop_locks(&self, ino: InodeId, pid: u64) -> bool {
        let found = {
            let mut inner = self.inner.lock().unwrap();
            match inner.get_mut(&ino.as_u64()) {
                Some(tracker) => {
                    tracker.removelk_pid(pid);
                    true
                }
                None => false,
            }
        };
        self.purge();
        found
    }

    /// Release every lock owned by a client mount, across all inodes.
    pub fn drop_locks_owner(&self, owner: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            for tracker in inner.values_mut() {
                tracker.removelk_owner(owner);
            }
        }
        self.purge();
    }

    /// Locks of one owner: inode to pid sets, reads and writes.
    pub fn ls_locks(
        &self,
        owner: &str,
    ) -> (HashMap<u64, HashSet<u64>>, HashMap<u64, HashSet<u64>>) {
        let inner = self.inner.lock().unwrap();
        let mut rlocks = HashMap::new();
        let mut wlocks = HashMap::new();
        for (ino, tracker) in inner.iter() {
            let r = tracker.rlock_pids(owner);
            let w = tracker.wlock_pids(owner);
            if !r.is_empty() {
                rlocks.insert(*ino, r);
            }
            if !w.is_empty() {
                wlocks.insert(*ino, w);
            }
        }
        (rlocks, wlocks)
    }

    /// True while any lock exists for `ino`.
    pub fn is_locked(&self, ino: InodeId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.get(&ino.as_u64()).is_some_and(|t| t.in_use())
    }

    /// Drop tracker entries that hold no locks anymore.
    pub fn purge(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, tracker| tracker.in_use());
    }

    /// Number of inodes with at least one lock.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True when no inode carries a lock.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
