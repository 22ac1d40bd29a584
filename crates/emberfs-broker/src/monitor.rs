//! Background maintenance loops.
//!
//! Two dedicated threads run once per second: the heartbeat monitor sweeps
//! the session registry (state machine, lock dropping, evictions, flush
//! expiry) and the cap monitor pops expired capabilities and periodically
//! refreshes quota information into outstanding caps. Both are written as
//! deterministic `tick` functions driven by an explicit clock; the thread
//! runners just call them on the wall clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::broadcast::Broadcaster;
use crate::caps::CapStore;
use crate::config::BrokerConfig;
use crate::flush::FlushTracker;
use crate::locks::LockMap;
use crate::quota::{QuotaOracle, NO_QUOTA};
use crate::registry::ClientRegistry;
use crate::types::Timestamp;

/// Sweeps sessions, drops locks of dead mounts, expires flush windows.
pub struct HeartbeatMonitor {
    registry: Arc<ClientRegistry>,
    locks: Arc<LockMap>,
    flush: Arc<FlushTracker>,
    broadcaster: Broadcaster,
}

impl HeartbeatMonitor {
    /// A monitor over its collaborators.
    pub fn new(
        registry: Arc<ClientRegistry>,
        locks: Arc<LockMap>,
        flush: Arc<FlushTracker>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            registry,
            locks,
            flush,
            broadcaster,
        }
    }

    /// One sweep tick at `now`.
    pub fn tick(&self, now: Timestamp) {
        let outcome = self.registry.sweep(now);

        // drop locks once on OFFLINE entry
        for uuid in &outcome.went_offline {
            info!(uuid, "client went offline, dropping locks");
            self.locks.drop_locks_owner(uuid);
        }

        for eviction in &outcome.evicted {
            self.broadcaster
                .send_to_client(&eviction.client_id, &evict_message(&eviction.reason));
            info!(uuid = %eviction.uuid, reason = %eviction.reason, "client evicted");
            self.locks.drop_locks_owner(&eviction.uuid);
        }

        self.flush.expire_flush(now);
    }

    /// Run ticks once per second until `terminate` is set.
    pub fn run(&self, terminate: &AtomicBool) {
        info!("starting heartbeat monitor thread");
        while !terminate.load(Ordering::Relaxed) {
            self.tick(Timestamp::now());
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

fn evict_message(reason: &str) -> emberfs_proto::Response {
    emberfs_proto::Response::Evict(emberfs_proto::Evict {
        reason: reason.to_string(),
    })
}

#[derive(Default)]
struct CapMonitorState {
    outofquota: HashMap<String, u64>,
    ticks: u64,
}

/// Pops expired caps and couples outstanding caps to the quota oracle.
pub struct CapMonitor {
    caps: Arc<CapStore>,
    quota: Arc<dyn QuotaOracle>,
    broadcaster: Broadcaster,
    quota_check_interval: AtomicU64,
    outofquota_retention: u64,
    state: Mutex<CapMonitorState>,
}

impl CapMonitor {
    /// A monitor over its collaborators.
    pub fn new(
        cfg: &BrokerConfig,
        caps: Arc<CapStore>,
        quota: Arc<dyn QuotaOracle>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            caps,
            quota,
            broadcaster,
            quota_check_interval: AtomicU64::new(cfg.quota_check_interval.max(1)),
            outofquota_retention: cfg.outofquota_retention,
            state: Mutex::new(CapMonitorState::default()),
        }
    }

    /// Change the quota sweep cadence (in monitor ticks).
    pub fn set_quota_check_interval(&self, interval: u64) {
        self.quota_check_interval
            .store(interval.max(1), Ordering::Relaxed);
    }

    /// One tick at `now`: pop expired caps, then every
    /// `quota_check_interval` ticks refresh quota into live caps.
    pub fn tick(&self, now: Timestamp) {
        while self.caps.expired_front(now) {
            if let Some(cap) = self.caps.pop_front() {
                debug!(authid = %cap.authid, id = cap.id, vtime = cap.vtime, "cap expired");
            }
        }

        let mut state = self.state.lock().unwrap();
        let interval = self.quota_check_interval.load(Ordering::Relaxed);

        if state.ticks % interval == 0 {
            self.quota_sweep(&mut state, now);
        }
        state.ticks += 1;
    }

    fn quota_sweep(&self, state: &mut CapMonitorState, now: Timestamp) {
        // distinct (uid, gid, quota node) tuples reachable via live caps
        let mut groups: HashMap<(u32, u32, u64), Vec<String>> = HashMap::new();
        for cap in self.caps.all() {
            if cap.quota.inode_quota == NO_QUOTA {
                continue;
            }
            if cap.quota.quota_node == 0 {
                continue;
            }
            groups
                .entry((cap.uid, cap.gid, cap.quota.quota_node))
                .or_default()
                .push(cap.authid);
        }

        for ((uid, gid, node), authids) in groups {
            let Some((avail_files, avail_bytes)) = self.quota.quota_by_node(node, uid, gid) else {
                continue;
            };
            let exhausted = avail_files == 0 || avail_bytes == 0;

            for authid in authids {
                let was_out = state.outofquota.contains_key(&authid);

                // broadcast only on an out-of-quota edge, in either direction
                if (exhausted && !was_out) || (!exhausted && was_out) {
                    if let Some(cap) = self.caps.update_quota(&authid, avail_files, avail_bytes) {
                        info!(
                            authid = %cap.authid,
                            node,
                            avail_files,
                            avail_bytes,
                            "quota change, re-sending cap"
                        );
                        self.broadcaster.send_cap(&cap);
                    }
                    if exhausted {
                        state.outofquota.insert(authid, now.secs);
                    } else {
                        state.outofquota.remove(&authid);
                    }
                }
            }
        }

        let retention = self.outofquota_retention;
        state
            .outofquota
            .retain(|_, stamped| *stamped + retention >= now.secs);
    }

    /// Run ticks once per second until `terminate` is set.
    pub fn run(&self, terminate: &AtomicBool) {
        info!("starting cap monitor thread");
        while !terminate.load(Ordering::Relaxed) {
            self.tick(Timestamp::now());
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::FixedQuota;
    use crate::transport::{ClientTransport, RecordingTransport};
    use crate::types::InodeId;
    use emberfs_proto::{CapRecord, Heartbeat, QuotaInfo, Response};

    struct Fixture {
        cfg: BrokerConfig,
        registry: Arc<ClientRegistry>,
        caps: Arc<CapStore>,
        locks: Arc<LockMap>,
        flush: Arc<FlushTracker>,
        quota: Arc<FixedQuota>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let cfg = BrokerConfig {
            hb_window: 5,
            hb_offline_window: 30,
            hb_remove_window: 120,
            ..Default::default()
        };
        Fixture {
            registry: Arc::new(ClientRegistry::new(&cfg)),
            caps: Arc::new(CapStore::new()),
            locks: Arc::new(LockMap::new()),
            flush: Arc::new(FlushTracker::new(cfg.flush_ttl)),
            quota: Arc::new(FixedQuota::new()),
            transport: Arc::new(RecordingTransport::new()),
            cfg,
        }
    }

    fn broadcaster(f: &Fixture) -> Broadcaster {
        Broadcaster::new(
            Arc::clone(&f.caps),
            Arc::clone(&f.registry),
            Arc::clone(&f.transport) as Arc<dyn ClientTransport>,
        )
    }

    fn heartbeat_monitor(f: &Fixture) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            Arc::clone(&f.registry),
            Arc::clone(&f.locks),
            Arc::clone(&f.flush),
            broadcaster(f),
        )
    }

    fn register(f: &Fixture, client_id: &str, uuid: &str, clock: u64) {
        let hb = Heartbeat {
            uuid: uuid.to_string(),
            clock,
            protocol_version: emberfs_proto::PROTOCOL_VERSION,
            ..Default::default()
        };
        f.registry
            .ingest_heartbeat(client_id, hb, Timestamp::from_secs(clock));
    }

    #[test]
    fn test_offline_entry_drops_locks_once() {
        let f = fixture();
        let monitor = heartbeat_monitor(&f);
        register(&f, "tcp://a", "u-a", 0);
        f.locks.setlk(
            InodeId::from_fid(1),
            "u-a",
            &emberfs_proto::Flock {
                pid: 1,
                start: 0,
                len: 0,
                kind: emberfs_proto::LockKind::WriteLock,
            },
            false,
        );

        monitor.tick(Timestamp::from_secs(40));
        assert!(f.locks.is_empty());
        assert_eq!(
            f.registry.state_of("u-a").unwrap(),
            crate::registry::ClientState::Offline
        );
    }

    #[test]
    fn test_eviction_sends_notice_and_removes() {
        let f = fixture();
        let monitor = heartbeat_monitor(&f);
        register(&f, "tcp://a", "u-a", 0);

        monitor.tick(Timestamp::from_secs(130));
        assert!(f.registry.is_empty());

        let evicts: Vec<Response> = f.transport.responses_to("tcp://a");
        assert_eq!(evicts.len(), 1);
        assert!(matches!(evicts[0], Response::Evict(_)));

        // a second tick does not re-send
        monitor.tick(Timestamp::from_secs(131));
        assert_eq!(f.transport.responses_to("tcp://a").len(), 1);
    }

    #[test]
    fn test_tick_expires_flush_windows() {
        let f = fixture();
        let monitor = heartbeat_monitor(&f);
        f.flush
            .begin_flush(InodeId::from_fid(2), "u-a", Timestamp::from_secs(0));

        monitor.tick(Timestamp::from_secs(100));
        assert!(f.flush.is_empty());
    }

    fn cap_with_quota(authid: &str, node: u64, vtime: u64) -> CapRecord {
        CapRecord {
            id: 7,
            authid: authid.to_string(),
            clientid: "tcp://a".to_string(),
            clientuuid: "u-a".to_string(),
            uid: 1000,
            gid: 1000,
            vtime,
            quota: QuotaInfo {
                inode_quota: 100,
                volume_quota: 1 << 30,
                quota_node: node,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_cap_monitor_pops_expired() {
        let f = fixture();
        let monitor = CapMonitor::new(
            &f.cfg,
            Arc::clone(&f.caps),
            Arc::clone(&f.quota) as Arc<dyn QuotaOracle>,
            broadcaster(&f),
        );
        f.caps.store(cap_with_quota("a1", 0, 100));
        f.caps.store(cap_with_quota("a2", 0, 2000));

        monitor.tick(Timestamp::from_secs(1000));
        assert!(f.caps.get("a1").is_none());
        assert!(f.caps.get("a2").is_some());
    }

    #[test]
    fn test_quota_edge_broadcasts_once() {
        let f = fixture();
        f.quota.add_node("/", InodeId::new(9));
        f.quota.set_availability(InodeId::new(9), 1000, 1000, 0, 1 << 20);
        register(&f, "tcp://a", "u-a", 10_000);

        let monitor = CapMonitor::new(
            &f.cfg,
            Arc::clone(&f.caps),
            Arc::clone(&f.quota) as Arc<dyn QuotaOracle>,
            broadcaster(&f),
        );
        f.caps.store(cap_with_quota("a1", 9, 20_000));

        // first sweep: out-of-quota edge, one cap broadcast with zero quota
        monitor.tick(Timestamp::from_secs(10_000));
        let sent = f.transport.responses_to("tcp://a");
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Response::Cap(cap) => assert_eq!(cap.quota.inode_quota, 0),
            other => panic!("expected cap, got {other:?}"),
        }

        // sweeps within the interval do not repeat the broadcast
        for i in 1..16 {
            monitor.tick(Timestamp::from_secs(10_000 + i));
        }
        assert_eq!(f.transport.responses_to("tcp://a").len(), 1);

        // the next sweep window sees unchanged quota: still nothing new
        monitor.tick(Timestamp::from_secs(10_016));
        assert_eq!(f.transport.responses_to("tcp://a").len(), 1);
    }

    #[test]
    fn test_quota_recovery_broadcasts_again() {
        let f = fixture();
        f.quota.add_node("/", InodeId::new(9));
        f.quota.set_availability(InodeId::new(9), 1000, 1000, 0, 0);
        register(&f, "tcp://a", "u-a", 10_000);

        let monitor = CapMonitor::new(
            &f.cfg,
            Arc::clone(&f.caps),
            Arc::clone(&f.quota) as Arc<dyn QuotaOracle>,
            broadcaster(&f),
        );
        f.caps.store(cap_with_quota("a1", 9, 20_000));

        monitor.tick(Timestamp::from_secs(10_000));
        assert_eq!(f.transport.responses_to("tcp://a").len(), 1);

        // quota restored: the next sweep re-sends the refreshed cap
        f.quota
            .set_availability(InodeId::new(9), 1000, 1000, 500, 1 << 30);
        monitor.tick(Timestamp::from_secs(10_016));
        let sent = f.transport.responses_to("tcp://a");
        assert_eq!(sent.len(), 2);
        match &sent[1] {
            Response::Cap(cap) => {
                assert_eq!(cap.quota.inode_quota, 500);
                assert_eq!(cap.quota.volume_quota, 1 << 30);
            }
            other => panic!("expected cap, got {other:?}"),
        }
    }

    #[test]
    fn test_outofquota_entries_age_out() {
        let f = fixture();
        f.quota.add_node("/", InodeId::new(9));
        f.quota.set_availability(InodeId::new(9), 1000, 1000, 0, 0);
        register(&f, "tcp://a", "u-a", 10_000);

        let monitor = CapMonitor::new(
            &f.cfg,
            Arc::clone(&f.caps),
            Arc::clone(&f.quota) as Arc<dyn QuotaOracle>,
            broadcaster(&f),
        );
        f.caps.store(cap_with_quota("a1", 9, 200_000));

        monitor.tick(Timestamp::from_secs(10_000));
        assert_eq!(f.transport.responses_to("tcp://a").len(), 1);

        // one hour later the marker expired: the same exhausted state is
        // announced again on the next sweep edge
        monitor.set_quota_check_interval(1);
        monitor.tick(Timestamp::from_secs(13_601));
        monitor.tick(Timestamp::from_secs(13_602));
        assert_eq!(f.transport.responses_to("tcp://a").len(), 2);
    }
}
