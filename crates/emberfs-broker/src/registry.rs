//! Client session registry.
//!
//! Sessions are keyed by the transport identity and by the mount uuid; the
//! two views form a bijection at any instant. The per-tick state machine
//! classifies sessions by heartbeat age (ONLINE, VOLATILE, OFFLINE) and
//! evicts sessions that shut down, fell silent for too long, or speak a
//! protocol version that is no longer accepted.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{info, warn};

use emberfs_proto::{Heartbeat, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

use crate::config::BrokerConfig;
use crate::types::Timestamp;

/// Liveness state of a client session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Heartbeats arrive within the heartbeat window.
    Online,
    /// Heartbeats are late but the session is kept fully alive.
    Volatile,
    /// No heartbeat for the offline window; locks have been dropped.
    Offline,
    /// Terminal: the session is being removed.
    Evicted,
}

/// One registered client mount.
#[derive(Clone, Debug)]
pub struct ClientSession {
    /// Transport identity of the connection.
    pub client_id: String,
    /// Last heartbeat received.
    pub heartbeat: Heartbeat,
    /// Liveness state as of the last sweep.
    pub state: ClientState,
    /// When the session was first registered.
    pub first_contact: Timestamp,
}

/// What a heartbeat asks the broker to do.
#[derive(Debug, Default)]
pub struct HeartbeatOutcome {
    /// This is the first contact of the session.
    pub first_seen: bool,
    /// The heartbeat was too old and has been ignored entirely.
    pub dropped: bool,
    /// Requested cap lifetime extensions, auth-id to extra seconds.
    pub extensions: Vec<(String, u64)>,
    /// Caps the client gives up (suppressed on first contact).
    pub revocations: Vec<String>,
}

/// A session evicted by the sweep.
#[derive(Clone, Debug)]
pub struct Eviction {
    /// Mount uuid of the evicted session.
    pub uuid: String,
    /// Transport identity of the evicted session.
    pub client_id: String,
    /// Human-readable reason, sent to the client.
    pub reason: String,
}

/// Result of one sweep tick.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Sessions removed this tick.
    pub evicted: Vec<Eviction>,
    /// Sessions that entered OFFLINE this tick (drop their locks once).
    pub went_offline: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, ClientSession>,
    uuid_view: HashMap<String, String>,
}

/// The session registry.
pub struct ClientRegistry {
    hb_window: u64,
    hb_offline_window: u64,
    hb_remove_window: u64,
    max_lease: u64,
    inner: RwLock<RegistryInner>,
}

impl ClientRegistry {
    /// A registry using the windows of `cfg`.
    pub fn new(cfg: &BrokerConfig) -> Self {
        Self {
            hb_window: cfg.hb_window,
            hb_offline_window: cfg.hb_offline_window,
            hb_remove_window: cfg.hb_remove_window,
            max_lease: cfg.max_lease,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Ingest one heartbeat.
    ///
    /// Heartbeats older than the offline window are dropped entirely so a
    /// late burst cannot undo a freshly taken eviction decision. The lease
    /// time is clamped to the server ceiling at store time.
    pub fn ingest_heartbeat(
        &self,
        client_id: &str,
        mut hb: Heartbeat,
        now: Timestamp,
    ) -> HeartbeatOutcome {
        let mut outcome = HeartbeatOutcome::default();
        let mut inner = self.inner.write().unwrap();
        outcome.first_seen = !inner.sessions.contains_key(client_id);

        let delay = heartbeat_age(&hb, now);
        if delay > self.hb_offline_window as f64 {
            warn!(client_id, delay, "delayed heartbeat, dropping");
            outcome.dropped = true;
            return outcome;
        }

        if hb.leasetime > self.max_lease {
            hb.leasetime = self.max_lease;
        }

        outcome.extensions = hb
            .authextension
            .iter()
            .map(|(authid, secs)| (authid.clone(), *secs))
            .collect();
        if !outcome.first_seen {
            outcome.revocations = hb.authrevocation.iter().cloned().collect();
        }

        // keep (client_id <-> uuid) a bijection across reconnects
        if let Some(old_id) = inner.uuid_view.insert(hb.uuid.clone(), client_id.to_string()) {
            if old_id != client_id {
                inner.sessions.remove(&old_id);
            }
        }
        let stale_uuid = inner
            .sessions
            .get(client_id)
            .filter(|session| session.heartbeat.uuid != hb.uuid)
            .map(|session| session.heartbeat.uuid.clone());
        if let Some(stale) = stale_uuid {
            inner.uuid_view.remove(&stale);
        }
        let session = inner
            .sessions
            .entry(client_id.to_string())
            .or_insert_with(|| ClientSession {
                client_id: client_id.to_string(),
                heartbeat: Heartbeat::default(),
                state: ClientState::Online,
                first_contact: now,
            });
        session.heartbeat = hb;

        outcome
    }

    /// One tick of the session state machine.
    pub fn sweep(&self, now: Timestamp) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut inner = self.inner.write().unwrap();

        for session in inner.sessions.values_mut() {
            let hb = &session.heartbeat;
            let age = heartbeat_age(hb, now);

            if hb.shutdown {
                session.state = ClientState::Evicted;
                outcome.evicted.push(Eviction {
                    uuid: hb.uuid.clone(),
                    client_id: session.client_id.clone(),
                    reason: "client shutdown".to_string(),
                });
                info!(client_id = %session.client_id, "client shutdown");
                continue;
            }

            if hb.protocol_version < MIN_PROTOCOL_VERSION {
                session.state = ClientState::Evicted;
                outcome.evicted.push(Eviction {
                    uuid: hb.uuid.clone(),
                    client_id: session.client_id.clone(),
                    reason: format!(
                        "Server supports PROTOCOLV{PROTOCOL_VERSION} and requires atleast PROTOCOLV{MIN_PROTOCOL_VERSION}"
                    ),
                });
                continue;
            }

            if age > self.hb_window as f64 {
                if age > self.hb_offline_window as f64 {
                    if age > self.hb_remove_window as f64 {
                        session.state = ClientState::Evicted;
                        outcome.evicted.push(Eviction {
                            uuid: hb.uuid.clone(),
                            client_id: session.client_id.clone(),
                            reason: format!("missing heartbeat for {age:.0}s"),
                        });
                    } else {
                        if session.state != ClientState::Offline {
                            outcome.went_offline.push(hb.uuid.clone());
                        }
                        session.state = ClientState::Offline;
                    }
                } else {
                    session.state = ClientState::Volatile;
                }
            } else {
                session.state = ClientState::Online;
            }
        }

        for eviction in &outcome.evicted {
            inner.sessions.remove(&eviction.client_id);
            inner.uuid_view.remove(&eviction.uuid);
        }

        outcome
    }

    /// Session lease time, already clamped; `None` for unknown uuids.
    pub fn leasetime(&self, uuid: &str) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        let client_id = inner.uuid_view.get(uuid)?;
        inner
            .sessions
            .get(client_id)
            .map(|s| s.heartbeat.leasetime)
    }

    /// Transport identity of a mount uuid.
    pub fn client_id_of(&self, uuid: &str) -> Option<String> {
        self.inner.read().unwrap().uuid_view.get(uuid).cloned()
    }

    /// Mount uuid of a transport identity.
    pub fn uuid_of(&self, client_id: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(client_id)
            .map(|s| s.heartbeat.uuid.clone())
    }

    /// Liveness state of a mount uuid.
    pub fn state_of(&self, uuid: &str) -> Option<ClientState> {
        let inner = self.inner.read().unwrap();
        let client_id = inner.uuid_view.get(uuid)?;
        inner.sessions.get(client_id).map(|s| s.state)
    }

    /// Remove one session by uuid, returning its transport identity.
    pub fn remove(&self, uuid: &str) -> Option<String> {
        let mut inner = self.inner.write().unwrap();
        let client_id = inner.uuid_view.remove(uuid)?;
        inner.sessions.remove(&client_id);
        Some(client_id)
    }

    /// Transport identities of every registered session.
    pub fn all_client_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().sessions.keys().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().sessions.len()
    }

    /// True when no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One line per session for the operator console.
    pub fn dump(&self, now: Timestamp) -> String {
        let inner = self.inner.read().unwrap();
        let mut out = String::new();
        for session in inner.sessions.values() {
            let hb = &session.heartbeat;
            out.push_str(&format!(
                "client={} uuid={} state={:?} heartbeat-age={:.02}s lease={}s v{}\n",
                session.client_id,
                hb.uuid,
                session.state,
                heartbeat_age(hb, now),
                hb.leasetime,
                hb.protocol_version,
            ));
            if let Some(stats) = &hb.statistics {
                out.push_str(&format!(
                    "  ino={} ino-to-del={} threads={} vsize={}M rss={}M open-files={}\n",
                    stats.inodes,
                    stats.inodes_todelete,
                    stats.threads,
                    stats.vsize_mb,
                    stats.rss_mb,
                    stats.open_files,
                ));
            }
        }
        out
    }

    #[cfg(test)]
    fn check_bijection(&self) {
        let inner = self.inner.read().unwrap();
        assert_eq!(inner.sessions.len(), inner.uuid_view.len());
        for (uuid, client_id) in inner.uuid_view.iter() {
            assert_eq!(&inner.sessions[client_id].heartbeat.uuid, uuid);
        }
    }
}

/// Age of a heartbeat relative to `now`, in seconds.
fn heartbeat_age(hb: &Heartbeat, now: Timestamp) -> f64 {
    now.secs as f64 - hb.clock as f64
        + (now.nanos as i64 - hb.clock_ns as i64) as f64 / 1_000_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(uuid: &str, clock: u64) -> Heartbeat {
        Heartbeat {
            uuid: uuid.to_string(),
            clock,
            protocol_version: PROTOCOL_VERSION,
            leasetime: 300,
            ..Default::default()
        }
    }

    fn registry() -> ClientRegistry {
        let cfg = BrokerConfig {
            hb_window: 5,
            hb_offline_window: 30,
            hb_remove_window: 120,
            ..Default::default()
        };
        ClientRegistry::new(&cfg)
    }

    #[test]
    fn test_first_heartbeat_registers() {
        let reg = registry();
        let outcome = reg.ingest_heartbeat("tcp://a", hb("u-a", 1000), Timestamp::from_secs(1000));
        assert!(outcome.first_seen);
        assert!(!outcome.dropped);
        assert_eq!(reg.client_id_of("u-a").unwrap(), "tcp://a");
        assert_eq!(reg.uuid_of("tcp://a").unwrap(), "u-a");
        reg.check_bijection();
    }

    #[test]
    fn test_second_heartbeat_is_not_first_seen() {
        let reg = registry();
        reg.ingest_heartbeat("tcp://a", hb("u-a", 1000), Timestamp::from_secs(1000));
        let outcome = reg.ingest_heartbeat("tcp://a", hb("u-a", 1005), Timestamp::from_secs(1005));
        assert!(!outcome.first_seen);
    }

    #[test]
    fn test_stale_heartbeat_dropped() {
        let reg = registry();
        let outcome = reg.ingest_heartbeat("tcp://a", hb("u-a", 900), Timestamp::from_secs(1000));
        assert!(outcome.dropped);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_lease_clamped_at_ingest() {
        let reg = registry();
        let mut beat = hb("u-a", 1000);
        beat.leasetime = 30 * 86_400;
        reg.ingest_heartbeat("tcp://a", beat, Timestamp::from_secs(1000));
        assert_eq!(reg.leasetime("u-a").unwrap(), 7 * 86_400);
    }

    #[test]
    fn test_extensions_and_revocations() {
        let reg = registry();
        let mut beat = hb("u-a", 1000);
        beat.authextension.insert("auth-1".to_string(), 60);
        beat.authrevocation.insert("auth-2".to_string());

        // revocations are suppressed on first contact
        let outcome = reg.ingest_heartbeat("tcp://a", beat.clone(), Timestamp::from_secs(1000));
        assert_eq!(outcome.extensions, vec![("auth-1".to_string(), 60)]);
        assert!(outcome.revocations.is_empty());

        beat.clock = 1005;
        let outcome = reg.ingest_heartbeat("tcp://a", beat, Timestamp::from_secs(1005));
        assert_eq!(outcome.revocations, vec!["auth-2".to_string()]);
    }

    #[test]
    fn test_state_machine_windows() {
        let reg = registry();
        reg.ingest_heartbeat("tcp://a", hb("u-a", 0), Timestamp::from_secs(0));

        reg.sweep(Timestamp::from_secs(3));
        assert_eq!(reg.state_of("u-a").unwrap(), ClientState::Online);

        reg.sweep(Timestamp::from_secs(10));
        assert_eq!(reg.state_of("u-a").unwrap(), ClientState::Volatile);

        let outcome = reg.sweep(Timestamp::from_secs(40));
        assert_eq!(reg.state_of("u-a").unwrap(), ClientState::Offline);
        assert_eq!(outcome.went_offline, vec!["u-a".to_string()]);

        // entering OFFLINE again does not re-announce it
        let outcome = reg.sweep(Timestamp::from_secs(50));
        assert!(outcome.went_offline.is_empty());

        let outcome = reg.sweep(Timestamp::from_secs(130));
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].uuid, "u-a");
        assert!(reg.is_empty());
        reg.check_bijection();
    }

    #[test]
    fn test_shutdown_evicts() {
        let reg = registry();
        let mut beat = hb("u-a", 1000);
        beat.shutdown = true;
        reg.ingest_heartbeat("tcp://a", beat, Timestamp::from_secs(1000));

        let outcome = reg.sweep(Timestamp::from_secs(1000));
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].reason, "client shutdown");
        assert!(reg.is_empty());
    }

    #[test]
    fn test_old_protocol_evicts_with_reason() {
        let reg = registry();
        let mut beat = hb("u-a", 1000);
        beat.protocol_version = 1;
        reg.ingest_heartbeat("tcp://a", beat, Timestamp::from_secs(1000));

        let outcome = reg.sweep(Timestamp::from_secs(1000));
        assert_eq!(outcome.evicted.len(), 1);
        assert!(outcome.evicted[0].reason.contains("PROTOCOLV2"));
        reg.check_bijection();
    }

    #[test]
    fn test_dump_contains_sessions() {
        let reg = registry();
        reg.ingest_heartbeat("tcp://a", hb("u-a", 1000), Timestamp::from_secs(1000));
        let dump = reg.dump(Timestamp::from_secs(1001));
        assert!(dump.contains("client=tcp://a"));
        assert!(dump.contains("uuid=u-a"));
    }
}
