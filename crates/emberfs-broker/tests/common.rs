//! Shared fixture for broker integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use emberfs_broker::broadcast::Broadcaster;
use emberfs_broker::caps::CapStore;
use emberfs_broker::config::BrokerConfig;
use emberfs_broker::dispatcher::Dispatcher;
use emberfs_broker::flush::FlushTracker;
use emberfs_broker::locks::LockMap;
use emberfs_broker::monitor::{CapMonitor, HeartbeatMonitor};
use emberfs_broker::namespace::MemoryNamespace;
use emberfs_broker::quota::FixedQuota;
use emberfs_broker::registry::ClientRegistry;
use emberfs_broker::transport::{ClientTransport, RecordingTransport};
use emberfs_broker::types::{Timestamp, VirtualIdentity};
use emberfs_proto::{
    deserialize_message, split_frames, Ack, CapRecord, Container, Flock, MdOperation, MdRecord,
    MdRequest, Response, PROTOCOL_VERSION,
};

/// A broker wired to in-memory collaborators with short session windows.
pub struct TestBroker {
    pub cfg: BrokerConfig,
    pub ns: Arc<MemoryNamespace>,
    pub quota: Arc<FixedQuota>,
    pub caps: Arc<CapStore>,
    pub registry: Arc<ClientRegistry>,
    pub locks: Arc<LockMap>,
    pub flush: Arc<FlushTracker>,
    pub transport: Arc<RecordingTransport>,
    pub dispatcher: Dispatcher,
}

impl TestBroker {
    pub fn new() -> Self {
        let cfg = BrokerConfig {
            hb_window: 5,
            hb_offline_window: 30,
            hb_remove_window: 120,
            ..Default::default()
        };
        let ns = Arc::new(MemoryNamespace::new());
        let quota = Arc::new(FixedQuota::new());
        let caps = Arc::new(CapStore::new());
        let registry = Arc::new(ClientRegistry::new(&cfg));
        let locks = Arc::new(LockMap::new());
        let flush = Arc::new(FlushTracker::new(cfg.flush_ttl));
        let transport = Arc::new(RecordingTransport::new());
        let broadcaster = Broadcaster::new(
            Arc::clone(&caps),
            Arc::clone(&registry),
            Arc::clone(&transport) as Arc<dyn ClientTransport>,
        );
        let dispatcher = Dispatcher::new(
            cfg.clone(),
            Arc::clone(&ns),
            Arc::clone(&quota) as _,
            Arc::clone(&caps),
            Arc::clone(&registry),
            Arc::clone(&locks),
            Arc::clone(&flush),
            broadcaster,
            None,
        );
        Self {
            cfg,
            ns,
            quota,
            caps,
            registry,
            locks,
            flush,
            transport,
            dispatcher,
        }
    }

    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.locks),
            Arc::clone(&self.flush),
            self.dispatcher.broadcaster().clone(),
        )
    }

    pub fn cap_monitor(&self) -> CapMonitor {
        CapMonitor::new(
            &self.cfg,
            Arc::clone(&self.caps),
            Arc::clone(&self.quota) as _,
            self.dispatcher.broadcaster().clone(),
        )
    }

    /// Register a session with a heartbeat stamped "now".
    pub fn heartbeat(&self, client_id: &str, uuid: &str) {
        self.heartbeat_at(client_id, uuid, Timestamp::now().secs);
    }

    pub fn heartbeat_at(&self, client_id: &str, uuid: &str, clock: u64) {
        let hb = emberfs_proto::Heartbeat {
            uuid: uuid.to_string(),
            clock,
            protocol_version: PROTOCOL_VERSION,
            leasetime: 300,
            ..Default::default()
        };
        self.dispatcher.handle_heartbeat(client_id, hb);
    }

    /// Fetch a capability for `ino`, returning the full cap record.
    pub fn getcap(&self, ino: u64, client_id: &str, uuid: &str, vid: &VirtualIdentity) -> CapRecord {
        let req = MdRequest {
            operation: Some(MdOperation::Getcap),
            md_ino: ino,
            clientid: client_id.to_string(),
            clientuuid: uuid.to_string(),
            ..Default::default()
        };
        let bytes = self.dispatcher.handle_md(client_id, &req, vid);
        let frames = split_frames(&bytes).expect("getcap frames");
        let cont: Container = deserialize_message(frames[0]).expect("getcap container");
        cont.cap.expect("cap payload")
    }

    fn set_request(
        &self,
        pino: u64,
        name: &str,
        mode: u32,
        authid: &str,
        client_id: &str,
        uuid: &str,
    ) -> MdRequest {
        MdRequest {
            operation: Some(MdOperation::Set),
            md_pino: pino,
            name: name.to_string(),
            mode,
            authid: authid.to_string(),
            clientid: client_id.to_string(),
            clientuuid: uuid.to_string(),
            reqid: 7,
            ctime: 1_700_000_000,
            mtime: 1_700_000_000,
            btime: 1_700_000_000,
            pmtime: 1_700_000_000,
            ..Default::default()
        }
    }

    pub fn mkdir(
        &self,
        pino: u64,
        name: &str,
        authid: &str,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> Ack {
        let req = self.set_request(pino, name, 0o040000 | 0o755, authid, client_id, uuid);
        self.ack(&self.dispatcher.handle_md(client_id, &req, vid))
    }

    /// mkdir with an explicit owner.
    #[allow(clippy::too_many_arguments)]
    pub fn mkdir_owned(
        &self,
        pino: u64,
        name: &str,
        uid: u32,
        gid: u32,
        perm: u32,
        authid: &str,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> Ack {
        let mut req = self.set_request(pino, name, 0o040000 | perm, authid, client_id, uuid);
        req.uid = uid;
        req.gid = gid;
        self.ack(&self.dispatcher.handle_md(client_id, &req, vid))
    }

    /// Move or rename an entry into `pino` under `new_name`.
    #[allow(clippy::too_many_arguments)]
    pub fn move_entry(
        &self,
        ino: u64,
        new_pino: u64,
        new_name: &str,
        mode: u32,
        authid: &str,
        mv_authid: &str,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> Ack {
        let mut req = self.set_request(new_pino, new_name, mode, authid, client_id, uuid);
        req.md_ino = ino;
        req.mv_authid = mv_authid.to_string();
        self.ack(&self.dispatcher.handle_md(client_id, &req, vid))
    }

    pub fn create_file(
        &self,
        pino: u64,
        name: &str,
        size: u64,
        authid: &str,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> Ack {
        let mut req = self.set_request(pino, name, 0o100000 | 0o644, authid, client_id, uuid);
        req.size = size;
        req.uid = vid.uid;
        req.gid = vid.gid;
        self.ack(&self.dispatcher.handle_md(client_id, &req, vid))
    }

    pub fn create_hardlink(
        &self,
        pino: u64,
        name: &str,
        target_ino: u64,
        authid: &str,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> Ack {
        let mut req = self.set_request(pino, name, 0o100000 | 0o644, authid, client_id, uuid);
        req.target = format!("////hlnk{target_ino}");
        self.ack(&self.dispatcher.handle_md(client_id, &req, vid))
    }

    pub fn rename(
        &self,
        pino: u64,
        ino: u64,
        new_name: &str,
        mode: u32,
        authid: &str,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> Ack {
        let mut req = self.set_request(pino, new_name, mode, authid, client_id, uuid);
        req.md_ino = ino;
        self.ack(&self.dispatcher.handle_md(client_id, &req, vid))
    }

    pub fn delete(
        &self,
        pino: u64,
        ino: u64,
        name: &str,
        mode: u32,
        authid: &str,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> Ack {
        let req = MdRequest {
            operation: Some(MdOperation::Delete),
            md_ino: ino,
            md_pino: pino,
            name: name.to_string(),
            mode,
            authid: authid.to_string(),
            clientid: client_id.to_string(),
            clientuuid: uuid.to_string(),
            mtime: 1_700_000_100,
            reqid: 9,
            ..Default::default()
        };
        self.ack(&self.dispatcher.handle_md(client_id, &req, vid))
    }

    /// GET one record (file or container).
    pub fn get(&self, ino: u64, client_id: &str, uuid: &str, vid: &VirtualIdentity) -> MdRecord {
        let req = MdRequest {
            operation: Some(MdOperation::Get),
            md_ino: ino,
            clientid: client_id.to_string(),
            clientuuid: uuid.to_string(),
            ..Default::default()
        };
        let bytes = self.dispatcher.handle_md(client_id, &req, vid);
        let frames = split_frames(&bytes).expect("get frames");
        let cont: Container = deserialize_message(frames[0]).expect("get container");
        match cont.md {
            Some(md) => *md,
            None => cont.md_map.get(&ino).cloned().expect("md record"),
        }
    }

    /// LS a container, merging every streamed frame.
    pub fn ls(
        &self,
        ino: u64,
        client_id: &str,
        uuid: &str,
        vid: &VirtualIdentity,
    ) -> (Vec<Container>, MdRecord) {
        let req = MdRequest {
            operation: Some(MdOperation::Ls),
            md_ino: ino,
            clientid: client_id.to_string(),
            clientuuid: uuid.to_string(),
            ..Default::default()
        };
        let bytes = self.dispatcher.handle_md(client_id, &req, vid);
        let frames = split_frames(&bytes).expect("ls frames");
        let containers: Vec<Container> = frames
            .iter()
            .map(|frame| deserialize_message(frame).expect("ls container"))
            .collect();
        let parent = containers
            .iter()
            .find_map(|c| c.md_map.get(&ino).cloned())
            .expect("parent record");
        (containers, parent)
    }

    pub fn setlk(
        &self,
        ino: u64,
        uuid: &str,
        flock: Flock,
        blocking: bool,
    ) -> i32 {
        let req = MdRequest {
            operation: Some(if blocking {
                MdOperation::Setlkw
            } else {
                MdOperation::Setlk
            }),
            md_ino: ino,
            clientuuid: uuid.to_string(),
            flock: Some(flock),
            ..Default::default()
        };
        let bytes = self
            .dispatcher
            .handle_md("tcp://lock", &req, &VirtualIdentity::root());
        match deserialize_message::<Response>(&bytes).expect("lock response") {
            Response::Lock(lock) => lock.err_no,
            other => panic!("expected lock response, got {other:?}"),
        }
    }

    pub fn ack(&self, bytes: &[u8]) -> Ack {
        match deserialize_message::<Response>(bytes).expect("response") {
            Response::Ack(ack) => ack,
            other => panic!("expected ack, got {other:?}"),
        }
    }
}

pub fn root_vid() -> VirtualIdentity {
    VirtualIdentity::root()
}

pub fn user_vid(uid: u32, gid: u32) -> VirtualIdentity {
    VirtualIdentity::user(uid, gid)
}
