//! Targeted server-to-client broadcasts.
//!
//! For a mutation on an inode the recipient set is every capability pinned
//! to that inode, excluding the originating auth-id and every cap of the
//! originating mount uuid (the mount that performed the mutation already
//! has the result). MD updates are additionally de-duplicated so each
//! recipient mount receives at most one message per event.
//!
//! Recipients are collected under the cap store lock; the lock is released
//! before anything is handed to the transport.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use emberfs_proto::{
    serialize_message, CapRecord, Config, Dentry, DentryKind, Evict, LeaseKind, LeaseMsg,
    MdRecord, MdRecordKind, Response,
};

use crate::caps::CapStore;
use crate::registry::ClientRegistry;
use crate::transport::ClientTransport;
use crate::types::{InodeId, Timestamp};

/// Computes recipient sets and emits broadcast messages.
#[derive(Clone)]
pub struct Broadcaster {
    caps: Arc<CapStore>,
    registry: Arc<ClientRegistry>,
    transport: Arc<dyn ClientTransport>,
}

impl Broadcaster {
    /// A broadcaster over the given collaborators.
    pub fn new(
        caps: Arc<CapStore>,
        registry: Arc<ClientRegistry>,
        transport: Arc<dyn ClientTransport>,
    ) -> Self {
        Self {
            caps,
            registry,
            transport,
        }
    }

    /// Send a response to one client by transport identity.
    pub fn send_to_client(&self, client_id: &str, rsp: &Response) {
        if let Ok(bytes) = serialize_message(rsp) {
            self.transport.reply(client_id, &bytes);
        }
    }

    /// Send a response to one client by mount uuid. Unknown uuids are
    /// silently skipped; broadcasts are best effort.
    pub fn send_to_uuid(&self, uuid: &str, rsp: &Response) -> bool {
        let Some(client_id) = self.registry.client_id_of(uuid) else {
            return false;
        };
        self.send_to_client(&client_id, rsp);
        true
    }

    /// Ask one mount to drop its capability on `md_ino`.
    pub fn release_cap(&self, md_ino: u64, uuid: &str, clientid: &str) {
        debug!(id = md_ino, uuid, clientid, "asking cap release");
        self.send_to_uuid(
            uuid,
            &Response::Lease(LeaseMsg {
                kind: LeaseKind::ReleaseCap,
                md_ino,
                clientid: clientid.to_string(),
            }),
        );
    }

    /// Ask one mount to forget the dentry `name` under `md_ino`.
    pub fn delete_entry(&self, md_ino: u64, uuid: &str, clientid: &str, name: &str) {
        debug!(id = md_ino, uuid, clientid, name, "asking dentry deletion");
        self.send_to_uuid(
            uuid,
            &Response::Dentry(Dentry {
                kind: DentryKind::Remove,
                name: name.to_string(),
                md_ino,
                clientid: clientid.to_string(),
            }),
        );
    }

    /// Send an MD update to one mount.
    #[allow(clippy::too_many_arguments)]
    pub fn send_md(
        &self,
        md: &MdRecord,
        uuid: &str,
        clientid: &str,
        md_ino: u64,
        md_pino: u64,
        clock: u64,
        p_mtime: Timestamp,
    ) {
        let mut update = md.clone();
        update.kind = MdRecordKind::Md;
        // the client needs its own clientid to sort out quota accounting
        update.clientid = clientid.to_string();
        // on create the inode was not yet known to the request record
        update.md_ino = md_ino;
        update.md_pino = md_pino;
        update.clock = clock;
        if p_mtime.secs != 0 {
            update.pt_mtime = p_mtime.secs;
            update.pt_mtime_ns = p_mtime.nanos;
        }
        debug!(id = md_ino, uuid, "sending md update");
        self.send_to_uuid(uuid, &Response::Md(Box::new(update)));
    }

    /// Send a capability to its own mount (quota refresh, re-issue).
    pub fn send_cap(&self, cap: &CapRecord) {
        if cap.id == 0 {
            return;
        }
        debug!(id = cap.id, uuid = %cap.clientuuid, "sending cap update");
        self.send_to_uuid(&cap.clientuuid, &Response::Cap(cap.clone()));
    }

    /// Send an eviction notice to a mount.
    pub fn evict(&self, uuid: &str, reason: &str) -> bool {
        info!(uuid, reason, "evicting client");
        self.send_to_uuid(
            uuid,
            &Response::Evict(Evict {
                reason: reason.to_string(),
            }),
        )
    }

    /// Push broker configuration to a client connection.
    pub fn config(&self, client_id: &str, cfg: Config) {
        info!(client_id, hb_rate = cfg.hb_rate, "broadcast config to client");
        self.send_to_client(client_id, &Response::Config(cfg));
    }

    /// Ask a client connection to drop all caps it holds.
    pub fn drop_all_caps(&self, client_id: &str) {
        info!(client_id, "broadcast drop-all-caps to client");
        self.send_to_client(client_id, &Response::Dropcaps);
    }

    /// Cap release for a mutation under `authid`: every cap on the cap's
    /// inode (or `md_pino` when the cap is already gone), excluding the
    /// originator's auth-id and mount uuid.
    pub fn broadcast_release(&self, authid: &str, md_pino: InodeId) {
        let refcap = self.caps.get(authid);
        let (origin_uuid, target) = match &refcap {
            Some(cap) if cap.id != 0 => (cap.clientuuid.clone(), InodeId::new(cap.id)),
            Some(cap) => (cap.clientuuid.clone(), md_pino),
            None => (String::new(), md_pino),
        };

        let recipients: Vec<CapRecord> = self
            .caps
            .caps_on_inode(target)
            .into_iter()
            .filter(|cap| cap.authid != authid && cap.clientuuid != origin_uuid && cap.id != 0)
            .collect();

        for cap in recipients {
            self.release_cap(cap.id, &cap.clientuuid, &cap.clientid);
        }
    }

    /// Cap release for an out-of-band mutation: every cap on `ino`, no
    /// exclusions.
    pub fn broadcast_release_external(&self, ino: InodeId) {
        for cap in self.caps.caps_on_inode(ino) {
            if cap.id != 0 {
                self.release_cap(cap.id, &cap.clientuuid, &cap.clientid);
            }
        }
    }

    /// Dentry invalidation for a deletion performed under `authid`.
    pub fn broadcast_deletion(&self, authid: &str, parent: InodeId, name: &str) {
        let refcap = self.caps.get(authid);
        let (origin_uuid, target) = match &refcap {
            Some(cap) if cap.id != 0 => (cap.clientuuid.clone(), InodeId::new(cap.id)),
            Some(cap) => (cap.clientuuid.clone(), parent),
            None => (String::new(), parent),
        };

        let recipients: Vec<CapRecord> = self
            .caps
            .caps_on_inode(target)
            .into_iter()
            .filter(|cap| cap.authid != authid && cap.clientuuid != origin_uuid && cap.id != 0)
            .collect();

        for cap in recipients {
            self.delete_entry(cap.id, &cap.clientuuid, &cap.clientid, name);
        }
    }

    /// Dentry invalidation for an out-of-band deletion: every cap on the
    /// parent, no exclusions.
    pub fn broadcast_deletion_external(&self, parent: InodeId, name: &str) {
        for cap in self.caps.caps_on_inode(parent) {
            if cap.id != 0 {
                self.delete_entry(cap.id, &cap.clientuuid, &cap.clientid, name);
            }
        }
    }

    /// MD update fanout to every cap on `md_pino`, excluding the
    /// originator, at most one message per recipient mount.
    #[allow(clippy::too_many_arguments)]
    pub fn broadcast_md(
        &self,
        md: &MdRecord,
        origin_authid: &str,
        md_ino: u64,
        md_pino: u64,
        clock: u64,
        p_mtime: Timestamp,
    ) {
        let origin_uuid = self
            .caps
            .get(origin_authid)
            .map(|cap| cap.clientuuid)
            .unwrap_or_default();

        let mut sent: HashSet<String> = HashSet::new();
        let recipients: Vec<CapRecord> = self
            .caps
            .caps_on_inode(InodeId::new(md_pino))
            .into_iter()
            .filter(|cap| {
                cap.authid != origin_authid
                    && cap.clientuuid != origin_uuid
                    && cap.id != 0
                    && sent.insert(cap.clientuuid.clone())
            })
            .collect();

        for cap in recipients {
            self.send_md(md, &cap.clientuuid, &cap.clientid, md_ino, md_pino, clock, p_mtime);
        }
    }

    /// Drop every cap of one mount and ask it to release each of them.
    /// Cap-store access strictly precedes registry reads.
    pub fn drop_client_caps(&self, uuid: &str) -> usize {
        let removed = self.caps.drop_client(uuid);
        let count = removed.len();
        for cap in removed {
            info!(id = cap.id, clientid = %cap.clientid, authid = %cap.authid, "erasing cap");
            self.release_cap(cap.id, &cap.clientuuid, &cap.clientid);
        }
        count
    }
}
