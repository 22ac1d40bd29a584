//! The metadata request dispatcher.
//!
//! One request is processed synchronously on its worker thread: parse and
//! validate without any lock, take the namespace writer lock for the whole
//! mutation, release it, serialize the reply, then issue broadcasts. The
//! reply must be queued before any other worker can observe the mutation's
//! broadcasts, and broadcasts never run under the namespace lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use emberfs_proto::{
    frame, serialize_message, Ack, CapRecord, Config, Container, ContainerKind, Flock, Heartbeat,
    LockKind, LockResponse, MdOperation, MdRecord, MdRecordKind, MdRequest, QuotaInfo,
    RequestEnvelope, Response,
};

use crate::broadcast::Broadcaster;
use crate::caps::CapStore;
use crate::config::{
    hardlink_shelter_name, BrokerConfig, ATOMIC_NAME_PREFIX, HARDLINK_TARGET_PREFIX,
};
use crate::flush::FlushTracker;
use crate::locks::LockMap;
use crate::namespace::{MemoryNamespace, NamespaceInner};
use crate::permissions::{self, ContainerView, RequiredPerm};
use crate::quota::{QuotaOracle, NO_QUOTA};
use crate::registry::ClientRegistry;
use crate::types::{BrokerError, CapMode, InodeId, Result, Timestamp, VirtualIdentity};

/// Hardlink entry: points at the physical target inode.
pub const K_MDINO: &str = "sys.eos.mdino";
/// Hardlink target: link count minus one.
pub const K_NLINK: &str = "sys.eos.nlink";
/// Birth time, stored as "sec.nsec".
pub const K_BTIME: &str = "sys.eos.btime";

const S_ISGID: u32 = 0o2000;

/// Out-of-band deletion routine used when a parent carries `sys.recycle`.
///
/// The dispatcher releases the namespace writer lock around the call and
/// re-acquires it afterwards; the recycler owns the removal.
pub trait Recycler: Send + Sync {
    /// Move the file at `path` (file id `fid`) into the recycle bin.
    fn recycle(&self, path: &str, fid: u64, vid: &VirtualIdentity) -> Result<()>;
}

enum SetOp {
    Create,
    Update,
    Rename,
    Move,
}

/// The broker's request dispatcher.
pub struct Dispatcher {
    cfg: BrokerConfig,
    ns: Arc<MemoryNamespace>,
    quota: Arc<dyn QuotaOracle>,
    caps: Arc<CapStore>,
    registry: Arc<ClientRegistry>,
    locks: Arc<LockMap>,
    flush: Arc<FlushTracker>,
    broadcaster: Broadcaster,
    recycler: Option<Arc<dyn Recycler>>,
    hb_interval: AtomicU64,
}

impl Dispatcher {
    /// A dispatcher over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: BrokerConfig,
        ns: Arc<MemoryNamespace>,
        quota: Arc<dyn QuotaOracle>,
        caps: Arc<CapStore>,
        registry: Arc<ClientRegistry>,
        locks: Arc<LockMap>,
        flush: Arc<FlushTracker>,
        broadcaster: Broadcaster,
        recycler: Option<Arc<dyn Recycler>>,
    ) -> Self {
        let hb_interval = AtomicU64::new(cfg.hb_interval);
        Self {
            cfg,
            ns,
            quota,
            caps,
            registry,
            locks,
            flush,
            broadcaster,
            recycler,
            hb_interval,
        }
    }

    /// The broadcaster, shared with the monitor loops.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Change the heartbeat interval and push the new configuration to
    /// every registered client.
    pub fn set_heartbeat_interval(&self, secs: u64) {
        self.hb_interval.store(secs, Ordering::Relaxed);
        for client_id in self.registry.all_client_ids() {
            self.broadcaster.config(
                &client_id,
                Config {
                    hb_rate: secs,
                    dentry_messaging: true,
                },
            );
        }
    }

    /// Handle one envelope from a client connection. Metadata requests
    /// return the serialized reply; heartbeats are absorbed.
    pub fn handle_envelope(
        &self,
        client_id: &str,
        envelope: RequestEnvelope,
        vid: &VirtualIdentity,
    ) -> Option<Vec<u8>> {
        match envelope {
            RequestEnvelope::Md(req) => Some(self.handle_md(client_id, &req, vid)),
            RequestEnvelope::Heartbeat(hb) => {
                self.handle_heartbeat(client_id, hb);
                None
            }
        }
    }

    /// Ingest a heartbeat: register the session, apply cap extensions and
    /// revocations, and greet first contacts with `DROPCAPS` + `CONFIG`.
    pub fn handle_heartbeat(&self, client_id: &str, hb: Heartbeat) {
        let outcome = self
            .registry
            .ingest_heartbeat(client_id, hb, Timestamp::now());
        if outcome.dropped {
            return;
        }

        for (authid, extra) in &outcome.extensions {
            self.caps.extend(authid, *extra);
        }

        if outcome.first_seen {
            // the broker may have restarted: make the client drop stale caps
            self.broadcaster.drop_all_caps(client_id);
            self.broadcaster.config(
                client_id,
                Config {
                    hb_rate: self.hb_interval.load(Ordering::Relaxed),
                    dentry_messaging: true,
                },
            );
        } else {
            for authid in &outcome.revocations {
                debug!(authid, "cap revocation");
                self.caps.remove(authid);
            }
        }
    }

    /// Handle one metadata request, returning the serialized reply (one or
    /// more frames for listing streams).
    pub fn handle_md(&self, client_id: &str, req: &MdRequest, vid: &VirtualIdentity) -> Vec<u8> {
        let op = req.operation;
        info!(
            ino = format_args!("{:#x}", req.md_ino),
            ?op,
            clientid = %req.clientid,
            clientuuid = %req.clientuuid,
            "request"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(json) = serde_json::to_string(req) {
                debug!(request = %json, "request payload");
            }
        }

        match op {
            Some(MdOperation::Beginflush) => {
                self.flush.begin_flush(
                    InodeId::new(req.md_ino),
                    &req.clientuuid,
                    Timestamp::now(),
                );
                serialize(&Response::None)
            }
            Some(MdOperation::Endflush) => {
                self.flush.end_flush(InodeId::new(req.md_ino), &req.clientuuid);
                serialize(&Response::None)
            }
            Some(MdOperation::Get) | Some(MdOperation::Ls) => {
                self.handle_get_ls(req, vid).unwrap_or_else(|err| {
                    error!(ino = req.md_ino, errno = err.errno(), %err, "read failed");
                    let mut rec = MdRecord::default();
                    rec.md_ino = req.md_ino;
                    rec.err = err.errno();
                    let mut cont = Container::new(ContainerKind::Md, req.md_ino);
                    cont.md = Some(Box::new(rec));
                    frame(&serialize(&cont))
                })
            }
            Some(MdOperation::Set) => match self.handle_set(req, vid) {
                Ok(bytes) => bytes,
                Err(err) => self.ack_failure(req, &err),
            },
            Some(MdOperation::Delete) => match self.handle_delete(req, vid) {
                Ok(bytes) => bytes,
                Err(err) => self.ack_failure(req, &err),
            },
            Some(MdOperation::Getcap) => self.handle_getcap(req, vid).unwrap_or_else(|err| {
                let cap = CapRecord {
                    errc: err.errno(),
                    ..Default::default()
                };
                let mut cont = Container::new(ContainerKind::Cap, req.md_ino);
                cont.cap = Some(cap);
                frame(&serialize(&cont))
            }),
            Some(MdOperation::Getlk) => self.handle_getlk(req),
            Some(MdOperation::Setlk) => self.handle_setlk(req, false),
            Some(MdOperation::Setlkw) => self.handle_setlk(req, true),
            None => {
                warn!(clientid = %client_id, "request without operation");
                self.ack_failure(
                    req,
                    &BrokerError::InvalidRequest("missing operation".to_string()),
                )
            }
        }
    }

    // ---------------------------------------------------------------- reads

    fn handle_get_ls(&self, req: &MdRequest, vid: &VirtualIdentity) -> Result<Vec<u8>> {
        let ino = InodeId::new(req.md_ino);
        let list = req.operation == Some(MdOperation::Ls);

        if ino.is_file() {
            let guard = self.ns.read();
            let rec = self.fill_file_md(&guard, ino, req)?;
            drop(guard);
            let mut cont = Container::new(ContainerKind::Md, req.md_ino);
            cont.md = Some(Box::new(rec));
            return Ok(frame(&serialize(&cont)));
        }

        let mut out = Vec::new();
        let mut guard = self.ns.read();
        let mut parent = self.fill_container_md(&guard, ino, list, req)?;
        // refresh the requester's cap under the same auth-id
        self.fill_container_cap(ino, &mut parent, vid, Some(&req.authid), false);

        let mut cont = Container::new(ContainerKind::MdMap, req.md_ino);
        let children: Vec<(String, u64)> = parent
            .children
            .iter()
            .map(|(name, child)| (name.clone(), *child))
            .collect();
        cont.md_map.insert(req.md_ino, parent);
        let mut attached = 1usize;

        if list {
            let mut issued_caps = 0usize;

            for (idx, (name, child_ino)) in children.iter().enumerate() {
                if idx > 0 && idx % self.cfg.listing_batch == 0 {
                    // bound the lock hold time on large listings
                    drop(guard);
                    guard = self.ns.read();
                }

                let child = InodeId::new(*child_ino);
                let rec = if child.is_file() {
                    self.fill_file_md(&guard, child, req).unwrap_or_else(|err| {
                        let mut rec = MdRecord::default();
                        rec.md_ino = *child_ino;
                        rec.err = err.errno();
                        rec
                    })
                } else {
                    match self.fill_container_md(&guard, child, false, req) {
                        Ok(mut rec) => {
                            if issued_caps < self.cfg.listing_caps && !name.starts_with('.') {
                                self.fill_container_cap(child, &mut rec, vid, None, true);
                                issued_caps += 1;
                            }
                            rec
                        }
                        Err(err) => {
                            let mut rec = MdRecord::default();
                            rec.md_ino = *child_ino;
                            rec.err = err.errno();
                            rec
                        }
                    }
                };

                cont.md_map.insert(*child_ino, rec);
                attached += 1;

                if attached >= self.cfg.listing_batch {
                    out.extend_from_slice(&frame(&serialize(&cont)));
                    cont = Container::new(ContainerKind::MdMap, req.md_ino);
                    attached = 0;
                }
            }
        }
        drop(guard);

        if attached > 0 {
            out.extend_from_slice(&frame(&serialize(&cont)));
        }
        Ok(out)
    }

    fn handle_getcap(&self, req: &MdRequest, vid: &VirtualIdentity) -> Result<Vec<u8>> {
        let ino = InodeId::new(req.md_ino);
        let guard = self.ns.read();
        let mut rec = self.fill_container_md(&guard, ino, false, req)?;
        // a GETCAP always mints a fresh auth-id
        self.fill_container_cap(ino, &mut rec, vid, None, false);
        drop(guard);

        let cap = rec.capability.take().unwrap_or_default();
        info!(
            id = format_args!("{:#x}", cap.id),
            mode = format_args!("{:#x}", cap.mode),
            vtime = cap.vtime,
            uid = cap.uid,
            gid = cap.gid,
            clientid = %cap.clientid,
            authid = %cap.authid,
            "cap issued"
        );
        let mut cont = Container::new(ContainerKind::Cap, req.md_ino);
        cont.cap = Some(cap);
        Ok(frame(&serialize(&cont)))
    }

    // -------------------------------------------------------------- fillers

    fn fill_container_md(
        &self,
        guard: &NamespaceInner,
        ino: InodeId,
        list: bool,
        req: &MdRequest,
    ) -> Result<MdRecord> {
        let cmd = guard.container(ino)?;
        let mut rec = MdRecord {
            md_ino: ino.as_u64(),
            md_pino: cmd.parent.as_u64(),
            ctime: cmd.ctime.secs,
            ctime_ns: cmd.ctime.nanos,
            mtime: cmd.mtime.secs,
            mtime_ns: cmd.mtime.nanos,
            atime: cmd.mtime.secs,
            atime_ns: cmd.mtime.nanos,
            size: cmd.tree_size,
            uid: cmd.uid,
            gid: cmd.gid,
            mode: cmd.mode,
            nlink: 2,
            name: cmd.name.clone(),
            fullpath: guard.container_path(ino)?,
            clientid: req.clientid.clone(),
            clientuuid: req.clientuuid.clone(),
            attr: cmd.xattrs.clone(),
            nchildren: cmd.num_children(),
            clock: cmd.clock,
            ..Default::default()
        };

        if let Some((secs, nanos)) = cmd.xattrs.get(K_BTIME).and_then(parse_btime) {
            rec.btime = secs;
            rec.btime_ns = nanos;
        }

        if list {
            // hard-coded listing limit for service protection
            if rec.nchildren > self.cfg.max_listing {
                return Err(BrokerError::ListingTooLarge(rec.nchildren));
            }
            for (name, child) in &cmd.containers {
                rec.children.insert(name.clone(), child.as_u64());
            }
            for (name, fid) in &cmd.files {
                rec.children
                    .insert(name.clone(), InodeId::from_fid(*fid).as_u64());
            }
            rec.kind = MdRecordKind::MdLs;
        } else {
            rec.kind = MdRecordKind::Md;
        }

        Ok(rec)
    }

    fn fill_file_md(
        &self,
        guard: &NamespaceInner,
        ino: InodeId,
        req: &MdRequest,
    ) -> Result<MdRecord> {
        let link_md = guard.file(ino.fid())?;
        let mut target_md = link_md;
        let mut has_mdino = false;

        if let Some(mdino) = link_md.xattrs.get(K_MDINO) {
            // hardlink entry: resolve to the physical target
            has_mdino = true;
            let tgt = mdino
                .parse::<u64>()
                .map_err(|e| BrokerError::InvalidRequest(format!("bad {K_MDINO}: {e}")))?;
            target_md = guard.file(InodeId::new(tgt).fid())?;
        }

        let mut rec = MdRecord {
            // the record keeps the link's own inode
            md_ino: ino.as_u64(),
            md_pino: target_md.parent.as_u64(),
            ctime: target_md.ctime.secs,
            ctime_ns: target_md.ctime.nanos,
            mtime: target_md.mtime.secs,
            mtime_ns: target_md.mtime.nanos,
            atime: target_md.mtime.secs,
            atime_ns: target_md.mtime.nanos,
            btime: target_md.ctime.secs,
            btime_ns: target_md.ctime.nanos,
            size: target_md.size,
            uid: target_md.uid,
            gid: target_md.gid,
            name: link_md.name.clone(),
            clientid: req.clientid.clone(),
            clientuuid: req.clientuuid.clone(),
            clock: target_md.clock,
            kind: MdRecordKind::Md,
            ..Default::default()
        };

        if let Some(target) = &target_md.link_target {
            rec.mode = target_md.flags | libc::S_IFLNK as u32;
            rec.target = target.clone();
        } else {
            rec.mode = target_md.flags | libc::S_IFREG as u32;
        }

        rec.nlink = match target_md.xattrs.get(K_NLINK).and_then(|v| v.parse::<i64>().ok()) {
            Some(n) => (n + 1) as u32,
            None => 1,
        };

        for (key, value) in &target_md.xattrs {
            if has_mdino && key == K_NLINK {
                continue;
            }
            rec.attr.insert(key.clone(), value.clone());
        }
        if has_mdino {
            if let Some(mdino) = link_md.xattrs.get(K_MDINO) {
                rec.attr.insert(K_MDINO.to_string(), mdino.clone());
            }
        }
        if let Some((secs, nanos)) = target_md.xattrs.get(K_BTIME).and_then(parse_btime) {
            rec.btime = secs;
            rec.btime_ns = nanos;
        }

        Ok(rec)
    }

    fn fill_container_cap(
        &self,
        ino: InodeId,
        rec: &mut MdRecord,
        vid: &VirtualIdentity,
        reuse_authid: Option<&str>,
        issue_only_one: bool,
    ) {
        if issue_only_one && self.caps.client_has_cap_on(&rec.clientid, ino) {
            return;
        }

        let leasetime = self
            .registry
            .leasetime(&rec.clientuuid)
            .filter(|lease| *lease > 0)
            .unwrap_or(self.cfg.default_lease);
        let now = Timestamp::now();

        let view = ContainerView {
            uid: rec.uid,
            gid: rec.gid,
            mode: rec.mode,
            xattrs: rec.attr.clone(),
        };
        let grant = permissions::evaluate(vid, &view);

        let authid = match reuse_authid {
            Some(reuse) if !reuse.is_empty() => reuse.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let max_file_size = rec
            .attr
            .get("sys.forced.maxsize")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(self.cfg.default_max_file_size);

        let space = rec
            .attr
            .get("sys.forced.space")
            .or_else(|| rec.attr.get("user.forced.space"))
            .cloned()
            .unwrap_or_else(|| "default".to_string());

        let quota = if self.quota.is_enabled(&space) {
            match self
                .quota
                .quota_by_path(&rec.fullpath, grant.uid, grant.gid)
            {
                Some(lookup) => QuotaInfo {
                    inode_quota: lookup.avail_files,
                    volume_quota: lookup.avail_bytes,
                    quota_node: lookup.quota_node,
                },
                None => QuotaInfo::default(),
            }
        } else {
            QuotaInfo {
                inode_quota: NO_QUOTA,
                volume_quota: NO_QUOTA,
                quota_node: 0,
            }
        };

        let cap = CapRecord {
            id: ino.as_u64(),
            mode: grant.mode.bits(),
            vtime: now.secs + leasetime,
            vtime_ns: now.nanos,
            uid: grant.uid,
            gid: grant.gid,
            authid,
            clientid: rec.clientid.clone(),
            clientuuid: rec.clientuuid.clone(),
            quota,
            max_file_size,
            errc: 0,
        };
        self.caps.store(cap.clone());
        rec.capability = Some(cap);
    }

    // ----------------------------------------------------------- validation

    fn validate_cap(&self, req: &MdRequest, needed: CapMode, now: Timestamp) -> Result<CapRecord> {
        let cap = self
            .caps
            .get(&req.authid)
            .ok_or_else(|| BrokerError::NotFound(format!("no cap for authid={}", req.authid)))?;

        if cap.id != req.md_ino && cap.id != req.md_pino {
            error!(
                authid = %req.authid,
                cap_id = cap.id,
                md_ino = req.md_ino,
                md_pino = req.md_pino,
                "wrong cap"
            );
            return Err(BrokerError::InvalidRequest("cap bound to another inode".to_string()));
        }

        if CapMode(cap.mode).grants(needed) {
            // leave some margin for revoking
            if cap.vtime <= now.secs + self.cfg.cap_revoke_margin {
                return Err(BrokerError::CapExpired);
            }
            return Ok(cap);
        }

        Err(BrokerError::PermissionDenied(format!(
            "cap mode {:#x} lacks {:#x}",
            cap.mode,
            needed.bits()
        )))
    }

    /// Cap check with ACL fallback: a cap may be gone after a broker restart
    /// or just expired, in which case the permissions are re-derived from
    /// the parent container.
    fn validate_access(
        &self,
        req: &MdRequest,
        pino: InodeId,
        needed: CapMode,
        fallback: RequiredPerm,
        vid: &VirtualIdentity,
    ) -> Result<()> {
        match self.validate_cap(req, needed, Timestamp::now()) {
            Ok(_) => Ok(()),
            Err(BrokerError::PermissionDenied(msg)) => Err(BrokerError::PermissionDenied(msg)),
            Err(_) => {
                let guard = self.ns.read();
                let allowed = guard
                    .container(pino)
                    .map(|cmd| {
                        permissions::validate_perm(vid, &container_view(cmd), fallback)
                    })
                    .unwrap_or(false);
                if allowed {
                    Ok(())
                } else {
                    Err(BrokerError::PermissionDenied(format!(
                        "no cap and no fallback permission on {pino}"
                    )))
                }
            }
        }
    }

    // -------------------------------------------------------------- mutations

    fn handle_set(&self, req: &MdRequest, vid: &VirtualIdentity) -> Result<Vec<u8>> {
        let mut pino = InodeId::new(req.md_pino);
        if pino.as_u64() == 0 {
            // creation under an implied cap: the parent inode travels in the cap
            pino = InodeId::new(self.caps.get(&req.authid).map(|c| c.id).unwrap_or(0));
        }

        self.validate_access(req, pino, CapMode::W | CapMode::SA, RequiredPerm::Write, vid)?;

        if req.is_dir() {
            self.set_dir(req, pino, vid)
        } else if req.is_regular() || req.is_fifo() {
            self.set_file(req, pino)
        } else if req.is_symlink() {
            self.set_link(req, pino)
        } else {
            Err(BrokerError::InvalidRequest(format!(
                "unsupported mode {:#o}",
                req.mode
            )))
        }
    }

    fn set_dir(&self, req: &MdRequest, pino: InodeId, vid: &VirtualIdentity) -> Result<Vec<u8>> {
        let md_ino = InodeId::new(req.md_ino);
        let mut guard = self.ns.write();
        let op;
        let target;
        let mut sgid_mode = 0u32;

        if req.md_ino != 0 {
            if req.exclusive {
                return Err(BrokerError::Exists(format!("ino {md_ino}")));
            }
            if !req.implied_authid.is_empty() {
                // a create on top of an existing inode
                return Err(BrokerError::Exists(format!("ino {md_ino} with implied cap")));
            }

            let cmd = guard.container(md_ino)?.clone();
            guard.container(pino)?;
            let mut current_op = SetOp::Update;

            if cmd.parent != pino {
                // directory move: needs write permission on the source parent too
                let source = guard.container(cmd.parent)?;
                if !permissions::validate_perm(vid, &container_view(source), RequiredPerm::Write) {
                    error!(source = %cmd.parent, ino = %md_ino, "no write permission on move source");
                    return Err(BrokerError::PermissionDenied(
                        "no write permission on source directory".to_string(),
                    ));
                }

                info!(from = %cmd.parent, to = %pino, ino = %md_ino, "moving directory");
                guard.remove_container_entry(cmd.parent, &cmd.name)?;

                if let Some(existing) = guard.find_container(pino, &req.name) {
                    let existing_md = guard.container(existing)?;
                    if !existing_md.is_empty() {
                        return Err(BrokerError::NotEmpty(existing));
                    }
                    guard.remove_container_entry(pino, &req.name)?;
                    guard.remove_container(existing)?;
                }

                guard.add_container_entry(pino, &req.name, md_ino)?;
                current_op = SetOp::Move;
            } else if cmd.name != req.name {
                info!(from = %cmd.name, to = %req.name, "renaming directory");
                guard.rename_container(md_ino, &req.name)?;
                current_op = SetOp::Rename;
            }

            if guard.container(pino)?.mode & S_ISGID != 0 {
                sgid_mode = S_ISGID;
            }
            op = current_op;
            target = md_ino;
        } else {
            // directory creation
            guard.container(pino)?;

            if req.name.starts_with(ATOMIC_NAME_PREFIX) {
                return Err(BrokerError::PermissionDenied(
                    "atomic path is forbidden as a directory name".to_string(),
                ));
            }
            if req.exclusive && guard.find_container(pino, &req.name).is_some() {
                return Err(BrokerError::Exists(req.name.clone()));
            }

            let id = guard.alloc_container();
            info!(pino = %pino, ino = %id, name = %req.name, "create directory");

            if !req.implied_authid.is_empty() {
                let lease = self
                    .registry
                    .leasetime(&req.clientuuid)
                    .filter(|l| *l > 0)
                    .unwrap_or(self.cfg.default_lease);
                let vtime = Timestamp::now().plus_secs(lease);
                if !self.caps.imply(id, &req.authid, &req.implied_authid, vtime) {
                    error!(ino = %id, "imply failed for new directory");
                }
            }

            // parent attribute inheritance
            let inherited = guard.container(pino)?.xattrs.clone();
            guard.container_mut(id)?.xattrs = inherited;
            guard.add_container_entry(pino, &req.name, id)?;
            sgid_mode = S_ISGID;
            op = SetOp::Create;
            target = id;
        }

        {
            let clock = guard.bump_clock();
            let cmd = guard.container_mut(target)?;
            cmd.uid = req.uid;
            cmd.gid = req.gid;
            cmd.mode = req.mode | sgid_mode;
            cmd.ctime = Timestamp {
                secs: req.ctime,
                nanos: req.ctime_ns,
            };
            cmd.mtime = Timestamp {
                secs: req.mtime,
                nanos: req.mtime_ns,
            };
            cmd.clock = clock;

            for (key, value) in &req.attr {
                if !key.starts_with("sys") || key == K_BTIME {
                    cmd.xattrs.insert(key.clone(), value.clone());
                }
            }

            match op {
                SetOp::Create => {
                    cmd.xattrs
                        .insert(K_BTIME.to_string(), format!("{}.{}", req.btime, req.btime_ns));
                }
                _ => {
                    // an attribute that disappeared from the client map was removed
                    let removed: Vec<String> = cmd
                        .xattrs
                        .keys()
                        .filter(|key| !req.attr.contains_key(*key) && *key != K_BTIME)
                        .cloned()
                        .collect();
                    for key in removed {
                        debug!(attr = %key, "attribute removed");
                        cmd.xattrs.remove(&key);
                    }
                }
            }
        }

        if !matches!(op, SetOp::Update) && req.pmtime != 0 {
            let pcmd = guard.container_mut(pino)?;
            pcmd.mtime = Timestamp {
                secs: req.pmtime,
                nanos: req.pmtime_ns,
            };
        }
        drop(guard);

        let reply = serialize(&Response::Ack(Ack::ok(req.reqid, target.as_u64())));

        // directory-level changes invalidate subscriber caps
        if matches!(op, SetOp::Move) {
            // the source-parent subscribers hold caps under the move auth-id
            self.broadcaster
                .broadcast_release(&req.mv_authid, InodeId::new(0));
        }
        self.broadcaster.broadcast_release(&req.authid, pino);

        Ok(reply)
    }

    fn set_file(&self, req: &MdRequest, pino: InodeId) -> Result<Vec<u8>> {
        let mut guard = self.ns.write();
        guard.container(pino)?;

        if req.md_ino != 0 && req.exclusive {
            return Err(BrokerError::Exists(format!("ino {:#x}", req.md_ino)));
        }

        let op;
        let fid;

        if req.md_ino != 0 {
            let ino = InodeId::new(req.md_ino);
            fid = ino.fid();
            let fmd = guard.file(fid)?.clone();
            let mut current_op = SetOp::Update;

            if fmd.parent != pino {
                // file move, replacing any existing target
                debug!(from = %fmd.parent, to = %pino, "moving file");
                guard.remove_file_entry(fmd.parent, &fmd.name)?;
                if let Some(old) = guard.find_file(pino, &req.name) {
                    guard.remove_file_entry(pino, &req.name)?;
                    guard.remove_file(old)?;
                }
                guard.add_file_entry(pino, &req.name, fid)?;
                current_op = SetOp::Move;
            } else if fmd.name != req.name {
                debug!(from = %fmd.name, to = %req.name, "renaming file");
                if let Some(old) = guard.find_file(pino, &req.name) {
                    guard.remove_file_entry(pino, &req.name)?;
                    guard.remove_file(old)?;
                }
                guard.rename_file(fid, &req.name)?;
                current_op = SetOp::Rename;
            }
            op = current_op;
        } else if req.target.starts_with(HARDLINK_TARGET_PREFIX) {
            return self.create_hardlink(guard, req, pino);
        } else {
            // file creation
            if req.name.starts_with(ATOMIC_NAME_PREFIX) {
                return Err(BrokerError::PermissionDenied(
                    "atomic path is forbidden as a filename".to_string(),
                ));
            }

            let pcmd = guard.container(pino)?;
            let space = pcmd
                .xattrs
                .get("sys.forced.space")
                .or_else(|| pcmd.xattrs.get("user.forced.space"))
                .cloned()
                .unwrap_or_else(|| "default".to_string());
            if self.quota.is_enabled(&space) {
                let path = guard.container_path(pino)?;
                if let Some(lookup) = self.quota.quota_by_path(&path, req.uid, req.gid) {
                    if lookup.avail_files == 0 {
                        error!(name = %req.name, uid = req.uid, gid = req.gid, "out of inode quota");
                        return Err(BrokerError::QuotaExceeded);
                    }
                }
            }

            fid = guard.alloc_file();
            guard.add_file_entry(pino, &req.name, fid)?;
            info!(pino = %pino, fid = format_args!("{fid:#x}"), name = %req.name, "create file");
            op = SetOp::Create;
        }

        let md_ino = InodeId::from_fid(fid);
        let clock;
        let pt_mtime;
        {
            guard.set_file_size(fid, req.size)?;
            clock = guard.bump_clock();
            let fmd = guard.file_mut(fid)?;
            fmd.uid = req.uid;
            fmd.gid = req.gid;
            fmd.flags = req.mode & 0o777;
            fmd.ctime = Timestamp {
                secs: req.ctime,
                nanos: req.ctime_ns,
            };
            fmd.mtime = Timestamp {
                secs: req.mtime,
                nanos: req.mtime_ns,
            };
            fmd.clock = clock;
            fmd.xattrs.clear();
            for (key, value) in &req.attr {
                fmd.xattrs.insert(key.clone(), value.clone());
            }
            fmd.xattrs
                .insert(K_BTIME.to_string(), format!("{}.{}", req.btime, req.btime_ns));
        }

        if !matches!(op, SetOp::Update) {
            let pcmd = guard.container_mut(pino)?;
            pcmd.mtime = Timestamp {
                secs: req.mtime,
                nanos: req.mtime_ns,
            };
            pt_mtime = Timestamp {
                secs: req.mtime,
                nanos: req.mtime_ns,
            };
        } else {
            pt_mtime = Timestamp::default();
        }
        drop(guard);

        let reply = serialize(&Response::Ack(Ack::ok(req.reqid, md_ino.as_u64())));
        self.broadcaster.broadcast_md(
            &md_record_from_request(req),
            &req.authid,
            md_ino.as_u64(),
            pino.as_u64(),
            clock,
            pt_mtime,
        );
        Ok(reply)
    }

    fn create_hardlink(
        &self,
        mut guard: std::sync::RwLockWriteGuard<'_, NamespaceInner>,
        req: &MdRequest,
        pino: InodeId,
    ) -> Result<Vec<u8>> {
        let tgt_ino: u64 = req.target[HARDLINK_TARGET_PREFIX.len()..]
            .parse()
            .map_err(|e| BrokerError::InvalidRequest(format!("bad hardlink target: {e}")))?;

        if guard.find_container(pino, &req.name).is_some()
            || guard.find_file(pino, &req.name).is_some()
        {
            return Err(BrokerError::Exists(req.name.clone()));
        }

        let tgt_fid = InodeId::new(tgt_ino).fid();
        let nlink = {
            let target = guard.file(tgt_fid)?;
            target
                .xattrs
                .get(K_NLINK)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|n| n + 1)
                .unwrap_or(1)
        };

        info!(
            link_target = format_args!("{tgt_ino:#x}"),
            nlink,
            name = %req.name,
            "create hard link"
        );

        let clock = guard.bump_clock();
        {
            let target = guard.file_mut(tgt_fid)?;
            target.xattrs.insert(K_NLINK.to_string(), nlink.to_string());
            target.clock = clock;
        }

        let gfid = guard.alloc_file();
        {
            let gmd = guard.file_mut(gfid)?;
            gmd.xattrs
                .insert(K_MDINO.to_string(), tgt_ino.to_string());
        }
        guard.add_file_entry(pino, &req.name, gfid)?;
        drop(guard);

        let reply = serialize(&Response::Ack(Ack::ok(
            req.reqid,
            InodeId::from_fid(gfid).as_u64(),
        )));
        let pt_mtime = Timestamp {
            secs: req.mtime,
            nanos: req.mtime_ns,
        };
        self.broadcaster.broadcast_md(
            &md_record_from_request(req),
            &req.authid,
            tgt_ino,
            pino.as_u64(),
            0,
            pt_mtime,
        );
        Ok(reply)
    }

    fn set_link(&self, req: &MdRequest, pino: InodeId) -> Result<Vec<u8>> {
        let mut guard = self.ns.write();
        guard.container(pino)?;

        let existing = guard.find_file(pino, &req.name);
        if existing.is_some() && req.exclusive {
            return Err(BrokerError::Exists(req.name.clone()));
        }

        let (fid, op) = match existing {
            Some(fid) => (fid, SetOp::Update),
            None => {
                if req.name.starts_with(ATOMIC_NAME_PREFIX) {
                    return Err(BrokerError::PermissionDenied(
                        "atomic path is forbidden as a link name".to_string(),
                    ));
                }
                let fid = guard.alloc_file();
                guard.add_file_entry(pino, &req.name, fid)?;
                (fid, SetOp::Create)
            }
        };

        info!(pino = %pino, fid = format_args!("{fid:#x}"), name = %req.name, "create link");

        let clock = guard.bump_clock();
        {
            guard.set_file_size(fid, req.target.len() as u64)?;
            let fmd = guard.file_mut(fid)?;
            if req.is_symlink() {
                fmd.link_target = Some(req.target.clone());
            }
            fmd.layout_id = 0;
            fmd.uid = req.uid;
            fmd.gid = req.gid;
            fmd.flags = req.mode & 0o777;
            fmd.ctime = Timestamp {
                secs: req.ctime,
                nanos: req.ctime_ns,
            };
            fmd.mtime = Timestamp {
                secs: req.mtime,
                nanos: req.mtime_ns,
            };
            fmd.clock = clock;
            fmd.xattrs.clear();
            if matches!(op, SetOp::Create) {
                fmd.xattrs
                    .insert(K_BTIME.to_string(), format!("{}.{}", req.btime, req.btime_ns));
            }
        }

        let pt_mtime = Timestamp {
            secs: req.mtime,
            nanos: req.mtime_ns,
        };
        guard.container_mut(pino)?.mtime = pt_mtime;
        drop(guard);

        let md_ino = InodeId::from_fid(fid);
        let reply = serialize(&Response::Ack(Ack::ok(req.reqid, md_ino.as_u64())));
        self.broadcaster.broadcast_md(
            &md_record_from_request(req),
            &req.authid,
            md_ino.as_u64(),
            pino.as_u64(),
            0,
            pt_mtime,
        );
        Ok(reply)
    }

    fn handle_delete(&self, req: &MdRequest, vid: &VirtualIdentity) -> Result<Vec<u8>> {
        let pino = InodeId::new(req.md_pino);
        let md_ino = InodeId::new(req.md_ino);
        self.validate_access(req, pino, CapMode::D, RequiredPerm::Delete, vid)?;

        let mtime = Timestamp {
            secs: req.mtime,
            nanos: req.mtime_ns,
        };
        let mut guard = self.ns.write();
        guard.container(pino)?;
        let dentry_name;

        if req.is_dir() {
            let cmd = guard.container(md_ino)?;
            if !cmd.is_empty() {
                return Err(BrokerError::NotEmpty(md_ino));
            }
            let name = cmd.name.clone();
            info!(ino = %md_ino, "delete directory");
            guard.remove_container_entry(pino, &name)?;
            guard.remove_container(md_ino)?;
            dentry_name = name;
        } else if req.is_symlink() {
            let fmd = guard.file(md_ino.fid())?.clone();
            info!(ino = %md_ino, "delete link");
            guard.remove_file_entry(pino, &fmd.name)?;
            guard.remove_file(fmd.fid)?;
            dentry_name = req.name.clone();
        } else {
            let fmd = guard.file(md_ino.fid())?.clone();
            let recycle = guard
                .container(pino)?
                .xattrs
                .contains_key("sys.recycle")
                && !fmd.xattrs.contains_key(K_MDINO)
                && !fmd.xattrs.contains_key(K_NLINK);

            if recycle {
                if let Some(recycler) = &self.recycler {
                    // the recycle routine re-enters the namespace at a higher
                    // level: release the writer lock around it
                    let path = guard.file_path(fmd.fid)?;
                    drop(guard);
                    recycler.recycle(&path, fmd.fid, vid)?;
                    guard = self.ns.write();
                } else {
                    self.delete_file_inline(&mut guard, pino, &fmd)?;
                }
            } else {
                self.delete_file_inline(&mut guard, pino, &fmd)?;
            }
            dentry_name = req.name.clone();
        }

        if let Ok(pcmd) = guard.container_mut(pino) {
            pcmd.mtime = mtime;
        }
        guard.bump_clock();
        drop(guard);

        let reply = serialize(&Response::Ack(Ack::ok(req.reqid, 0)));
        self.broadcaster.broadcast_release(&req.authid, pino);
        self.broadcaster
            .broadcast_deletion(&req.authid, pino, &dentry_name);
        self.caps.delete_inode(md_ino);
        Ok(reply)
    }

    /// Unlink a regular file, honouring the hardlink bookkeeping.
    fn delete_file_inline(
        &self,
        guard: &mut NamespaceInner,
        pino: InodeId,
        fmd: &crate::namespace::FileMd,
    ) -> Result<()> {
        let mut do_delete = true;

        if let Some(mdino) = fmd.xattrs.get(K_MDINO) {
            // a link entry: drop one reference on the physical target
            let tgt_ino: u64 = mdino
                .parse()
                .map_err(|e| BrokerError::InvalidRequest(format!("bad {K_MDINO}: {e}")))?;
            let tgt_fid = InodeId::new(tgt_ino).fid();
            let target = guard.file(tgt_fid)?.clone();
            let nlink = target
                .xattrs
                .get(K_NLINK)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
                - 1;

            if nlink >= 0 {
                info!(link_target = %target.name, nlink, "hardlink count update");
                guard
                    .file_mut(tgt_fid)?
                    .xattrs
                    .insert(K_NLINK.to_string(), nlink.to_string());
            } else {
                info!(link_target = %target.name, "unlinking hardlink target");
                guard.remove_file_entry(target.parent, &target.name)?;
                guard.remove_file(tgt_fid)?;
            }
        } else if let Some(nlink) = fmd.xattrs.get(K_NLINK) {
            // a physical file other links still point at
            let nlink = nlink.parse::<i64>().unwrap_or(0) - 1;
            if nlink >= 0 {
                let shelter = hardlink_shelter_name(fmd.fid);
                info!(from = %fmd.name, to = %shelter, nlink, "sheltering hardlink target");
                if let Some(old) = guard.find_file(fmd.parent, &shelter) {
                    guard.remove_file_entry(fmd.parent, &shelter)?;
                    guard.remove_file(old)?;
                }
                guard.rename_file(fmd.fid, &shelter)?;
                guard
                    .file_mut(fmd.fid)?
                    .xattrs
                    .insert(K_NLINK.to_string(), nlink.to_string());
                do_delete = false;
            }
        }

        if do_delete {
            info!(ino = %fmd.inode(), name = %fmd.name, "delete file");
            guard.remove_file_entry(fmd.parent, &fmd.name)?;
            guard.remove_file(fmd.fid)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------- locks

    fn handle_getlk(&self, req: &MdRequest) -> Vec<u8> {
        let Some(probe) = req.flock else {
            return self.lock_reply_err(libc::EINVAL);
        };
        let reply = self
            .locks
            .getlk(InodeId::new(req.md_ino), probe.pid, &probe);
        info!(
            ino = format_args!("{:#x}", req.md_ino),
            start = reply.start,
            len = reply.len,
            pid = reply.pid,
            "getlk"
        );
        serialize(&Response::Lock(LockResponse {
            start: reply.start,
            len: reply.len,
            pid: reply.pid,
            kind: reply.kind,
            err_no: 0,
        }))
    }

    fn handle_setlk(&self, req: &MdRequest, blocking: bool) -> Vec<u8> {
        let Some(flock) = req.flock else {
            return self.lock_reply_err(libc::EAGAIN);
        };
        info!(
            ino = format_args!("{:#x}", req.md_ino),
            start = flock.start,
            len = flock.len,
            pid = flock.pid,
            kind = ?flock.kind,
            blocking,
            "setlk"
        );
        let ok = self
            .locks
            .setlk(InodeId::new(req.md_ino), &req.clientuuid, &flock, blocking);
        self.lock_reply_err(if ok { 0 } else { libc::EAGAIN })
    }

    fn lock_reply_err(&self, err_no: i32) -> Vec<u8> {
        serialize(&Response::Lock(LockResponse {
            start: 0,
            len: 0,
            pid: 0,
            kind: LockKind::Unlock,
            err_no,
        }))
    }

    // ----------------------------------------------------------------- misc

    fn ack_failure(&self, req: &MdRequest, err: &BrokerError) -> Vec<u8> {
        error!(
            ino = format_args!("{:#x}", req.md_ino),
            errno = err.errno(),
            %err,
            "request failed"
        );
        serialize(&Response::Ack(Ack::failure(
            req.reqid,
            err.errno(),
            err.to_string(),
        )))
    }
}

fn serialize<T: serde::Serialize>(msg: &T) -> Vec<u8> {
    serialize_message(msg).unwrap_or_default()
}

fn container_view(cmd: &crate::namespace::ContainerMd) -> ContainerView {
    ContainerView {
        uid: cmd.uid,
        gid: cmd.gid,
        mode: cmd.mode,
        xattrs: cmd.xattrs.clone(),
    }
}

fn parse_btime(value: &String) -> Option<(u64, u32)> {
    let (secs, nanos) = value.split_once('.')?;
    Some((secs.parse().ok()?, nanos.parse().ok()?))
}

/// The MD record broadcast after a file mutation, built from the request.
fn md_record_from_request(req: &MdRequest) -> MdRecord {
    MdRecord {
        md_ino: req.md_ino,
        md_pino: req.md_pino,
        name: req.name.clone(),
        target: req.target.clone(),
        uid: req.uid,
        gid: req.gid,
        mode: req.mode,
        size: req.size,
        ctime: req.ctime,
        ctime_ns: req.ctime_ns,
        mtime: req.mtime,
        mtime_ns: req.mtime_ns,
        btime: req.btime,
        btime_ns: req.btime_ns,
        attr: req.attr.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::FixedQuota;
    use crate::transport::RecordingTransport;

    fn dispatcher() -> (Dispatcher, Arc<RecordingTransport>) {
        let cfg = BrokerConfig::default();
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
            Arc::clone(&transport) as Arc<dyn crate::transport::ClientTransport>,
        );
        let dispatcher = Dispatcher::new(
            cfg,
            ns,
            quota,
            caps,
            registry,
            locks,
            flush,
            broadcaster,
            None,
        );
        (dispatcher, transport)
    }

    fn getcap_authid(d: &Dispatcher, ino: u64, clientid: &str, uuid: &str) -> String {
        let req = MdRequest {
            operation: Some(MdOperation::Getcap),
            md_ino: ino,
            clientid: clientid.to_string(),
            clientuuid: uuid.to_string(),
            ..Default::default()
        };
        d.handle_md(clientid, &req, &VirtualIdentity::root());
        d.caps
            .all()
            .into_iter()
            .find(|c| c.id == ino && c.clientid == clientid)
            .map(|c| c.authid)
            .unwrap_or_default()
    }

    fn mkdir_req(parent: u64, name: &str, authid: &str) -> MdRequest {
        MdRequest {
            operation: Some(MdOperation::Set),
            md_pino: parent,
            name: name.to_string(),
            mode: libc::S_IFDIR as u32 | 0o755,
            uid: 0,
            gid: 0,
            authid: authid.to_string(),
            clientid: "tcp://a".to_string(),
            clientuuid: "u-a".to_string(),
            reqid: 1,
            ..Default::default()
        }
    }

    fn decode_ack(bytes: &[u8]) -> Ack {
        match emberfs_proto::deserialize_message::<Response>(bytes).unwrap() {
            Response::Ack(ack) => ack,
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn test_mkdir_and_get_roundtrip() {
        let (d, _t) = dispatcher();
        let authid = getcap_authid(&d, 1, "tcp://a", "u-a");
        let ack = decode_ack(&d.handle_md(
            "tcp://a",
            &mkdir_req(1, "docs", &authid),
            &VirtualIdentity::root(),
        ));
        assert_eq!(ack.code, emberfs_proto::AckCode::Ok);
        assert!(ack.md_ino > 1);

        let get = MdRequest {
            operation: Some(MdOperation::Get),
            md_ino: ack.md_ino,
            clientid: "tcp://a".to_string(),
            clientuuid: "u-a".to_string(),
            ..Default::default()
        };
        let bytes = d.handle_md("tcp://a", &get, &VirtualIdentity::root());
        let frames = emberfs_proto::split_frames(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        let cont: Container = emberfs_proto::deserialize_message(frames[0]).unwrap();
        let rec = &cont.md_map[&ack.md_ino];
        assert_eq!(rec.name, "docs");
        assert_eq!(rec.md_pino, 1);
        // a cap was refreshed alongside the record
        assert!(rec.capability.is_some());
    }

    #[test]
    fn test_exclusive_create_over_existing_fails() {
        let (d, _t) = dispatcher();
        let authid = getcap_authid(&d, 1, "tcp://a", "u-a");
        let mut req = mkdir_req(1, "docs", &authid);
        decode_ack(&d.handle_md("tcp://a", &req, &VirtualIdentity::root()));

        req.exclusive = true;
        let ack = decode_ack(&d.handle_md("tcp://a", &req, &VirtualIdentity::root()));
        assert_eq!(ack.code, emberfs_proto::AckCode::PermanentFailure);
        assert_eq!(ack.err_no, libc::EEXIST);
    }

    #[test]
    fn test_set_without_cap_or_permission_is_denied() {
        let (d, _t) = dispatcher();
        // no cap at all, root directory is 0o755 root-owned
        let req = mkdir_req(1, "intruder", "no-such-auth");
        let ack = decode_ack(&d.handle_md("tcp://a", &req, &VirtualIdentity::user(1000, 1000)));
        assert_eq!(ack.err_no, libc::EPERM);
    }

    #[test]
    fn test_atomic_prefix_rejected() {
        let (d, _t) = dispatcher();
        let authid = getcap_authid(&d, 1, "tcp://a", "u-a");
        let req = mkdir_req(1, ".sys.a#.upload", &authid);
        let ack = decode_ack(&d.handle_md("tcp://a", &req, &VirtualIdentity::root()));
        assert_eq!(ack.err_no, libc::EPERM);
    }

    #[test]
    fn test_cap_near_expiry_falls_back_to_acl() {
        let (d, _t) = dispatcher();
        // a cap that expires within the revocation margin
        d.caps.store(CapRecord {
            id: 1,
            mode: CapMode::ALL.bits(),
            vtime: Timestamp::now().secs + 10,
            authid: "short".to_string(),
            clientid: "tcp://a".to_string(),
            clientuuid: "u-a".to_string(),
            ..Default::default()
        });
        // root passes the ACL fallback even though the cap is stale
        let req = mkdir_req(1, "docs", "short");
        let ack = decode_ack(&d.handle_md("tcp://a", &req, &VirtualIdentity::root()));
        assert_eq!(ack.code, emberfs_proto::AckCode::Ok);

        // a plain user without directory permissions does not
        let req = mkdir_req(1, "docs2", "short");
        let ack = decode_ack(&d.handle_md("tcp://a", &req, &VirtualIdentity::user(1000, 1000)));
        assert_eq!(ack.err_no, libc::EPERM);
    }

    #[test]
    fn test_lock_roundtrip_over_dispatcher() {
        let (d, _t) = dispatcher();
        let ino = InodeId::from_fid(1).as_u64();
        let setlk = MdRequest {
            operation: Some(MdOperation::Setlk),
            md_ino: ino,
            clientuuid: "u-a".to_string(),
            flock: Some(Flock {
                pid: 10,
                start: 0,
                len: 0,
                kind: LockKind::WriteLock,
            }),
            ..Default::default()
        };
        let rsp: Response = emberfs_proto::deserialize_message(&d.handle_md(
            "tcp://a",
            &setlk,
            &VirtualIdentity::root(),
        ))
        .unwrap();
        match rsp {
            Response::Lock(lock) => assert_eq!(lock.err_no, 0),
            other => panic!("expected lock, got {other:?}"),
        }

        // a second writer gets EAGAIN
        let mut conflict = setlk.clone();
        conflict.clientuuid = "u-b".to_string();
        conflict.flock = Some(Flock {
            pid: 11,
            start: 0,
            len: 100,
            kind: LockKind::WriteLock,
        });
        let rsp: Response = emberfs_proto::deserialize_message(&d.handle_md(
            "tcp://b",
            &conflict,
            &VirtualIdentity::root(),
        ))
        .unwrap();
        match rsp {
            Response::Lock(lock) => assert_eq!(lock.err_no, libc::EAGAIN),
            other => panic!("expected lock, got {other:?}"),
        }
    }

    #[test]
    fn test_flush_ops_return_none() {
        let (d, _t) = dispatcher();
        let req = MdRequest {
            operation: Some(MdOperation::Beginflush),
            md_ino: InodeId::from_fid(3).as_u64(),
            clientuuid: "u-a".to_string(),
            ..Default::default()
        };
        let rsp: Response = emberfs_proto::deserialize_message(&d.handle_md(
            "tcp://a",
            &req,
            &VirtualIdentity::root(),
        ))
        .unwrap();
        assert_eq!(rsp, Response::None);
        assert!(d.flush.validate_flush(InodeId::from_fid(3), Timestamp::now()));
    }

    #[test]
    fn test_get_missing_container_reports_err_record() {
        let (d, _t) = dispatcher();
        let req = MdRequest {
            operation: Some(MdOperation::Get),
            md_ino: 4242,
            ..Default::default()
        };
        let bytes = d.handle_md("tcp://a", &req, &VirtualIdentity::root());
        let frames = emberfs_proto::split_frames(&bytes).unwrap();
        let cont: Container = emberfs_proto::deserialize_message(frames[0]).unwrap();
        assert_eq!(cont.md.unwrap().err, libc::ENOENT);
    }
}
