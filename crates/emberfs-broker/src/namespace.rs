//! In-process view of the shared namespace.
//!
//! The persistent namespace store is an external collaborator; the broker
//! only needs lookup/create/update/remove of containers and files by id and
//! by name-in-parent, behind one exclusive writer lock. [`MemoryNamespace`]
//! provides that view: a request takes the writer guard for the whole
//! mutation and must drop it before serialising replies or broadcasting.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{BrokerError, InodeId, Result, Timestamp};

/// Directory metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerMd {
    /// Container inode.
    pub id: InodeId,
    /// Parent container inode.
    pub parent: InodeId,
    /// Entry name in the parent.
    pub name: String,
    /// Change time.
    pub ctime: Timestamp,
    /// Modification time.
    pub mtime: Timestamp,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full POSIX mode, `S_IFDIR` included.
    pub mode: u32,
    /// Extended attributes.
    pub xattrs: BTreeMap<String, String>,
    /// Child containers by name.
    pub containers: BTreeMap<String, InodeId>,
    /// Child files by name, values are file ids.
    pub files: BTreeMap<String, u64>,
    /// Bytes stored in the subtree.
    pub tree_size: u64,
    /// Namespace modification clock at the last update.
    pub clock: u64,
}

impl ContainerMd {
    /// Number of direct children.
    pub fn num_children(&self) -> u64 {
        (self.containers.len() + self.files.len()) as u64
    }

    /// True when the container has no children at all.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.files.is_empty()
    }
}

/// File metadata (no data).
#[derive(Clone, Debug, PartialEq)]
pub struct FileMd {
    /// File id; the inode is `InodeId::from_fid(fid)`.
    pub fid: u64,
    /// Containing directory.
    pub parent: InodeId,
    /// Entry name in the parent.
    pub name: String,
    /// Change time.
    pub ctime: Timestamp,
    /// Modification time.
    pub mtime: Timestamp,
    /// Size in bytes.
    pub size: u64,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Permission bits (lower 12 bits only).
    pub flags: u32,
    /// Data layout id, assigned at create time.
    pub layout_id: u32,
    /// Extended attributes.
    pub xattrs: BTreeMap<String, String>,
    /// Symlink target for link entries.
    pub link_target: Option<String>,
    /// Namespace modification clock at the last update.
    pub clock: u64,
}

impl FileMd {
    /// File inode of this record.
    pub fn inode(&self) -> InodeId {
        InodeId::from_fid(self.fid)
    }

    /// True for symlinks.
    pub fn is_link(&self) -> bool {
        self.link_target.is_some()
    }
}

/// The mutable namespace state behind the lock.
#[derive(Debug, Default)]
pub struct NamespaceInner {
    containers: HashMap<u64, ContainerMd>,
    files: HashMap<u64, FileMd>,
    next_container_id: u64,
    next_fid: u64,
    clock: u64,
}

impl NamespaceInner {
    /// Fetch a container by inode.
    pub fn container(&self, id: InodeId) -> Result<&ContainerMd> {
        self.containers
            .get(&id.as_u64())
            .ok_or_else(|| BrokerError::NotFound(format!("container {id}")))
    }

    /// Fetch a container for mutation.
    pub fn container_mut(&mut self, id: InodeId) -> Result<&mut ContainerMd> {
        self.containers
            .get_mut(&id.as_u64())
            .ok_or_else(|| BrokerError::NotFound(format!("container {id}")))
    }

    /// Fetch a file by file id.
    pub fn file(&self, fid: u64) -> Result<&FileMd> {
        self.files
            .get(&fid)
            .ok_or_else(|| BrokerError::NotFound(format!("file {fid:#x}")))
    }

    /// Fetch a file for mutation.
    pub fn file_mut(&mut self, fid: u64) -> Result<&mut FileMd> {
        self.files
            .get_mut(&fid)
            .ok_or_else(|| BrokerError::NotFound(format!("file {fid:#x}")))
    }

    /// Child container id by name.
    pub fn find_container(&self, parent: InodeId, name: &str) -> Option<InodeId> {
        self.containers
            .get(&parent.as_u64())
            .and_then(|c| c.containers.get(name))
            .copied()
    }

    /// Child file id by name.
    pub fn find_file(&self, parent: InodeId, name: &str) -> Option<u64> {
        self.containers
            .get(&parent.as_u64())
            .and_then(|c| c.files.get(name))
            .copied()
    }

    /// Advance and return the namespace modification clock.
    pub fn bump_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Current namespace modification clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Allocate a fresh, unlinked container record.
    pub fn alloc_container(&mut self) -> InodeId {
        self.next_container_id += 1;
        let id = InodeId::new(self.next_container_id);
        let clock = self.bump_clock();
        self.containers.insert(
            id.as_u64(),
            ContainerMd {
                id,
                parent: InodeId::new(0),
                name: String::new(),
                ctime: Timestamp::default(),
                mtime: Timestamp::default(),
                uid: 0,
                gid: 0,
                mode: 0,
                xattrs: BTreeMap::new(),
                containers: BTreeMap::new(),
                files: BTreeMap::new(),
                tree_size: 0,
                clock,
            },
        );
        id
    }

    /// Allocate a fresh, unlinked file record.
    pub fn alloc_file(&mut self) -> u64 {
        self.next_fid += 1;
        let fid = self.next_fid;
        let clock = self.bump_clock();
        self.files.insert(
            fid,
            FileMd {
                fid,
                parent: InodeId::new(0),
                name: String::new(),
                ctime: Timestamp::default(),
                mtime: Timestamp::default(),
                size: 0,
                uid: 0,
                gid: 0,
                flags: 0,
                layout_id: 0,
                xattrs: BTreeMap::new(),
                link_target: None,
                clock,
            },
        );
        fid
    }

    /// Link a container under `parent` with `name`.
    pub fn add_container_entry(&mut self, parent: InodeId, name: &str, child: InodeId) -> Result<()> {
        let pmd = self.container_mut(parent)?;
        pmd.containers.insert(name.to_string(), child);
        let child_md = self.container_mut(child)?;
        child_md.parent = parent;
        child_md.name = name.to_string();
        Ok(())
    }

    /// Unlink the named child container from `parent`.
    pub fn remove_container_entry(&mut self, parent: InodeId, name: &str) -> Result<InodeId> {
        let pmd = self.container_mut(parent)?;
        pmd.containers
            .remove(name)
            .ok_or_else(|| BrokerError::NotFound(format!("entry '{name}' in {parent}")))
    }

    /// Link a file under `parent` with `name`, adjusting the tree size.
    pub fn add_file_entry(&mut self, parent: InodeId, name: &str, fid: u64) -> Result<()> {
        let size = self.file(fid)?.size;
        let pmd = self.container_mut(parent)?;
        pmd.files.insert(name.to_string(), fid);
        let fmd = self.file_mut(fid)?;
        fmd.parent = parent;
        fmd.name = name.to_string();
        self.adjust_tree_size(parent, size as i64);
        Ok(())
    }

    /// Unlink the named file from `parent`, adjusting the tree size.
    pub fn remove_file_entry(&mut self, parent: InodeId, name: &str) -> Result<u64> {
        let pmd = self.container_mut(parent)?;
        let fid = pmd
            .files
            .remove(name)
            .ok_or_else(|| BrokerError::NotFound(format!("entry '{name}' in {parent}")))?;
        let size = self.file(fid)?.size;
        self.adjust_tree_size(parent, -(size as i64));
        Ok(fid)
    }

    /// Rename a file within its parent.
    pub fn rename_file(&mut self, fid: u64, new_name: &str) -> Result<()> {
        let (parent, old_name) = {
            let fmd = self.file(fid)?;
            (fmd.parent, fmd.name.clone())
        };
        let pmd = self.container_mut(parent)?;
        pmd.files.remove(&old_name);
        pmd.files.insert(new_name.to_string(), fid);
        let fmd = self.file_mut(fid)?;
        fmd.name = new_name.to_string();
        Ok(())
    }

    /// Rename a container within its parent.
    pub fn rename_container(&mut self, id: InodeId, new_name: &str) -> Result<()> {
        let (parent, old_name) = {
            let cmd = self.container(id)?;
            (cmd.parent, cmd.name.clone())
        };
        let pmd = self.container_mut(parent)?;
        pmd.containers.remove(&old_name);
        pmd.containers.insert(new_name.to_string(), id);
        let cmd = self.container_mut(id)?;
        cmd.name = new_name.to_string();
        Ok(())
    }

    /// Drop an unlinked container record.
    pub fn remove_container(&mut self, id: InodeId) -> Result<()> {
        self.containers
            .remove(&id.as_u64())
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("container {id}")))
    }

    /// Drop an unlinked file record.
    pub fn remove_file(&mut self, fid: u64) -> Result<()> {
        self.files
            .remove(&fid)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("file {fid:#x}")))
    }

    /// Resize a file, keeping ancestor tree sizes consistent.
    pub fn set_file_size(&mut self, fid: u64, size: u64) -> Result<()> {
        let (parent, old_size, linked) = {
            let fmd = self.file(fid)?;
            (fmd.parent, fmd.size, fmd.parent.as_u64() != 0)
        };
        self.file_mut(fid)?.size = size;
        if linked {
            self.adjust_tree_size(parent, size as i64 - old_size as i64);
        }
        Ok(())
    }

    /// Full path of a container, root rendered as "/".
    pub fn container_path(&self, id: InodeId) -> Result<String> {
        if id == InodeId::ROOT {
            return Ok("/".to_string());
        }
        let mut parts = Vec::new();
        let mut cur = id;
        while cur != InodeId::ROOT {
            let md = self.container(cur)?;
            parts.push(md.name.clone());
            cur = md.parent;
        }
        parts.reverse();
        Ok(format!("/{}/", parts.join("/")))
    }

    /// Full path of a file.
    pub fn file_path(&self, fid: u64) -> Result<String> {
        let fmd = self.file(fid)?;
        Ok(format!("{}{}", self.container_path(fmd.parent)?, fmd.name))
    }

    fn adjust_tree_size(&mut self, from: InodeId, delta: i64) {
        let mut cur = from;
        loop {
            let Some(md) = self.containers.get_mut(&cur.as_u64()) else {
                break;
            };
            md.tree_size = (md.tree_size as i64 + delta).max(0) as u64;
            if cur == InodeId::ROOT || md.parent.as_u64() == 0 {
                break;
            }
            cur = md.parent;
        }
    }
}

/// The namespace view handed to the dispatcher.
pub struct MemoryNamespace {
    inner: RwLock<NamespaceInner>,
}

impl MemoryNamespace {
    /// A namespace holding only the root container.
    pub fn new() -> Self {
        let mut inner = NamespaceInner::default();
        let now = Timestamp::now();
        let clock = inner.bump_clock();
        inner.containers.insert(
            1,
            ContainerMd {
                id: InodeId::ROOT,
                parent: InodeId::ROOT,
                name: String::new(),
                ctime: now,
                mtime: now,
                uid: 0,
                gid: 0,
                mode: libc::S_IFDIR as u32 | 0o755,
                xattrs: BTreeMap::new(),
                containers: BTreeMap::new(),
                files: BTreeMap::new(),
                tree_size: 0,
                clock,
            },
        );
        inner.next_container_id = 1;
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, NamespaceInner> {
        self.inner.read().unwrap()
    }

    /// The exclusive writer lock; hold it for the whole mutation and drop it
    /// before serialising replies or broadcasting.
    pub fn write(&self) -> RwLockWriteGuard<'_, NamespaceInner> {
        self.inner.write().unwrap()
    }
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}
