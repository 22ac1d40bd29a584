//! Permission evaluation.
//!
//! Resolves `(identity, container)` to a capability mode from the POSIX
//! bits, the `sys.acl`/`user.acl` overlay, the `sys.mask` attribute and the
//! sticky-ownership rules, and provides the ACL fallback check used when a
//! request arrives without a usable capability (after a broker restart the
//! caps are gone but the permissions can be re-derived on the fly).

use std::collections::BTreeMap;

use tracing::debug;

use crate::acl::Acl;
use crate::types::{CapMode, VirtualIdentity};

const S_IRUSR: u32 = 0o400;
const S_IWUSR: u32 = 0o200;
const S_IXUSR: u32 = 0o100;
const S_IRGRP: u32 = 0o040;
const S_IWGRP: u32 = 0o020;
const S_IXGRP: u32 = 0o010;
const S_IROTH: u32 = 0o004;
const S_IWOTH: u32 = 0o002;
const S_IXOTH: u32 = 0o001;

/// What a permission-fallback check asks for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequiredPerm {
    /// Write access on the parent container.
    Write,
    /// Delete access on the parent container.
    Delete,
}

/// The view of a container the evaluator needs.
#[derive(Clone, Debug, Default)]
pub struct ContainerView {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Full POSIX mode.
    pub mode: u32,
    /// Extended attributes.
    pub xattrs: BTreeMap<String, String>,
}

/// Outcome of a capability mode computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapGrant {
    /// Granted capability mode.
    pub mode: CapMode,
    /// Uid the cap should account under.
    pub uid: u32,
    /// Gid the cap should account under.
    pub gid: u32,
}

/// Compute the capability mode of `vid` on `dir`.
pub fn evaluate(vid: &VirtualIdentity, dir: &ContainerView) -> CapGrant {
    let (uid, gid) = sticky_owner(vid, dir);

    if vid.uid == 0 {
        return CapGrant {
            mode: CapMode::ALL,
            uid,
            gid,
        };
    }

    let mut mode = CapMode::default();

    // group and other bits are intersected with sys.mask; owner r/w are not
    let mask = dir
        .xattrs
        .get("sys.mask")
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .map(|m| m & 0o777)
        .unwrap_or(0o777);

    if vid.sudoer {
        mode |= CapMode::C | CapMode::M | CapMode::U | CapMode::W | CapMode::D | CapMode::SA | CapMode::SU;
    }

    if vid.uid == dir.uid {
        if dir.mode & S_IRUSR != 0 {
            mode |= CapMode::R | CapMode::M | CapMode::SU;
        }
        if dir.mode & S_IWUSR != 0 {
            mode |= CapMode::U | CapMode::W | CapMode::D | CapMode::SA | CapMode::M | CapMode::SU;
        }
        if dir.mode & mask & S_IXUSR != 0 {
            mode |= CapMode::X;
        }
    }

    if vid.gid == dir.gid {
        if dir.mode & mask & S_IRGRP != 0 {
            mode |= CapMode::R;
        }
        if dir.mode & mask & S_IWGRP != 0 {
            mode |= CapMode::U | CapMode::W | CapMode::D | CapMode::SA | CapMode::M | CapMode::SU;
        }
        if dir.mode & mask & S_IXGRP != 0 {
            mode |= CapMode::X;
        }
    }

    if dir.mode & mask & S_IROTH != 0 {
        mode |= CapMode::R;
    }
    if dir.mode & mask & S_IWOTH != 0 {
        mode |= CapMode::U | CapMode::W | CapMode::D | CapMode::SA | CapMode::M | CapMode::SU;
    }
    if dir.mode & mask & S_IXOTH != 0 {
        mode |= CapMode::X;
    }

    let sysacl = dir.xattrs.get("sys.acl").map(String::as_str).unwrap_or("");
    let useracl = dir.xattrs.get("user.acl").map(String::as_str).unwrap_or("");

    if !sysacl.is_empty() || !useracl.is_empty() {
        let eval_useracl = dir.xattrs.contains_key("sys.eval.useracl");
        let acl = Acl::evaluate(sysacl, useracl, vid, eval_useracl);
        debug!(?acl, uid = vid.uid, "acl evaluated");

        if acl.is_mutable() {
            if acl.can_read {
                mode |= CapMode::R;
            }
            if acl.can_write || acl.can_write_once {
                mode |= CapMode::W | CapMode::SA | CapMode::D | CapMode::M;
            }
            if acl.can_browse {
                mode |= CapMode::X;
            }
            if acl.can_not_chmod {
                mode = mode & !CapMode::M;
            }
            if acl.can_chmod {
                mode |= CapMode::M;
            }
            if acl.can_chown {
                mode |= CapMode::C;
            }
            if acl.can_update {
                mode |= CapMode::U | CapMode::SA;
            }
            // the owner can always delete
            if vid.uid != dir.uid && acl.can_not_delete {
                mode = mode & !CapMode::D;
            }
        } else {
            mode = mode & !(CapMode::W | CapMode::D);
        }
    }

    CapGrant { mode, uid, gid }
}

/// The fallback permission check on the parent container, used when a
/// request's capability is missing, expired or bound to the wrong inode.
pub fn validate_perm(vid: &VirtualIdentity, parent: &ContainerView, needed: RequiredPerm) -> bool {
    if vid.uid == 0 {
        return true;
    }

    let mut r_ok = posix_access(vid, parent, S_IRUSR, S_IRGRP, S_IROTH);
    let mut w_ok = posix_access(vid, parent, S_IWUSR, S_IWGRP, S_IWOTH);
    let x_ok = posix_access(vid, parent, S_IXUSR, S_IXGRP, S_IXOTH);
    let mut d_ok = w_ok;

    let sysacl = parent.xattrs.get("sys.acl").map(String::as_str).unwrap_or("");
    let useracl = parent
        .xattrs
        .get("user.acl")
        .map(String::as_str)
        .unwrap_or("");

    if !sysacl.is_empty() || !useracl.is_empty() {
        let eval_useracl = parent.xattrs.contains_key("sys.eval.useracl");
        let acl = Acl::evaluate(sysacl, useracl, vid, eval_useracl);

        if acl.has_acl {
            if acl.can_write {
                w_ok = true;
                d_ok = true;
            }
            // write-once excludes updates
            if !(acl.can_write || acl.can_write_once) {
                w_ok = false;
            }
            if acl.can_not_delete {
                d_ok = false;
            }
            r_ok |= acl.can_read;
            if !acl.is_mutable() {
                w_ok = false;
                d_ok = false;
            }
        }
    }

    let granted = match needed {
        RequiredPerm::Write => w_ok,
        RequiredPerm::Delete => d_ok,
    };

    debug!(
        uid = vid.uid,
        ?needed,
        granted,
        r_ok,
        x_ok,
        "permission fallback"
    );
    granted
}

fn posix_access(vid: &VirtualIdentity, dir: &ContainerView, user: u32, group: u32, other: u32) -> bool {
    if vid.uid == dir.uid {
        dir.mode & user != 0
    } else if vid.gid == dir.gid {
        dir.mode & group != 0
    } else {
        dir.mode & other != 0
    }
}

fn sticky_owner(vid: &VirtualIdentity, dir: &ContainerView) -> (u32, u32) {
    let Some(ownerauth) = dir.xattrs.get("sys.owner.auth") else {
        return (vid.uid, vid.gid);
    };

    if ownerauth == "*" {
        return (dir.uid, dir.gid);
    }

    let identity = if vid.protocol == "gsi" {
        &vid.dn
    } else {
        &vid.uid_string
    };
    let ownerkey = format!("{}:{}", vid.protocol, identity);
    let list = format!("{ownerauth},");

    if list.contains(&ownerkey) {
        (dir.uid, dir.gid)
    } else {
        (vid.uid, vid.gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(uid: u32, gid: u32, mode: u32) -> ContainerView {
        ContainerView {
            uid,
            gid,
            mode,
            xattrs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_root_gets_everything() {
        let grant = evaluate(&VirtualIdentity::root(), &dir(1000, 1000, 0o700));
        assert_eq!(grant.mode, CapMode::ALL);
    }

    #[test]
    fn test_owner_rwx() {
        let vid = VirtualIdentity::user(1000, 1000);
        let grant = evaluate(&vid, &dir(1000, 1000, 0o750));
        assert!(grant.mode.grants(CapMode::R | CapMode::W | CapMode::X));
        assert!(grant.mode.grants(CapMode::D | CapMode::SA | CapMode::M | CapMode::SU | CapMode::U));
        assert!(!grant.mode.grants(CapMode::C));
        assert_eq!((grant.uid, grant.gid), (1000, 1000));
    }

    #[test]
    fn test_owner_readonly() {
        let vid = VirtualIdentity::user(1000, 1000);
        let grant = evaluate(&vid, &dir(1000, 1000, 0o500));
        assert!(grant.mode.grants(CapMode::R | CapMode::X));
        assert!(!grant.mode.grants(CapMode::W));
        assert!(!grant.mode.grants(CapMode::D));
    }

    #[test]
    fn test_group_member() {
        let vid = VirtualIdentity::user(2000, 100);
        let grant = evaluate(&vid, &dir(1000, 100, 0o750));
        assert!(grant.mode.grants(CapMode::R | CapMode::X));
        assert!(!grant.mode.grants(CapMode::W));
    }

    #[test]
    fn test_other_write() {
        let vid = VirtualIdentity::user(2000, 200);
        let grant = evaluate(&vid, &dir(1000, 100, 0o707));
        assert!(grant.mode.grants(CapMode::R | CapMode::W | CapMode::X | CapMode::D));
    }

    #[test]
    fn test_sudoer_extra_rights() {
        let mut vid = VirtualIdentity::user(2000, 200);
        vid.sudoer = true;
        let grant = evaluate(&vid, &dir(1000, 100, 0o700));
        assert!(grant.mode.grants(CapMode::C | CapMode::M | CapMode::W | CapMode::D));
    }

    #[test]
    fn test_sys_mask_limits_group_and_other() {
        let vid = VirtualIdentity::user(2000, 100);
        let mut d = dir(1000, 100, 0o777);
        d.xattrs.insert("sys.mask".to_string(), "500".to_string());
        let grant = evaluate(&vid, &d);
        // group write masked away, group read masked away too (mask 5 = r-x)
        assert!(!grant.mode.grants(CapMode::W));

        // the owner keeps r/w regardless of the mask
        let owner = VirtualIdentity::user(1000, 100);
        let grant = evaluate(&owner, &d);
        assert!(grant.mode.grants(CapMode::R | CapMode::W));
    }

    #[test]
    fn test_acl_grants_beyond_posix() {
        let vid = VirtualIdentity::user(2000, 200);
        let mut d = dir(1000, 100, 0o700);
        d.xattrs
            .insert("sys.acl".to_string(), "u:2000:rwx".to_string());
        let grant = evaluate(&vid, &d);
        assert!(grant.mode.grants(CapMode::R | CapMode::W | CapMode::X | CapMode::D | CapMode::SA));
    }

    #[test]
    fn test_acl_not_delete_spares_owner() {
        let mut d = dir(1000, 100, 0o770);
        d.xattrs.insert("sys.acl".to_string(), "z:rwx!d".to_string());

        let other = VirtualIdentity::user(2000, 100);
        let grant = evaluate(&other, &d);
        assert!(!grant.mode.grants(CapMode::D));

        let owner = VirtualIdentity::user(1000, 100);
        let grant = evaluate(&owner, &d);
        assert!(grant.mode.grants(CapMode::D));
    }

    #[test]
    fn test_immutable_acl_clears_write_and_delete() {
        let vid = VirtualIdentity::user(1000, 100);
        let mut d = dir(1000, 100, 0o700);
        d.xattrs.insert("sys.acl".to_string(), "z:rwxi".to_string());
        let grant = evaluate(&vid, &d);
        assert!(!grant.mode.grants(CapMode::W));
        assert!(!grant.mode.grants(CapMode::D));
        assert!(grant.mode.grants(CapMode::R));
    }

    #[test]
    fn test_sticky_owner_wildcard() {
        let vid = VirtualIdentity::user(2000, 200);
        let mut d = dir(1000, 100, 0o777);
        d.xattrs
            .insert("sys.owner.auth".to_string(), "*".to_string());
        let grant = evaluate(&vid, &d);
        assert_eq!((grant.uid, grant.gid), (1000, 100));
    }

    #[test]
    fn test_sticky_owner_by_protocol_identity() {
        let mut vid = VirtualIdentity::user(2000, 200);
        vid.protocol = "krb5".to_string();
        vid.uid_string = "alice".to_string();
        let mut d = dir(1000, 100, 0o777);
        d.xattrs
            .insert("sys.owner.auth".to_string(), "krb5:alice".to_string());

        let grant = evaluate(&vid, &d);
        assert_eq!((grant.uid, grant.gid), (1000, 100));

        vid.uid_string = "bob".to_string();
        let grant = evaluate(&vid, &d);
        assert_eq!((grant.uid, grant.gid), (2000, 200));
    }

    #[test]
    fn test_validate_perm_posix_write() {
        let vid = VirtualIdentity::user(1000, 100);
        assert!(validate_perm(&vid, &dir(1000, 100, 0o700), RequiredPerm::Write));
        assert!(!validate_perm(&vid, &dir(2000, 200, 0o700), RequiredPerm::Write));
    }

    #[test]
    fn test_validate_perm_acl_overrides() {
        let vid = VirtualIdentity::user(2000, 200);
        let mut d = dir(1000, 100, 0o700);
        d.xattrs
            .insert("sys.acl".to_string(), "u:2000:w".to_string());
        assert!(validate_perm(&vid, &d, RequiredPerm::Write));
        assert!(validate_perm(&vid, &d, RequiredPerm::Delete));

        d.xattrs
            .insert("sys.acl".to_string(), "u:2000:w!d".to_string());
        assert!(validate_perm(&vid, &d, RequiredPerm::Write));
        assert!(!validate_perm(&vid, &d, RequiredPerm::Delete));
    }

    #[test]
    fn test_validate_perm_write_once_grants_nothing_by_itself() {
        let vid = VirtualIdentity::user(2000, 200);
        let mut d = dir(1000, 100, 0o700);
        d.xattrs
            .insert("sys.acl".to_string(), "u:2000:wo".to_string());
        // write-once alone does not grant updates
        assert!(!validate_perm(&vid, &d, RequiredPerm::Write));

        // but it also does not revoke a posix write grant
        let mut open = dir(1000, 200, 0o770);
        open.xattrs
            .insert("sys.acl".to_string(), "u:2000:wo".to_string());
        assert!(validate_perm(&vid, &open, RequiredPerm::Write));
    }

    #[test]
    fn test_validate_perm_root() {
        assert!(validate_perm(
            &VirtualIdentity::root(),
            &dir(1000, 100, 0o000),
            RequiredPerm::Delete
        ));
    }
}
