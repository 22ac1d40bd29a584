//! Access control lists.
//!
//! An ACL is a comma-separated list of entries `tag:qualifier:perms` stored
//! in the `sys.acl` xattr (and optionally `user.acl`, evaluated only when
//! `sys.eval.useracl` is set). Tags are `u` (user), `g` (group) and `z`
//! (everyone). Permission tokens: `r`, `w`, `wo` (write once), `x`, `m`
//! (chmod), `c` (chown), `u` (update), `d` (delete), `i` (immutable), with
//! `!` negating `m`, `u` and `d`. Later matching entries override earlier
//! ones per flag.

use crate::types::VirtualIdentity;

/// The evaluated rights of one identity against one ACL set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Acl {
    /// At least one entry matched the identity.
    pub has_acl: bool,
    /// Read granted.
    pub can_read: bool,
    /// Write granted.
    pub can_write: bool,
    /// Write-once granted (create but never rewrite).
    pub can_write_once: bool,
    /// Browse granted.
    pub can_browse: bool,
    /// Chmod granted.
    pub can_chmod: bool,
    /// Chmod explicitly forbidden.
    pub can_not_chmod: bool,
    /// Chown granted.
    pub can_chown: bool,
    /// Update granted.
    pub can_update: bool,
    /// Delete explicitly forbidden.
    pub can_not_delete: bool,
    /// Delete explicitly granted.
    pub can_delete: bool,
    /// `i` makes the directory immutable for this identity.
    immutable: bool,
}

impl Acl {
    /// Evaluate `sys.acl` and optionally `user.acl` for `vid`.
    pub fn evaluate(sys_acl: &str, user_acl: &str, vid: &VirtualIdentity, eval_useracl: bool) -> Self {
        let mut acl = Acl::default();
        acl.apply(sys_acl, vid);
        if eval_useracl {
            acl.apply(user_acl, vid);
        }
        acl
    }

    /// A mutable directory grants writes at all; `i` revokes mutability.
    pub fn is_mutable(&self) -> bool {
        !self.immutable
    }

    fn apply(&mut self, acl: &str, vid: &VirtualIdentity) {
        for entry in acl.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut fields = entry.splitn(3, ':');
            let (Some(tag), Some(qualifier), Some(perms)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            let matches = match tag {
                "u" => qualifier == vid.uid.to_string() || qualifier == vid.uid_string,
                "g" => qualifier == vid.gid.to_string(),
                "z" => true,
                _ => false,
            };
            if !matches {
                continue;
            }

            self.has_acl = true;
            self.apply_perms(perms);
        }
    }

    fn apply_perms(&mut self, perms: &str) {
        let mut rest = perms;
        while !rest.is_empty() {
            // longest tokens first
            if let Some(tail) = rest.strip_prefix("!d") {
                self.can_not_delete = true;
                self.can_delete = false;
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("!m") {
                self.can_not_chmod = true;
                self.can_chmod = false;
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("!u") {
                self.can_update = false;
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("+d") {
                self.can_delete = true;
                self.can_not_delete = false;
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("+u") {
                self.can_update = true;
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("wo") {
                self.can_write_once = true;
                rest = tail;
            } else {
                let (token, tail) = rest.split_at(1);
                match token {
                    "r" => self.can_read = true,
                    "w" => self.can_write = true,
                    "x" => self.can_browse = true,
                    "m" => {
                        self.can_chmod = true;
                        self.can_not_chmod = false;
                    }
                    "c" => self.can_chown = true,
                    "u" => self.can_update = true,
                    "d" => {
                        self.can_delete = true;
                        self.can_not_delete = false;
                    }
                    "i" => self.immutable = true,
                    _ => {}
                }
                rest = tail;
            }
        }
    }
}
