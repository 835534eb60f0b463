//! uid/gid to name resolution with a per-listing cache
//!
//! A cache lives for one listing call and is never invalidated while it
//! lives. Names renamed by the system during a listing may show up stale.

use std::collections::HashMap;

use nix::unistd::{Gid, Group, Uid, User};

/// Source of user and group names
pub trait IdentityLookup {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// Lookups through the local system databases
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl IdentityLookup for SystemLookup {
    fn user_name(&self, uid: u32) -> Option<String> {
        User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name)
    }
}

/// Memoizes one lookup per distinct id
pub struct IdentityCache<L> {
    lookup: L,
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl<L: IdentityLookup> IdentityCache<L> {
    pub fn new(lookup: L) -> Self {
        Self {
            lookup,
            users: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn user(&mut self, uid: u32) -> Option<String> {
        let lookup = &self.lookup;
        self.users
            .entry(uid)
            .or_insert_with(|| lookup.user_name(uid))
            .clone()
    }

    pub fn group(&mut self, gid: u32) -> Option<String> {
        let lookup = &self.lookup;
        self.groups
            .entry(gid)
            .or_insert_with(|| lookup.group_name(gid))
            .clone()
    }
}
