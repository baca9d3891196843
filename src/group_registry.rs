// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Group Registry
//!
//! Owns group identity, admin and membership. Every mutation keeps two
//! invariants: a group with no members does not exist, and the admin is
//! always a current member.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

/// A chat group.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub admin: String,
    /// Members in join order. The admin is always among them.
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    fn new(name: &str, creator: &str) -> Self {
        Group {
            name: name.to_string(),
            admin: creator.to_string(),
            members: vec![creator.to_string()],
            created_at: Utc::now(),
        }
    }

    pub fn is_member(&self, username: &str) -> bool {
        self.members.iter().any(|m| m == username)
    }

    fn remove(&mut self, username: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != username);
        self.members.len() != before
    }
}

/// What happened to a group after a member left it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub group: String,
    /// Set when the departing member was admin and someone else took over.
    pub new_admin: Option<String>,
    /// True if the group became empty and was removed.
    pub deleted: bool,
}

/// Thread-safe group table keyed by name.
pub struct GroupRegistry {
    groups: RwLock<BTreeMap<String, Group>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        GroupRegistry {
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates `name` with `creator` as sole member and admin.
    /// Returns false (and changes nothing) if the name is taken.
    pub fn create(&self, creator: &str, name: &str) -> bool {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if groups.contains_key(name) {
            return false;
        }
        groups.insert(name.to_string(), Group::new(name, creator));
        true
    }

    /// Reinstates a previously persisted group. Rejected if the name is
    /// taken or the record breaks the membership invariants.
    pub fn restore(&self, group: Group) -> bool {
        if group.members.is_empty() || !group.is_member(&group.admin) {
            return false;
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if groups.contains_key(&group.name) {
            return false;
        }
        groups.insert(group.name.clone(), group);
        true
    }

    /// Adds `username` to `name`. False if the group is absent or the user
    /// is already a member.
    pub fn join(&self, username: &str, name: &str) -> bool {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        match groups.get_mut(name) {
            Some(group) if !group.is_member(username) => {
                group.members.push(username.to_string());
                true
            }
            _ => false,
        }
    }

    /// Removes `username` from `name`, reassigning admin to the earliest
    /// remaining member and deleting the group if it becomes empty.
    pub fn leave(&self, username: &str, name: &str) -> Option<Departure> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        Self::depart(&mut groups, username, name)
    }

    fn depart(
        groups: &mut BTreeMap<String, Group>,
        username: &str,
        name: &str,
    ) -> Option<Departure> {
        let group = groups.get_mut(name)?;
        if !group.remove(username) {
            return None;
        }

        let mut departure = Departure {
            group: name.to_string(),
            new_admin: None,
            deleted: false,
        };

        match group.members.first().cloned() {
            None => {
                groups.remove(name);
                departure.deleted = true;
            }
            Some(successor) if group.admin == username => {
                group.admin = successor.clone();
                departure.new_admin = Some(successor);
            }
            Some(_) => {}
        }
        Some(departure)
    }

    /// Removes `target` from `name` on behalf of `admin`.
    ///
    /// Only the current admin may kick, and not themselves. The group
    /// always survives a kick because the admin stays a member.
    pub fn kick(&self, admin: &str, name: &str, target: &str) -> bool {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        match groups.get_mut(name) {
            Some(group) if group.admin == admin && target != admin => group.remove(target),
            _ => false,
        }
    }

    /// Hands admin rights from `current_admin` to `new_admin`, who must
    /// already be a member.
    pub fn set_admin(&self, current_admin: &str, name: &str, new_admin: &str) -> bool {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        match groups.get_mut(name) {
            Some(group)
                if group.admin == current_admin
                    && new_admin != current_admin
                    && group.is_member(new_admin) =>
            {
                group.admin = new_admin.to_string();
                true
            }
            _ => false,
        }
    }

    /// Removes `name` entirely if `admin` is its admin. Returns the
    /// members it had, for notification.
    pub fn delete(&self, admin: &str, name: &str) -> Option<Vec<String>> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if groups.get(name)?.admin != admin {
            return None;
        }
        groups.remove(name).map(|g| g.members)
    }

    /// Removes `username` from every group it belongs to.
    pub fn remove_member_everywhere(&self, username: &str) -> Vec<Departure> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let names: Vec<String> = groups
            .values()
            .filter(|g| g.is_member(username))
            .map(|g| g.name.clone())
            .collect();
        names
            .iter()
            .filter_map(|name| Self::depart(&mut groups, username, name))
            .collect()
    }

    /// Current members of `name` in join order, empty if absent.
    pub fn members_of(&self, name: &str) -> Vec<String> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(name).map(|g| g.members.clone()).unwrap_or_default()
    }

    pub fn is_member(&self, username: &str, name: &str) -> bool {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(name).is_some_and(|g| g.is_member(username))
    }

    pub fn exists(&self, name: &str) -> bool {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Group> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.get(name).cloned()
    }

    /// All groups, sorted by name.
    pub fn all(&self) -> Vec<Group> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}
