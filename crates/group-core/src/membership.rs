//! Authoritative set of reachable members.
//!
//! Pure data structure: no I/O and no events. Readers get an `Arc<[Member]>`
//! snapshot that is rebuilt on every mutation, so iterating a snapshot never
//! observes a concurrent add or remove.

use crate::member::{Member, UniqueId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Inner {
    /// Keyed by identity; the value keeps the latest reported form
    entries: HashMap<Member, Member>,
    snapshot: Arc<[Member]>,
}

impl Inner {
    fn rebuild_snapshot(&mut self) {
        self.snapshot = self.entries.values().cloned().collect();
    }
}

/// Thread-safe membership set.
#[derive(Default)]
pub struct Membership {
    inner: RwLock<Inner>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a member is alive.
    ///
    /// Returns true if the member was not known before.
    pub fn member_alive(&self, member: Member) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(stored) = inner.entries.get_mut(&member) {
            *stored = member;
            return false;
        }

        inner.entries.insert(member.clone(), member);
        inner.rebuild_snapshot();
        true
    }

    /// Remove a member. Returns the stored member if it was present.
    pub fn remove(&self, member: &Member) -> Option<Member> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let removed = inner.entries.remove(member);
        if removed.is_some() {
            inner.rebuild_snapshot();
        }
        removed
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .contains_key(member)
    }

    /// Look a member up by its unique id.
    pub fn get(&self, unique_id: &UniqueId) -> Option<Member> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .values()
            .find(|m| m.unique_id() == unique_id)
            .cloned()
    }

    /// Snapshot of all members.
    pub fn members(&self) -> Arc<[Member]> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every member.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.rebuild_snapshot();
    }
}
