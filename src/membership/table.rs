//! Membership Table
//!
//! A node's local view of the cluster: exactly one `MembershipRecord` per `PeerId`.
//! The table is shared by the disseminator, receiver and failure detector, so every
//! operation goes through `DashMap`'s per-shard locks and callers only ever get clones.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Instant;

use super::config::GossipConfig;
use super::events::MemberEvent;
use super::types::{MembershipRecord, PeerId};

#[derive(Debug, Default)]
pub struct MembershipTable {
    members: DashMap<PeerId, MembershipRecord>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<MembershipRecord> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    /// Inserts `record` unless `id` is already present. Returns `true` if inserted.
    pub fn put_if_absent(&self, id: PeerId, record: MembershipRecord) -> bool {
        match self.members.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn remove(&self, id: &PeerId) -> Option<MembershipRecord> {
        self.members.remove(id).map(|(_, record)| record)
    }

    /// Visits a point-in-time copy of every record.
    ///
    /// No shard lock is held while `f` runs, so `f` may call back into the table.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&MembershipRecord),
    {
        for record in self.snapshot() {
            f(&record);
        }
    }

    pub fn snapshot(&self) -> Vec<MembershipRecord> {
        self.members
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All known peers other than `local`.
    pub fn peer_ids_except(&self, local: &PeerId) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|entry| entry.key() != local)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Merges a remote heartbeat into an existing record.
    ///
    /// Returns `None` if the peer is unknown, otherwise whether the record changed.
    pub fn merge(&self, id: &PeerId, heartbeat: u64, now: Instant) -> Option<bool> {
        self.members
            .get_mut(id)
            .map(|mut entry| entry.value_mut().merge(heartbeat, now))
    }

    /// Bumps a record's own heartbeat and returns the updated copy.
    pub fn increment_heartbeat(&self, id: &PeerId, now: Instant) -> Option<MembershipRecord> {
        self.members.get_mut(id).map(|mut entry| {
            let record = entry.value_mut();
            record.increment_heartbeat(now);
            record.clone()
        })
    }

    /// One failure detector pass over every record except `local`.
    ///
    /// Recomputes `failed`, reports `Failed`/`Revived` transitions, and removes records
    /// that are past their cleanup deadline. Removal re-checks the deadline under the
    /// entry lock, so a heartbeat merged in between keeps the record.
    pub fn sweep(&self, local: &PeerId, now: Instant, config: &GossipConfig) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        let ids = self.peer_ids_except(local);

        for id in ids {
            let (address, cleanup) = {
                let Some(mut entry) = self.members.get_mut(&id) else {
                    continue;
                };
                let record = entry.value_mut();
                let was_failed = record.failed;
                let failed = record.check_failed(now, config);

                match (was_failed, failed) {
                    (false, true) => events.push(MemberEvent::Failed(record.address)),
                    (true, false) => events.push(MemberEvent::Revived(record.address)),
                    _ => {}
                }

                (record.address, record.should_cleanup(now, config))
            };

            if cleanup
                && self
                    .members
                    .remove_if(&id, |_, record| record.should_cleanup(now, config))
                    .is_some()
            {
                events.push(MemberEvent::Removed(address));
            }
        }

        events
    }
}
