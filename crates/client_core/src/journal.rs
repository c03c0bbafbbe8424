//! Optimistic journal: the pre-image, move and payload of every optimistic
//! write until the server confirms it, plus failed writes kept for user retry.

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, PoisonError},
};

use serde_json::Value;
use shared::{
    domain::{Collection, ItemId, ModifierId},
    protocol::ReorderRequest,
};
use uuid::Uuid;

use crate::{reorder::MoveIntent, store::Slice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub Uuid);

impl OpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OpId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// The persistence call that confirms an optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub enum Persist {
    CategoryOrder(ReorderRequest),
    ItemUpdate { id: ItemId, body: Value },
    ModifierUpdate { id: ModifierId, body: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    InFlight,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub op: OpId,
    pub intent: MoveIntent,
    pub pre_image: Slice,
    /// Revision the optimistic write produced; rollback only applies while
    /// the slice is still at this revision.
    pub written_revision: u64,
    pub persist: Persist,
    pub status: OpStatus,
    /// A refetch replaced the slice while this write was in flight.
    pub resynced: bool,
}

impl JournalEntry {
    pub fn collection(&self) -> Collection {
        self.intent.collection()
    }
}

#[derive(Default)]
pub struct OptimisticJournal {
    entries: Mutex<HashMap<OpId, JournalEntry>>,
}

impl OptimisticJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OpId, JournalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self, entry: JournalEntry) {
        self.lock().insert(entry.op, entry);
    }

    /// Drops an entry that needs no further reconciliation.
    pub fn remove(&self, op: OpId) -> Option<JournalEntry> {
        self.lock().remove(&op)
    }

    /// Marks an entry failed and returns a copy for reconciliation.
    pub fn fail(&self, op: OpId) -> Option<JournalEntry> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&op)?;
        entry.status = OpStatus::Failed;
        Some(entry.clone())
    }

    /// Moves a failed entry back in flight for a retry, recording the
    /// pre-image, revision and payload of the re-planned write.
    pub fn resume(
        &self,
        op: OpId,
        pre_image: Slice,
        written_revision: u64,
        persist: Persist,
    ) -> Option<JournalEntry> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&op)?;
        if entry.status != OpStatus::Failed {
            return None;
        }
        entry.status = OpStatus::InFlight;
        entry.pre_image = pre_image;
        entry.written_revision = written_revision;
        entry.persist = persist;
        entry.resynced = false;
        Some(entry.clone())
    }

    /// Flags every in-flight write of `collection` whose optimistic state a
    /// refetch has replaced.
    pub fn mark_resynced(&self, collection: Collection) -> usize {
        let mut marked = 0;
        for entry in self.lock().values_mut() {
            if entry.status == OpStatus::InFlight && entry.collection() == collection {
                entry.resynced = true;
                marked += 1;
            }
        }
        marked
    }

    pub fn get(&self, op: OpId) -> Option<JournalEntry> {
        self.lock().get(&op).cloned()
    }

    pub fn failed(&self) -> Vec<OpId> {
        self.lock()
            .values()
            .filter(|entry| entry.status == OpStatus::Failed)
            .map(|entry| entry.op)
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.status == OpStatus::InFlight)
            .count()
    }
}
