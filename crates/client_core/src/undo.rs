//! Delete/Undo Controller and its undo cache.
//!
//! A deleted entity is remembered under a client-side correlation token rather
//! than its server id: undo re-creates it through the create endpoint, the
//! server hands out a new id, and the token keeps every id the entity has held
//! pointing at the same lineage.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    entity::{refetch, MenuEntity, MenuScope},
    events::{ClientEvent, Notification, NotificationAction, RetryTarget},
    store::EntityStore,
    transport::MenuApi,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(pub Uuid);

impl CorrelationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoPolicy {
    /// Maximum remembered lineages; the least recently touched is evicted first.
    pub capacity: usize,
    /// Lineages untouched for longer than this are forgotten.
    pub ttl: Option<Duration>,
}

impl Default for UndoPolicy {
    fn default() -> Self {
        Self {
            capacity: 50,
            ttl: Some(Duration::minutes(30)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoPhase {
    Deleted,
    PendingUndo,
    Restored,
}

#[derive(Debug, Clone)]
struct UndoRecord<T> {
    current_id: String,
    snapshot: T,
    phase: UndoPhase,
    touched_at: DateTime<Utc>,
}

pub struct UndoCache<T> {
    policy: UndoPolicy,
    records: HashMap<CorrelationToken, UndoRecord<T>>,
    /// Every id a lineage has held, old and new.
    ids: HashMap<String, CorrelationToken>,
    pending_deletes: HashSet<String>,
}

impl<T: Clone> UndoCache<T> {
    pub fn new(policy: UndoPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            ids: HashMap::new(),
            pending_deletes: HashSet::new(),
        }
    }

    /// The id the entity currently has on the server. Ids never seen by the
    /// cache resolve to themselves.
    pub fn resolve(&self, id: &str) -> String {
        match self.record_for(id) {
            Some(record) if record.phase == UndoPhase::Restored => record.current_id.clone(),
            _ => id.to_string(),
        }
    }

    pub fn token(&self, id: &str) -> Option<CorrelationToken> {
        self.ids.get(id).copied()
    }

    pub fn phase(&self, id: &str) -> Option<UndoPhase> {
        self.record_for(id).map(|record| record.phase)
    }

    /// Snapshot available for undo under `id`.
    pub fn snapshot(&self, id: &str) -> Option<&T> {
        self.record_for(id)
            .filter(|record| record.phase == UndoPhase::Deleted)
            .map(|record| &record.snapshot)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record_for(&self, id: &str) -> Option<&UndoRecord<T>> {
        self.ids.get(id).and_then(|token| self.records.get(token))
    }

    /// Returns `false` when a delete of the same id is already in flight.
    pub fn begin_delete(&mut self, current_id: &str) -> bool {
        self.pending_deletes.insert(current_id.to_string())
    }

    pub fn abort_delete(&mut self, current_id: &str) {
        self.pending_deletes.remove(current_id);
    }

    /// Records a confirmed delete, overwriting any earlier entry of the same
    /// lineage.
    pub fn commit_delete(
        &mut self,
        requested_id: &str,
        current_id: &str,
        snapshot: T,
        now: DateTime<Utc>,
    ) -> CorrelationToken {
        self.pending_deletes.remove(current_id);
        let token = self
            .token(current_id)
            .or_else(|| self.token(requested_id))
            .unwrap_or_default();
        self.records.insert(
            token,
            UndoRecord {
                current_id: current_id.to_string(),
                snapshot,
                phase: UndoPhase::Deleted,
                touched_at: now,
            },
        );
        self.ids.insert(requested_id.to_string(), token);
        self.ids.insert(current_id.to_string(), token);
        self.evict(now);
        token
    }

    /// Moves a deleted lineage to pending-undo and hands out its snapshot.
    pub fn begin_undo(&mut self, id: &str, now: DateTime<Utc>) -> Option<(CorrelationToken, T)> {
        self.evict(now);
        let token = self.token(id)?;
        let record = self.records.get_mut(&token)?;
        if record.phase != UndoPhase::Deleted {
            return None;
        }
        record.phase = UndoPhase::PendingUndo;
        record.touched_at = now;
        Some((token, record.snapshot.clone()))
    }

    pub fn abort_undo(&mut self, token: CorrelationToken, now: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(&token) {
            record.phase = UndoPhase::Deleted;
            record.touched_at = now;
        }
    }

    /// Completes an undo. Without the restored id the lineage cannot be
    /// followed any further and is dropped.
    pub fn finish_undo(
        &mut self,
        token: CorrelationToken,
        restored_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        let Some(restored_id) = restored_id else {
            self.forget(token);
            return;
        };
        if let Some(record) = self.records.get_mut(&token) {
            record.current_id = restored_id.clone();
            record.phase = UndoPhase::Restored;
            record.touched_at = now;
            self.ids.insert(restored_id, token);
        }
    }

    fn forget(&mut self, token: CorrelationToken) {
        self.records.remove(&token);
        self.ids.retain(|_, mapped| *mapped != token);
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        if let Some(ttl) = self.policy.ttl {
            let expired: Vec<CorrelationToken> = self
                .records
                .iter()
                .filter(|(_, record)| {
                    // An expiry past the end of the calendar never comes.
                    record.phase != UndoPhase::PendingUndo
                        && record
                            .touched_at
                            .checked_add_signed(ttl)
                            .is_some_and(|expiry| expiry <= now)
                })
                .map(|(token, _)| *token)
                .collect();
            for token in expired {
                debug!(%token, "undo cache: expired");
                self.forget(token);
            }
        }

        while self.records.len() > self.policy.capacity {
            let oldest = self
                .records
                .iter()
                .filter(|(_, record)| record.phase != UndoPhase::PendingUndo)
                .min_by_key(|(_, record)| record.touched_at)
                .map(|(token, _)| *token);
            let Some(token) = oldest else {
                break;
            };
            debug!(%token, "undo cache: evicted over capacity");
            self.forget(token);
        }
    }
}

pub struct DeleteUndoController<T: MenuEntity> {
    api: Arc<dyn MenuApi>,
    store: Arc<EntityStore>,
    scope: MenuScope,
    cache: Mutex<UndoCache<T>>,
    events: broadcast::Sender<ClientEvent>,
}

impl<T: MenuEntity> DeleteUndoController<T> {
    pub fn new(
        api: Arc<dyn MenuApi>,
        store: Arc<EntityStore>,
        scope: MenuScope,
        policy: UndoPolicy,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            store,
            scope,
            cache: Mutex::new(UndoCache::new(policy)),
            events,
        }
    }

    fn cache(&self) -> MutexGuard<'_, UndoCache<T>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached(&self, id: &str) -> Option<T> {
        self.cache().snapshot(id).cloned()
    }

    pub fn phase(&self, id: &str) -> Option<UndoPhase> {
        self.cache().phase(id)
    }

    pub fn resolve(&self, id: &str) -> String {
        self.cache().resolve(id)
    }

    /// Deletes the entity currently known as `id`. The snapshot is only
    /// retained for undo once the server confirms the delete.
    pub async fn delete(&self, id: &str) -> bool {
        let collection = T::COLLECTION;
        let current_id = self.resolve(id);
        let snapshot = self.store.snapshot();
        let Some(entity) = T::slice(&snapshot)
            .iter()
            .find(|entity| entity.id() == current_id)
            .cloned()
        else {
            warn!(%collection, id, current_id, "delete rejected: entity not loaded");
            self.notify(Notification::error(format!(
                "Cannot delete {collection} entry {id}: it is not loaded"
            )));
            return false;
        };

        let begun = self.cache().begin_delete(&current_id);
        if !begun {
            warn!(%collection, id, current_id, "delete rejected: already in flight");
            return false;
        }

        if let Err(err) = self.api.delete(collection, &current_id).await {
            self.cache().abort_delete(&current_id);
            warn!(%collection, id, current_id, "delete failed: {err}");
            self.notify(
                Notification::error(format!("Deleting {collection} entry failed"))
                    .with_action(NotificationAction::Retry(RetryTarget::Delete {
                        collection,
                        id: id.to_string(),
                    })),
            );
            return false;
        }

        let token = self
            .cache()
            .commit_delete(id, &current_id, entity, Utc::now());
        info!(%collection, id, current_id, %token, "deleted; snapshot kept for undo");

        if let Err(err) = refetch::<T>(self.api.as_ref(), &self.store).await {
            warn!(%collection, "refetch after delete failed: {err}");
        }
        self.notify(
            Notification::success(format!("Deleted {collection} entry")).with_action(
                NotificationAction::Undo {
                    collection,
                    id: id.to_string(),
                },
            ),
        );
        true
    }

    /// Re-creates the entity deleted as `id` from its snapshot. The restored
    /// entity gets a new server id; the cache follows it.
    pub async fn undo(&self, id: &str) -> bool {
        let collection = T::COLLECTION;
        let begun = self.cache().begin_undo(id, Utc::now());
        let Some((token, mut snapshot)) = begun else {
            debug!(%collection, id, "undo ignored: nothing cached");
            return false;
        };

        let loaded = self.store.snapshot();
        snapshot.place_after(T::slice(&loaded));
        let body = match snapshot.create_body(&self.scope) {
            Ok(body) => body,
            Err(err) => {
                self.cache().abort_undo(token, Utc::now());
                warn!(%collection, id, "undo failed to encode snapshot: {err}");
                return false;
            }
        };

        let known: HashSet<String> = T::slice(&loaded)
            .iter()
            .map(|entity| entity.id().to_string())
            .collect();

        if let Err(err) = self.api.create(collection, body).await {
            self.cache().abort_undo(token, Utc::now());
            warn!(%collection, id, %token, "undo failed: {err}");
            self.notify(
                Notification::error(format!("Restoring {collection} entry failed"))
                    .with_action(NotificationAction::Retry(RetryTarget::Undo {
                        collection,
                        id: id.to_string(),
                    })),
            );
            return false;
        }

        let restored_id = match refetch::<T>(self.api.as_ref(), &self.store).await {
            Ok(list) => list
                .iter()
                .find(|entity| !known.contains(entity.id()) && entity.same_content(&snapshot))
                .map(|entity| entity.id().to_string()),
            Err(err) => {
                warn!(%collection, "refetch after undo failed: {err}");
                None
            }
        };
        match &restored_id {
            Some(restored_id) => {
                info!(%collection, id, restored_id, %token, "restored under a new id")
            }
            None => warn!(
                %collection,
                id,
                %token,
                "restored entity could not be identified; lineage dropped"
            ),
        }
        self.cache().finish_undo(token, restored_id, Utc::now());
        self.notify(Notification::success(format!("Restored {collection} entry")));
        true
    }

    fn notify(&self, notification: Notification) {
        let _ = self.events.send(ClientEvent::Notification(notification));
    }
}

#[cfg(test)]
#[path = "tests/undo_tests.rs"]
mod tests;
