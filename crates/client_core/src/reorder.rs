//! Reorder Controller: move an element within an ordered sequence, reindex
//! densely, write the store before any network call, then confirm through the
//! optimistic journal.

use std::sync::Arc;

use shared::{
    domain::{Addition, Category, Collection, MenuItem, Modifier, ModifierId},
    protocol::{ReorderEntry, ReorderRequest},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    entity::{refetch, MenuEntity},
    error::{ApiError, ApiResult},
    events::{ClientEvent, Notification, NotificationAction, RetryTarget},
    journal::{JournalEntry, OpId, OpStatus, OptimisticJournal, Persist},
    store::{EntityStore, MenuSnapshot, Slice},
    transport::MenuApi,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveInstruction {
    /// Drag-drop from one position to another.
    Drag { from: usize, to: usize },
    /// Button-driven single step.
    Step { position: usize, direction: Direction },
}

#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("position {position} is out of range for {len} entries")]
    OutOfRange { position: usize, len: usize },
    #[error("no {collection} entry with id {id}")]
    UnknownEntity { collection: Collection, id: String },
    #[error("failed to encode persistence payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MoveInstruction {
    /// Resolves to a `(from, to)` pair, or `None` when the move is a no-op.
    pub fn resolve(self, len: usize) -> Result<Option<(usize, usize)>, ReorderError> {
        let check = |position: usize| {
            if position < len {
                Ok(position)
            } else {
                Err(ReorderError::OutOfRange { position, len })
            }
        };
        match self {
            MoveInstruction::Drag { from, to } => {
                let (from, to) = (check(from)?, check(to)?);
                Ok((from != to).then_some((from, to)))
            }
            MoveInstruction::Step {
                position,
                direction: Direction::Up,
            } => {
                let position = check(position)?;
                Ok((position > 0).then(|| (position, position - 1)))
            }
            MoveInstruction::Step {
                position,
                direction: Direction::Down,
            } => {
                let position = check(position)?;
                Ok((position + 1 < len).then_some((position, position + 1)))
            }
        }
    }
}

/// Elements of a reorderable sequence. Only categories carry an explicit
/// index; everything else is ordered by array position alone.
pub trait Sequenced: Clone {
    fn set_position(&mut self, _index: usize) {}
}

impl Sequenced for Category {
    fn set_position(&mut self, index: usize) {
        self.index = index;
    }
}

impl Sequenced for ModifierId {}

impl Sequenced for Addition {}

/// Returns the reordered and densely reindexed sequence, or `None` for a no-op.
pub fn apply_move<T: Sequenced>(
    sequence: &[T],
    instruction: MoveInstruction,
) -> Result<Option<Vec<T>>, ReorderError> {
    let Some((from, to)) = instruction.resolve(sequence.len())? else {
        return Ok(None);
    };
    let mut next = sequence.to_vec();
    let moved = next.remove(from);
    next.insert(to, moved);
    reindex(&mut next);
    Ok(Some(next))
}

pub fn reindex<T: Sequenced>(sequence: &mut [T]) {
    for (index, element) in sequence.iter_mut().enumerate() {
        element.set_position(index);
    }
}

/// `{_id, index}` for every category, in order.
pub fn reorder_payload(categories: &[Category]) -> ReorderRequest {
    ReorderRequest {
        order: categories
            .iter()
            .map(|category| ReorderEntry {
                id: category.id.to_string(),
                index: category.index,
            })
            .collect(),
    }
}

type Planned = Option<(Slice, Persist)>;

/// The move a journaled reorder asked for. A retry re-plans it against
/// whatever the store holds by then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveIntent {
    Categories(MoveInstruction),
    ItemModifiers {
        item_id: String,
        instruction: MoveInstruction,
    },
    ModifierOptions {
        modifier_id: String,
        instruction: MoveInstruction,
    },
}

impl MoveIntent {
    pub fn collection(&self) -> Collection {
        match self {
            MoveIntent::Categories(_) => Collection::Categories,
            MoveIntent::ItemModifiers { .. } => Collection::Items,
            MoveIntent::ModifierOptions { .. } => Collection::Modifiers,
        }
    }

    fn plan(&self, snapshot: &MenuSnapshot) -> Result<Planned, ReorderError> {
        match self {
            MoveIntent::Categories(instruction) => plan_category_move(snapshot, *instruction),
            MoveIntent::ItemModifiers {
                item_id,
                instruction,
            } => plan_item_modifier_move(snapshot, item_id, *instruction),
            MoveIntent::ModifierOptions {
                modifier_id,
                instruction,
            } => plan_modifier_option_move(snapshot, modifier_id, *instruction),
        }
    }
}

fn plan_category_move(
    snapshot: &MenuSnapshot,
    instruction: MoveInstruction,
) -> Result<Planned, ReorderError> {
    let Some(next) = apply_move(&snapshot.categories, instruction)? else {
        return Ok(None);
    };
    let payload = reorder_payload(&next);
    Ok(Some((
        Slice::Categories(next),
        Persist::CategoryOrder(payload),
    )))
}

fn plan_item_modifier_move(
    snapshot: &MenuSnapshot,
    item_id: &str,
    instruction: MoveInstruction,
) -> Result<Planned, ReorderError> {
    let position = snapshot
        .items
        .iter()
        .position(|item| item.id.as_str() == item_id)
        .ok_or_else(|| ReorderError::UnknownEntity {
            collection: Collection::Items,
            id: item_id.to_string(),
        })?;
    let Some(modifiers) = apply_move(&snapshot.items[position].modifiers, instruction)? else {
        return Ok(None);
    };
    let mut items: Vec<MenuItem> = snapshot.items.clone();
    items[position].modifiers = modifiers;
    let persist = Persist::ItemUpdate {
        id: items[position].id.clone(),
        body: items[position].update_body()?,
    };
    Ok(Some((Slice::Items(items), persist)))
}

fn plan_modifier_option_move(
    snapshot: &MenuSnapshot,
    modifier_id: &str,
    instruction: MoveInstruction,
) -> Result<Planned, ReorderError> {
    let position = snapshot
        .modifiers
        .iter()
        .position(|modifier| modifier.id.as_str() == modifier_id)
        .ok_or_else(|| ReorderError::UnknownEntity {
            collection: Collection::Modifiers,
            id: modifier_id.to_string(),
        })?;
    let Some(options) = apply_move(&snapshot.modifiers[position].options, instruction)? else {
        return Ok(None);
    };
    let mut modifiers: Vec<Modifier> = snapshot.modifiers.clone();
    modifiers[position].options = options;
    let persist = Persist::ModifierUpdate {
        id: modifiers[position].id.clone(),
        body: modifiers[position].update_body()?,
    };
    Ok(Some((Slice::Modifiers(modifiers), persist)))
}

pub struct ReorderController {
    api: Arc<dyn MenuApi>,
    store: Arc<EntityStore>,
    journal: OptimisticJournal,
    events: broadcast::Sender<ClientEvent>,
}

impl ReorderController {
    pub fn new(
        api: Arc<dyn MenuApi>,
        store: Arc<EntityStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            store,
            journal: OptimisticJournal::new(),
            events,
        }
    }

    pub fn journal(&self) -> &OptimisticJournal {
        &self.journal
    }

    /// Applies a move to the store and journals it. Returns `None` when the
    /// move is a no-op; nothing is written or sent in that case.
    pub fn stage(&self, intent: MoveIntent) -> Result<Option<OpId>, ReorderError> {
        let staged = self.store.transform(|snapshot| intent.plan(snapshot))?;
        let Some(staged) = staged else {
            return Ok(None);
        };
        let op = OpId::new();
        debug!(
            %op,
            collection = %staged.post_image.collection(),
            revision = staged.revision,
            "reorder: staged optimistic write"
        );
        self.journal.begin(JournalEntry {
            op,
            intent,
            pre_image: staged.pre_image,
            written_revision: staged.revision,
            persist: staged.payload,
            status: OpStatus::InFlight,
            resynced: false,
        });
        Ok(Some(op))
    }

    pub fn stage_category_move(
        &self,
        instruction: MoveInstruction,
    ) -> Result<Option<OpId>, ReorderError> {
        self.stage(MoveIntent::Categories(instruction))
    }

    pub async fn move_category(&self, instruction: MoveInstruction) -> bool {
        self.run(MoveIntent::Categories(instruction)).await
    }

    pub async fn move_item_modifier(&self, item_id: &str, instruction: MoveInstruction) -> bool {
        self.run(MoveIntent::ItemModifiers {
            item_id: item_id.to_string(),
            instruction,
        })
        .await
    }

    pub async fn move_modifier_option(
        &self,
        modifier_id: &str,
        instruction: MoveInstruction,
    ) -> bool {
        self.run(MoveIntent::ModifierOptions {
            modifier_id: modifier_id.to_string(),
            instruction,
        })
        .await
    }

    async fn run(&self, intent: MoveIntent) -> bool {
        let collection = intent.collection();
        match self.stage(intent) {
            Ok(Some(op)) => self.persist(op).await,
            Ok(None) => {
                debug!(%collection, "reorder: no-op move, nothing to persist");
                true
            }
            Err(err) => {
                warn!(%collection, "reorder rejected: {err}");
                self.notify(Notification::error(format!(
                    "Could not reorder {collection}: {err}"
                )));
                false
            }
        }
    }

    /// Sends the journaled payload of `op` and reconciles the outcome.
    pub async fn persist(&self, op: OpId) -> bool {
        let Some(entry) = self.journal.get(op) else {
            warn!(%op, "reorder: no journal entry to persist");
            return false;
        };
        let result = match &entry.persist {
            Persist::CategoryOrder(request) => self.api.reorder_categories(request).await,
            Persist::ItemUpdate { id, body } => {
                self.api
                    .update(Collection::Items, id.as_str(), body.clone())
                    .await
            }
            Persist::ModifierUpdate { id, body } => {
                self.api
                    .update(Collection::Modifiers, id.as_str(), body.clone())
                    .await
            }
        };

        match result {
            Ok(()) => {
                let collection = entry.collection();
                info!(%op, %collection, "reorder persisted");
                let confirmed = self.journal.remove(op);
                // The store lost this write to a resync before the server took it.
                if confirmed.is_some_and(|entry| entry.resynced) {
                    info!(%op, %collection, "reorder was resynced while in flight; reloading");
                    if let Err(err) = self.resync(collection).await {
                        warn!(%op, %collection, "reload after resynced reorder failed: {err}");
                        self.notify(Notification::error(format!(
                            "Reloading {collection} failed; the list may be out of date"
                        )));
                    }
                }
                true
            }
            Err(err) => {
                self.reconcile_failure(op, &err).await;
                false
            }
        }
    }

    async fn reconcile_failure(&self, op: OpId, err: &ApiError) {
        let Some(entry) = self.journal.fail(op) else {
            return;
        };
        let collection = entry.collection();
        warn!(%op, %collection, "reorder persistence failed: {err}");
        let retry = NotificationAction::Retry(RetryTarget::Reorder(op));

        if self
            .store
            .rollback_if_current(entry.pre_image, entry.written_revision)
        {
            let _ = self.events.send(ClientEvent::RolledBack { collection, op });
            self.notify(
                Notification::error(format!(
                    "Saving the new {collection} order failed; the previous order was restored"
                ))
                .with_action(retry),
            );
            return;
        }

        // A later write owns the slice now; rolling back would clobber it.
        let _ = self.events.send(ClientEvent::Resynced { collection, op });
        self.notify(
            Notification::error(format!(
                "Saving the new {collection} order failed; reloading {collection}"
            ))
            .with_action(retry),
        );
        let refreshed = self.resync(collection).await;
        let marked = self.journal.mark_resynced(collection);
        match refreshed {
            Ok(()) => debug!(%op, %collection, marked, "resynced after failed reorder"),
            Err(err) => {
                warn!(%op, %collection, "resync after failed reorder also failed: {err}")
            }
        }
    }

    async fn resync(&self, collection: Collection) -> ApiResult<()> {
        match collection {
            Collection::Categories => refetch::<Category>(self.api.as_ref(), &self.store)
                .await
                .map(drop),
            Collection::Items => refetch::<MenuItem>(self.api.as_ref(), &self.store)
                .await
                .map(drop),
            Collection::Modifiers => refetch::<Modifier>(self.api.as_ref(), &self.store)
                .await
                .map(drop),
        }
    }

    /// Re-plans a failed reorder against the store's current contents and
    /// sends the resulting payload.
    pub async fn retry(&self, op: OpId) -> bool {
        let Some(entry) = self
            .journal
            .get(op)
            .filter(|entry| entry.status == OpStatus::Failed)
        else {
            debug!(%op, "reorder: nothing to retry");
            return false;
        };
        let collection = entry.collection();

        match self.store.transform(|snapshot| entry.intent.plan(snapshot)) {
            Ok(Some(replanned)) => {
                if self
                    .journal
                    .resume(op, replanned.pre_image, replanned.revision, replanned.payload)
                    .is_none()
                {
                    return false;
                }
                info!(%op, %collection, "reorder: retrying");
                self.persist(op).await
            }
            Ok(None) => {
                self.journal.remove(op);
                info!(%op, %collection, "reorder: order already in place, nothing to retry");
                true
            }
            Err(err) => {
                self.journal.remove(op);
                warn!(%op, %collection, "reorder retry abandoned: {err}");
                self.notify(Notification::error(format!(
                    "Could not retry the {collection} reorder: {err}"
                )));
                false
            }
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = self.events.send(ClientEvent::Notification(notification));
    }
}

#[cfg(test)]
#[path = "tests/reorder_tests.rs"]
mod tests;
