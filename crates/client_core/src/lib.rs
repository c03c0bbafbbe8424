use std::sync::Arc;

use serde_json::Value;
use shared::{
    domain::{Category, CategoryId, Collection, MenuItem, Modifier},
    protocol::{self, CategoryDraft, ItemDraft, ModifierDraft},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

pub mod entity;
pub mod error;
pub mod events;
pub mod journal;
pub mod reorder;
pub mod store;
pub mod transport;
pub mod undo;

pub use entity::{MenuEntity, MenuScope};
pub use error::{ApiError, ApiResult};
pub use events::{ClientEvent, Notification, NotificationAction, NotificationLevel, RetryTarget};
pub use journal::OpId;
pub use reorder::{Direction, MoveInstruction};
pub use store::{EntityStore, MenuSnapshot};
pub use transport::{HttpMenuApi, MenuApi, StaticToken, TokenFile, TokenSource};
pub use undo::{UndoPhase, UndoPolicy};

use crate::{
    entity::{next_category_index, refetch},
    reorder::ReorderController,
    undo::DeleteUndoController,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub scope: MenuScope,
    pub undo: UndoPolicy,
}

/// Long-lived client owning the store, the reorder controller and one
/// delete/undo controller per collection.
///
/// Every operation reports a plain success flag; failures are logged and
/// surfaced as [`ClientEvent::Notification`]s carrying undo/retry actions.
pub struct MenuClient {
    api: Arc<dyn MenuApi>,
    store: Arc<EntityStore>,
    scope: MenuScope,
    reorder: ReorderController,
    categories: DeleteUndoController<Category>,
    items: DeleteUndoController<MenuItem>,
    modifiers: DeleteUndoController<Modifier>,
    events: broadcast::Sender<ClientEvent>,
}

impl MenuClient {
    pub fn new(api: Arc<dyn MenuApi>, config: ClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let store = Arc::new(EntityStore::new());
        Arc::new(Self {
            reorder: ReorderController::new(Arc::clone(&api), Arc::clone(&store), events.clone()),
            categories: DeleteUndoController::new(
                Arc::clone(&api),
                Arc::clone(&store),
                config.scope.clone(),
                config.undo,
                events.clone(),
            ),
            items: DeleteUndoController::new(
                Arc::clone(&api),
                Arc::clone(&store),
                config.scope.clone(),
                config.undo,
                events.clone(),
            ),
            modifiers: DeleteUndoController::new(
                Arc::clone(&api),
                Arc::clone(&store),
                config.scope.clone(),
                config.undo,
                events.clone(),
            ),
            api,
            store,
            scope: config.scope,
            events,
        })
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn scope(&self) -> &MenuScope {
        &self.scope
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn refresh(&self, collection: Collection) -> bool {
        let result = match collection {
            Collection::Categories => refetch::<Category>(self.api.as_ref(), &self.store)
                .await
                .map(drop),
            Collection::Items => refetch::<MenuItem>(self.api.as_ref(), &self.store)
                .await
                .map(drop),
            Collection::Modifiers => refetch::<Modifier>(self.api.as_ref(), &self.store)
                .await
                .map(drop),
        };
        if let Err(err) = result {
            self.notify(Notification::error(format!("Loading {collection} failed: {err}")));
            return false;
        }
        true
    }

    pub async fn refresh_all(&self) -> bool {
        let (categories, items, modifiers) = tokio::join!(
            self.refresh(Collection::Categories),
            self.refresh(Collection::Items),
            self.refresh(Collection::Modifiers)
        );
        categories && items && modifiers
    }

    /// Appends a new category after the highest loaded index.
    pub async fn create_category(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> bool {
        let draft = CategoryDraft {
            name: name.into(),
            description: description.into(),
            index: next_category_index(&self.store.snapshot().categories),
            restaurant_id: Some(self.scope.restaurant_id.clone()),
            menu_id: self.scope.menu_id.clone(),
        };
        self.create_from::<Category, _>(&draft).await
    }

    pub async fn update_category(&self, category: &Category) -> bool {
        self.update_entity(category).await
    }

    /// Creates an item; its category must be a loaded category id.
    pub async fn create_item(&self, draft: ItemDraft) -> bool {
        if !self.has_category(&draft.category) {
            warn!(category = %draft.category, "create item rejected: unknown category");
            self.notify(Notification::error(format!(
                "Unknown category {} for new item",
                draft.category
            )));
            return false;
        }
        self.create_from::<MenuItem, _>(&draft).await
    }

    pub async fn update_item(&self, item: &MenuItem) -> bool {
        if !self.has_category(&item.category) {
            warn!(item = %item.id, category = %item.category, "update item rejected: unknown category");
            return false;
        }
        self.update_entity(item).await
    }

    pub async fn create_modifier(&self, draft: ModifierDraft) -> bool {
        self.create_from::<Modifier, _>(&draft).await
    }

    pub async fn update_modifier(&self, modifier: &Modifier) -> bool {
        self.update_entity(modifier).await
    }

    fn has_category(&self, id: &CategoryId) -> bool {
        self.store
            .snapshot()
            .categories
            .iter()
            .any(|category| &category.id == id)
    }

    async fn create_from<T: MenuEntity, D: serde::Serialize>(&self, draft: &D) -> bool {
        match protocol::envelope(T::COLLECTION, draft) {
            Ok(body) => self.send_create::<T>(body).await,
            Err(err) => {
                warn!(collection = %T::COLLECTION, "failed to encode create body: {err}");
                false
            }
        }
    }

    async fn send_create<T: MenuEntity>(&self, body: Value) -> bool {
        let collection = T::COLLECTION;
        if let Err(err) = self.api.create(collection, body).await {
            warn!(%collection, "create failed: {err}");
            self.notify(Notification::error(format!("Creating {collection} entry failed")));
            return false;
        }
        info!(%collection, "created");
        if let Err(err) = refetch::<T>(self.api.as_ref(), &self.store).await {
            warn!(%collection, "refetch after create failed: {err}");
        }
        self.notify(Notification::success(format!("Created {collection} entry")));
        true
    }

    async fn update_entity<T: MenuEntity>(&self, entity: &T) -> bool {
        let collection = T::COLLECTION;
        let body = match entity.update_body() {
            Ok(body) => body,
            Err(err) => {
                warn!(%collection, id = entity.id(), "failed to encode update body: {err}");
                return false;
            }
        };
        if let Err(err) = self.api.update(collection, entity.id(), body).await {
            warn!(%collection, id = entity.id(), "update failed: {err}");
            self.notify(Notification::error(format!("Saving {collection} entry failed")));
            return false;
        }
        if let Err(err) = refetch::<T>(self.api.as_ref(), &self.store).await {
            warn!(%collection, "refetch after update failed: {err}");
        }
        true
    }

    pub async fn move_category(&self, instruction: MoveInstruction) -> bool {
        self.reorder.move_category(instruction).await
    }

    /// Applies the move to the store before returning and confirms it with the
    /// server on a background task. `None` when the move was a no-op or was
    /// rejected.
    pub fn move_category_in_background(
        self: &Arc<Self>,
        instruction: MoveInstruction,
    ) -> Option<JoinHandle<bool>> {
        let op = match self.reorder.stage_category_move(instruction) {
            Ok(op) => op?,
            Err(err) => {
                warn!("reorder rejected: {err}");
                return None;
            }
        };
        let client = Arc::clone(self);
        Some(tokio::spawn(async move { client.reorder.persist(op).await }))
    }

    pub async fn move_item_modifier(&self, item_id: &str, instruction: MoveInstruction) -> bool {
        self.reorder.move_item_modifier(item_id, instruction).await
    }

    pub async fn move_modifier_option(
        &self,
        modifier_id: &str,
        instruction: MoveInstruction,
    ) -> bool {
        self.reorder
            .move_modifier_option(modifier_id, instruction)
            .await
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> bool {
        match collection {
            Collection::Categories => self.categories.delete(id).await,
            Collection::Items => self.items.delete(id).await,
            Collection::Modifiers => self.modifiers.delete(id).await,
        }
    }

    pub async fn undo(&self, collection: Collection, id: &str) -> bool {
        match collection {
            Collection::Categories => self.categories.undo(id).await,
            Collection::Items => self.items.undo(id).await,
            Collection::Modifiers => self.modifiers.undo(id).await,
        }
    }

    pub fn undo_phase(&self, collection: Collection, id: &str) -> Option<UndoPhase> {
        match collection {
            Collection::Categories => self.categories.phase(id),
            Collection::Items => self.items.phase(id),
            Collection::Modifiers => self.modifiers.phase(id),
        }
    }

    /// Runs the action attached to a notification.
    pub async fn perform(&self, action: NotificationAction) -> bool {
        match action {
            NotificationAction::Undo { collection, id } => self.undo(collection, &id).await,
            NotificationAction::Retry(target) => self.retry(target).await,
        }
    }

    pub async fn retry(&self, target: RetryTarget) -> bool {
        match target {
            RetryTarget::Reorder(op) => self.reorder.retry(op).await,
            RetryTarget::Delete { collection, id } => self.delete(collection, &id).await,
            RetryTarget::Undo { collection, id } => self.undo(collection, &id).await,
        }
    }

    /// Optimistic writes whose confirmation failed and can be retried.
    pub fn failed_operations(&self) -> Vec<OpId> {
        self.reorder.journal().failed()
    }

    fn notify(&self, notification: Notification) {
        let _ = self.events.send(ClientEvent::Notification(notification));
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
