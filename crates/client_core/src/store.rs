//! Entity Store: the last-fetched menu collections behind a single writer.
//!
//! Every write is a typed [`StoreAction`] that replaces one slice wholesale
//! and bumps that slice's revision. Readers either clone the current
//! [`MenuSnapshot`] or subscribe to changes.

use shared::domain::{Category, Collection, MenuItem, Modifier};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revisions {
    pub categories: u64,
    pub items: u64,
    pub modifiers: u64,
}

impl Revisions {
    pub fn get(&self, collection: Collection) -> u64 {
        match collection {
            Collection::Categories => self.categories,
            Collection::Items => self.items,
            Collection::Modifiers => self.modifiers,
        }
    }

    fn bump(&mut self, collection: Collection) -> u64 {
        let slot = match collection {
            Collection::Categories => &mut self.categories,
            Collection::Items => &mut self.items,
            Collection::Modifiers => &mut self.modifiers,
        };
        *slot += 1;
        *slot
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MenuSnapshot {
    pub categories: Vec<Category>,
    pub items: Vec<MenuItem>,
    pub modifiers: Vec<Modifier>,
    pub revisions: Revisions,
}

/// A full replacement value for one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Slice {
    Categories(Vec<Category>),
    Items(Vec<MenuItem>),
    Modifiers(Vec<Modifier>),
}

impl Slice {
    pub fn collection(&self) -> Collection {
        match self {
            Slice::Categories(_) => Collection::Categories,
            Slice::Items(_) => Collection::Items,
            Slice::Modifiers(_) => Collection::Modifiers,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// Result of a refetch.
    Loaded(Slice),
    /// Local mutation applied ahead of server confirmation.
    Optimistic(Slice),
    /// Pre-image restored after a failed confirmation.
    RolledBack(Slice),
}

impl StoreAction {
    fn name(&self) -> &'static str {
        match self {
            StoreAction::Loaded(_) => "loaded",
            StoreAction::Optimistic(_) => "optimistic",
            StoreAction::RolledBack(_) => "rolled_back",
        }
    }

    fn into_slice(self) -> Slice {
        match self {
            StoreAction::Loaded(slice)
            | StoreAction::Optimistic(slice)
            | StoreAction::RolledBack(slice) => slice,
        }
    }
}

impl MenuSnapshot {
    /// Clone of one collection's current contents.
    pub fn slice_of(&self, collection: Collection) -> Slice {
        match collection {
            Collection::Categories => Slice::Categories(self.categories.clone()),
            Collection::Items => Slice::Items(self.items.clone()),
            Collection::Modifiers => Slice::Modifiers(self.modifiers.clone()),
        }
    }

    fn apply(&mut self, action: StoreAction) -> (Collection, u64) {
        let slice = action.into_slice();
        let collection = slice.collection();
        match slice {
            Slice::Categories(list) => self.categories = list,
            Slice::Items(list) => self.items = list,
            Slice::Modifiers(list) => self.modifiers = list,
        }
        (collection, self.revisions.bump(collection))
    }
}

/// Outcome of an optimistic [`EntityStore::transform`].
#[derive(Debug, Clone)]
pub struct Transformed<P> {
    pub pre_image: Slice,
    pub post_image: Slice,
    pub revision: u64,
    pub payload: P,
}

pub struct EntityStore {
    state: watch::Sender<MenuSnapshot>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(MenuSnapshot::default());
        Self { state }
    }

    /// Applies an action synchronously and returns the touched slice's new
    /// revision.
    pub fn dispatch(&self, action: StoreAction) -> u64 {
        let name = action.name();
        let mut applied = (Collection::Categories, 0);
        self.state.send_modify(|snapshot| {
            applied = snapshot.apply(action);
        });
        debug!(
            action = name,
            collection = %applied.0,
            revision = applied.1,
            "store: applied action"
        );
        applied.1
    }

    /// Computes and applies an optimistic write against the current snapshot
    /// in one step, so no other write can land between reading the pre-image
    /// and replacing the slice. `Ok(None)` leaves the store untouched.
    pub fn transform<P, E>(
        &self,
        f: impl FnOnce(&MenuSnapshot) -> Result<Option<(Slice, P)>, E>,
    ) -> Result<Option<Transformed<P>>, E> {
        let mut outcome = Ok(None);
        self.state.send_if_modified(|snapshot| match f(snapshot) {
            Ok(Some((post_image, payload))) => {
                let pre_image = snapshot.slice_of(post_image.collection());
                let (_, revision) = snapshot.apply(StoreAction::Optimistic(post_image.clone()));
                outcome = Ok(Some(Transformed {
                    pre_image,
                    post_image,
                    revision,
                    payload,
                }));
                true
            }
            Ok(None) => false,
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        if let Ok(Some(transformed)) = &outcome {
            debug!(
                action = "optimistic",
                collection = %transformed.post_image.collection(),
                revision = transformed.revision,
                "store: applied action"
            );
        }
        outcome
    }

    /// Restores `pre_image` only while its slice is still at
    /// `expected_revision`. Returns whether the rollback was applied.
    pub fn rollback_if_current(&self, pre_image: Slice, expected_revision: u64) -> bool {
        let collection = pre_image.collection();
        let applied = self.state.send_if_modified(|snapshot| {
            if snapshot.revisions.get(collection) != expected_revision {
                return false;
            }
            snapshot.apply(StoreAction::RolledBack(pre_image));
            true
        });
        debug!(%collection, expected_revision, applied, "store: conditional rollback");
        applied
    }

    pub fn snapshot(&self) -> MenuSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MenuSnapshot> {
        self.state.subscribe()
    }

    pub fn revision(&self, collection: Collection) -> u64 {
        self.state.borrow().revisions.get(collection)
    }

    pub fn categories(&self) -> Vec<Category> {
        self.state.borrow().categories.clone()
    }

    pub fn items(&self) -> Vec<MenuItem> {
        self.state.borrow().items.clone()
    }

    pub fn modifiers(&self) -> Vec<Modifier> {
        self.state.borrow().modifiers.clone()
    }

    pub fn category(&self, id: &str) -> Option<Category> {
        self.state
            .borrow()
            .categories
            .iter()
            .find(|category| category.id.as_str() == id)
            .cloned()
    }

    pub fn item(&self, id: &str) -> Option<MenuItem> {
        self.state
            .borrow()
            .items
            .iter()
            .find(|item| item.id.as_str() == id)
            .cloned()
    }

    pub fn modifier(&self, id: &str) -> Option<Modifier> {
        self.state
            .borrow()
            .modifiers
            .iter()
            .find(|modifier| modifier.id.as_str() == id)
            .cloned()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
