//! Per-collection behavior shared by the store, the controllers and CRUD.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{Category, Collection, MenuId, MenuItem, Modifier, RestaurantId},
    protocol::{self, CategoryDraft, ItemDraft, ModifierDraft, ReorderRequest},
};
use tracing::{info, warn};

use crate::{
    error::ApiResult,
    reorder::{reindex, reorder_payload},
    store::{EntityStore, MenuSnapshot, Slice, StoreAction},
    transport::MenuApi,
};

/// Restaurant/menu the client is bound to. Stamped into create bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuScope {
    pub restaurant_id: RestaurantId,
    pub menu_id: Option<MenuId>,
}

pub trait MenuEntity:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    /// Read this collection's slice out of a snapshot.
    fn slice(snapshot: &MenuSnapshot) -> &[Self];

    fn into_slice(list: Vec<Self>) -> Slice;

    /// Body for the create endpoint. Never carries `_id`.
    fn create_body(&self, scope: &MenuScope) -> serde_json::Result<Value>;

    /// Body for the update endpoint.
    fn update_body(&self) -> serde_json::Result<Value>;

    /// Field equality ignoring the server-assigned identity.
    fn same_content(&self, other: &Self) -> bool;

    /// Post-processing of a freshly fetched list before it lands in the store.
    fn normalize(list: &mut [Self]) {
        let _ = list;
    }

    /// Rewrites positional indices densely in list order. Returns the order
    /// to persist when any index changed.
    fn compact(list: &mut [Self]) -> Option<ReorderRequest> {
        let _ = list;
        None
    }

    /// Positions a re-created entity after its loaded siblings.
    fn place_after(&mut self, siblings: &[Self]) {
        let _ = siblings;
    }
}

/// Index for a category appended after `categories`.
pub fn next_category_index(categories: &[Category]) -> usize {
    categories
        .iter()
        .map(|category| category.index + 1)
        .max()
        .unwrap_or(0)
}

impl MenuEntity for Category {
    const COLLECTION: Collection = Collection::Categories;

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn slice(snapshot: &MenuSnapshot) -> &[Self] {
        &snapshot.categories
    }

    fn into_slice(list: Vec<Self>) -> Slice {
        Slice::Categories(list)
    }

    fn create_body(&self, scope: &MenuScope) -> serde_json::Result<Value> {
        let mut draft = CategoryDraft::from(self);
        draft.restaurant_id = Some(scope.restaurant_id.clone());
        draft.menu_id = scope.menu_id.clone();
        protocol::envelope(Collection::Categories, &draft)
    }

    fn update_body(&self) -> serde_json::Result<Value> {
        protocol::envelope(Collection::Categories, &CategoryDraft::from(self))
    }

    // The server may place a re-created category at a different index.
    fn same_content(&self, other: &Self) -> bool {
        self.name == other.name && self.description == other.description
    }

    fn normalize(list: &mut [Self]) {
        list.sort_by_key(|category| category.index);
    }

    // A delete leaves a gap the server does not close on its own.
    fn compact(list: &mut [Self]) -> Option<ReorderRequest> {
        let dense = list
            .iter()
            .enumerate()
            .all(|(position, category)| category.index == position);
        if dense {
            return None;
        }
        reindex(list);
        Some(reorder_payload(list))
    }

    fn place_after(&mut self, siblings: &[Self]) {
        self.index = next_category_index(siblings);
    }
}

impl MenuEntity for MenuItem {
    const COLLECTION: Collection = Collection::Items;

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn slice(snapshot: &MenuSnapshot) -> &[Self] {
        &snapshot.items
    }

    fn into_slice(list: Vec<Self>) -> Slice {
        Slice::Items(list)
    }

    fn create_body(&self, _scope: &MenuScope) -> serde_json::Result<Value> {
        protocol::envelope(Collection::Items, &ItemDraft::from(self))
    }

    fn update_body(&self) -> serde_json::Result<Value> {
        protocol::envelope(Collection::Items, &ItemDraft::from(self))
    }

    fn same_content(&self, other: &Self) -> bool {
        ItemDraft::from(self) == ItemDraft::from(other)
    }
}

impl MenuEntity for Modifier {
    const COLLECTION: Collection = Collection::Modifiers;

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn slice(snapshot: &MenuSnapshot) -> &[Self] {
        &snapshot.modifiers
    }

    fn into_slice(list: Vec<Self>) -> Slice {
        Slice::Modifiers(list)
    }

    fn create_body(&self, _scope: &MenuScope) -> serde_json::Result<Value> {
        protocol::envelope(Collection::Modifiers, &ModifierDraft::from(self))
    }

    fn update_body(&self) -> serde_json::Result<Value> {
        protocol::envelope(Collection::Modifiers, &ModifierDraft::from(self))
    }

    fn same_content(&self, other: &Self) -> bool {
        ModifierDraft::from(self) == ModifierDraft::from(other)
    }
}

/// Fetches a whole collection and replaces its store slice. A refetch always
/// wins over whatever optimistic state the slice held.
///
/// Category indices land in the store densely; when the server's were not,
/// the compacted order is written back.
pub async fn refetch<T: MenuEntity>(api: &dyn MenuApi, store: &EntityStore) -> ApiResult<Vec<T>> {
    let collection = T::COLLECTION;
    let body = api.list(collection).await.inspect_err(|err| {
        warn!(%collection, "refetch failed: {err}");
    })?;
    let mut list: Vec<T> = protocol::decode_list(collection, body)?;
    T::normalize(&mut list);
    let compacted = T::compact(&mut list);
    let revision = store.dispatch(StoreAction::Loaded(T::into_slice(list.clone())));
    info!(
        %collection,
        count = list.len(),
        revision,
        compacted = compacted.is_some(),
        "refetched collection"
    );
    if let Some(order) = compacted {
        if let Err(err) = api.reorder_categories(&order).await {
            warn!(%collection, "writing back the compacted order failed: {err}");
        }
    }
    Ok(list)
}
