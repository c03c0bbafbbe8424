//! In-memory menu service used by controller tests.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use shared::{
    domain::{Category, CategoryId, Collection, MenuItem, Modifier, ModifierId, RestaurantId},
    protocol::ReorderRequest,
};
use tokio::sync::broadcast;

use crate::{
    entity::MenuScope,
    error::{ApiError, ApiResult},
    events::ClientEvent,
    transport::MenuApi,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    List(Collection),
    Create(Collection, Value),
    Update(Collection, String, Value),
    Delete(Collection, String),
    Reorder(ReorderRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FailKind {
    List,
    Create,
    Update,
    Delete,
    Reorder,
}

#[derive(Default)]
struct FakeState {
    categories: Vec<Value>,
    items: Vec<Value>,
    modifiers: Vec<Value>,
    calls: Vec<Call>,
    failing: HashSet<FailKind>,
    next_id: u64,
}

impl FakeState {
    fn list_mut(&mut self, collection: Collection) -> &mut Vec<Value> {
        match collection {
            Collection::Categories => &mut self.categories,
            Collection::Items => &mut self.items,
            Collection::Modifiers => &mut self.modifiers,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeMenuApi {
    state: Mutex<FakeState>,
}

impl FakeMenuApi {
    pub(crate) fn with_categories(categories: &[Category]) -> Arc<Self> {
        let api = Self::default();
        api.seed_categories(categories);
        Arc::new(api)
    }

    pub(crate) fn seed_categories(&self, categories: &[Category]) {
        self.state.lock().expect("fake state").categories = categories
            .iter()
            .map(|category| serde_json::to_value(category).expect("encode"))
            .collect();
    }

    pub(crate) fn seed_items(&self, items: &[MenuItem]) {
        self.state.lock().expect("fake state").items = items
            .iter()
            .map(|item| serde_json::to_value(item).expect("encode"))
            .collect();
    }

    pub(crate) fn seed_modifiers(&self, modifiers: &[Modifier]) {
        self.state.lock().expect("fake state").modifiers = modifiers
            .iter()
            .map(|modifier| serde_json::to_value(modifier).expect("encode"))
            .collect();
    }

    pub(crate) fn set_failing(&self, kind: FailKind, failing: bool) {
        let mut state = self.state.lock().expect("fake state");
        if failing {
            state.failing.insert(kind);
        } else {
            state.failing.remove(&kind);
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().expect("fake state").calls.clone()
    }

    /// Calls other than list refetches.
    pub(crate) fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::List(_)))
            .collect()
    }

    pub(crate) fn server_categories(&self) -> Vec<Category> {
        let state = self.state.lock().expect("fake state");
        state
            .categories
            .iter()
            .map(|value| serde_json::from_value(value.clone()).expect("decode"))
            .collect()
    }

    fn begin(&self, call: Call, kind: FailKind) -> ApiResult<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().expect("fake state");
        state.calls.push(call);
        if state.failing.contains(&kind) {
            return Err(rejected(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(state)
    }
}

fn rejected(status: StatusCode) -> ApiError {
    ApiError::Status { status, body: None }
}

#[async_trait]
impl MenuApi for FakeMenuApi {
    async fn list(&self, collection: Collection) -> ApiResult<Value> {
        let mut state = self.begin(Call::List(collection), FailKind::List)?;
        Ok(Value::Array(state.list_mut(collection).clone()))
    }

    async fn create(&self, collection: Collection, body: Value) -> ApiResult<()> {
        let mut state = self.begin(Call::Create(collection, body.clone()), FailKind::Create)?;
        let mut entity = body
            .get(collection.envelope_key())
            .cloned()
            .ok_or_else(|| rejected(StatusCode::BAD_REQUEST))?;
        state.next_id += 1;
        let id = format!("srv-{}", state.next_id);
        entity["_id"] = json!(id);
        state.list_mut(collection).push(entity);
        Ok(())
    }

    async fn update(&self, collection: Collection, id: &str, body: Value) -> ApiResult<()> {
        let mut state = self.begin(
            Call::Update(collection, id.to_string(), body.clone()),
            FailKind::Update,
        )?;
        let mut entity = body
            .get(collection.envelope_key())
            .cloned()
            .ok_or_else(|| rejected(StatusCode::BAD_REQUEST))?;
        entity["_id"] = json!(id);
        let list = state.list_mut(collection);
        let slot = list
            .iter_mut()
            .find(|existing| existing["_id"] == json!(id))
            .ok_or_else(|| rejected(StatusCode::NOT_FOUND))?;
        *slot = entity;
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> ApiResult<()> {
        let mut state = self.begin(Call::Delete(collection, id.to_string()), FailKind::Delete)?;
        let list = state.list_mut(collection);
        let before = list.len();
        list.retain(|existing| existing["_id"] != json!(id));
        if list.len() == before {
            return Err(rejected(StatusCode::NOT_FOUND));
        }
        Ok(())
    }

    async fn reorder_categories(&self, request: &ReorderRequest) -> ApiResult<()> {
        let mut state = self.begin(Call::Reorder(request.clone()), FailKind::Reorder)?;
        for entry in &request.order {
            if let Some(category) = state
                .categories
                .iter_mut()
                .find(|category| category["_id"] == json!(entry.id))
            {
                category["index"] = json!(entry.index);
            }
        }
        state
            .categories
            .sort_by_key(|category| category["index"].as_u64().unwrap_or(u64::MAX));
        Ok(())
    }
}

pub(crate) fn category(id: &str, name: &str, index: usize) -> Category {
    Category {
        id: CategoryId::from(id),
        name: name.to_string(),
        description: format!("{name} description"),
        index,
        restaurant_id: None,
        menu_id: None,
    }
}

pub(crate) fn categories(ids: &[&str]) -> Vec<Category> {
    ids.iter()
        .enumerate()
        .map(|(index, id)| category(id, &id.to_uppercase(), index))
        .collect()
}

pub(crate) fn item(id: &str, category: &str, modifiers: &[&str]) -> MenuItem {
    MenuItem {
        id: id.into(),
        name: format!("item {id}"),
        description: String::new(),
        price: 4.5,
        category: CategoryId::from(category),
        modifiers: modifiers.iter().map(|id| ModifierId::from(*id)).collect(),
        image: None,
        available: true,
    }
}

pub(crate) fn scope() -> MenuScope {
    MenuScope {
        restaurant_id: RestaurantId::from("resto-1"),
        menu_id: Some("menu-1".into()),
    }
}

pub(crate) fn events() -> broadcast::Sender<ClientEvent> {
    broadcast::channel(64).0
}

pub(crate) fn ids(categories: &[Category]) -> Vec<&str> {
    categories.iter().map(|category| category.id.as_str()).collect()
}

pub(crate) fn indices(categories: &[Category]) -> Vec<usize> {
    categories.iter().map(|category| category.index).collect()
}
