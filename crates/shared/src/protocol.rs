use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{
    Addition, Category, CategoryId, Collection, MenuId, MenuItem, Modifier, ModifierId,
    RestaurantId,
};

/// One entry of a reorder payload: the entity id and its new dense position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub order: Vec<ReorderEntry>,
}

/// Create/update body of a category; never carries `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDraft {
    pub name: String,
    pub description: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<RestaurantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_id: Option<MenuId>,
}

impl From<&Category> for CategoryDraft {
    fn from(value: &Category) -> Self {
        Self {
            name: value.name.clone(),
            description: value.description.clone(),
            index: value.index,
            restaurant_id: value.restaurant_id.clone(),
            menu_id: value.menu_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifierDraft {
    pub name: String,
    pub required: bool,
    pub multiple: bool,
    pub options: Vec<Addition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_days_available: Option<Vec<u8>>,
}

impl From<&Modifier> for ModifierDraft {
    fn from(value: &Modifier) -> Self {
        Self {
            name: value.name.clone(),
            required: value.required,
            multiple: value.multiple,
            options: value.options.clone(),
            max: value.max,
            index_days_available: value.index_days_available.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDraft {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub category: CategoryId,
    pub modifiers: Vec<ModifierId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub available: bool,
}

impl From<&MenuItem> for ItemDraft {
    fn from(value: &MenuItem) -> Self {
        Self {
            name: value.name.clone(),
            description: value.description.clone(),
            price: value.price,
            category: value.category.clone(),
            modifiers: value.modifiers.clone(),
            image: value.image.clone(),
            available: value.available,
        }
    }
}

/// Wraps a body under the collection's singular key, e.g. `{"category": {...}}`.
pub fn envelope<T: Serialize>(collection: Collection, body: &T) -> serde_json::Result<Value> {
    let mut map = Map::new();
    map.insert(
        collection.envelope_key().to_string(),
        serde_json::to_value(body)?,
    );
    Ok(Value::Object(map))
}

/// Decodes a list response. The service answers either with a bare array or
/// with the array under the collection's plural key.
pub fn decode_list<T: DeserializeOwned>(
    collection: Collection,
    body: Value,
) -> serde_json::Result<Vec<T>> {
    match body {
        Value::Array(_) => serde_json::from_value(body),
        Value::Object(mut map) => match map.remove(collection.path_segment()) {
            Some(inner) => serde_json::from_value(inner),
            None => Err(serde::de::Error::custom(format!(
                "list response for {collection} has no '{}' field",
                collection.path_segment()
            ))),
        },
        other => Err(serde::de::Error::custom(format!(
            "unexpected list response for {collection}: {other}"
        ))),
    }
}
