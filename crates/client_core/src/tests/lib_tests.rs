use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde_json::json;
use shared::domain::{ModifierId, RestaurantId};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;
use crate::test_support::{categories, category, indices, scope, Call, FakeMenuApi};

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    authorization: Option<String>,
    body: Option<Value>,
}

#[derive(Default)]
struct MenuServer {
    collections: HashMap<String, Vec<Value>>,
    requests: Vec<Recorded>,
    fail_with: Option<(StatusCode, Value)>,
    next_id: u64,
}

#[derive(Clone, Default)]
struct MenuServerState {
    inner: Arc<Mutex<MenuServer>>,
}

impl MenuServerState {
    async fn seed(&self, collection: &str, entities: Vec<Value>) {
        self.inner
            .lock()
            .await
            .collections
            .insert(collection.to_string(), entities);
    }

    async fn fail_with(&self, status: StatusCode, body: Value) {
        self.inner.lock().await.fail_with = Some((status, body));
    }

    async fn recover(&self) {
        self.inner.lock().await.fail_with = None;
    }

    async fn requests(&self) -> Vec<Recorded> {
        self.inner.lock().await.requests.clone()
    }

    async fn writes(&self) -> Vec<Recorded> {
        self.requests()
            .await
            .into_iter()
            .filter(|request| request.method != Method::GET)
            .collect()
    }

    async fn names(&self, collection: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .collections
            .get(collection)
            .map(|entities| {
                entities
                    .iter()
                    .map(|entity| entity["name"].as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn failure(server: &MenuServer) -> Option<Response> {
    server
        .fail_with
        .clone()
        .map(|(status, body)| (status, Json(body)).into_response())
}

fn record(server: &mut MenuServer, method: Method, uri: &Uri, headers: &HeaderMap, body: &Bytes) {
    server.requests.push(Recorded {
        method,
        path: uri.path().to_string(),
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(body).ok(),
    });
}

fn envelope_key(collection: &str) -> &'static str {
    collection
        .parse::<Collection>()
        .map(Collection::envelope_key)
        .unwrap_or("unknown")
}

async fn list_handler(
    State(state): State<MenuServerState>,
    Path((_rid, collection)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let mut server = state.inner.lock().await;
    record(&mut server, method, &uri, &headers, &Bytes::new());
    if let Some(response) = failure(&server) {
        return response;
    }
    let list = server.collections.get(&collection).cloned().unwrap_or_default();
    // Categories come wrapped, the other collections as a bare array.
    if collection == "categories" {
        Json(json!({ "categories": list })).into_response()
    } else {
        Json(Value::Array(list)).into_response()
    }
}

async fn create_handler(
    State(state): State<MenuServerState>,
    Path((_rid, collection)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut server = state.inner.lock().await;
    record(&mut server, method, &uri, &headers, &body);
    if let Some(response) = failure(&server) {
        return response;
    }
    let parsed: Value = serde_json::from_slice(&body).unwrap_or_default();
    let Some(mut entity) = parsed.get(envelope_key(&collection)).cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    server.next_id += 1;
    entity["_id"] = json!(format!("{collection}-{}", server.next_id));
    server
        .collections
        .entry(collection)
        .or_default()
        .push(entity.clone());
    Json(entity).into_response()
}

async fn entity_handler(
    State(state): State<MenuServerState>,
    Path((_rid, collection, id)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut server = state.inner.lock().await;
    record(&mut server, method.clone(), &uri, &headers, &body);
    if let Some(response) = failure(&server) {
        return response;
    }
    let parsed: Value = serde_json::from_slice(&body).unwrap_or_default();
    let list = server.collections.entry(collection.clone()).or_default();

    if method == Method::PUT && collection == "categories" && id == "order" {
        for entry in parsed["order"].as_array().cloned().unwrap_or_default() {
            if let Some(category) = list.iter_mut().find(|c| c["_id"] == entry["_id"]) {
                category["index"] = entry["index"].clone();
            }
        }
        list.sort_by_key(|category| category["index"].as_u64().unwrap_or(u64::MAX));
        return Json(json!({ "ok": true })).into_response();
    }

    let Some(position) = list.iter().position(|entity| entity["_id"] == json!(id)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": "not_found", "message": "no such entity" })),
        )
            .into_response();
    };
    if method == Method::DELETE {
        list.remove(position);
        return Json(json!({ "ok": true })).into_response();
    }
    let Some(mut entity) = parsed.get(envelope_key(&collection)).cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    entity["_id"] = json!(id);
    list[position] = entity.clone();
    Json(entity).into_response()
}

async fn spawn_menu_server() -> Result<(String, MenuServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = MenuServerState::default();
    let app = Router::new()
        .route(
            "/menu/:rid/:collection",
            get(list_handler).post(create_handler),
        )
        .route(
            "/menu/:rid/:collection/:id",
            put(entity_handler).delete(entity_handler),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn http_api(server_url: &str, token: Box<dyn TokenSource>) -> HttpMenuApi {
    HttpMenuApi::new(
        server_url,
        RestaurantId::from("resto-1"),
        token,
        Some(Duration::from_secs(5)),
    )
    .expect("http client")
}

fn static_token(token: &str) -> Box<dyn TokenSource> {
    Box::new(StaticToken(token.to_string()))
}

fn seeded_categories() -> Vec<Value> {
    vec![
        json!({"_id": "starters", "name": "Starters", "description": "", "index": 0}),
        json!({"_id": "drinks", "name": "Drinks", "description": "Cold", "index": 1}),
        json!({"_id": "desserts", "name": "Desserts", "description": "", "index": 2}),
    ]
}

fn client_config() -> ClientConfig {
    ClientConfig {
        scope: scope(),
        undo: UndoPolicy::default(),
    }
}

fn category_names(client: &MenuClient) -> Vec<String> {
    client
        .store()
        .categories()
        .into_iter()
        .map(|category| category.name)
        .collect()
}

async fn next_notification(rx: &mut broadcast::Receiver<ClientEvent>) -> Notification {
    loop {
        match rx.recv().await.expect("event") {
            ClientEvent::Notification(notification) => return notification,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn http_api_uses_bearer_token_paths_and_envelopes() {
    let (server_url, server) = spawn_menu_server().await.expect("spawn server");
    server.seed("categories", seeded_categories()).await;
    let api = http_api(&server_url, static_token("secret"));

    let listed = api.list(Collection::Categories).await.expect("list");
    let decoded: Vec<Category> =
        protocol::decode_list(Collection::Categories, listed).expect("decode");
    assert_eq!(decoded.len(), 3);

    api.create(
        Collection::Categories,
        json!({"category": {"name": "Mains", "description": "", "index": 3}}),
    )
    .await
    .expect("create");
    api.update(
        Collection::Categories,
        "drinks",
        json!({"category": {"name": "Beverages", "description": "Cold", "index": 1}}),
    )
    .await
    .expect("update");
    api.delete(Collection::Categories, "starters")
        .await
        .expect("delete");

    let requests = server.requests().await;
    let summary: Vec<(Method, &str)> = requests
        .iter()
        .map(|request| (request.method.clone(), request.path.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Method::GET, "/menu/resto-1/categories"),
            (Method::POST, "/menu/resto-1/categories"),
            (Method::PUT, "/menu/resto-1/categories/drinks"),
            (Method::DELETE, "/menu/resto-1/categories/starters"),
        ]
    );
    assert!(requests
        .iter()
        .all(|request| request.authorization.as_deref() == Some("Bearer secret")));
    assert_eq!(
        server.names("categories").await,
        vec!["Beverages", "Desserts", "Mains"]
    );
}

#[tokio::test]
async fn reorder_puts_the_full_order() {
    let (server_url, server) = spawn_menu_server().await.expect("spawn server");
    server.seed("categories", seeded_categories()).await;
    let api = http_api(&server_url, static_token("secret"));

    let request = protocol::ReorderRequest {
        order: vec![
            protocol::ReorderEntry {
                id: "desserts".into(),
                index: 0,
            },
            protocol::ReorderEntry {
                id: "starters".into(),
                index: 1,
            },
            protocol::ReorderEntry {
                id: "drinks".into(),
                index: 2,
            },
        ],
    };
    api.reorder_categories(&request).await.expect("reorder");

    let writes = server.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].method, Method::PUT);
    assert_eq!(writes[0].path, "/menu/resto-1/categories/order");
    assert_eq!(
        writes[0].body,
        Some(json!({"order": [
            {"_id": "desserts", "index": 0},
            {"_id": "starters", "index": 1},
            {"_id": "drinks", "index": 2}
        ]}))
    );
    assert_eq!(
        server.names("categories").await,
        vec!["Desserts", "Starters", "Drinks"]
    );
}

#[tokio::test]
async fn any_non_ok_status_is_a_failure() {
    let (server_url, server) = spawn_menu_server().await.expect("spawn server");
    let api = http_api(&server_url, static_token("secret"));

    server
        .fail_with(
            StatusCode::CONFLICT,
            json!({"code": "conflict", "message": "stale order"}),
        )
        .await;
    match api.list(Collection::Items).await {
        Err(ApiError::Status { status, body }) => {
            assert_eq!(status, StatusCode::CONFLICT);
            let body = body.expect("error body");
            assert_eq!(body.code, shared::error::ErrorCode::Conflict);
            assert_eq!(body.message, "stale order");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    server.fail_with(StatusCode::CREATED, json!({})).await;
    let created = api
        .create(Collection::Items, json!({"item": {"name": "x"}}))
        .await;
    assert!(matches!(
        created,
        Err(ApiError::Status { status, .. }) if status == StatusCode::CREATED
    ));
}

#[tokio::test]
async fn empty_token_fails_before_any_request() {
    let (server_url, server) = spawn_menu_server().await.expect("spawn server");
    let api = http_api(&server_url, static_token("   "));

    let result = api.list(Collection::Categories).await;
    assert!(matches!(result, Err(ApiError::MissingToken(_))));
    assert!(server.requests().await.is_empty());
}

#[tokio::test]
async fn token_file_is_read_on_every_request() {
    let (server_url, server) = spawn_menu_server().await.expect("spawn server");
    let path = std::env::temp_dir().join(format!("menu-token-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, "first\n").expect("write token");
    let api = http_api(&server_url, Box::new(TokenFile(path.clone())));

    api.list(Collection::Modifiers).await.expect("first list");
    std::fs::write(&path, "second").expect("rewrite token");
    api.list(Collection::Modifiers).await.expect("second list");
    std::fs::remove_file(&path).expect("remove token");

    let tokens: Vec<_> = server
        .requests()
        .await
        .into_iter()
        .map(|request| request.authorization)
        .collect();
    assert_eq!(
        tokens,
        vec![Some("Bearer first".to_string()), Some("Bearer second".to_string())]
    );

    let missing = api.list(Collection::Modifiers).await;
    assert!(matches!(missing, Err(ApiError::MissingToken(_))));
}

#[tokio::test]
async fn client_moves_deletes_and_undoes_against_the_service() {
    let (server_url, server) = spawn_menu_server().await.expect("spawn server");
    server.seed("categories", seeded_categories()).await;
    let client = MenuClient::new(
        Arc::new(http_api(&server_url, static_token("secret"))),
        client_config(),
    );
    let mut rx = client.subscribe_events();

    assert!(client.refresh_all().await);
    assert_eq!(category_names(&client), vec!["Starters", "Drinks", "Desserts"]);

    assert!(
        client
            .move_category(MoveInstruction::Drag { from: 2, to: 0 })
            .await
    );
    assert_eq!(category_names(&client), vec!["Desserts", "Starters", "Drinks"]);
    assert_eq!(
        server.names("categories").await,
        vec!["Desserts", "Starters", "Drinks"]
    );

    assert!(client.delete(Collection::Categories, "drinks").await);
    assert_eq!(category_names(&client), vec!["Desserts", "Starters"]);
    let notification = next_notification(&mut rx).await;
    assert_eq!(notification.level, NotificationLevel::Success);
    let action = notification.action.expect("undo action");

    assert!(client.perform(action).await);
    assert_eq!(category_names(&client), vec!["Desserts", "Starters", "Drinks"]);
    assert_eq!(
        client.undo_phase(Collection::Categories, "drinks"),
        Some(UndoPhase::Restored)
    );

    let writes = server.writes().await;
    let recreate = writes
        .iter()
        .find(|request| request.method == Method::POST)
        .and_then(|request| request.body.clone())
        .expect("create request");
    assert!(recreate["category"].get("_id").is_none());
    assert_eq!(recreate["category"]["name"], "Drinks");
    assert_eq!(recreate["category"]["description"], "Cold");
    assert_eq!(recreate["category"]["restaurantId"], "resto-1");
}

#[tokio::test]
async fn failed_reorder_rolls_back_and_retries_from_the_notification() {
    let (server_url, server) = spawn_menu_server().await.expect("spawn server");
    server.seed("categories", seeded_categories()).await;
    let client = MenuClient::new(
        Arc::new(http_api(&server_url, static_token("secret"))),
        client_config(),
    );
    assert!(client.refresh(Collection::Categories).await);
    let mut rx = client.subscribe_events();

    server
        .fail_with(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"code": "internal", "message": "boom"}),
        )
        .await;
    assert!(
        !client
            .move_category(MoveInstruction::Step {
                position: 0,
                direction: Direction::Down,
            })
            .await
    );
    assert_eq!(category_names(&client), vec!["Starters", "Drinks", "Desserts"]);
    assert!(matches!(
        rx.recv().await.expect("event"),
        ClientEvent::RolledBack {
            collection: Collection::Categories,
            ..
        }
    ));
    let notification = next_notification(&mut rx).await;
    assert_eq!(notification.level, NotificationLevel::Error);
    let Some(NotificationAction::Retry(target)) = notification.action else {
        panic!("expected a retry action");
    };
    assert_eq!(client.failed_operations().len(), 1);

    server.recover().await;
    assert!(client.retry(target).await);
    assert_eq!(category_names(&client), vec!["Drinks", "Starters", "Desserts"]);
    assert!(client.failed_operations().is_empty());

    let orders: Vec<_> = server
        .writes()
        .await
        .into_iter()
        .filter(|request| request.path.ends_with("/categories/order"))
        .map(|request| request.body)
        .collect();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0], orders[1]);
}

#[tokio::test]
async fn background_move_updates_store_before_confirmation() {
    let api = FakeMenuApi::with_categories(&categories(&["a", "b", "c"]));
    let client = MenuClient::new(api.clone(), client_config());
    assert!(client.refresh(Collection::Categories).await);

    let handle = client
        .move_category_in_background(MoveInstruction::Drag { from: 0, to: 2 })
        .expect("staged");
    assert_eq!(category_names(&client), vec!["B", "C", "A"]);
    assert!(handle.await.expect("join"));
    assert!(matches!(api.writes().as_slice(), [Call::Reorder(_)]));

    assert!(client
        .move_category_in_background(MoveInstruction::Step {
            position: 0,
            direction: Direction::Up,
        })
        .is_none());
}

#[tokio::test]
async fn items_need_a_loaded_category() {
    let api = FakeMenuApi::with_categories(&categories(&["mains"]));
    let client = MenuClient::new(api.clone(), client_config());
    assert!(client.refresh(Collection::Categories).await);

    let draft = |category: &str| ItemDraft {
        name: "Burger".into(),
        description: String::new(),
        price: 9.5,
        category: CategoryId::from(category),
        modifiers: vec![ModifierId::from("sauces")],
        image: None,
        available: true,
    };

    assert!(!client.create_item(draft("Mains")).await);
    assert!(api.writes().is_empty());

    assert!(client.create_item(draft("mains")).await);
    match api.writes().as_slice() {
        [Call::Create(Collection::Items, body)] => {
            assert_eq!(body["item"]["category"], "mains");
            assert_eq!(body["item"]["modifiers"], json!(["sauces"]));
        }
        other => panic!("unexpected calls: {other:?}"),
    }
    assert_eq!(client.store().items().len(), 1);
}

#[tokio::test]
async fn create_category_appends_with_scope() {
    let api = FakeMenuApi::with_categories(&categories(&["a", "b"]));
    let client = MenuClient::new(api.clone(), client_config());
    assert!(client.refresh(Collection::Categories).await);

    assert!(client.create_category("Specials", "Today only").await);
    match api.writes().as_slice() {
        [Call::Create(Collection::Categories, body)] => {
            assert_eq!(body["category"]["index"], 2);
            assert_eq!(body["category"]["restaurantId"], "resto-1");
            assert_eq!(body["category"]["menuId"], "menu-1");
        }
        other => panic!("unexpected calls: {other:?}"),
    }
    assert_eq!(category_names(&client), vec!["A", "B", "Specials"]);
}

#[tokio::test]
async fn category_indices_stay_dense_through_delete_move_undo_and_create() {
    let api = FakeMenuApi::with_categories(&[
        category("starters", "Starters", 0),
        category("drinks", "Drinks", 1),
        category("desserts", "Desserts", 2),
    ]);
    let client = MenuClient::new(api.clone(), client_config());
    assert!(client.refresh(Collection::Categories).await);

    assert!(client.delete(Collection::Categories, "drinks").await);
    assert_eq!(indices(&client.store().categories()), vec![0, 1]);

    assert!(
        client
            .move_category(MoveInstruction::Step {
                position: 1,
                direction: Direction::Up,
            })
            .await
    );
    assert_eq!(category_names(&client), vec!["Desserts", "Starters"]);

    assert!(client.undo(Collection::Categories, "drinks").await);
    assert_eq!(category_names(&client), vec!["Desserts", "Starters", "Drinks"]);
    assert_eq!(indices(&client.store().categories()), vec![0, 1, 2]);

    assert!(client.create_category("Specials", "").await);
    assert_eq!(
        category_names(&client),
        vec!["Desserts", "Starters", "Drinks", "Specials"]
    );
    assert_eq!(indices(&client.store().categories()), vec![0, 1, 2, 3]);
    assert_eq!(indices(&api.server_categories()), vec![0, 1, 2, 3]);
}
