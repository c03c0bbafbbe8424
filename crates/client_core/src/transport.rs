//! Remote menu service: the trait controllers talk to and its HTTP binding.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use shared::{
    domain::{Collection, RestaurantId},
    error::ApiErrorBody,
    protocol::ReorderRequest,
};
use tracing::debug;

use crate::error::{ApiError, ApiResult};

/// Persistence calls consumed by the controllers.
///
/// Bodies are already wrapped in their `{category|item|modifier: ...}`
/// envelope. Any non-200 answer is an error.
#[async_trait]
pub trait MenuApi: Send + Sync {
    async fn list(&self, collection: Collection) -> ApiResult<Value>;
    async fn create(&self, collection: Collection, body: Value) -> ApiResult<()>;
    async fn update(&self, collection: Collection, id: &str, body: Value) -> ApiResult<()>;
    async fn delete(&self, collection: Collection, id: &str) -> ApiResult<()>;
    async fn reorder_categories(&self, request: &ReorderRequest) -> ApiResult<()>;
}

/// Where the bearer token comes from. Auth itself is handled elsewhere.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_token(&self) -> ApiResult<String>;
}

pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn bearer_token(&self) -> ApiResult<String> {
        if self.0.trim().is_empty() {
            return Err(ApiError::MissingToken("configured token is empty".into()));
        }
        Ok(self.0.trim().to_string())
    }
}

/// Token persisted on local storage by the auth provider. Re-read on every
/// request so a refreshed token is picked up without restarting.
pub struct TokenFile(pub PathBuf);

#[async_trait]
impl TokenSource for TokenFile {
    async fn bearer_token(&self) -> ApiResult<String> {
        let raw = tokio::fs::read_to_string(&self.0).await.map_err(|err| {
            ApiError::MissingToken(format!("failed to read {}: {err}", self.0.display()))
        })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(ApiError::MissingToken(format!(
                "{} is empty",
                self.0.display()
            )));
        }
        Ok(token.to_string())
    }
}

pub struct HttpMenuApi {
    http: Client,
    server_url: String,
    restaurant_id: RestaurantId,
    token: Box<dyn TokenSource>,
}

impl HttpMenuApi {
    pub fn new(
        server_url: impl Into<String>,
        restaurant_id: RestaurantId,
        token: Box<dyn TokenSource>,
        timeout: Option<Duration>,
    ) -> ApiResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            restaurant_id,
            token,
        })
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!(
            "{}/menu/{}/{}",
            self.server_url,
            self.restaurant_id,
            collection.path_segment()
        )
    }

    fn entity_url(&self, collection: Collection, id: &str) -> String {
        format!("{}/{id}", self.collection_url(collection))
    }

    async fn send(&self, request: RequestBuilder) -> ApiResult<Response> {
        let token = self.token.bearer_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let raw = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status,
                body: ApiErrorBody::parse(&raw),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl MenuApi for HttpMenuApi {
    async fn list(&self, collection: Collection) -> ApiResult<Value> {
        let url = self.collection_url(collection);
        debug!(%url, "menu api: list");
        let response = self.send(self.http.get(url)).await?;
        Ok(response.json().await?)
    }

    async fn create(&self, collection: Collection, body: Value) -> ApiResult<()> {
        let url = self.collection_url(collection);
        debug!(%url, "menu api: create");
        self.send(self.http.post(url).json(&body)).await?;
        Ok(())
    }

    async fn update(&self, collection: Collection, id: &str, body: Value) -> ApiResult<()> {
        let url = self.entity_url(collection, id);
        debug!(%url, "menu api: update");
        self.send(self.http.put(url).json(&body)).await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> ApiResult<()> {
        let url = self.entity_url(collection, id);
        debug!(%url, "menu api: delete");
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn reorder_categories(&self, request: &ReorderRequest) -> ApiResult<()> {
        let url = format!("{}/order", self.collection_url(Collection::Categories));
        debug!(%url, entries = request.order.len(), "menu api: reorder categories");
        self.send(self.http.put(url).json(request)).await?;
        Ok(())
    }
}
