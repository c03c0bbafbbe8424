use reqwest::StatusCode;
use shared::error::ApiErrorBody;
use thiserror::Error;

/// Everything that can go wrong between a controller and the menu service.
///
/// Controllers collapse all variants to a `false` outcome; the variant only
/// feeds logs and notifications.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("menu service answered {status}{}", describe_body(.body))]
    Status {
        status: StatusCode,
        body: Option<ApiErrorBody>,
    },
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no bearer token available: {0}")]
    MissingToken(String),
}

fn describe_body(body: &Option<ApiErrorBody>) -> String {
    match body {
        Some(body) if !body.message.is_empty() => format!(" ({:?}: {})", body.code, body.message),
        Some(body) => format!(" ({:?})", body.code),
        None => String::new(),
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
