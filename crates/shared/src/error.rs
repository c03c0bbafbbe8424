use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    Internal,
    #[serde(other)]
    Unknown,
}

/// Error body returned by the menu service on non-success responses.
///
/// Only used for log context; every non-200 response is a failure whether or
/// not a body could be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default = "unknown_code")]
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

fn unknown_code() -> ErrorCode {
    ErrorCode::Unknown
}

impl ApiErrorBody {
    /// Parses a response body, returning `None` for empty or foreign bodies.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            return None;
        }
        serde_json::from_str(raw).ok()
    }
}
