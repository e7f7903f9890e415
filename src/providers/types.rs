use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponderRequest {
    pub message: String,
    pub conversation_id: String,
    pub user_id: String,
}

/// Body returned by the endpoint. A missing or null `response` reads as an
/// empty reply rather than a malformed one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponderReply {
    #[serde(default)]
    pub response: Option<String>,
}
