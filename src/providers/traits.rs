use async_trait::async_trait;

use super::types::{GatewayError, ResponderRequest};

/// The AI endpoint, treated as a plain request/response service.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Returns the reply text, possibly empty.
    async fn respond(&self, request: ResponderRequest) -> Result<String, GatewayError>;
}
