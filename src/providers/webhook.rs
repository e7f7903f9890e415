use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::providers::traits::Responder;
use crate::providers::types::{GatewayError, ResponderReply, ResponderRequest};

const ERROR_BODY_PREVIEW: usize = 200;

/// Posts each user message as JSON to a webhook and reads `{"response": ...}` back.
pub struct WebhookResponder {
    client: Client,
    endpoint: Url,
}

impl WebhookResponder {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        let body = body.trim();
        if body.is_empty() {
            return format!("HTTP {}: Request failed", status.as_u16());
        }
        let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
        format!("HTTP {}: {}", status.as_u16(), preview)
    }

    fn parse_reply(body: &str) -> Result<String, GatewayError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        if !value.is_object() {
            return Err(GatewayError::InvalidResponse(
                "Expected a JSON object".to_string(),
            ));
        }
        let reply: ResponderReply = serde_json::from_value(value)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok(reply.response.unwrap_or_default())
    }
}

#[async_trait]
impl Responder for WebhookResponder {
    async fn respond(&self, request: ResponderRequest) -> Result<String, GatewayError> {
        tracing::debug!(
            conversation_id = %request.conversation_id,
            endpoint = %self.endpoint,
            "Sending message to responder"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        Self::parse_reply(&body)
    }
}
