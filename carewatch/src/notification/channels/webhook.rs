//! HTTP gateway sender.
//!
//! Posts each message as JSON to a delivery gateway that fans out to the real
//! SMS/push/email/voice providers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::ChannelSender;
use crate::http::build_client;
use crate::domain::{DeliveryChannel, DeliveryFault, SendReceipt};
use crate::notification::template::RenderedMessage;

/// Response header carrying the provider message id.
const MESSAGE_ID_HEADER: &str = "x-message-id";

/// Webhook gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Gateway URL.
    pub url: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication type.
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    15
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

/// Sender that delegates to an HTTP delivery gateway.
pub struct WebhookSender {
    config: WebhookConfig,
    client: Client,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> crate::Result<Self> {
        if config.url.trim().is_empty() {
            return Err(crate::Error::config("webhook url is empty"));
        }
        let client = build_client(Duration::from_secs(config.timeout_secs))
            .map_err(|e| crate::Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {}", token).parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, value);
                }
            }
            // Basic auth goes through the request builder.
            Some(WebhookAuth::Basic { .. }) | None => {}
        }

        headers
    }

    fn build_payload(
        channel: DeliveryChannel,
        address: &str,
        message: &RenderedMessage,
    ) -> serde_json::Value {
        json!({
            "channel": channel.as_str(),
            "address": address,
            "title": message.title,
            "body": message.body,
        })
    }
}

/// Map a non-success gateway status onto a fault.
pub(crate) fn classify_status(status: StatusCode, detail: &str) -> DeliveryFault {
    let message = if detail.is_empty() {
        format!("gateway returned {}", status)
    } else {
        format!("gateway returned {}: {}", status, detail)
    };
    let fault = match status.as_u16() {
        400 | 403 | 404 | 410 | 422 => DeliveryFault::permanent(message),
        _ => DeliveryFault::transient(message),
    };
    fault.with_code(status.as_u16().to_string())
}

/// Pull the provider message id out of a gateway response.
fn external_id(headers: &HeaderMap, body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message_id").and_then(|id| id.as_str()).map(str::to_string))
        .or_else(|| {
            headers
                .get(MESSAGE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        message: &RenderedMessage,
    ) -> std::result::Result<SendReceipt, DeliveryFault> {
        let payload = Self::build_payload(channel, address, message);
        let mut request = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&payload);

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryFault::timeout(format!("gateway request timed out: {}", e))
            } else {
                DeliveryFault::transient(format!("gateway request failed: {}", e))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(channel = %channel, status = %status, "Gateway rejected delivery");
            return Err(classify_status(status, body.trim()));
        }

        let external_message_id = external_id(&headers, &body);
        debug!(channel = %channel, message_id = ?external_message_id, "Gateway accepted delivery");
        Ok(SendReceipt {
            external_message_id,
            provider_response_code: Some(status.as_u16().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FaultKind;

    fn sender(auth: Option<WebhookAuth>) -> WebhookSender {
        WebhookSender::new(WebhookConfig {
            url: "https://gateway.example.com/send".to_string(),
            headers: vec![("X-Tenant".to_string(), "care".to_string())],
            auth,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_empty_url_is_rejected() {
        assert!(WebhookSender::new(WebhookConfig::default()).is_err());
    }

    #[test]
    fn test_build_headers_with_bearer() {
        let headers = sender(Some(WebhookAuth::Bearer {
            token: "secret".to_string(),
        }))
        .build_headers();
        assert_eq!(headers[reqwest::header::AUTHORIZATION], "Bearer secret");
        assert_eq!(headers["x-tenant"], "care");
    }

    #[test]
    fn test_build_headers_with_custom_auth_header() {
        let headers = sender(Some(WebhookAuth::Header {
            name: "X-Api-Key".to_string(),
            value: "k".to_string(),
        }))
        .build_headers();
        assert_eq!(headers["x-api-key"], "k");
        assert!(!headers.contains_key(reqwest::header::AUTHORIZATION));
    }

    #[test]
    fn test_build_payload() {
        let payload = WebhookSender::build_payload(
            DeliveryChannel::InApp,
            "user-7",
            &RenderedMessage::new("Fall", "Fall detected"),
        );
        assert_eq!(payload["channel"], "IN_APP");
        assert_eq!(payload["address"], "user-7");
        assert_eq!(payload["body"], "Fall detected");
    }

    #[test]
    fn test_classify_status() {
        for code in [400u16, 403, 404, 410, 422] {
            let fault = classify_status(StatusCode::from_u16(code).unwrap(), "");
            assert_eq!(fault.kind, FaultKind::Permanent, "status {}", code);
            assert_eq!(fault.code, Some(code.to_string()));
        }
        for code in [401u16, 408, 429, 500, 503] {
            let fault = classify_status(StatusCode::from_u16(code).unwrap(), "busy");
            assert_eq!(fault.kind, FaultKind::Transient, "status {}", code);
            assert!(fault.message.ends_with("busy"));
        }
    }

    #[test]
    fn test_external_id_prefers_body() {
        let mut headers = HeaderMap::new();
        headers.insert(MESSAGE_ID_HEADER, "hdr-1".parse().unwrap());
        assert_eq!(
            external_id(&headers, r#"{"message_id":"body-1"}"#).as_deref(),
            Some("body-1")
        );
        assert_eq!(external_id(&headers, "accepted").as_deref(), Some("hdr-1"));
        assert_eq!(external_id(&HeaderMap::new(), ""), None);
    }
}
