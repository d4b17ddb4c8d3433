use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{PlatformAdapter, check_delivery, id_string, verify_hmac_sha1};
use crate::error::{EngineError, Result};
use crate::models::db::Platform;
use crate::models::message::{ChatIdentity, IdentityShape, InboundMessage, Keyboard, ReplyTarget};

pub const MAX_MESSAGE_LENGTH: usize = 2000;
pub const MAX_QUICK_REPLIES: usize = 11;
const MAX_QUICK_REPLY_TITLE: usize = 20;
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

pub struct MessengerAdapter {
    http: reqwest::Client,
    api_base: String,
    page_token: String,
    app_secret: Option<String>,
    shape: IdentityShape,
}

impl MessengerAdapter {
    pub fn new(http: reqwest::Client, api_base: &str, page_token: &str, app_secret: Option<String>) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            page_token: page_token.to_string(),
            app_secret,
            shape: IdentityShape::ChatOnly,
        }
    }

    pub fn with_shape(mut self, shape: IdentityShape) -> Self {
        self.shape = shape;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2.6{}", self.api_base, path)
    }
}

#[async_trait]
impl PlatformAdapter for MessengerAdapter {
    fn platform(&self) -> Platform {
        Platform::Messenger
    }

    fn identity_shape(&self) -> IdentityShape {
        self.shape
    }

    fn max_message_length(&self) -> usize {
        MAX_MESSAGE_LENGTH
    }

    fn signature_header(&self) -> Option<&'static str> {
        Some(SIGNATURE_HEADER)
    }

    fn parse_inbound(&self, payload: &Value) -> Result<Vec<InboundMessage>> {
        let entries = payload
            .get("entry")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::MalformedPayload("messenger payload without entry".into()))?;

        let mut parsed = Vec::new();
        for event in entries
            .iter()
            .filter_map(|e| e.get("messaging").and_then(Value::as_array))
            .flatten()
        {
            let Some(message) = event.get("message") else {
                continue;
            };
            if message.get("is_echo").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            let Some(text) = message.get("text").and_then(Value::as_str) else {
                continue;
            };
            let sender = event
                .pointer("/sender/id")
                .and_then(id_string)
                .ok_or_else(|| EngineError::MalformedPayload("messenger event without sender".into()))?;
            let mid = message
                .get("mid")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    let ts = event.get("timestamp").and_then(id_string).unwrap_or_default();
                    format!("{sender}.{ts}")
                });

            parsed.push(InboundMessage {
                id: mid,
                platform: Platform::Messenger,
                command_text: text.to_string(),
                identity: ChatIdentity::new(sender.clone(), Some(sender.clone())),
                reply_to: ReplyTarget::new(sender, None),
                raw: message.clone(),
                envelope: event.clone(),
            });
        }
        Ok(parsed)
    }

    fn verify_signature(&self, signature: Option<&str>, body: &[u8]) -> Result<()> {
        let Some(secret) = &self.app_secret else {
            debug!("No Messenger app secret configured, skipping signature check");
            return Ok(());
        };
        let signature = signature
            .and_then(|s| s.strip_prefix("sha1="))
            .ok_or(EngineError::Signature)?;
        verify_hmac_sha1(secret, body, signature)
    }

    fn build_keyboard(&self, keyboard: Option<&Keyboard>) -> Value {
        match keyboard {
            Some(rows) => {
                let replies: Vec<Value> = rows
                    .iter()
                    .flatten()
                    .take(MAX_QUICK_REPLIES)
                    .map(|label| {
                        let title: String = label.chars().take(MAX_QUICK_REPLY_TITLE).collect();
                        json!({ "content_type": "text", "title": title, "payload": label })
                    })
                    .collect();
                Value::Array(replies)
            }
            None => Value::Null,
        }
    }

    async fn send_message(&self, target: &ReplyTarget, text: &str, keyboard: Option<&Keyboard>) -> Result<()> {
        let mut message = json!({ "text": text });
        let quick_replies = self.build_keyboard(keyboard);
        if !quick_replies.is_null() {
            message["quick_replies"] = quick_replies;
        }
        let response = self
            .http
            .post(self.url("/me/messages"))
            .query(&[("access_token", self.page_token.as_str())])
            .json(&json!({ "recipient": { "id": target.chat_id }, "message": message }))
            .send()
            .await
            .map_err(|e| EngineError::Delivery(format!("messenger send: {e}")))?;
        check_delivery(Platform::Messenger, response).await?;
        Ok(())
    }

    /// The callback URL itself is registered in the app dashboard; this
    /// subscribes or unsubscribes the page.
    async fn set_webhook(&self, url: Option<&str>) -> Result<()> {
        let request = match url {
            Some(_) => self.http.post(self.url("/me/subscribed_apps")),
            None => self.http.delete(self.url("/me/subscribed_apps")),
        };
        let response = request
            .query(&[("access_token", self.page_token.as_str())])
            .send()
            .await
            .map_err(|e| EngineError::Delivery(format!("messenger subscription: {e}")))?;
        check_delivery(Platform::Messenger, response).await?;
        info!(enabled = url.is_some(), "Messenger page subscription updated");
        Ok(())
    }
}
