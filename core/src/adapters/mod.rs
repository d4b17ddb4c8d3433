//! Chat platform adapters: inbound normalization, signature checks and the
//! outbound send API for each supported platform.

pub mod kik;
pub mod messenger;
pub mod telegram;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::models::db::{Platform, PlatformBinding};
use crate::models::message::{IdentityShape, InboundMessage, Keyboard, ReplyTarget};

pub use kik::KikAdapter;
pub use messenger::MessengerAdapter;
pub use telegram::TelegramAdapter;

type HmacSha1 = Hmac<Sha1>;

/// Base URLs of the platform APIs. Overridable so tests can point adapters
/// at a mock server.
#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    pub telegram: String,
    pub kik: String,
    pub messenger: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            telegram: "https://api.telegram.org".to_string(),
            kik: "https://api.kik.com".to_string(),
            messenger: "https://graph.facebook.com".to_string(),
        }
    }
}

impl ApiEndpoints {
    /// Points every platform at the same base URL.
    pub fn all(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            telegram: base.clone(),
            kik: base.clone(),
            messenger: base,
        }
    }
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Which identity components key the ChatState on this platform.
    fn identity_shape(&self) -> IdentityShape;

    fn max_message_length(&self) -> usize;

    /// Request header carrying the webhook signature, if the platform signs.
    fn signature_header(&self) -> Option<&'static str> {
        None
    }

    /// Normalizes a webhook payload into text messages. Non-text events are
    /// skipped; a payload of the wrong shape is `MalformedPayload`.
    fn parse_inbound(&self, payload: &Value) -> Result<Vec<InboundMessage>>;

    fn verify_signature(&self, _signature: Option<&str>, _body: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Platform-native keyboard markup. `None` removes a previous keyboard
    /// where the platform supports it.
    fn build_keyboard(&self, keyboard: Option<&Keyboard>) -> Value;

    async fn send_message(&self, target: &ReplyTarget, text: &str, keyboard: Option<&Keyboard>) -> Result<()>;

    /// Registers `url` as the webhook, or removes it when `None`.
    async fn set_webhook(&self, url: Option<&str>) -> Result<()>;
}

/// Builds the adapter for a binding.
pub trait AdapterFactory: Send + Sync {
    fn adapter(&self, binding: &PlatformBinding) -> Box<dyn PlatformAdapter>;
}

pub struct HttpAdapterFactory {
    http: reqwest::Client,
    endpoints: ApiEndpoints,
    identity_override: Option<IdentityShape>,
    messenger_app_secret: Option<String>,
}

impl HttpAdapterFactory {
    pub fn new(http: reqwest::Client, endpoints: ApiEndpoints) -> Self {
        Self {
            http,
            endpoints,
            identity_override: None,
            messenger_app_secret: None,
        }
    }

    pub fn with_identity_override(mut self, shape: Option<IdentityShape>) -> Self {
        self.identity_override = shape;
        self
    }

    pub fn with_messenger_app_secret(mut self, secret: Option<String>) -> Self {
        self.messenger_app_secret = secret;
        self
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn adapter(&self, binding: &PlatformBinding) -> Box<dyn PlatformAdapter> {
        match binding.platform {
            Platform::Telegram => Box::new(
                TelegramAdapter::new(self.http.clone(), &self.endpoints.telegram, &binding.token)
                    .with_shape(self.identity_override.unwrap_or(IdentityShape::ChatAndUser)),
            ),
            Platform::Kik => Box::new(
                KikAdapter::new(
                    self.http.clone(),
                    &self.endpoints.kik,
                    binding.username.as_deref().unwrap_or_default(),
                    &binding.token,
                )
                .with_shape(self.identity_override.unwrap_or(IdentityShape::ChatAndUser)),
            ),
            Platform::Messenger => Box::new(
                MessengerAdapter::new(
                    self.http.clone(),
                    &self.endpoints.messenger,
                    &binding.token,
                    self.messenger_app_secret.clone(),
                )
                .with_shape(self.identity_override.unwrap_or(IdentityShape::ChatOnly)),
            ),
        }
    }
}

/// Splits `text` into chunks of at most `limit` characters.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(limit).map(|c| c.iter().collect()).collect()
}

/// Sends a reply, split to the platform limit. Only the last chunk carries
/// the keyboard. Returns the number of messages sent.
pub async fn send_reply(
    adapter: &dyn PlatformAdapter,
    target: &ReplyTarget,
    text: &str,
    keyboard: Option<&Keyboard>,
) -> Result<usize> {
    if text.trim().is_empty() {
        warn!(
            platform = %adapter.platform(),
            chat_id = target.chat_id,
            "Rendered reply is empty, nothing sent"
        );
        return Ok(0);
    }

    let chunks = split_text(text, adapter.max_message_length());
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        let kb = if i == last { keyboard } else { None };
        adapter.send_message(target, chunk, kb).await?;
    }
    debug!(
        platform = %adapter.platform(),
        chat_id = target.chat_id,
        chunks = chunks.len(),
        "Reply sent"
    );
    Ok(chunks.len())
}

/// Lowercase hex HMAC-SHA1 of `body`, for signing test payloads.
#[cfg(test)]
pub(crate) fn hmac_sha1_hex(key: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| EngineError::config(format!("invalid signing key: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex HMAC-SHA1 signature (either case).
pub(crate) fn verify_hmac_sha1(key: &str, body: &[u8], signature_hex: &str) -> Result<()> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| EngineError::Signature)?;
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| EngineError::config(format!("invalid signing key: {e}")))?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| EngineError::Signature)
}

/// Renders a JSON scalar id (numbers or strings) as a string.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Fails with `Delivery` when the platform answered with a non-2xx status.
pub(crate) async fn check_delivery(platform: Platform, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| EngineError::Delivery(format!("{platform}: {e}")))?;
    if !status.is_success() {
        return Err(EngineError::Delivery(format!("{platform} answered {status}: {body}")));
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_text("hello", 10), vec!["hello"]);
    }

    #[test]
    fn long_text_splits_on_characters() {
        let text = "ñ".repeat(5);
        let chunks = split_text(&text, 2);
        assert_eq!(chunks, vec!["ññ", "ññ", "ñ"]);
    }

    #[test]
    fn exact_limit_is_not_split() {
        let text = "a".repeat(4096);
        assert_eq!(split_text(&text, 4096).len(), 1);
        assert_eq!(split_text(&format!("{text}b"), 4096).len(), 2);
    }

    #[test]
    fn hmac_round_trips_in_either_case() {
        let sig = hmac_sha1_hex("secret", b"{}").unwrap();
        assert!(verify_hmac_sha1("secret", b"{}", &sig).is_ok());
        assert!(verify_hmac_sha1("secret", b"{}", &sig.to_uppercase()).is_ok());
        assert!(matches!(
            verify_hmac_sha1("other", b"{}", &sig),
            Err(EngineError::Signature)
        ));
        assert!(matches!(
            verify_hmac_sha1("secret", b"{}", "not-hex"),
            Err(EngineError::Signature)
        ));
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        assert_eq!(id_string(&serde_json::json!(42)), Some("42".to_string()));
        assert_eq!(id_string(&serde_json::json!("abc")), Some("abc".to_string()));
        assert_eq!(id_string(&serde_json::json!(null)), None);
    }
}
