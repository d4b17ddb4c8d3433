use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use super::{PlatformAdapter, check_delivery, id_string};
use crate::error::{EngineError, Result};
use crate::models::db::Platform;
use crate::models::message::{ChatIdentity, IdentityShape, InboundMessage, Keyboard, ReplyTarget};

pub const MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    reply_markup: Value,
}

pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
    token: String,
    shape: IdentityShape,
}

impl TelegramAdapter {
    pub fn new(http: reqwest::Client, api_base: &str, token: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            shape: IdentityShape::ChatAndUser,
        }
    }

    pub fn with_shape(mut self, shape: IdentityShape) -> Self {
        self.shape = shape;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: Serialize + Sync>(&self, method: &str, payload: &T) -> Result<Value> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await
            .map_err(|e| EngineError::Delivery(format!("telegram {method}: {e}")))?;
        let body = check_delivery(Platform::Telegram, response).await?;
        if body.get("ok").and_then(Value::as_bool) == Some(false) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(EngineError::Delivery(format!("telegram {method}: {description}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl PlatformAdapter for TelegramAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn identity_shape(&self) -> IdentityShape {
        self.shape
    }

    fn max_message_length(&self) -> usize {
        MAX_MESSAGE_LENGTH
    }

    fn parse_inbound(&self, payload: &Value) -> Result<Vec<InboundMessage>> {
        let update_id = payload
            .get("update_id")
            .and_then(id_string)
            .ok_or_else(|| EngineError::MalformedPayload("telegram update without update_id".into()))?;

        let Some(message) = payload.get("message") else {
            return Ok(vec![]);
        };
        let Some(text) = message.get("text").and_then(Value::as_str) else {
            return Ok(vec![]);
        };
        let chat_id = message
            .pointer("/chat/id")
            .and_then(id_string)
            .ok_or_else(|| EngineError::MalformedPayload("telegram message without chat".into()))?;
        let user_id = message.pointer("/from/id").and_then(id_string);

        Ok(vec![InboundMessage {
            id: update_id,
            platform: Platform::Telegram,
            command_text: text.to_string(),
            identity: ChatIdentity::new(chat_id.clone(), user_id),
            reply_to: ReplyTarget::new(chat_id, None),
            raw: message.clone(),
            envelope: payload.clone(),
        }])
    }

    fn build_keyboard(&self, keyboard: Option<&Keyboard>) -> Value {
        match keyboard {
            Some(rows) => {
                let rows: Vec<Vec<Value>> = rows
                    .iter()
                    .map(|row| row.iter().map(|label| json!({ "text": label })).collect())
                    .collect();
                json!({ "keyboard": rows, "resize_keyboard": true })
            }
            None => json!({ "remove_keyboard": true }),
        }
    }

    async fn send_message(&self, target: &ReplyTarget, text: &str, keyboard: Option<&Keyboard>) -> Result<()> {
        let payload = SendMessage {
            chat_id: &target.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
            reply_markup: self.build_keyboard(keyboard),
        };
        self.call("sendMessage", &payload).await?;
        Ok(())
    }

    async fn set_webhook(&self, url: Option<&str>) -> Result<()> {
        match url {
            Some(url) => {
                self.call("setWebhook", &json!({ "url": url })).await?;
                info!(url = url, "Telegram webhook set");
            }
            None => {
                self.call("deleteWebhook", &json!({})).await?;
                info!("Telegram webhook removed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base: &str) -> TelegramAdapter {
        TelegramAdapter::new(reqwest::Client::new(), base, "123:abc")
    }

    fn update(text: &str) -> Value {
        json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "date": 1441645532,
                "from": {"id": 7, "first_name": "John"},
                "chat": {"id": 100, "type": "private"},
                "text": text
            }
        })
    }

    #[test]
    fn parses_text_update() {
        let messages = adapter("http://localhost").parse_inbound(&update("/start")).unwrap();
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.id, "1");
        assert_eq!(m.command_text, "/start");
        assert_eq!(m.identity, ChatIdentity::new("100", Some("7".to_string())));
        assert_eq!(m.reply_to.chat_id, "100");
        assert_eq!(m.raw["from"]["first_name"], "John");
    }

    #[test]
    fn non_text_update_is_skipped() {
        let payload = json!({"update_id": 2, "message": {"chat": {"id": 1}, "photo": []}});
        assert!(adapter("http://localhost").parse_inbound(&payload).unwrap().is_empty());
    }

    #[test]
    fn update_without_id_is_malformed() {
        let err = adapter("http://localhost").parse_inbound(&json!({"foo": 1})).unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload(_)));
    }

    #[test]
    fn keyboard_markup() {
        let a = adapter("http://localhost");
        let kb = vec![vec!["a".to_string(), "b".to_string()]];
        let markup = a.build_keyboard(Some(&kb));
        assert_eq!(markup["keyboard"][0][1]["text"], "b");
        assert_eq!(markup["resize_keyboard"], true);
        assert_eq!(a.build_keyboard(None), json!({"remove_keyboard": true}));
    }

    #[tokio::test]
    async fn sends_html_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": "100",
                "text": "<b>author1</b>",
                "parse_mode": "HTML"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {}})))
            .expect(1)
            .mount(&server)
            .await;

        adapter(&server.uri())
            .send_message(&ReplyTarget::new("100", None), "<b>author1</b>", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn api_error_is_delivery_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"ok": false, "description": "Bad Request: chat not found"})),
            )
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .send_message(&ReplyTarget::new("1", None), "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Delivery(_)));
    }

    #[tokio::test]
    async fn removes_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/deleteWebhook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": true})))
            .expect(1)
            .mount(&server)
            .await;

        adapter(&server.uri()).set_webhook(None).await.unwrap();
    }
}
