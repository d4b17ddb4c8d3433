//! The render context: named sections available to templates during one dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::executor::NormalizedResponse;
use crate::models::db::{EnvironmentVar, Platform};

static EMOJI: LazyLock<BTreeMap<&'static str, &'static str>> = LazyLock::new(|| {
    BTreeMap::from([
        ("smile", "😄"),
        ("grinning", "😀"),
        ("wink", "😉"),
        ("heart", "❤️"),
        ("thumbs_up", "👍"),
        ("thumbs_down", "👎"),
        ("ok_hand", "👌"),
        ("clap", "👏"),
        ("wave", "👋"),
        ("pray", "🙏"),
        ("fire", "🔥"),
        ("star", "⭐"),
        ("sparkles", "✨"),
        ("check_mark", "✅"),
        ("cross_mark", "❌"),
        ("warning", "⚠️"),
        ("information", "ℹ️"),
        ("question", "❓"),
        ("exclamation", "❗"),
        ("bell", "🔔"),
        ("calendar", "📅"),
        ("clock", "🕒"),
        ("hourglass", "⌛"),
        ("book", "📖"),
        ("books", "📚"),
        ("memo", "📝"),
        ("email", "📧"),
        ("link", "🔗"),
        ("lock", "🔒"),
        ("key", "🔑"),
        ("money_bag", "💰"),
        ("shopping_cart", "🛒"),
        ("package", "📦"),
        ("rocket", "🚀"),
        ("robot", "🤖"),
        ("house", "🏠"),
        ("globe", "🌍"),
        ("sunny", "☀️"),
        ("cloud", "☁️"),
        ("umbrella", "☔"),
        ("back", "🔙"),
        ("arrow_right", "➡️"),
        ("arrow_left", "⬅️"),
        ("arrow_up", "⬆️"),
        ("arrow_down", "⬇️"),
    ])
});

/// Named emoji available to templates as `emoji.<name>`.
pub fn emoji_table() -> &'static BTreeMap<&'static str, &'static str> {
    &EMOJI
}

/// Template context assembled per dispatch from explicit sections.
///
/// Sections left unset are omitted from the serialized context, so templates
/// see them as undefined.
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pattern: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Value>,
    env: HashMap<String, String>,
    state_context: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    message: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    update: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'static str>,
    #[serde(skip_serializing_if = "Value::is_null")]
    data: Value,
    emoji: &'static BTreeMap<&'static str, &'static str>,
}

impl RenderContext {
    pub fn builder() -> RenderContextBuilder {
        RenderContextBuilder {
            ctx: RenderContext {
                state_context: Value::Object(Map::new()),
                ..RenderContext::default_sections()
            },
        }
    }

    fn default_sections() -> RenderContext {
        RenderContext {
            pattern: Map::new(),
            response: None,
            env: HashMap::new(),
            state_context: Value::Null,
            message: Value::Null,
            update: Value::Null,
            service: None,
            data: Value::Null,
            emoji: emoji_table(),
        }
    }

    pub fn pattern(&self) -> &Map<String, Value> {
        &self.pattern
    }

    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    /// HTTP status of the handler's request, if one was made.
    pub fn response_status(&self) -> Option<u16> {
        self.response
            .as_ref()
            .and_then(|r| r.get("status"))
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    pub fn message(&self) -> &Value {
        &self.message
    }

    /// Adds the response section once the request has been executed.
    pub fn set_response(&mut self, response: &NormalizedResponse) {
        self.response = Some(response.to_context_value());
    }

    /// The part of the context persisted into ChatState after a transition.
    pub fn snapshot(&self) -> Value {
        let mut snap = Map::new();
        snap.insert("pattern".to_string(), Value::Object(self.pattern.clone()));
        if let Some(response) = &self.response {
            snap.insert("response".to_string(), response.clone());
        }
        if !self.message.is_null() {
            snap.insert("message".to_string(), self.message.clone());
        }
        Value::Object(snap)
    }
}

pub struct RenderContextBuilder {
    ctx: RenderContext,
}

impl RenderContextBuilder {
    pub fn pattern(mut self, params: Map<String, Value>) -> Self {
        self.ctx.pattern = params;
        self
    }

    pub fn env(mut self, vars: &[EnvironmentVar]) -> Self {
        self.ctx.env = vars
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();
        self
    }

    pub fn state_context(mut self, context: Value) -> Self {
        if context.is_object() {
            self.ctx.state_context = context;
        }
        self
    }

    pub fn message(mut self, message: Value, envelope: Value) -> Self {
        self.ctx.message = message;
        self.ctx.update = envelope;
        self
    }

    pub fn service(mut self, platform: Platform) -> Self {
        self.ctx.service = Some(platform.as_str());
        self
    }

    /// Hook payload, exposed as `data`.
    pub fn data(mut self, data: Value) -> Self {
        self.ctx.data = data;
        self
    }

    pub fn build(self) -> RenderContext {
        self.ctx
    }
}
