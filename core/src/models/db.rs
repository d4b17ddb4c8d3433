use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Kik,
    Messenger,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Telegram, Platform::Kik, Platform::Messenger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Kik => "kik",
            Platform::Messenger => "messenger",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Platform::Telegram),
            "kik" => Ok(Platform::Kik),
            "messenger" => Ok(Platform::Messenger),
            other => Err(EngineError::not_found(format!("platform {other}"))),
        }
    }
}

impl TryFrom<String> for Platform {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(EngineError::config(format!("unsupported HTTP method {other}"))),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bot's account on one chat platform. `id` doubles as the webhook path id.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlatformBinding {
    pub id: String,
    pub bot_id: String,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub token: String,
    pub username: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EnvironmentVar {
    pub id: String,
    pub bot_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub bot_id: String,
    pub name: String,
}

/// Current position of one conversation. `user_id` is empty for chat-only identities.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChatState {
    pub id: String,
    pub bot_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub state_id: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value_template: String,
}

impl Param {
    pub fn new(key: impl Into<String>, value_template: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value_template: value_template.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub id: String,
    pub url_template: String,
    pub method: HttpMethod,
    pub data: Option<String>,
    pub url_parameters: Vec<Param>,
    pub header_parameters: Vec<Param>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ResponseSpec {
    pub id: String,
    pub text_template: String,
    pub keyboard_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handler {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    pub pattern: String,
    pub priority: i32,
    /// Insertion sequence; breaks priority ties.
    pub seq: i64,
    pub enabled: bool,
    pub source_states: Vec<String>,
    pub target_state: Option<String>,
    pub request: Option<RequestSpec>,
    pub response: ResponseSpec,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Hook {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    pub key: String,
    pub enabled: bool,
    pub response_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub hook_id: String,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub chat_id: String,
    pub name: String,
}
