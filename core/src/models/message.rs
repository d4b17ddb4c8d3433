use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::db::Platform;

/// Rows of button labels.
pub type Keyboard = Vec<Vec<String>>;

/// Which parts of a conversation identify its ChatState.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityShape {
    ChatAndUser,
    ChatOnly,
}

impl FromStr for IdentityShape {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_user" | "chat_and_user" => Ok(IdentityShape::ChatAndUser),
            "chat" | "chat_only" => Ok(IdentityShape::ChatOnly),
            other => Err(EngineError::config(format!("unknown chat identity shape {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub chat_id: String,
    pub user_id: Option<String>,
}

impl ChatIdentity {
    pub fn new(chat_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id,
        }
    }

    /// Projects the identity onto the given shape.
    pub fn with_shape(&self, shape: IdentityShape) -> ChatIdentity {
        match shape {
            IdentityShape::ChatAndUser => self.clone(),
            IdentityShape::ChatOnly => ChatIdentity {
                chat_id: self.chat_id.clone(),
                user_id: None,
            },
        }
    }

    /// User component as stored in the ChatState key.
    pub fn user_key(&self) -> &str {
        self.user_id.as_deref().unwrap_or("")
    }
}

/// Where an outbound message goes. Kik needs the username as well as the chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub chat_id: String,
    pub user: Option<String>,
}

impl ReplyTarget {
    pub fn new(chat_id: impl Into<String>, user: Option<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            user,
        }
    }
}

/// A platform message normalized by an inbound adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id, unique per binding.
    pub id: String,
    pub platform: Platform,
    pub command_text: String,
    pub identity: ChatIdentity,
    pub reply_to: ReplyTarget,
    /// The platform message object.
    pub raw: serde_json::Value,
    /// The full webhook envelope (e.g. a Telegram update).
    pub envelope: serde_json::Value,
}
