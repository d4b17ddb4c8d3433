//! Persistence contract for bots, handlers, states and hooks.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::db::{
    Bot, ChatState, EnvironmentVar, Handler, Hook, Platform, PlatformBinding, Recipient,
    ResponseSpec, State,
};
use crate::models::message::ChatIdentity;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

/// Outcome of a ChatState upsert.
#[derive(Debug, Clone)]
pub enum Transition {
    Created(ChatState),
    Updated(ChatState),
    /// Neither the state nor the merged context changed; nothing was written.
    Unchanged(ChatState),
}

impl Transition {
    pub fn chat_state(&self) -> &ChatState {
        match self {
            Transition::Created(cs) | Transition::Updated(cs) | Transition::Unchanged(cs) => cs,
        }
    }

    pub fn into_chat_state(self) -> ChatState {
        match self {
            Transition::Created(cs) | Transition::Updated(cs) | Transition::Unchanged(cs) => cs,
        }
    }
}

/// Merges `contribution` into `current` by top-level key; values under a key
/// are replaced wholesale.
pub fn merge_context(current: &Value, contribution: &Value) -> Value {
    let mut merged = match current {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(incoming) = contribution {
        for (key, value) in incoming {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_bot(&self, bot: &Bot) -> Result<()>;
    async fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>>;
    /// Removes the bot with its bindings, handlers, states, chat states,
    /// hooks and environment variables.
    async fn delete_bot(&self, bot_id: &str) -> Result<()>;

    /// Inserts or updates a binding (one per bot and platform).
    async fn save_binding(&self, binding: &PlatformBinding) -> Result<()>;
    async fn get_binding(&self, platform: Platform, binding_id: &str) -> Result<Option<PlatformBinding>>;
    async fn bindings_for_bot(&self, bot_id: &str) -> Result<Vec<PlatformBinding>>;

    /// Sets `env.<key>` for the bot, overwriting an existing value.
    async fn set_env_var(&self, bot_id: &str, key: &str, value: &str) -> Result<EnvironmentVar>;
    async fn env_vars(&self, bot_id: &str) -> Result<Vec<EnvironmentVar>>;

    async fn insert_state(&self, state: &State) -> Result<()>;
    async fn get_state(&self, state_id: &str) -> Result<Option<State>>;
    async fn state_by_name(&self, bot_id: &str, name: &str) -> Result<Option<State>>;
    /// Fails with `Integrity` while any ChatState points at the state or
    /// any handler lists it as a source or target.
    async fn delete_state(&self, state_id: &str) -> Result<()>;

    /// Stores a new handler; the returned copy carries its insertion sequence.
    async fn insert_handler(&self, handler: &Handler) -> Result<Handler>;
    async fn update_handler(&self, handler: &Handler) -> Result<()>;
    async fn handlers_for_bot(&self, bot_id: &str) -> Result<Vec<Handler>>;
    async fn count_handlers(&self, bot_id: &str) -> Result<i64>;
    /// Deletes a request and detaches it from its handler.
    async fn delete_request(&self, request_id: &str) -> Result<()>;

    async fn get_chat_state(&self, bot_id: &str, identity: &ChatIdentity) -> Result<Option<ChatState>>;
    /// Atomically creates or updates the ChatState for `identity`, merging
    /// `contribution` into its context.
    async fn upsert_chat_state(
        &self,
        bot_id: &str,
        identity: &ChatIdentity,
        state_id: &str,
        contribution: &Value,
    ) -> Result<Transition>;
    async fn count_chat_states(&self, bot_id: &str) -> Result<i64>;

    async fn insert_hook(&self, hook: &Hook, response: &ResponseSpec) -> Result<()>;
    async fn update_hook(&self, hook: &Hook) -> Result<()>;
    async fn get_hook(&self, hook_id: &str) -> Result<Option<Hook>>;
    async fn hook_by_key(&self, key: &str) -> Result<Option<Hook>>;
    async fn get_response(&self, response_id: &str) -> Result<Option<ResponseSpec>>;
    async fn insert_recipient(&self, recipient: &Recipient) -> Result<()>;
    async fn recipients(&self, hook_id: &str) -> Result<Vec<Recipient>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_within_key_and_keeps_others() {
        let current = json!({"s1": {"a": 1, "b": 2}, "s2": {"c": 3}});
        let merged = merge_context(&current, &json!({"s1": {"a": 9}}));
        assert_eq!(merged, json!({"s1": {"a": 9}, "s2": {"c": 3}}));
    }

    #[test]
    fn merge_into_non_object_starts_fresh() {
        let merged = merge_context(&Value::Null, &json!({"s1": {"a": 1}}));
        assert_eq!(merged, json!({"s1": {"a": 1}}));
    }
}
