//! Per-conversation state: which State a chat is in and the context it has
//! accumulated on the way.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::db::{ChatState, State};
use crate::models::message::ChatIdentity;
use crate::storage::{Storage, Transition};

pub struct StateMachine<'a> {
    storage: &'a dyn Storage,
}

impl<'a> StateMachine<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// The chat's ChatState and the State it points at, if the chat has one.
    pub async fn current(&self, bot_id: &str, identity: &ChatIdentity) -> Result<Option<(ChatState, State)>> {
        let Some(chat_state) = self.storage.get_chat_state(bot_id, identity).await? else {
            return Ok(None);
        };
        let state = self
            .storage
            .get_state(&chat_state.state_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("state {}", chat_state.state_id)))?;
        Ok(Some((chat_state, state)))
    }

    /// Moves the chat to `target_state_id`, merging `contribution` into its
    /// context by top-level key.
    pub async fn transition(
        &self,
        bot_id: &str,
        identity: &ChatIdentity,
        target_state_id: &str,
        contribution: &Value,
    ) -> Result<Transition> {
        let target = self
            .storage
            .get_state(target_state_id)
            .await?
            .filter(|s| s.bot_id == bot_id)
            .ok_or_else(|| EngineError::not_found(format!("state {target_state_id} for bot {bot_id}")))?;

        let outcome = self
            .storage
            .upsert_chat_state(bot_id, identity, &target.id, contribution)
            .await?;

        match &outcome {
            Transition::Created(cs) => info!(
                bot_id = bot_id,
                chat_id = cs.chat_id,
                state = target.name,
                "Chat entered its first state"
            ),
            Transition::Updated(cs) => info!(
                bot_id = bot_id,
                chat_id = cs.chat_id,
                state = target.name,
                "Chat state updated"
            ),
            Transition::Unchanged(cs) => debug!(
                bot_id = bot_id,
                chat_id = cs.chat_id,
                state = target.name,
                "Chat state unchanged"
            ),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn state(id: &str, bot: &str, name: &str) -> State {
        State {
            id: id.to_string(),
            bot_id: bot.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn transitions_create_then_update_one_row() {
        let storage = MemoryStorage::new();
        storage.insert_state(&state("s1", "bot", "state1")).await.unwrap();
        storage.insert_state(&state("s2", "bot", "state2")).await.unwrap();
        let machine = StateMachine::new(&storage);
        let chat = ChatIdentity::new("100", Some("7".to_string()));

        assert!(machine.current("bot", &chat).await.unwrap().is_none());

        let first = machine.transition("bot", &chat, "s1", &json!({"_start": {"a": 1}})).await.unwrap();
        assert!(matches!(first, Transition::Created(_)));

        let second = machine.transition("bot", &chat, "s2", &json!({"state1": {"b": 2}})).await.unwrap();
        assert!(matches!(second, Transition::Updated(_)));

        let again = machine.transition("bot", &chat, "s2", &json!({"state1": {"b": 2}})).await.unwrap();
        assert!(matches!(again, Transition::Unchanged(_)));

        let (cs, current) = machine.current("bot", &chat).await.unwrap().unwrap();
        assert_eq!(current.name, "state2");
        assert_eq!(cs.context, json!({"_start": {"a": 1}, "state1": {"b": 2}}));
        assert_eq!(storage.count_chat_states("bot").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn foreign_state_is_not_found() {
        let storage = MemoryStorage::new();
        storage.insert_state(&state("s1", "other-bot", "state1")).await.unwrap();
        let machine = StateMachine::new(&storage);
        let err = machine
            .transition("bot", &ChatIdentity::new("1", None), "s1", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn chat_only_identity_shares_state_across_users() {
        let storage = MemoryStorage::new();
        storage.insert_state(&state("s1", "bot", "state1")).await.unwrap();
        let machine = StateMachine::new(&storage);

        let a = ChatIdentity::new("group", None);
        machine.transition("bot", &a, "s1", &json!({})).await.unwrap();
        let b = ChatIdentity::new("group", Some("someone".to_string()));
        assert!(machine.current("bot", &b).await.unwrap().is_none());
        assert!(machine.current("bot", &a).await.unwrap().is_some());
    }
}
