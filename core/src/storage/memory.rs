//! In-process storage used by tests and single-node development runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Storage, Transition, merge_context};
use crate::error::{EngineError, Result};
use crate::models::db::{
    Bot, ChatState, EnvironmentVar, Handler, Hook, Platform, PlatformBinding, Recipient,
    ResponseSpec, State,
};
use crate::models::message::ChatIdentity;

#[derive(Default)]
struct Inner {
    bots: HashMap<String, Bot>,
    bindings: HashMap<String, PlatformBinding>,
    env_vars: Vec<EnvironmentVar>,
    states: HashMap<String, State>,
    handlers: Vec<Handler>,
    next_seq: i64,
    chat_states: HashMap<(String, String, String), ChatState>,
    hooks: HashMap<String, Hook>,
    responses: HashMap<String, ResponseSpec>,
    recipients: Vec<Recipient>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn chat_key(bot_id: &str, identity: &ChatIdentity) -> (String, String, String) {
    (
        bot_id.to_string(),
        identity.chat_id.clone(),
        identity.user_key().to_string(),
    )
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_bot(&self, bot: &Bot) -> Result<()> {
        self.inner.lock().await.bots.insert(bot.id.clone(), bot.clone());
        Ok(())
    }

    async fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>> {
        Ok(self.inner.lock().await.bots.get(bot_id).cloned())
    }

    async fn delete_bot(&self, bot_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.bots.remove(bot_id);
        inner.bindings.retain(|_, b| b.bot_id != bot_id);
        inner.env_vars.retain(|v| v.bot_id != bot_id);
        inner.states.retain(|_, s| s.bot_id != bot_id);
        inner.handlers.retain(|h| h.bot_id != bot_id);
        inner.chat_states.retain(|(bot, _, _), _| bot != bot_id);
        let hook_ids: Vec<String> = inner
            .hooks
            .values()
            .filter(|h| h.bot_id == bot_id)
            .map(|h| h.id.clone())
            .collect();
        inner.hooks.retain(|_, h| h.bot_id != bot_id);
        inner.recipients.retain(|r| !hook_ids.contains(&r.hook_id));
        Ok(())
    }

    async fn save_binding(&self, binding: &PlatformBinding) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let clash = inner.bindings.values().any(|b| {
            b.bot_id == binding.bot_id && b.platform == binding.platform && b.id != binding.id
        });
        if clash {
            return Err(EngineError::config(format!(
                "bot {} already has a {} binding",
                binding.bot_id, binding.platform
            )));
        }
        inner.bindings.insert(binding.id.clone(), binding.clone());
        Ok(())
    }

    async fn get_binding(&self, platform: Platform, binding_id: &str) -> Result<Option<PlatformBinding>> {
        Ok(self
            .inner
            .lock()
            .await
            .bindings
            .get(binding_id)
            .filter(|b| b.platform == platform)
            .cloned())
    }

    async fn bindings_for_bot(&self, bot_id: &str) -> Result<Vec<PlatformBinding>> {
        Ok(self
            .inner
            .lock()
            .await
            .bindings
            .values()
            .filter(|b| b.bot_id == bot_id)
            .cloned()
            .collect())
    }

    async fn set_env_var(&self, bot_id: &str, key: &str, value: &str) -> Result<EnvironmentVar> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .env_vars
            .iter_mut()
            .find(|v| v.bot_id == bot_id && v.key == key)
        {
            existing.value = value.to_string();
            return Ok(existing.clone());
        }
        let var = EnvironmentVar {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        inner.env_vars.push(var.clone());
        Ok(var)
    }

    async fn env_vars(&self, bot_id: &str) -> Result<Vec<EnvironmentVar>> {
        Ok(self
            .inner
            .lock()
            .await
            .env_vars
            .iter()
            .filter(|v| v.bot_id == bot_id)
            .cloned()
            .collect())
    }

    async fn insert_state(&self, state: &State) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .states
            .values()
            .any(|s| s.bot_id == state.bot_id && s.name == state.name)
        {
            return Err(EngineError::config(format!("state {} already exists", state.name)));
        }
        inner.states.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn get_state(&self, state_id: &str) -> Result<Option<State>> {
        Ok(self.inner.lock().await.states.get(state_id).cloned())
    }

    async fn state_by_name(&self, bot_id: &str, name: &str) -> Result<Option<State>> {
        Ok(self
            .inner
            .lock()
            .await
            .states
            .values()
            .find(|s| s.bot_id == bot_id && s.name == name)
            .cloned())
    }

    async fn delete_state(&self, state_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let in_use = inner.chat_states.values().filter(|cs| cs.state_id == state_id).count();
        if in_use > 0 {
            return Err(EngineError::Integrity(format!(
                "state {state_id} is the current state of {in_use} chat(s)"
            )));
        }
        let referencing = inner
            .handlers
            .iter()
            .filter(|h| {
                h.source_states.iter().any(|s| s == state_id)
                    || h.target_state.as_deref() == Some(state_id)
            })
            .count();
        if referencing > 0 {
            return Err(EngineError::Integrity(format!(
                "state {state_id} is referenced by {referencing} handler(s)"
            )));
        }
        inner.states.remove(state_id);
        Ok(())
    }

    async fn insert_handler(&self, handler: &Handler) -> Result<Handler> {
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let mut stored = handler.clone();
        stored.seq = inner.next_seq;
        inner
            .responses
            .insert(stored.response.id.clone(), stored.response.clone());
        inner.handlers.push(stored.clone());
        Ok(stored)
    }

    async fn update_handler(&self, handler: &Handler) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .handlers
            .iter_mut()
            .find(|h| h.id == handler.id)
            .ok_or_else(|| EngineError::not_found(format!("handler {}", handler.id)))?;
        let seq = slot.seq;
        *slot = handler.clone();
        slot.seq = seq;
        inner
            .responses
            .insert(handler.response.id.clone(), handler.response.clone());
        Ok(())
    }

    async fn handlers_for_bot(&self, bot_id: &str) -> Result<Vec<Handler>> {
        Ok(self
            .inner
            .lock()
            .await
            .handlers
            .iter()
            .filter(|h| h.bot_id == bot_id)
            .cloned()
            .collect())
    }

    async fn count_handlers(&self, bot_id: &str) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .await
            .handlers
            .iter()
            .filter(|h| h.bot_id == bot_id)
            .count() as i64)
    }

    async fn delete_request(&self, request_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for handler in inner.handlers.iter_mut() {
            if handler.request.as_ref().is_some_and(|r| r.id == request_id) {
                handler.request = None;
            }
        }
        Ok(())
    }

    async fn get_chat_state(&self, bot_id: &str, identity: &ChatIdentity) -> Result<Option<ChatState>> {
        Ok(self
            .inner
            .lock()
            .await
            .chat_states
            .get(&chat_key(bot_id, identity))
            .cloned())
    }

    async fn upsert_chat_state(
        &self,
        bot_id: &str,
        identity: &ChatIdentity,
        state_id: &str,
        contribution: &Value,
    ) -> Result<Transition> {
        let mut inner = self.inner.lock().await;
        let key = chat_key(bot_id, identity);
        let now = Utc::now();

        if let Some(existing) = inner.chat_states.get_mut(&key) {
            let merged = merge_context(&existing.context, contribution);
            if existing.state_id == state_id && merged == existing.context {
                return Ok(Transition::Unchanged(existing.clone()));
            }
            existing.state_id = state_id.to_string();
            existing.context = merged;
            existing.updated_at = now;
            return Ok(Transition::Updated(existing.clone()));
        }

        let chat_state = ChatState {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            chat_id: key.1.clone(),
            user_id: key.2.clone(),
            state_id: state_id.to_string(),
            context: merge_context(&Value::Null, contribution),
            created_at: now,
            updated_at: now,
        };
        inner.chat_states.insert(key, chat_state.clone());
        Ok(Transition::Created(chat_state))
    }

    async fn count_chat_states(&self, bot_id: &str) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .await
            .chat_states
            .keys()
            .filter(|(bot, _, _)| bot == bot_id)
            .count() as i64)
    }

    async fn insert_hook(&self, hook: &Hook, response: &ResponseSpec) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.hooks.values().any(|h| h.key == hook.key) {
            return Err(EngineError::config("hook key already in use"));
        }
        inner.responses.insert(response.id.clone(), response.clone());
        inner.hooks.insert(hook.id.clone(), hook.clone());
        Ok(())
    }

    async fn update_hook(&self, hook: &Hook) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.hooks.get_mut(&hook.id) {
            Some(slot) => {
                *slot = hook.clone();
                Ok(())
            }
            None => Err(EngineError::not_found(format!("hook {}", hook.id))),
        }
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Option<Hook>> {
        Ok(self.inner.lock().await.hooks.get(hook_id).cloned())
    }

    async fn hook_by_key(&self, key: &str) -> Result<Option<Hook>> {
        Ok(self
            .inner
            .lock()
            .await
            .hooks
            .values()
            .find(|h| h.key == key)
            .cloned())
    }

    async fn get_response(&self, response_id: &str) -> Result<Option<ResponseSpec>> {
        Ok(self.inner.lock().await.responses.get(response_id).cloned())
    }

    async fn insert_recipient(&self, recipient: &Recipient) -> Result<()> {
        self.inner.lock().await.recipients.push(recipient.clone());
        Ok(())
    }

    async fn recipients(&self, hook_id: &str) -> Result<Vec<Recipient>> {
        Ok(self
            .inner
            .lock()
            .await
            .recipients
            .iter()
            .filter(|r| r.hook_id == hook_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn binding(id: &str, platform: Platform) -> PlatformBinding {
        let now = Utc::now();
        PlatformBinding {
            id: id.to_string(),
            bot_id: "bot-1".to_string(),
            platform,
            token: "token".to_string(),
            username: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn state(id: &str, name: &str) -> State {
        State {
            id: id.to_string(),
            bot_id: "bot-1".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn one_binding_per_platform() {
        let storage = MemoryStorage::new();
        storage.save_binding(&binding("b1", Platform::Telegram)).await.unwrap();
        storage.save_binding(&binding("b2", Platform::Kik)).await.unwrap();
        let err = storage
            .save_binding(&binding("b3", Platform::Telegram))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        // Re-saving the same binding is an update.
        storage.save_binding(&binding("b1", Platform::Telegram)).await.unwrap();
        assert_eq!(storage.bindings_for_bot("bot-1").await.unwrap().len(), 2);
        assert!(storage.get_binding(Platform::Kik, "b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_reports_what_happened() {
        let storage = MemoryStorage::new();
        let identity = ChatIdentity::new("chat", Some("user".to_string()));

        let created = storage
            .upsert_chat_state("bot-1", &identity, "s1", &json!({"_start": {"a": 1}}))
            .await
            .unwrap();
        assert!(matches!(created, Transition::Created(_)));

        let unchanged = storage
            .upsert_chat_state("bot-1", &identity, "s1", &json!({"_start": {"a": 1}}))
            .await
            .unwrap();
        assert!(matches!(unchanged, Transition::Unchanged(_)));

        let updated = storage
            .upsert_chat_state("bot-1", &identity, "s2", &json!({"s1": {"b": 2}}))
            .await
            .unwrap();
        let cs = updated.into_chat_state();
        assert_eq!(cs.state_id, "s2");
        assert_eq!(cs.context, json!({"_start": {"a": 1}, "s1": {"b": 2}}));
    }

    #[tokio::test]
    async fn concurrent_transitions_keep_one_chat_state() {
        let storage = Arc::new(MemoryStorage::new());
        let mut tasks = Vec::new();
        for n in 0..16 {
            let storage = storage.clone();
            tasks.push(tokio::spawn(async move {
                let identity = ChatIdentity::new("chat", None);
                let target = if n % 2 == 0 { "s1" } else { "s2" };
                let mut contribution = serde_json::Map::new();
                contribution.insert(format!("k{n}"), json!(n));
                storage
                    .upsert_chat_state("bot-1", &identity, target, &Value::Object(contribution))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(storage.count_chat_states("bot-1").await.unwrap(), 1);
        let cs = storage
            .get_chat_state("bot-1", &ChatIdentity::new("chat", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cs.context.as_object().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn state_in_use_cannot_be_deleted() {
        let storage = MemoryStorage::new();
        storage.insert_state(&state("s1", "menu")).await.unwrap();
        storage.insert_state(&state("s2", "done")).await.unwrap();
        assert!(storage.insert_state(&state("s3", "menu")).await.is_err());

        let identity = ChatIdentity::new("chat", None);
        storage
            .upsert_chat_state("bot-1", &identity, "s1", &json!({}))
            .await
            .unwrap();

        let err = storage.delete_state("s1").await.unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
        storage.delete_state("s2").await.unwrap();
        assert!(storage.get_state("s2").await.unwrap().is_none());
        assert!(storage.state_by_name("bot-1", "menu").await.unwrap().is_some());
    }

    fn scoped_handler(id: &str, source: Option<&str>, target: Option<&str>) -> Handler {
        Handler {
            id: id.to_string(),
            bot_id: "bot-1".to_string(),
            name: id.to_string(),
            pattern: "/secret".to_string(),
            priority: 0,
            seq: 0,
            enabled: true,
            source_states: source.into_iter().map(str::to_string).collect(),
            target_state: target.map(str::to_string),
            request: None,
            response: ResponseSpec {
                id: format!("{id}-response"),
                text_template: "secret".to_string(),
                keyboard_template: None,
            },
        }
    }

    #[tokio::test]
    async fn state_referenced_by_handlers_cannot_be_deleted() {
        let storage = MemoryStorage::new();
        storage.insert_state(&state("s1", "logged_in")).await.unwrap();
        storage.insert_state(&state("s2", "logged_out")).await.unwrap();
        storage
            .insert_handler(&scoped_handler("h1", Some("s1"), None))
            .await
            .unwrap();
        storage
            .insert_handler(&scoped_handler("h2", None, Some("s2")))
            .await
            .unwrap();

        for id in ["s1", "s2"] {
            let err = storage.delete_state(id).await.unwrap_err();
            assert!(matches!(err, EngineError::Integrity(_)));
            assert!(storage.get_state(id).await.unwrap().is_some());
        }
        // Still scoped: an unscoped copy would answer chats with no state.
        let handlers = storage.handlers_for_bot("bot-1").await.unwrap();
        let h1 = handlers.iter().find(|h| h.id == "h1").unwrap();
        assert_eq!(h1.source_states, vec!["s1".to_string()]);

        let mut moved = h1.clone();
        moved.source_states = vec!["s2".to_string()];
        storage.update_handler(&moved).await.unwrap();
        storage.delete_state("s1").await.unwrap();
        assert!(storage.get_state("s1").await.unwrap().is_none());
    }
}
