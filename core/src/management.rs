//! Save-time operations on bot configuration. Everything stored through here
//! is validated first, so the dispatch path only sees well-formed patterns
//! and templates.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::AdapterFactory;
use crate::cache::{self, KeyValueCache};
use crate::error::{EngineError, Result};
use crate::hooks::generate_hook_key;
use crate::models::db::{
    Bot, EnvironmentVar, Handler, Hook, HttpMethod, Param, Platform, PlatformBinding, Recipient,
    RequestSpec, ResponseSpec, State,
};
use crate::storage::Storage;
use crate::template::Renderer;
use crate::validators::{validate_keyboard, validate_markup, validate_pattern, validate_template};

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub url_template: String,
    pub method: HttpMethod,
    pub data: Option<String>,
    pub url_parameters: Vec<Param>,
    pub header_parameters: Vec<Param>,
}

impl NewRequest {
    pub fn new(method: HttpMethod, url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            method,
            data: None,
            url_parameters: vec![],
            header_parameters: vec![],
        }
    }

    pub fn get(url_template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url_template)
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn url_param(mut self, key: impl Into<String>, value_template: impl Into<String>) -> Self {
        self.url_parameters.push(Param::new(key, value_template));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value_template: impl Into<String>) -> Self {
        self.header_parameters.push(Param::new(key, value_template));
        self
    }

    fn into_spec(self) -> RequestSpec {
        RequestSpec {
            id: new_id(),
            url_template: self.url_template,
            method: self.method,
            data: self.data,
            url_parameters: self.url_parameters,
            header_parameters: self.header_parameters,
        }
    }
}

/// Handler definition before it has ids.
#[derive(Debug, Clone)]
pub struct NewHandler {
    pub name: String,
    pub pattern: String,
    pub priority: i32,
    pub enabled: bool,
    pub source_states: Vec<String>,
    pub target_state: Option<String>,
    pub request: Option<NewRequest>,
    pub text_template: String,
    pub keyboard_template: Option<String>,
}

impl NewHandler {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, text_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            priority: 0,
            enabled: true,
            source_states: vec![],
            target_state: None,
            request: None,
            text_template: text_template.into(),
            keyboard_template: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn keyboard(mut self, template: impl Into<String>) -> Self {
        self.keyboard_template = Some(template.into());
        self
    }

    pub fn request(mut self, request: NewRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn source_state(mut self, state_id: impl Into<String>) -> Self {
        self.source_states.push(state_id.into());
        self
    }

    pub fn target_state(mut self, state_id: impl Into<String>) -> Self {
        self.target_state = Some(state_id.into());
        self
    }
}

/// Registers or removes platform webhooks when a binding is switched on or off.
pub struct BotLifecycle {
    adapters: Arc<dyn AdapterFactory>,
    public_base_url: Option<String>,
}

impl BotLifecycle {
    pub fn new(adapters: Arc<dyn AdapterFactory>, public_base_url: Option<String>) -> Self {
        Self {
            adapters,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn webhook_url(&self, binding: &PlatformBinding) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/{}/{}/", binding.platform, binding.id))
    }

    pub async fn on_enabled_changed(&self, binding: &PlatformBinding) -> Result<()> {
        let adapter = self.adapters.adapter(binding);
        if !binding.enabled {
            adapter.set_webhook(None).await?;
            info!(binding_id = binding.id, platform = %binding.platform, "Webhook removed");
            return Ok(());
        }
        match self.webhook_url(binding) {
            Some(url) => {
                adapter.set_webhook(Some(&url)).await?;
                info!(binding_id = binding.id, platform = %binding.platform, url = url, "Webhook registered");
            }
            None => warn!(
                binding_id = binding.id,
                "PUBLIC_BASE_URL is not set, webhook not registered"
            ),
        }
        Ok(())
    }
}

pub struct Manager<'a> {
    storage: &'a dyn Storage,
    renderer: &'a Renderer,
}

impl<'a> Manager<'a> {
    pub fn new(storage: &'a dyn Storage, renderer: &'a Renderer) -> Self {
        Self { storage, renderer }
    }

    pub async fn create_bot(&self, owner_id: &str, name: &str) -> Result<Bot> {
        let now = Utc::now();
        let bot = Bot {
            id: new_id(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_bot(&bot).await?;
        info!(bot_id = bot.id, name = bot.name, "Bot created");
        Ok(bot)
    }

    pub async fn delete_bot(&self, cache: &dyn KeyValueCache, bot_id: &str) -> Result<()> {
        self.storage.delete_bot(bot_id).await?;
        cache.delete(&cache::bot_key(bot_id)).await?;
        info!(bot_id = bot_id, "Bot deleted");
        Ok(())
    }

    /// Stores a binding and, when its enabled flag changed (or it is new),
    /// lets the lifecycle update the platform webhook.
    pub async fn save_binding(&self, lifecycle: &BotLifecycle, binding: &PlatformBinding) -> Result<()> {
        let previous = self.storage.get_binding(binding.platform, &binding.id).await?;
        self.storage.save_binding(binding).await?;
        let changed = previous.is_none_or(|p| p.enabled != binding.enabled);
        if changed {
            lifecycle.on_enabled_changed(binding).await?;
        }
        Ok(())
    }

    pub async fn create_binding(
        &self,
        lifecycle: &BotLifecycle,
        bot_id: &str,
        platform: Platform,
        token: &str,
        username: Option<&str>,
    ) -> Result<PlatformBinding> {
        if token.trim().is_empty() {
            return Err(EngineError::config(format!("{platform} token must not be empty")));
        }
        if platform == Platform::Kik && username.is_none_or(|u| u.trim().is_empty()) {
            return Err(EngineError::config("kik bindings need the bot username"));
        }
        let now = Utc::now();
        let binding = PlatformBinding {
            id: new_id(),
            bot_id: bot_id.to_string(),
            platform,
            token: token.to_string(),
            username: username.map(str::to_string),
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        self.save_binding(lifecycle, &binding).await?;
        Ok(binding)
    }

    pub async fn set_binding_enabled(
        &self,
        lifecycle: &BotLifecycle,
        platform: Platform,
        binding_id: &str,
        enabled: bool,
    ) -> Result<PlatformBinding> {
        let mut binding = self
            .storage
            .get_binding(platform, binding_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("{platform} binding {binding_id}")))?;
        binding.enabled = enabled;
        binding.updated_at = Utc::now();
        self.save_binding(lifecycle, &binding).await?;
        Ok(binding)
    }

    pub async fn set_env_var(&self, bot_id: &str, key: &str, value: &str) -> Result<EnvironmentVar> {
        let valid = key.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(EngineError::config(format!("{key:?} is not a valid variable name")));
        }
        self.storage.set_env_var(bot_id, key, value).await
    }

    pub async fn create_state(&self, bot_id: &str, name: &str) -> Result<State> {
        if name.trim().is_empty() {
            return Err(EngineError::config("state name must not be empty"));
        }
        let state = State {
            id: new_id(),
            bot_id: bot_id.to_string(),
            name: name.to_string(),
        };
        self.storage.insert_state(&state).await?;
        Ok(state)
    }

    pub async fn delete_state(&self, state_id: &str) -> Result<()> {
        self.storage.delete_state(state_id).await
    }

    pub async fn create_handler(&self, bot_id: &str, new: NewHandler) -> Result<Handler> {
        let handler = Handler {
            id: new_id(),
            bot_id: bot_id.to_string(),
            name: new.name,
            pattern: new.pattern,
            priority: new.priority,
            seq: 0,
            enabled: new.enabled,
            source_states: new.source_states,
            target_state: new.target_state,
            request: new.request.map(NewRequest::into_spec),
            response: ResponseSpec {
                id: new_id(),
                text_template: new.text_template,
                keyboard_template: new.keyboard_template,
            },
        };
        self.validate_handler(&handler).await?;
        let stored = self.storage.insert_handler(&handler).await?;
        info!(bot_id = bot_id, handler = stored.name, seq = stored.seq, "Handler created");
        Ok(stored)
    }

    pub async fn update_handler(&self, handler: &Handler) -> Result<()> {
        self.validate_handler(handler).await?;
        self.storage.update_handler(handler).await
    }

    /// Removes a handler's request; the handler keeps answering without it.
    pub async fn delete_request(&self, request_id: &str) -> Result<()> {
        self.storage.delete_request(request_id).await
    }

    pub async fn create_hook(
        &self,
        bot_id: &str,
        name: &str,
        text_template: &str,
        keyboard_template: Option<&str>,
    ) -> Result<Hook> {
        let response = ResponseSpec {
            id: new_id(),
            text_template: text_template.to_string(),
            keyboard_template: keyboard_template.map(str::to_string),
        };
        self.validate_response(&response)?;
        let hook = Hook {
            id: new_id(),
            bot_id: bot_id.to_string(),
            name: name.to_string(),
            key: generate_hook_key(),
            enabled: true,
            response_id: response.id.clone(),
            created_at: Utc::now(),
        };
        self.storage.insert_hook(&hook, &response).await?;
        info!(bot_id = bot_id, hook = hook.name, "Hook created");
        Ok(hook)
    }

    pub async fn set_hook_enabled(&self, hook_id: &str, enabled: bool) -> Result<Hook> {
        let mut hook = self
            .storage
            .get_hook(hook_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("hook {hook_id}")))?;
        hook.enabled = enabled;
        self.storage.update_hook(&hook).await?;
        Ok(hook)
    }

    pub async fn add_recipient(
        &self,
        hook_id: &str,
        platform: Platform,
        chat_id: &str,
        name: &str,
    ) -> Result<Recipient> {
        if self.storage.get_hook(hook_id).await?.is_none() {
            return Err(EngineError::not_found(format!("hook {hook_id}")));
        }
        let recipient = Recipient {
            id: new_id(),
            hook_id: hook_id.to_string(),
            platform,
            chat_id: chat_id.to_string(),
            name: name.to_string(),
        };
        self.storage.insert_recipient(&recipient).await?;
        Ok(recipient)
    }

    fn validate_response(&self, response: &ResponseSpec) -> Result<()> {
        validate_template(self.renderer, &response.text_template)?;
        validate_markup(self.renderer, &response.text_template)?;
        if let Some(keyboard) = &response.keyboard_template {
            validate_keyboard(self.renderer, keyboard)?;
        }
        Ok(())
    }

    async fn validate_handler(&self, handler: &Handler) -> Result<()> {
        validate_pattern(&handler.pattern)?;
        self.validate_response(&handler.response)?;

        if let Some(request) = &handler.request {
            validate_template(self.renderer, &request.url_template)?;
            if let Some(data) = &request.data {
                validate_template(self.renderer, data)?;
            }
            for param in request.url_parameters.iter().chain(&request.header_parameters) {
                validate_template(self.renderer, &param.value_template)?;
            }
        }

        let referenced = handler.source_states.iter().chain(handler.target_state.as_ref());
        for state_id in referenced {
            let owned = self
                .storage
                .get_state(state_id)
                .await?
                .is_some_and(|s| s.bot_id == handler.bot_id);
            if !owned {
                return Err(EngineError::config(format!(
                    "state {state_id} does not belong to bot {}",
                    handler.bot_id
                )));
            }
        }
        Ok(())
    }
}
