//! Hooks: externally triggered broadcasts of a rendered response to a fixed
//! set of recipients.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use tracing::{info, warn};

use crate::adapters::{AdapterFactory, send_reply};
use crate::context::RenderContext;
use crate::error::{EngineError, Result};
use crate::models::message::ReplyTarget;
use crate::storage::Storage;
use crate::template::Renderer;

pub const HOOK_KEY_LENGTH: usize = 32;

/// Random alphanumeric key used in the hook's public URL.
pub fn generate_hook_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(HOOK_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Renders the hook's response with `data` and sends it to every recipient
/// through the bot's binding for the recipient's platform. Returns how many
/// recipients were reached; a failed recipient does not stop the others.
pub async fn broadcast(
    storage: &dyn Storage,
    renderer: &Renderer,
    adapters: &dyn AdapterFactory,
    hook_id: &str,
    data: Value,
) -> Result<usize> {
    let hook = storage
        .get_hook(hook_id)
        .await?
        .filter(|h| h.enabled)
        .ok_or_else(|| EngineError::not_found(format!("hook {hook_id}")))?;
    let response = storage
        .get_response(&hook.response_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("response {}", hook.response_id)))?;
    let env = storage.env_vars(&hook.bot_id).await?;
    let bindings = storage.bindings_for_bot(&hook.bot_id).await?;
    let recipients = storage.recipients(&hook.id).await?;

    let mut delivered = 0;
    for recipient in &recipients {
        let Some(binding) = bindings
            .iter()
            .find(|b| b.platform == recipient.platform && b.enabled)
        else {
            warn!(
                hook = hook.name,
                platform = %recipient.platform,
                "Bot has no enabled binding for recipient platform"
            );
            continue;
        };

        let ctx = RenderContext::builder()
            .env(&env)
            .data(data.clone())
            .service(recipient.platform)
            .build();
        let text = renderer.render(&response.text_template, &ctx)?;
        let keyboard = match &response.keyboard_template {
            Some(template) => renderer.render_keyboard(template, &ctx)?,
            None => None,
        };

        let adapter = adapters.adapter(binding);
        let target = ReplyTarget::new(recipient.chat_id.clone(), Some(recipient.name.clone()));
        match send_reply(adapter.as_ref(), &target, &text, keyboard.as_ref()).await {
            Ok(_) => delivered += 1,
            Err(e) => warn!(
                hook = hook.name,
                recipient = recipient.name,
                error = %e,
                "Hook delivery failed"
            ),
        }
    }

    info!(
        hook = hook.name,
        delivered = delivered,
        recipients = recipients.len(),
        "Hook broadcast finished"
    );
    Ok(delivered)
}
