//! Worker-side job handling: consumes jobs from the queue, runs them and
//! acknowledges the ones that completed.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::adapters::send_reply;
use crate::cache::{self, abandon_message, claim_message, release_message};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{EngineError, Result};
use crate::hooks;
use crate::models::db::{Bot, Platform};
use crate::models::message::InboundMessage;
use crate::models::payloads::IncomingJob;
use crate::queue::Delivery;
use crate::AppState;

/// Processes one cached inbound message at most once.
///
/// The message is claimed before dispatch and released once it has been
/// dispatched, even when the reply could not be delivered. On a dispatch
/// failure the claim is dropped and the message stays cached, so a
/// redelivery of the job can try again until the entry expires.
pub async fn handle_message(
    state: &AppState,
    binding_id: &str,
    platform: Platform,
    message_key: &str,
) -> Result<()> {
    let Some(message) = claim_message(state.cache.as_ref(), message_key).await? else {
        debug!(message_key = message_key, "Nothing to process");
        return Ok(());
    };

    match process_message(state, binding_id, platform, &message).await {
        Ok(()) => release_message(state.cache.as_ref(), message_key).await,
        Err(e) => {
            error!(
                binding_id = binding_id,
                platform = %platform,
                message_id = message.id,
                error = %e,
                "Failed to process message"
            );
            if let Err(release_err) = abandon_message(state.cache.as_ref(), message_key).await {
                warn!(error = %release_err, "Failed to drop processing lock");
            }
            Err(e)
        }
    }
}

async fn process_message(
    state: &AppState,
    binding_id: &str,
    platform: Platform,
    message: &InboundMessage,
) -> Result<()> {
    let binding = state
        .storage
        .get_binding(platform, binding_id)
        .await?
        .filter(|b| b.enabled)
        .ok_or_else(|| EngineError::not_found(format!("{platform} binding {binding_id}")))?;

    let storage = state.storage.clone();
    let bot_id = binding.bot_id.clone();
    let bot: Bot = cache::get_or_set(
        state.cache.as_ref(),
        &cache::bot_key(&binding.bot_id),
        state.config.cache_ttl_secs,
        || async move { storage.get_bot(&bot_id).await },
    )
    .await?
    .ok_or_else(|| EngineError::not_found(format!("bot {}", binding.bot_id)))?;

    let adapter = state.adapters.adapter(&binding);
    let dispatcher = Dispatcher::new(
        state.storage.as_ref(),
        &state.renderer,
        state.http.as_ref(),
        state.policy.as_ref(),
    );

    match dispatcher.dispatch(&bot, message, adapter.identity_shape()).await? {
        DispatchOutcome::NoHandler => Ok(()),
        DispatchOutcome::Reply(reply) => {
            // The transition is committed: the message is consumed even
            // when the send fails.
            let sent = send_reply(adapter.as_ref(), &message.reply_to, &reply.text, reply.keyboard.as_ref()).await;
            if let Err(e) = sent {
                warn!(
                    binding_id = binding_id,
                    platform = %platform,
                    message_id = message.id,
                    error = %e,
                    "Reply not delivered, message consumed"
                );
            }
            Ok(())
        }
    }
}

pub async fn handle_hook(state: &AppState, hook_id: &str, data: Value) -> Result<usize> {
    hooks::broadcast(
        state.storage.as_ref(),
        &state.renderer,
        state.adapters.as_ref(),
        hook_id,
        data,
    )
    .await
    .inspect_err(|e| error!(hook_id = hook_id, error = %e, "Failed to process hook"))
}

/// Runs one queue entry and acknowledges it when it completed or can never
/// succeed (unparsable payload).
pub async fn process_delivery(state: Arc<AppState>, delivery: Delivery) {
    let job = match delivery.job() {
        Ok(job) => job,
        Err(e) => {
            error!(id = delivery.id, payload = delivery.payload, error = %e, "Failed to parse job");
            // ACK to avoid poison pill
            ack(&state, &delivery.id).await;
            return;
        }
    };

    let result = match job {
        IncomingJob::NewMessage {
            binding_id,
            platform,
            message_key,
        } => {
            debug!(binding_id = binding_id, platform = %platform, "Received NEW_MESSAGE");
            handle_message(&state, &binding_id, platform, &message_key).await
        }
        IncomingJob::HookTriggered { hook_id, data } => {
            debug!(hook_id = hook_id, "Received HOOK_TRIGGERED");
            handle_hook(&state, &hook_id, data).await.map(|_| ())
        }
    };

    if result.is_ok() {
        ack(&state, &delivery.id).await;
    }
}

async fn ack(state: &AppState, id: &str) {
    if let Err(e) = state.queue.ack(id).await {
        warn!(id = id, error = %e, "Failed to acknowledge job");
    }
}

/// Reprocesses jobs left unacknowledged by a previous run, then consumes new
/// jobs forever, one task per job.
pub async fn run_worker(state: Arc<AppState>) -> anyhow::Result<()> {
    let pending = state
        .queue
        .pending()
        .await
        .context("Failed to read pending jobs")?;
    if !pending.is_empty() {
        info!(count = pending.len(), "Recovering unacknowledged jobs");
    }
    for delivery in pending {
        process_delivery(state.clone(), delivery).await;
    }

    info!(stream = state.config.stream_key, "Listening for incoming jobs");
    loop {
        match state.queue.next_batch().await {
            Ok(batch) => {
                for delivery in batch {
                    let spawn_state = state.clone();
                    tokio::spawn(async move {
                        process_delivery(spawn_state, delivery).await;
                    });
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading from job queue");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}
