use tracing::{debug, info, warn};

use crate::composer::{TransitionPolicy, compose};
use crate::context::RenderContext;
use crate::error::Result;
use crate::executor::{HttpClient, RequestExecutor};
use crate::matcher::{Router, eligible_handlers};
use crate::models::db::Bot;
use crate::models::message::{IdentityShape, InboundMessage, Keyboard};
use crate::state_machine::StateMachine;
use crate::storage::{Storage, Transition};
use crate::template::Renderer;

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub handler_id: String,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// No eligible handler matched; nothing is sent.
    NoHandler,
    Reply(Reply),
}

/// Runs one inbound message through matching, request execution,
/// composition and the state transition.
pub struct Dispatcher<'a> {
    storage: &'a dyn Storage,
    renderer: &'a Renderer,
    http: &'a dyn HttpClient,
    policy: &'a dyn TransitionPolicy,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        renderer: &'a Renderer,
        http: &'a dyn HttpClient,
        policy: &'a dyn TransitionPolicy,
    ) -> Self {
        Self {
            storage,
            renderer,
            http,
            policy,
        }
    }

    pub async fn dispatch(
        &self,
        bot: &Bot,
        message: &InboundMessage,
        shape: IdentityShape,
    ) -> Result<DispatchOutcome> {
        let identity = message.identity.with_shape(shape);
        let machine = StateMachine::new(self.storage);

        let current = machine.current(&bot.id, &identity).await?;
        let (current_state, state_context) = match &current {
            Some((chat_state, state)) => (Some(state), chat_state.context.clone()),
            None => (None, serde_json::Value::Null),
        };

        let handlers = self.storage.handlers_for_bot(&bot.id).await?;
        let eligible = eligible_handlers(&handlers, current_state.map(|s| s.id.as_str()));
        let router = Router::new(eligible);

        let Some(matched) = router.find_match(&message.command_text) else {
            warn!(
                bot_id = bot.id,
                chat_id = identity.chat_id,
                state = current_state.map(|s| s.name.as_str()),
                candidates = router.len(),
                "No handler matched"
            );
            return Ok(DispatchOutcome::NoHandler);
        };
        let handler = matched.handler;
        info!(
            bot_id = bot.id,
            handler = handler.name,
            chat_id = identity.chat_id,
            "Handler matched"
        );

        let env = self.storage.env_vars(&bot.id).await?;
        let mut ctx = RenderContext::builder()
            .pattern(matched.params)
            .env(&env)
            .state_context(state_context)
            .message(message.raw.clone(), message.envelope.clone())
            .service(message.platform)
            .build();

        if let Some(request) = &handler.request {
            let response = RequestExecutor::new(self.renderer, self.http)
                .execute(request, &ctx)
                .await?;
            ctx.set_response(&response);
        }

        let composition = compose(
            self.renderer,
            &handler,
            &ctx,
            current_state.map(|s| s.name.as_str()),
            self.policy,
        )?;

        match (&handler.target_state, composition.should_transition) {
            (Some(target), true) => {
                let outcome = machine
                    .transition(&bot.id, &identity, target, &composition.contribution)
                    .await?;
                if let Transition::Unchanged(_) = outcome {
                    debug!(handler = handler.name, "Transition left the chat as it was");
                }
            }
            (Some(target), false) => debug!(
                handler = handler.name,
                target_state = target,
                status = ctx.response_status(),
                "Transition not allowed"
            ),
            (None, _) => {}
        }

        Ok(DispatchOutcome::Reply(Reply {
            handler_id: handler.id,
            text: composition.text,
            keyboard: composition.keyboard,
        }))
    }
}
