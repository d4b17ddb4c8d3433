//! Response composition: renders a handler's response and decides whether the
//! chat moves to the handler's target state.

use serde_json::{Map, Value};

use crate::context::RenderContext;
use crate::error::Result;
use crate::models::db::Handler;
use crate::models::message::Keyboard;
use crate::template::Renderer;

/// Context key used when the chat had no state before the transition.
pub const INITIAL_STATE_KEY: &str = "_start";

/// Decides whether a handler's execution counts as a success for the purpose
/// of moving the chat to the handler's target state.
pub trait TransitionPolicy: Send + Sync {
    fn allows(&self, ctx: &RenderContext) -> bool;
}

/// Transitions when no request was made or the request answered with 2xx.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuccessStatusPolicy;

impl TransitionPolicy for SuccessStatusPolicy {
    fn allows(&self, ctx: &RenderContext) -> bool {
        match ctx.response() {
            None => true,
            Some(_) => ctx.response_status().is_some_and(|s| (200..300).contains(&s)),
        }
    }
}

/// Transitions whenever the handler has a target state.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysTransition;

impl TransitionPolicy for AlwaysTransition {
    fn allows(&self, _ctx: &RenderContext) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct Composition {
    pub text: String,
    pub keyboard: Option<Keyboard>,
    pub should_transition: bool,
    /// `{ <source state name>: snapshot }`, merged into ChatState.context.
    pub contribution: Value,
}

pub fn compose(
    renderer: &Renderer,
    handler: &Handler,
    ctx: &RenderContext,
    source_state: Option<&str>,
    policy: &dyn TransitionPolicy,
) -> Result<Composition> {
    let text = renderer.render(&handler.response.text_template, ctx)?;
    let keyboard = match &handler.response.keyboard_template {
        Some(template) => renderer.render_keyboard(template, ctx)?,
        None => None,
    };
    let should_transition = handler.target_state.is_some() && policy.allows(ctx);

    let mut contribution = Map::new();
    contribution.insert(
        source_state.unwrap_or(INITIAL_STATE_KEY).to_string(),
        ctx.snapshot(),
    );

    Ok(Composition {
        text,
        keyboard,
        should_transition,
        contribution: Value::Object(contribution),
    })
}
