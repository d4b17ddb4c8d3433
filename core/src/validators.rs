//! Save-time validation of handler and hook configuration.

use crate::context::RenderContext;
use crate::error::{EngineError, Result};
use crate::matcher::compile_pattern;
use crate::template::{Renderer, parse_keyboard};

/// Tags accepted in HTML-formatted replies.
const ALLOWED_TAGS: &[&str] = &[
    "b", "strong", "i", "em", "u", "ins", "s", "strike", "del", "a", "code", "pre", "span",
    "tg-spoiler", "blockquote",
];

pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(EngineError::config("pattern must not be empty"));
    }
    compile_pattern(pattern)
        .map(|_| ())
        .map_err(|e| EngineError::config(format!("invalid pattern {pattern:?}: {e}")))
}

pub fn validate_template(renderer: &Renderer, source: &str) -> Result<()> {
    renderer.check_syntax(source)
}

/// Checks the template syntax, then renders it against an empty context and
/// requires the output to be blank or a keyboard literal.
pub fn validate_keyboard(renderer: &Renderer, source: &str) -> Result<()> {
    renderer.check_syntax(source)?;
    let rendered = renderer
        .render(source, RenderContext::builder().build())
        .map_err(|e| EngineError::config(format!("keyboard template: {e}")))?;
    parse_keyboard(&rendered)
        .map(|_| ())
        .map_err(|e| EngineError::config(format!("not a valid keyboard: {e}")))
}

/// Renders a text template against an empty context and checks that the
/// output only uses supported HTML tags and that they are balanced.
pub fn validate_markup(renderer: &Renderer, source: &str) -> Result<()> {
    renderer.check_syntax(source)?;
    let rendered = renderer
        .render(source, RenderContext::builder().build())
        .map_err(|e| EngineError::config(format!("text template: {e}")))?;
    check_tags(&rendered)
}

fn check_tags(text: &str) -> Result<()> {
    let mut open: Vec<String> = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let closing = rest.starts_with('/');
        let body = if closing { &rest[1..] } else { rest };
        if !body.starts_with(|c: char| c.is_ascii_alphabetic()) {
            continue;
        }
        let end = body
            .find('>')
            .ok_or_else(|| EngineError::config("unterminated HTML tag"))?;
        let name: String = body[..end]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if !ALLOWED_TAGS.contains(&name.as_str()) {
            return Err(EngineError::config(format!("unsupported tag <{name}>")));
        }
        if closing {
            match open.pop() {
                Some(top) if top == name => {}
                Some(top) => {
                    return Err(EngineError::config(format!("</{name}> closes <{top}>")));
                }
                None => return Err(EngineError::config(format!("</{name}> was never opened"))),
            }
        } else if !body[..end].ends_with('/') {
            open.push(name);
        }
        rest = &body[end + 1..];
    }

    match open.pop() {
        Some(tag) => Err(EngineError::config(format!("<{tag}> is not closed"))),
        None => Ok(()),
    }
}
