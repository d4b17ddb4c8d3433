//! Jinja-style template rendering for handler and hook responses.
//!
//! Undefined lookups render as empty strings, iterate as empty sequences and
//! are falsy, so templates can reference sections (`response`, `state_context`)
//! that are absent for a given dispatch. Syntax errors are always errors.

use std::iter::Peekable;
use std::str::Chars;

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::models::message::Keyboard;

#[derive(Clone)]
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        // JSON nulls print as nothing rather than "none".
        env.set_formatter(|out, state, value| {
            if value.is_none() {
                Ok(())
            } else {
                minijinja::escape_formatter(out, state, value)
            }
        });
        Self { env }
    }

    /// Compiles the template without rendering it.
    pub fn check_syntax(&self, source: &str) -> Result<()> {
        self.env
            .template_from_str(source)
            .map(|_| ())
            .map_err(|e| EngineError::config(format!("template syntax: {e}")))
    }

    pub fn render<S: Serialize>(&self, source: &str, ctx: S) -> Result<String> {
        self.env
            .render_str(source, ctx)
            .map_err(|e| EngineError::Render(e.to_string()))
    }

    /// Renders a keyboard template. Blank output means "no keyboard"; output
    /// that is not a literal list of rows is logged and also treated as none.
    pub fn render_keyboard<S: Serialize>(&self, source: &str, ctx: S) -> Result<Option<Keyboard>> {
        if source.trim().is_empty() {
            return Ok(None);
        }
        let rendered = self.render(source, ctx)?;
        match parse_keyboard(&rendered) {
            Ok(keyboard) => Ok(keyboard),
            Err(e) => {
                warn!(rendered = rendered.as_str(), error = e.as_str(), "Keyboard did not parse, sending none");
                Ok(None)
            }
        }
    }
}

/// Parses a rendered keyboard such as `[['a','b'],["c"]]`.
///
/// Returns `Ok(None)` for blank input or an empty outer list.
pub fn parse_keyboard(input: &str) -> std::result::Result<Option<Keyboard>, String> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    let mut parser = LiteralParser {
        chars: input.chars().peekable(),
    };
    parser.skip_ws();
    let rows = parser.list(|p| {
        p.skip_ws();
        p.list(|p| p.scalar())
    })?;
    parser.skip_ws();
    if parser.chars.peek().is_some() {
        return Err("trailing characters after keyboard".to_string());
    }
    let rows: Keyboard = rows.into_iter().filter(|row| !row.is_empty()).collect();
    if rows.is_empty() {
        Ok(None)
    } else {
        Ok(Some(rows))
    }
}

struct LiteralParser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl LiteralParser<'_> {
    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn expect(&mut self, expected: char) -> std::result::Result<(), String> {
        match self.chars.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(format!("expected '{expected}', found '{c}'")),
            None => Err(format!("expected '{expected}', found end of input")),
        }
    }

    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> std::result::Result<T, String>,
    ) -> std::result::Result<Vec<T>, String> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.chars.peek() == Some(&']') {
                self.chars.next();
                return Ok(items);
            }
            items.push(item(self)?);
            self.skip_ws();
            match self.chars.next() {
                Some(',') => continue,
                Some(']') => return Ok(items),
                Some(c) => return Err(format!("unexpected '{c}' in list")),
                None => return Err("unterminated list".to_string()),
            }
        }
    }

    fn scalar(&mut self) -> std::result::Result<String, String> {
        self.skip_ws();
        match self.chars.peek().copied() {
            Some(q @ ('\'' | '"')) => {
                self.chars.next();
                self.quoted(q)
            }
            Some(c) if c.is_ascii_digit() || c == '-' => Ok(self.number()),
            Some(c) => Err(format!("unexpected '{c}', expected a quoted label")),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn quoted(&mut self, quote: char) -> std::result::Result<String, String> {
        let mut out = String::new();
        while let Some(c) = self.chars.next() {
            match c {
                '\\' => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => break,
                },
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
        Err("unterminated string".to_string())
    }

    fn number(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == '-' {
                out.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_loop_over_response_data() {
        let r = Renderer::new();
        let ctx = json!({"response": {"status": 200, "data": [{"name": "author1"}]}});
        let out = r
            .render("{% for a in response.data %}<b>{{a.name}}</b>{% endfor %}", &ctx)
            .unwrap();
        assert_eq!(out, "<b>author1</b>");
    }

    #[test]
    fn undefined_renders_empty() {
        let r = Renderer::new();
        let out = r.render("x{{ missing }}{{ response.data.name }}y", json!({})).unwrap();
        assert_eq!(out, "xy");
    }

    #[test]
    fn undefined_loop_is_empty() {
        let r = Renderer::new();
        let out = r
            .render("{% for a in response.data %}{{a}}{% endfor %}done", json!({}))
            .unwrap();
        assert_eq!(out, "done");
    }

    #[test]
    fn null_prints_nothing() {
        let r = Renderer::new();
        let out = r.render("[{{ v }}]", json!({"v": null})).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn html_is_not_escaped() {
        let r = Renderer::new();
        let out = r.render("{{ v }}", json!({"v": "<i>x</i>"})).unwrap();
        assert_eq!(out, "<i>x</i>");
    }

    #[test]
    fn broken_syntax_is_rejected() {
        let r = Renderer::new();
        assert!(matches!(
            r.check_syntax("{% for a in x %}"),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(r.render("{{ a ", json!({})), Err(EngineError::Render(_))));
    }

    #[test]
    fn parses_single_and_double_quotes() {
        let kb = parse_keyboard(r#"[['a','b'], ["c"],]"#).unwrap().unwrap();
        assert_eq!(kb, vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]);
    }

    #[test]
    fn blank_and_empty_keyboards_are_none() {
        assert_eq!(parse_keyboard("  ").unwrap(), None);
        assert_eq!(parse_keyboard("[]").unwrap(), None);
        assert_eq!(parse_keyboard("[[]]").unwrap(), None);
    }

    #[test]
    fn unbalanced_keyboard_is_an_error() {
        assert!(parse_keyboard("[['a','b']").is_err());
        assert!(parse_keyboard("['a']").is_err());
        assert!(parse_keyboard("[['a']] x").is_err());
    }

    #[test]
    fn numbers_become_labels() {
        let kb = parse_keyboard("[[1, 2]]").unwrap().unwrap();
        assert_eq!(kb, vec![vec!["1".to_string(), "2".to_string()]]);
    }

    #[test]
    fn keyboard_parse_failure_degrades_to_none() {
        let r = Renderer::new();
        let kb = r.render_keyboard("[['{{ x }}'", json!({"x": "a"})).unwrap();
        assert_eq!(kb, None);
    }

    #[test]
    fn keyboard_with_template_inside() {
        let r = Renderer::new();
        let kb = r
            .render_keyboard(
                r#"[[{% for a in response.data %}"{{a.name}}"{% endfor %}]]"#,
                json!({"response": {"data": [{"name": "author1"}]}}),
            )
            .unwrap();
        assert_eq!(kb, Some(vec![vec!["author1".to_string()]]));
    }
}
