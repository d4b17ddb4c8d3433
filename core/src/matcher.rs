use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::models::db::Handler;

pub struct MatchResult {
    pub handler: Handler,
    /// Named capture groups, exposed to templates as `pattern.<name>`.
    pub params: Map<String, Value>,
}

/// Handlers reachable from the chat's current state: enabled, and either
/// unrestricted or listing the current state among their sources.
pub fn eligible_handlers(handlers: &[Handler], current_state: Option<&str>) -> Vec<Handler> {
    handlers
        .iter()
        .filter(|h| h.enabled)
        .filter(|h| {
            h.source_states.is_empty()
                || current_state.is_some_and(|s| h.source_states.iter().any(|src| src == s))
        })
        .cloned()
        .collect()
}

/// Compiles a handler pattern with full-match anchoring.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Handlers compiled and sorted by priority (descending), then insertion order.
pub struct Router {
    routes: Vec<(Regex, Handler)>,
}

impl Router {
    pub fn new(handlers: Vec<Handler>) -> Self {
        let mut routes: Vec<(Regex, Handler)> = handlers
            .into_iter()
            .filter_map(|h| match compile_pattern(&h.pattern) {
                Ok(re) => Some((re, h)),
                Err(e) => {
                    warn!(handler_id = h.id, pattern = h.pattern, error = %e, "Skipping handler with invalid pattern");
                    None
                }
            })
            .collect();
        routes.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Matches against the full text as received; surrounding whitespace is
    /// part of it.
    pub fn find_match(&self, content: &str) -> Option<MatchResult> {
        for (re, handler) in &self.routes {
            if let Some(caps) = re.captures(content) {
                let mut params = Map::new();
                for name in re.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        params.insert(name.to_string(), Value::String(m.as_str().to_string()));
                    }
                }
                return Some(MatchResult {
                    handler: handler.clone(),
                    params,
                });
            }
        }

        None
    }
}

/// First handler whose pattern fully matches `content`, by priority.
pub fn find_match(content: &str, handlers: &[Handler]) -> Option<MatchResult> {
    Router::new(handlers.to_vec()).find_match(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::db::ResponseSpec;

    fn make_handler(name: &str, pattern: &str, priority: i32, seq: i64) -> Handler {
        Handler {
            id: format!("handler-{}", name),
            bot_id: "bot-1".to_string(),
            name: name.to_string(),
            pattern: pattern.to_string(),
            priority,
            seq,
            enabled: true,
            source_states: vec![],
            target_state: None,
            request: None,
            response: ResponseSpec {
                id: format!("response-{}", name),
                text_template: "ok".to_string(),
                keyboard_template: None,
            },
        }
    }

    #[test]
    fn exact_pattern_matches() {
        let handlers = vec![make_handler("authors", "/authors", 0, 1)];
        let result = find_match("/authors", &handlers);
        assert!(result.is_some());
        assert!(result.unwrap().params.is_empty());
    }

    #[test]
    fn pattern_is_full_match() {
        let handlers = vec![make_handler("authors", "/authors", 0, 1)];
        assert!(find_match("/authors_delete", &handlers).is_none());
        assert!(find_match("x/authors", &handlers).is_none());
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        let handlers = vec![make_handler("ab", "/a|/b", 0, 1)];
        assert!(find_match("/b", &handlers).is_some());
        assert!(find_match("/ab", &handlers).is_none());
    }

    #[test]
    fn named_groups_become_params() {
        let handlers = vec![make_handler("author", r"/authors@(?P<id>\d+)", 0, 1)];
        let result = find_match("/authors@1", &handlers).unwrap();
        assert_eq!(result.params["id"], "1");
    }

    #[test]
    fn higher_priority_wins() {
        let handlers = vec![
            make_handler("handler1", "/authors", 1, 1),
            make_handler("handler2", "/authors", 2, 2),
        ];
        let result = find_match("/authors", &handlers).unwrap();
        assert_eq!(result.handler.name, "handler2");
    }

    #[test]
    fn ties_keep_insertion_order() {
        let handlers = vec![
            make_handler("second", "/authors", 5, 2),
            make_handler("first", "/authors", 5, 1),
        ];
        let result = find_match("/authors", &handlers).unwrap();
        assert_eq!(result.handler.name, "first");
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let handlers = vec![
            make_handler("broken", "/authors(", 10, 1),
            make_handler("good", "/authors", 0, 2),
        ];
        let result = find_match("/authors", &handlers).unwrap();
        assert_eq!(result.handler.name, "good");
    }

    #[test]
    fn whole_text_is_matched_untrimmed() {
        let handlers = vec![make_handler("authors", "/authors", 0, 1)];
        assert!(find_match(" /authors ", &handlers).is_none());

        let any = vec![make_handler("any", ".*", 0, 1)];
        assert!(find_match("", &any).is_some());
        assert!(find_match("   ", &any).is_some());
    }

    #[test]
    fn no_handlers_returns_none() {
        assert!(find_match("/authors", &[]).is_none());
    }

    #[test]
    fn disabled_handlers_are_not_eligible() {
        let mut h = make_handler("authors", "/authors", 0, 1);
        h.enabled = false;
        assert!(eligible_handlers(&[h], None).is_empty());
    }

    #[test]
    fn source_states_restrict_eligibility() {
        let mut scoped = make_handler("scoped", "/authors", 0, 1);
        scoped.source_states = vec!["s1".to_string()];
        let open = make_handler("open", "/books", 0, 2);
        let handlers = vec![scoped, open];

        let in_s1 = eligible_handlers(&handlers, Some("s1"));
        assert_eq!(in_s1.len(), 2);

        let in_s2 = eligible_handlers(&handlers, Some("s2"));
        assert_eq!(in_s2.len(), 1);
        assert_eq!(in_s2[0].name, "open");

        let no_state = eligible_handlers(&handlers, None);
        assert_eq!(no_state.len(), 1);
        assert_eq!(no_state[0].name, "open");
    }
}
