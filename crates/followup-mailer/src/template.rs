//! Mail template rendering.
//!
//! Two passes over the text:
//! 1. conditional blocks `{% name %}…{%}` / `{% !name %}…{%}`, kept or
//!    dropped on the truthiness of `context[name]`;
//! 2. tags `{name}` or `{name:modifier}`, replaced by the registered
//!    producer's output. Unknown tags are left untouched.
//!
//! Substitution is a single pass: producer output is never re-scanned.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use followup_core::Context;
use regex::{Captures, Regex};
use serde_json::Value;

/// Produces the replacement text for one tag.
pub type TagProducer = Arc<dyn Fn(&Context) -> String + Send + Sync>;

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{%\s*(!?)\s*([A-Za-z_][A-Za-z0-9_]*)\s*%\}(.*?)\{%\}")
        .unwrap_or_else(|e| panic!("invalid block pattern: {e}"))
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_]+)(?::[^}]*)?\}")
        .unwrap_or_else(|e| panic!("invalid tag pattern: {e}"))
});

static PARAGRAPH_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").unwrap_or_else(|e| panic!("invalid pattern: {e}")));

#[derive(Clone, Default)]
pub struct TemplateRenderer {
    tags: HashMap<String, TagProducer>,
}

impl TemplateRenderer {
    /// Renderer with no tags at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renderer with the built-in tags: `site_name`, `site_url`,
    /// `customer_name`, `notes` and `has_notes`.
    pub fn with_defaults(site_name: &str, site_url: &str) -> Self {
        let mut renderer = Self::new();

        let name = site_name.to_string();
        renderer.register_tag("site_name", move |_| name.clone());

        let url = site_url.to_string();
        renderer.register_tag("site_url", move |_| url.clone());

        renderer.register_tag("customer_name", |ctx| {
            ctx.get("customer_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });

        renderer.register_tag("notes", |ctx| {
            ctx.get("notes")
                .and_then(Value::as_str)
                .map(paragraphs)
                .unwrap_or_default()
        });

        renderer.register_tag("has_notes", |ctx| {
            let has = ctx
                .get("notes")
                .and_then(Value::as_str)
                .is_some_and(|n| !n.is_empty());
            if has { "1".into() } else { String::new() }
        });

        renderer
    }

    /// Add or replace a tag.
    pub fn register_tag<F>(&mut self, name: &str, producer: F)
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.tags.insert(name.to_string(), Arc::new(producer));
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn render(&self, text: &str, context: &Context) -> String {
        let text = render_blocks(text, context);
        TAG_RE
            .replace_all(&text, |caps: &Captures| match self.tags.get(&caps[1]) {
                Some(producer) => producer(context),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

fn render_blocks(text: &str, context: &Context) -> String {
    BLOCK_RE
        .replace_all(text, |caps: &Captures| {
            let negate = &caps[1] == "!";
            let met = context.get(&caps[2]).is_some_and(is_truthy);
            if met != negate {
                caps[3].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

/// Truthiness used by conditional blocks and validation predicates.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.trim().is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f > 0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Plain text to HTML paragraphs: blank lines split `<p>` blocks, single
/// newlines become `<br />`.
pub fn paragraphs(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    PARAGRAPH_BREAK_RE
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>\n", p.replace('\n', "<br />\n")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => Context::new(),
        }
    }

    #[test]
    fn test_conditional_blocks() {
        let r = TemplateRenderer::new();
        let c = ctx(json!({"has_notes": true, "count": 0, "name": "  "}));

        assert_eq!(r.render("A{% has_notes %}B{%}C", &c), "ABC");
        assert_eq!(r.render("A{% !has_notes %}B{%}C", &c), "AC");
        assert_eq!(r.render("{%count%}x{%}{% !count %}y{%}", &c), "y");
        assert_eq!(r.render("{% name %}x{%}", &c), "");
        assert_eq!(r.render("{% missing %}x{%}{% ! missing %}y{%}", &c), "y");
        assert_eq!(r.render("{% has_notes %}line1\nline2{%}", &c), "line1\nline2");
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!("0")));
        assert!(!is_truthy(&json!(" \t")));
        assert!(is_truthy(&json!(0.5)));
        assert!(!is_truthy(&json!(-1)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!({"a": 1})));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_tags_and_modifiers() {
        let mut r = TemplateRenderer::with_defaults("Acme", "https://acme.test");
        r.register_tag("order_id", |c| c["order_id"].to_string());
        let c = ctx(json!({"order_id": 42, "customer_name": "Dana"}));

        assert_eq!(
            r.render("Hi {customer_name}, order #{order_id:raw} at {site_name} ({site_url})", &c),
            "Hi Dana, order #42 at Acme (https://acme.test)"
        );
        assert_eq!(r.render("{unknown} {unknown:x}", &c), "{unknown} {unknown:x}");
        assert_eq!(r.render("{customer_name}", &Context::new()), "");
    }

    #[test]
    fn test_producer_output_not_rescanned() {
        let mut r = TemplateRenderer::new();
        r.register_tag("a", |_| "{b}".into());
        r.register_tag("b", |_| "B".into());
        assert_eq!(r.render("{a}{b}", &Context::new()), "{b}B");
    }

    #[test]
    fn test_dropped_blocks_do_not_call_producers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut r = TemplateRenderer::new();
        r.register_tag("expensive", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            "x".into()
        });

        let c = ctx(json!({"show": false}));
        assert_eq!(r.render("{% show %}{expensive}{%}", &c), "");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        r.render("{expensive}{expensive}", &c);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_notes_tags() {
        let r = TemplateRenderer::with_defaults("Acme", "");
        let c = ctx(json!({"notes": "First line\nsecond line\n\nNew para"}));
        assert_eq!(
            r.render("{notes}", &c),
            "<p>First line<br />\nsecond line</p>\n<p>New para</p>\n"
        );
        assert_eq!(r.render("[{has_notes}]", &c), "[1]");
        assert_eq!(r.render("[{has_notes}]", &Context::new()), "[]");
    }

    #[test]
    fn test_template_without_markup_is_unchanged() {
        let r = TemplateRenderer::with_defaults("Acme", "");
        let text = "Plain text with braces { like this } and 100% effort.";
        assert_eq!(r.render(text, &Context::new()), text);
    }
}
