//! Logic-less SQL template expansion engine (spec §4.3).
//!
//! Directive set:
//!   `{{{ x }}}` — string-safe escaped render (single quotes doubled).
//!   `{{ x }}`   — literal render, no escaping.
//!   `{{#x}}…{{/x}}` — render the block iff `x` is present and truthy.
//!   `{{^x}}…{{/x}}` — render the block iff `x` is absent or falsy.
//!
//! Unlike the teacher's `minijinja`-based SQL templating (retained in
//! `config::templating` purely for directory discovery), this engine is a
//! small dedicated tokenizer: the Mustache-style section/escape semantics
//! this spec requires are not a natural fit for minijinja's Jinja2 syntax.

use serde_json::Value;

use crate::errors::{ApitapError, Result};

/// A typed variable context built from the `params`/`conn`/`cache`/`env`/`auth`
/// namespaces of spec §4.3, backed by a `serde_json::Value` tree.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    root: Value,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self {
            root: Value::Object(serde_json::Map::new()),
        }
    }

    /// Sets a top-level namespace (e.g. `"params"`, `"conn"`, `"cache"`, `"env"`, `"auth"`).
    pub fn set_namespace(&mut self, name: &str, value: Value) {
        if let Value::Object(map) = &mut self.root {
            map.insert(name.to_string(), value);
        }
    }

    /// Resolves a dotted path (`params.foo.bar`) against the context tree.
    /// Unknown variables resolve to `None` (renders as empty in non-conditional position).
    pub fn lookup(&self, dotted: &str) -> Option<&Value> {
        let mut current = &self.root;
        for part in dotted.split('.') {
            match current {
                Value::Object(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn is_truthy(&self, dotted: &str) -> bool {
        match self.lookup(dotted) {
            None => false,
            Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }
}

/// Renders `value` for a non-escaped `{{ x }}` substitution.
fn render_literal(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Array(items)) => {
            // Deterministic, escape-safe default: render as a SQL array literal.
            // Spec §9 leaves the exact list format implementation-defined.
            let parts: Vec<String> = items.iter().map(|v| render_literal(Some(v))).collect();
            format!("[{}]", parts.join(", "))
        }
        Some(Value::Object(_)) => String::new(),
    }
}

/// Renders `value` for an escaped `{{{ x }}}` substitution: wraps nothing, but
/// doubles embedded single quotes so the caller can safely wrap the result in
/// `'...'` inside SQL text (spec S3 injection-defense scenario).
fn render_escaped(value: Option<&Value>) -> String {
    let literal = render_literal(value);
    literal.replace('\'', "''")
}

#[derive(Debug)]
enum Token<'a> {
    Text(&'a str),
    Escaped(&'a str),
    Literal(&'a str),
    SectionOpen(&'a str),
    SectionInverted(&'a str),
    SectionClose(&'a str),
}

/// Tokenizes the raw template text into a flat stream of directives/text runs.
fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut text_start = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if i > text_start {
                tokens.push(Token::Text(&input[text_start..i]));
            }

            // Triple mustache {{{ ... }}}
            if i + 2 < bytes.len() && bytes[i + 2] == b'{' {
                let close = input[i + 3..]
                    .find("}}}")
                    .ok_or_else(|| ApitapError::Template("unbalanced tag: {{{".to_string()))?;
                let name = input[i + 3..i + 3 + close].trim();
                tokens.push(Token::Escaped(name));
                i = i + 3 + close + 3;
                text_start = i;
                continue;
            }

            let close = input[i + 2..]
                .find("}}")
                .ok_or_else(|| ApitapError::Template("unbalanced tag: {{".to_string()))?;
            let raw = input[i + 2..i + 2 + close].trim();
            let tok = if let Some(name) = raw.strip_prefix('#') {
                Token::SectionOpen(name.trim())
            } else if let Some(name) = raw.strip_prefix('^') {
                Token::SectionInverted(name.trim())
            } else if let Some(name) = raw.strip_prefix('/') {
                Token::SectionClose(name.trim())
            } else {
                Token::Literal(raw)
            };
            tokens.push(tok);
            i = i + 2 + close + 2;
            text_start = i;
        } else {
            i += 1;
        }
    }

    if text_start < bytes.len() {
        tokens.push(Token::Text(&input[text_start..]));
    }

    Ok(tokens)
}

/// Renders `template` against `ctx`. Rendering is deterministic: repeated
/// renders of the same template/context yield byte-identical output.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String> {
    let tokens = tokenize(template)?;
    render_tokens(&tokens, ctx)
}

fn render_tokens(tokens: &[Token<'_>], ctx: &TemplateContext) -> Result<String> {
    let mut out = String::new();
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Text(t) => {
                out.push_str(t);
                i += 1;
            }
            Token::Literal(name) => {
                out.push_str(&render_literal(ctx.lookup(name)));
                i += 1;
            }
            Token::Escaped(name) => {
                out.push_str(&render_escaped(ctx.lookup(name)));
                i += 1;
            }
            Token::SectionOpen(name) => {
                let (inner, next) = extract_section(tokens, i, name)?;
                if ctx.is_truthy(name) {
                    out.push_str(&render_tokens(inner, ctx)?);
                }
                i = next;
            }
            Token::SectionInverted(name) => {
                let (inner, next) = extract_section(tokens, i, name)?;
                if !ctx.is_truthy(name) {
                    out.push_str(&render_tokens(inner, ctx)?);
                }
                i = next;
            }
            Token::SectionClose(name) => {
                return Err(ApitapError::Template(format!(
                    "unbalanced closing tag: {{{{/{name}}}}}"
                )));
            }
        }
    }
    Ok(out)
}

/// Given tokens starting at a `SectionOpen`/`SectionInverted` at index `start`,
/// returns the slice of inner tokens and the index just past the matching close.
fn extract_section<'a, 'b>(
    tokens: &'b [Token<'a>],
    start: usize,
    name: &str,
) -> Result<(&'b [Token<'a>], usize)> {
    let mut depth = 0usize;
    let mut j = start + 1;
    while j < tokens.len() {
        match &tokens[j] {
            Token::SectionOpen(n) | Token::SectionInverted(n) if *n == name => depth += 1,
            Token::SectionClose(n) if *n == name => {
                if depth == 0 {
                    return Ok((&tokens[start + 1..j], j + 1));
                }
                depth -= 1;
            }
            _ => {}
        }
        j += 1;
    }
    Err(ApitapError::Template(format!(
        "unbalanced tag: {{{{#{name}}}}} has no matching {{{{/{name}}}}}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_params(params: Value) -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.set_namespace("params", params);
        ctx
    }

    #[test]
    fn literal_substitution() {
        let ctx = ctx_with_params(json!({"id": 42}));
        let out = render("SELECT {{ params.id }}", &ctx).unwrap();
        assert_eq!(out, "SELECT 42");
    }

    #[test]
    fn missing_variable_renders_empty() {
        let ctx = TemplateContext::new();
        let out = render("X[{{ params.missing }}]", &ctx).unwrap();
        assert_eq!(out, "X[]");
    }

    #[test]
    fn escape_doubles_single_quotes() {
        let ctx = ctx_with_params(json!({"name": "O'Brien"}));
        let out = render("WHERE name='{{{ params.name }}}'", &ctx).unwrap();
        assert_eq!(out, "WHERE name='O''Brien'");
    }

    #[test]
    fn escape_doubling_is_proportional_to_quote_count() {
        let s = "a'b'c'd";
        let n_quotes = s.matches('\'').count();
        let ctx = ctx_with_params(json!({"v": s}));
        let out = render("{{{ params.v }}}", &ctx).unwrap();
        assert_eq!(out.matches('\'').count(), 2 * n_quotes);
    }

    #[test]
    fn truthy_section_renders_when_present() {
        let ctx = ctx_with_params(json!({"id": 42}));
        let out = render("{{#params.id}}AND id={{ params.id }}{{/params.id}}", &ctx).unwrap();
        assert_eq!(out, "AND id=42");
    }

    #[test]
    fn truthy_section_skipped_when_absent() {
        let ctx = TemplateContext::new();
        let out = render("{{#params.id}}AND id={{ params.id }}{{/params.id}}", &ctx).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn inverted_section_renders_when_falsy() {
        let ctx = TemplateContext::new();
        let out = render("{{^params.id}}no id given{{/params.id}}", &ctx).unwrap();
        assert_eq!(out, "no id given");
    }

    #[test]
    fn inverted_section_skipped_when_truthy() {
        let ctx = ctx_with_params(json!({"id": 1}));
        let out = render("{{^params.id}}no id given{{/params.id}}", &ctx).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn zero_is_falsy_and_empty_string_is_falsy() {
        let ctx = ctx_with_params(json!({"n": 0, "s": ""}));
        assert_eq!(render("{{#params.n}}x{{/params.n}}", &ctx).unwrap(), "");
        assert_eq!(render("{{#params.s}}x{{/params.s}}", &ctx).unwrap(), "");
    }

    #[test]
    fn unbalanced_section_tag_errors() {
        let ctx = TemplateContext::new();
        let err = render("{{#params.id}}oops", &ctx).unwrap_err();
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn stray_closing_tag_errors() {
        let ctx = TemplateContext::new();
        let err = render("oops{{/params.id}}", &ctx).unwrap_err();
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let ctx = ctx_with_params(json!({"id": 7, "name": "Ada"}));
        let tpl = "SELECT {{ params.id }}, '{{{ params.name }}}' {{#params.id}}LIMIT 10{{/params.id}}";
        let a = render(tpl, &ctx).unwrap();
        let b = render(tpl, &ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn nested_dotted_lookup() {
        let ctx = ctx_with_params(json!({"foo": {"bar": "baz"}}));
        let out = render("{{ params.foo.bar }}", &ctx).unwrap();
        assert_eq!(out, "baz");
    }

    #[test]
    fn full_s1_scenario_template() {
        let tpl = "SELECT id,name FROM 'customers.parquet' WHERE 1=1 {{#params.id}}AND id={{ params.id }}{{/params.id}} LIMIT 10";
        let ctx = ctx_with_params(json!({"id": 42}));
        let out = render(tpl, &ctx).unwrap();
        assert_eq!(
            out,
            "SELECT id,name FROM 'customers.parquet' WHERE 1=1 AND id=42 LIMIT 10"
        );
    }
}
