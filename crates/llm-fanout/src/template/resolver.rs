//! Variable substitution and iteration blocks for prompt bodies.
//!
//! Supported constructs:
//!
//! - `{{key}}` / `{{a.b}}`: substitution. Strings are inserted raw, other
//!   scalars in their JSON text form, arrays and objects as compact JSON,
//!   `null` as nothing. A key that does not resolve leaves the placeholder
//!   in the output verbatim.
//! - `{{#each key}}...{{/each}}`: renders the block once per element. Record
//!   fields are addressable by name, the element itself as `{{this}}` and its
//!   position as `{{@index}}`.
//! - `{{#unless @last}}...{{/unless}}`: inside an each block, renders on every
//!   element but the last. `@first` and plain keys (rendered when falsy) are
//!   also accepted.
//!
//! Resolution is a pure function of `(body, variables)`.

use crate::variables::{VariableBag, value_at_path};
use serde_json::Value as JsonValue;
use std::borrow::Cow;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Resolves `body` against `variables`.
///
/// # Examples
///
/// ```
/// use llm_fanout::{VariableBag, template::resolve};
/// use serde_json::json;
///
/// let vars = VariableBag::new()
///     .with("name", "Ana")
///     .with("xs", json!(["a", "b", "c"]));
///
/// let out = resolve(
///     "Hello {{name}}, items: {{#each xs}}{{this}}{{#unless @last}}, {{/unless}}{{/each}}.",
///     &vars,
/// );
/// assert_eq!(out, "Hello Ana, items: a, b, c.");
/// ```
pub fn resolve(body: &str, variables: &VariableBag) -> String {
    let nodes = parse(body);
    let mut out = String::with_capacity(body.len());
    render(&nodes, variables, &mut Vec::new(), &mut out);
    out
}

#[derive(Debug, PartialEq)]
enum Node<'a> {
    Text(&'a str),
    /// `raw` is the full tag text, emitted when `key` does not resolve.
    Var { raw: &'a str, key: &'a str },
    Each { key: &'a str, body: Vec<Node<'a>> },
    Unless { condition: &'a str, body: Vec<Node<'a>> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Each,
    Unless,
}

impl BlockKind {
    fn close_tag(self) -> &'static str {
        match self {
            BlockKind::Each => "/each",
            BlockKind::Unless => "/unless",
        }
    }
}

enum Tag<'a> {
    Open(BlockKind, &'a str),
    Close(&'a str),
    Var(&'a str),
}

fn classify(inner: &str) -> Tag<'_> {
    let inner = inner.trim();
    if let Some(rest) = inner.strip_prefix("#each ") {
        Tag::Open(BlockKind::Each, rest.trim())
    } else if let Some(rest) = inner.strip_prefix("#unless ") {
        Tag::Open(BlockKind::Unless, rest.trim())
    } else if inner.starts_with('/') {
        Tag::Close(inner)
    } else {
        Tag::Var(inner)
    }
}

fn parse(body: &str) -> Vec<Node<'_>> {
    parse_sequence(body, None).0
}

/// Parses nodes until the close tag of `until` or end of input.
///
/// Returns the nodes, the input after the close tag, and whether the close tag
/// was found. At top level (`until == None`) stray close tags become text.
fn parse_sequence<'a>(input: &'a str, until: Option<BlockKind>) -> (Vec<Node<'a>>, &'a str, bool) {
    let mut nodes = Vec::new();
    let mut rest = input;

    loop {
        let Some(start) = rest.find(OPEN) else {
            if !rest.is_empty() {
                nodes.push(Node::Text(rest));
            }
            return (nodes, "", false);
        };
        if start > 0 {
            nodes.push(Node::Text(&rest[..start]));
        }
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            nodes.push(Node::Text(&rest[start..]));
            return (nodes, "", false);
        };
        let raw = &rest[start..start + OPEN.len() + end + CLOSE.len()];
        let inner = &after_open[..end];
        let after_tag = &after_open[end + CLOSE.len()..];

        match classify(inner) {
            Tag::Var("") => {
                nodes.push(Node::Text(raw));
                rest = after_tag;
            }
            Tag::Var(key) => {
                nodes.push(Node::Var { raw, key });
                rest = after_tag;
            }
            Tag::Close(name) => match until {
                Some(kind) if name == kind.close_tag() => return (nodes, after_tag, true),
                _ => {
                    nodes.push(Node::Text(raw));
                    rest = after_tag;
                }
            },
            Tag::Open(kind, argument) => match parse_sequence(after_tag, Some(kind)) {
                (body, remaining, true) => {
                    nodes.push(match kind {
                        BlockKind::Each => Node::Each { key: argument, body },
                        BlockKind::Unless => Node::Unless {
                            condition: argument,
                            body,
                        },
                    });
                    rest = remaining;
                }
                _ => {
                    // Unterminated block: keep the opening tag as literal text.
                    nodes.push(Node::Text(raw));
                    rest = after_tag;
                }
            },
        }
    }
}

struct Frame<'v> {
    element: &'v JsonValue,
    index: usize,
    len: usize,
}

fn render<'v>(nodes: &[Node<'_>], vars: &'v VariableBag, frames: &mut Vec<Frame<'v>>, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { raw, key: "@index" } => match frames.last() {
                Some(frame) => out.push_str(&frame.index.to_string()),
                None => out.push_str(raw),
            },
            Node::Var { raw, key } => match lookup(key, vars, frames) {
                Some(value) => out.push_str(&text_form(value)),
                None => out.push_str(raw),
            },
            Node::Each { key, body } => {
                let items = match lookup(key, vars, frames) {
                    Some(JsonValue::Array(items)) => items,
                    _ => continue,
                };
                let len = items.len();
                for (index, element) in items.iter().enumerate() {
                    frames.push(Frame { element, index, len });
                    render(body, vars, frames, out);
                    frames.pop();
                }
            }
            Node::Unless { condition, body } => {
                if !is_truthy(condition, vars, frames) {
                    render(body, vars, frames, out);
                }
            }
        }
    }
}

fn lookup<'v>(key: &str, vars: &'v VariableBag, frames: &[Frame<'v>]) -> Option<&'v JsonValue> {
    if key == "this" {
        return frames.last().map(|f| f.element);
    }
    if let Some(path) = key.strip_prefix("this.") {
        return frames.last().and_then(|f| value_at_path(f.element, path));
    }
    for frame in frames.iter().rev() {
        if frame.element.is_object()
            && let Some(found) = value_at_path(frame.element, key)
        {
            return Some(found);
        }
    }
    vars.lookup_path(key)
}

fn is_truthy(condition: &str, vars: &VariableBag, frames: &[Frame<'_>]) -> bool {
    let frame = frames.last();
    match condition {
        "@last" => frame.is_some_and(|f| f.index + 1 == f.len),
        "@first" => frame.is_some_and(|f| f.index == 0),
        key => match lookup(key, vars, frames) {
            None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)) => false,
            Some(JsonValue::String(s)) => !s.is_empty(),
            Some(JsonValue::Array(a)) => !a.is_empty(),
            Some(JsonValue::Number(n)) => n.as_f64() != Some(0.0),
            Some(JsonValue::Object(_)) | Some(JsonValue::Bool(true)) => true,
        },
    }
}

fn text_form(value: &JsonValue) -> Cow<'_, str> {
    match value {
        JsonValue::String(s) => Cow::Borrowed(s),
        JsonValue::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: JsonValue) -> VariableBag {
        VariableBag::from_json(value).unwrap()
    }

    #[test]
    fn test_concrete_greeting_scenario() {
        let vars = bag(json!({"name": "Ana", "xs": ["a", "b", "c"]}));
        let out = resolve(
            "Hello {{name}}, items: {{#each xs}}{{this}}{{#unless @last}}, {{/unless}}{{/each}}.",
            &vars,
        );
        assert_eq!(out, "Hello Ana, items: a, b, c.");
    }

    #[test]
    fn test_missing_key_left_verbatim() {
        let vars = bag(json!({"name": "Ana"}));
        assert_eq!(
            resolve("Hi {{name}}, age {{ age }}.", &vars),
            "Hi Ana, age {{ age }}."
        );
    }

    #[test]
    fn test_scalar_text_forms() {
        let vars = bag(json!({"n": 3, "f": 1.5, "b": true, "z": null, "o": {"k": [1, 2]}}));
        assert_eq!(resolve("{{n}}|{{f}}|{{b}}|{{z}}|{{o}}", &vars), "3|1.5|true||{\"k\":[1,2]}");
    }

    #[test]
    fn test_dotted_lookup() {
        let vars = bag(json!({"profile": {"age": 40, "sex": "F"}}));
        assert_eq!(resolve("{{profile.age}}/{{profile.sex}}/{{profile.x}}", &vars), "40/F/{{profile.x}}");
    }

    #[test]
    fn test_each_over_records() {
        let vars = bag(json!({
            "concern": "insomnia",
            "props": [{"name": "calming", "w": 2}, {"name": "sedative", "w": 1}]
        }));
        let out = resolve(
            "{{#each props}}- {{name}} ({{w}}) for {{concern}}\n{{/each}}",
            &vars,
        );
        assert_eq!(out, "- calming (2) for insomnia\n- sedative (1) for insomnia\n");
    }

    #[test]
    fn test_each_empty_sequence_renders_nothing() {
        let vars = bag(json!({"xs": []}));
        assert_eq!(resolve("[{{#each xs}}{{this}}{{/each}}]", &vars), "[]");
    }

    #[test]
    fn test_each_concatenates_elements() {
        let vars = bag(json!({"xs": ["a", 1, true]}));
        assert_eq!(resolve("{{#each xs}}{{this}}{{/each}}", &vars), "a1true");
    }

    #[test]
    fn test_each_missing_or_non_sequence_renders_nothing() {
        let vars = bag(json!({"s": "scalar"}));
        assert_eq!(resolve("<{{#each s}}x{{/each}}{{#each nope}}y{{/each}}>", &vars), "<>");
    }

    #[test]
    fn test_index_and_first() {
        let vars = bag(json!({"xs": ["a", "b"]}));
        assert_eq!(
            resolve("{{#each xs}}{{#unless @first}}; {{/unless}}{{@index}}={{this}}{{/each}}", &vars),
            "0=a; 1=b"
        );
    }

    #[test]
    fn test_unless_on_plain_key() {
        let vars = bag(json!({"flag": false, "list": []}));
        assert_eq!(resolve("{{#unless flag}}A{{/unless}}{{#unless list}}B{{/unless}}", &vars), "AB");
    }

    #[test]
    fn test_unterminated_block_is_literal() {
        let vars = bag(json!({"xs": ["a"]}));
        assert_eq!(resolve("{{#each xs}}{{this}}", &vars), "{{#each xs}}{{this}}");
    }

    #[test]
    fn test_stray_close_and_unclosed_braces_are_literal() {
        let vars = bag(json!({"a": 1}));
        assert_eq!(resolve("{{/each}} {{a}} {{ b", &vars), "{{/each}} 1 {{ b");
    }

    #[test]
    fn test_element_fields_shadow_outer_variables() {
        let vars = bag(json!({"name": "outer", "xs": [{"name": "inner"}, {"other": 1}]}));
        assert_eq!(resolve("{{#each xs}}{{name}},{{/each}}", &vars), "inner,outer,");
    }

    #[test]
    fn test_nested_each() {
        let vars = bag(json!({"groups": [{"g": "x", "vs": [1, 2]}, {"g": "y", "vs": [3]}]}));
        let out = resolve(
            "{{#each groups}}{{g}}:{{#each vs}}{{this}}{{#unless @last}}+{{/unless}}{{/each}};{{/each}}",
            &vars,
        );
        assert_eq!(out, "x:1+2;y:3;");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let vars = bag(json!({"a": {"z": 1, "y": 2}, "xs": [1, 2, 3]}));
        let body = "{{a}} {{#each xs}}{{this}}{{/each}} {{missing}}";
        let first = resolve(body, &vars);
        for _ in 0..10 {
            assert_eq!(resolve(body, &vars), first);
        }
    }
}
