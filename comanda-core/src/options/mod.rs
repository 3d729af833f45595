//! The "options" sub-document attached to a menu item or order line.
//!
//! A document is a list of groups ("Tamanho", "Adicionais"), each with its
//! options. It travels as a JSON string inside the parent record, and older
//! records hold it in a sloppy single-quoted form.
//!
//! Everything funnels through one pipeline:
//!
//! ```text
//! parse(raw) -> normalize(groups) -> serialize(document)
//! ```
//!
//! [`canonicalize`] runs all three. Two inputs with the same meaning always
//! produce the same canonical string, which is what lets the
//! [`OptionsEditor`] tell a real change from an echo.

mod editor;

pub use editor::OptionsEditor;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

/// Render key for a group or option.
///
/// Unique per process, assigned on normalization and never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(u64);

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

impl Uid {
    pub fn next() -> Self {
        Self(NEXT_UID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupOption {
    pub uid: Uid,
    pub name: String,
    pub extra_value: f64,
    pub depleted: bool,
}

impl GroupOption {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uid: Uid::next(),
            name: name.into(),
            extra_value: 0.0,
            depleted: false,
        }
    }

    pub fn with_extra_value(mut self, extra_value: f64) -> Self {
        self.extra_value = extra_value;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionGroup {
    pub uid: Uid,
    pub name: String,
    /// Ids of the menu items this group applies to, as typed
    pub selection_ids: String,
    pub max_selected: u32,
    pub required: bool,
    pub options: Vec<GroupOption>,
}

impl OptionGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uid: Uid::next(),
            name: name.into(),
            selection_ids: String::new(),
            max_selected: 1,
            required: false,
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, option: GroupOption) -> Self {
        self.options.push(option);
        self
    }
}

/// A normalized options document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionsDocument {
    pub groups: Vec<OptionGroup>,
}

impl OptionsDocument {
    pub fn new(groups: Vec<OptionGroup>) -> Self {
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Canonical string form.
    pub fn serialize(&self) -> String {
        serialize(self)
    }

    /// Same meaning, ignoring render keys.
    pub fn same_content(&self, other: &OptionsDocument) -> bool {
        self.serialize() == other.serialize()
    }

    /// One-line summary for tickets and listings: `"Tamanho: Grande |
    /// Adicionais: Bacon, Ovo"`. Groups without named options are left out.
    pub fn summary(&self) -> String {
        self.groups
            .iter()
            .filter_map(|group| {
                let names: Vec<&str> = group
                    .options
                    .iter()
                    .map(|o| o.name.trim())
                    .filter(|n| !n.is_empty())
                    .collect();
                if names.is_empty() {
                    return None;
                }
                let list = names.join(", ");
                let title = group.name.trim();
                Some(if title.is_empty() {
                    list
                } else {
                    format!("{}: {}", title, list)
                })
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Raw groups pulled out of some input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parsed {
    pub groups: Vec<Value>,
    /// The input only decoded after swapping single quotes for double
    pub fallback_used: bool,
}

/// Pulls raw groups out of a parent field.
///
/// Accepts an array, a single group object, or a string holding either.
/// Strings that are not valid JSON get one more try with single quotes
/// treated as double quotes. Anything else yields no groups.
pub fn parse(raw: &Value) -> Parsed {
    match raw {
        Value::String(text) => parse_str(text),
        other => Parsed {
            groups: groups_of(other.clone()),
            fallback_used: false,
        },
    }
}

/// [`parse`] for text input.
pub fn parse_str(text: &str) -> Parsed {
    let text = text.trim();
    if text.is_empty() {
        return Parsed::default();
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        // Double-encoded documents show up as a JSON string.
        let value = match value {
            Value::String(inner) => serde_json::from_str(&inner).unwrap_or(Value::Null),
            other => other,
        };
        return Parsed {
            groups: groups_of(value),
            fallback_used: false,
        };
    }

    match serde_json::from_str::<Value>(&text.replace('\'', "\"")) {
        Ok(value) => {
            tracing::debug!("options decoded with single-quote fallback");
            Parsed {
                groups: groups_of(value),
                fallback_used: true,
            }
        }
        Err(e) => {
            tracing::debug!("unreadable options document: {}", e);
            Parsed::default()
        }
    }
}

fn groups_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    }
}

/// Coerces raw groups into a document, filling defaults and assigning
/// fresh render keys.
pub fn normalize(groups: &[Value]) -> OptionsDocument {
    OptionsDocument {
        groups: groups.iter().map(normalize_group).collect(),
    }
}

fn normalize_group(raw: &Value) -> OptionGroup {
    let options = match raw.get("options") {
        Some(Value::Array(items)) => items.iter().map(normalize_option).collect(),
        _ => Vec::new(),
    };
    OptionGroup {
        uid: Uid::next(),
        name: to_text(raw.get("nome")),
        selection_ids: to_text(raw.get("ids")),
        max_selected: to_count(raw.get("max_selected")),
        required: to_bool(raw.get("obrigatorio")),
        options,
    }
}

fn normalize_option(raw: &Value) -> GroupOption {
    GroupOption {
        uid: Uid::next(),
        name: to_text(raw.get("nome")),
        extra_value: to_number(raw.get("valor_extra")),
        depleted: to_bool(raw.get("esgotado")),
    }
}

#[derive(Serialize)]
struct WireGroup<'a> {
    nome: &'a str,
    ids: &'a str,
    max_selected: u32,
    obrigatorio: u8,
    options: Vec<WireOption<'a>>,
}

#[derive(Serialize)]
struct WireOption<'a> {
    nome: &'a str,
    valor_extra: Value,
    esgotado: u8,
}

/// Canonical JSON: fixed key order, booleans as 0/1, whole numbers without
/// a fraction, no render keys.
pub fn serialize(doc: &OptionsDocument) -> String {
    let wire: Vec<WireGroup<'_>> = doc
        .groups
        .iter()
        .map(|g| WireGroup {
            nome: &g.name,
            ids: &g.selection_ids,
            max_selected: g.max_selected,
            obrigatorio: u8::from(g.required),
            options: g
                .options
                .iter()
                .map(|o| WireOption {
                    nome: &o.name,
                    valor_extra: canonical_number(o.extra_value),
                    esgotado: u8::from(o.depleted),
                })
                .collect(),
        })
        .collect();
    // Plain structs of strings and numbers always serialize.
    serde_json::to_string(&wire).unwrap_or_else(|_| "[]".to_string())
}

/// `serialize(normalize(parse(raw)))`.
pub fn canonicalize(raw: &Value) -> String {
    serialize(&normalize(&parse(raw).groups))
}

fn canonical_number(n: f64) -> Value {
    if !n.is_finite() {
        return Value::from(0);
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0))
}

fn to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| to_text(Some(v)))
            .collect::<Vec<_>>()
            .join(","),
        Some(other) => other.to_string(),
    }
}

/// `true`, `1` and `"1"` are true; everything else is false.
fn to_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(Value::String(s)) => s == "1",
        _ => false,
    }
}

/// Lenient decimal: accepts `"2,5"` as well as `"2.5"`. Unreadable is 0.
pub fn to_number(value: Option<&Value>) -> f64 {
    let n = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => parse_decimal(s),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// Parses typed text, taking the first comma as the decimal separator.
pub fn parse_decimal(text: &str) -> f64 {
    let text = text.trim();
    if text.is_empty() {
        return 0.0;
    }
    text.replacen(',', ".", 1).parse().unwrap_or(0.0)
}

/// Selection limit: missing or unreadable means 1, negatives clamp to 0.
fn to_count(value: Option<&Value>) -> u32 {
    let n = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().replacen(',', ".", 1).parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(f64::from(u8::from(*b))),
        _ => None,
    };
    match n {
        Some(n) if n.is_finite() => n.trunc().clamp(0.0, u32::MAX as f64) as u32,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_quoted_object_is_one_group() {
        let parsed = parse_str("{'nome':'Tamanho'}");
        assert!(parsed.fallback_used);

        let doc = normalize(&parsed.groups);
        assert_eq!(doc.groups.len(), 1);
        assert_eq!(doc.groups[0].name, "Tamanho");
        assert!(doc.groups[0].options.is_empty());
        assert_eq!(doc.groups[0].max_selected, 1);
    }

    #[test]
    fn test_unparseable_is_empty() {
        assert!(parse_str("not json at all").groups.is_empty());
        assert!(parse_str("").groups.is_empty());
        assert!(parse(&Value::Null).groups.is_empty());
        assert!(parse(&json!(42)).groups.is_empty());
        assert_eq!(canonicalize(&json!("[{")), "[]");
    }

    #[test]
    fn test_lenient_coercion() {
        let raw = json!([{
            "nome": "Adicionais",
            "ids": [3, 4],
            "max_selected": "2",
            "obrigatorio": "1",
            "options": [
                {"nome": "Bacon", "valor_extra": "2,5", "esgotado": 1},
                {"nome": 7, "valor_extra": "abc", "esgotado": "true"}
            ]
        }]);
        let doc = normalize(&parse(&raw).groups);
        let g = &doc.groups[0];
        assert_eq!(g.selection_ids, "3,4");
        assert_eq!(g.max_selected, 2);
        assert!(g.required);
        assert_eq!(g.options[0].extra_value, 2.5);
        assert!(g.options[0].depleted);
        assert_eq!(g.options[1].name, "7");
        assert_eq!(g.options[1].extra_value, 0.0);
        assert!(!g.options[1].depleted);
    }

    #[test]
    fn test_max_selected_defaults() {
        let doc = normalize(&parse(&json!([{}, {"max_selected": null}, {"max_selected": -3}, {"max_selected": 2.7}])).groups);
        let limits: Vec<u32> = doc.groups.iter().map(|g| g.max_selected).collect();
        assert_eq!(limits, vec![1, 1, 0, 2]);
    }

    #[test]
    fn test_canonical_form() {
        let raw = json!([{
            "options": [{"esgotado": false, "valor_extra": 3.0, "nome": "Grande"}],
            "obrigatorio": true,
            "nome": "Tamanho"
        }]);
        assert_eq!(
            canonicalize(&raw),
            r#"[{"nome":"Tamanho","ids":"","max_selected":1,"obrigatorio":1,"options":[{"nome":"Grande","valor_extra":3,"esgotado":0}]}]"#
        );
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let inputs = [
            json!("[{'nome':'Tamanho','options':[{'nome':'P','valor_extra':'1,50'}]}]"),
            json!([{"nome": "Molho", "max_selected": "3", "options": [{"nome": "Barbecue", "esgotado": "1"}]}]),
            json!({"nome": "Ponto", "obrigatorio": 1}),
            json!("garbage"),
        ];
        for raw in inputs {
            let once = canonicalize(&raw);
            let twice = canonicalize(&Value::String(once.clone()));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_uids_do_not_affect_serialization() {
        let raw = json!([{"nome": "Tamanho", "options": [{"nome": "P"}]}]);
        let a = normalize(&parse(&raw).groups);
        let b = normalize(&parse(&raw).groups);
        assert_ne!(a.groups[0].uid, b.groups[0].uid);
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_double_encoded_string() {
        let inner = r#"[{"nome":"Tamanho"}]"#;
        let outer = serde_json::to_string(inner).unwrap();
        assert_eq!(parse_str(&outer).groups.len(), 1);
    }

    #[test]
    fn test_summary() {
        let doc = normalize(
            &parse(&json!([
                {"nome": "Tamanho", "options": [{"nome": "Grande"}]},
                {"nome": "Vazio", "options": []},
                {"nome": "", "options": [{"nome": "Bacon"}, {"nome": " "}, {"nome": "Ovo"}]}
            ]))
            .groups,
        );
        assert_eq!(doc.summary(), "Tamanho: Grande | Bacon, Ovo");
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("2,5"), 2.5);
        assert_eq!(parse_decimal(" 10 "), 10.0);
        assert_eq!(parse_decimal("1,2,3"), 0.0);
        assert_eq!(parse_decimal(""), 0.0);
    }
}
