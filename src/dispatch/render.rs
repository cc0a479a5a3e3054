//! Alert text rendering.
//!
//! The default body comes from a compiled `askama` template. Rules may
//! override subject and text with `{{placeholder}}` strings resolved against
//! the match and its first document.

use askama::Template;
use chrono::SecondsFormat;
use serde_json::{Map, Value};

use crate::evaluator::MatchEvent;
use crate::rules::RuleDefinition;

#[derive(Template)]
#[template(
    source = "Rule '{{ rule }}' ({{ kind }}) matched on {{ index }}
Window: {{ window_start }} .. {{ window_end }}
Matches: {{ match_count }}
{%- if !key.is_empty() %}
Key: {{ key }}
{%- endif %}
{%- if !ids.is_empty() %}
Matched ids: {{ ids|join(\", \") }}
{%- endif %}
{%- for (name, value) in fields %}
{{ name }}: {{ value }}
{%- endfor %}
",
    ext = "txt"
)]
struct DefaultAlertText<'a> {
    rule: &'a str,
    kind: &'a str,
    index: &'a str,
    key: &'a str,
    window_start: String,
    window_end: String,
    match_count: u64,
    ids: &'a [String],
    fields: Vec<(String, String)>,
}

fn timestamp(t: chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Plain text form of a JSON value; strings lose their quotes.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Values of the rule's `include` fields taken from the first matched document.
pub fn included_fields(rule: &RuleDefinition, event: &MatchEvent) -> Map<String, Value> {
    let mut out = Map::new();
    let Some(first) = event.records.first() else {
        return out;
    };
    for name in &rule.include {
        if let Some(v) = first.field(name) {
            out.insert(name.clone(), v.clone());
        }
    }
    out
}

/// Default alert body.
pub fn default_text(
    rule: &RuleDefinition,
    event: &MatchEvent,
    fields: &Map<String, Value>,
) -> Result<String, askama::Error> {
    DefaultAlertText {
        rule: &rule.name,
        kind: event.kind,
        index: &rule.index,
        key: event.key.as_deref().unwrap_or_default(),
        window_start: timestamp(event.window.start),
        window_end: timestamp(event.window.end),
        match_count: event.match_count,
        ids: &event.matched_ids,
        fields: fields.iter().map(|(k, v)| (k.clone(), plain(v))).collect(),
    }
    .render()
}

/// Default subject line.
pub fn default_subject(rule: &RuleDefinition, event: &MatchEvent) -> String {
    match &event.key {
        Some(key) => format!("[elastic-alert] {} ({}): {}", rule.name, event.kind, key),
        None => format!("[elastic-alert] {} ({})", rule.name, event.kind),
    }
}

/// Substitute `{{name}}` placeholders in a rule-provided template.
///
/// Unknown names resolve against the first matched document (dotted paths
/// allowed) and render empty when absent.
pub fn fill_placeholders(template: &str, rule: &RuleDefinition, event: &MatchEvent) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        out.push_str(&resolve(after[..close].trim(), rule, event));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

fn resolve(name: &str, rule: &RuleDefinition, event: &MatchEvent) -> String {
    match name {
        "rule" => rule.name.clone(),
        "index" => rule.index.clone(),
        "kind" => event.kind.to_string(),
        "count" => event.match_count.to_string(),
        "key" => event.key.clone().unwrap_or_default(),
        "window_start" => timestamp(event.window.start),
        "window_end" => timestamp(event.window.end),
        "fingerprint" => event.fingerprint.clone(),
        "ids" => event.matched_ids.join(","),
        field => event
            .records
            .first()
            .and_then(|r| r.field(field))
            .map(plain)
            .unwrap_or_default(),
    }
}
