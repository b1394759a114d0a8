//! Literal template substitution with a closed placeholder vocabulary.
//!
//! `{event_type}`, `{host_id}`, `{timestamp}`, `{args.<key>}`,
//! `{context.<key>}`, `{rule.id}`, `{rule.name}`, `{rule.version}`.
//! Unknown placeholders are left as-is so operator typos surface in the
//! rendered output instead of aborting the match. Deliberately not an
//! expression language.

use warden_model::{Event, Rule};

pub fn render(template: &str, event: &Event, rule: &Rule) -> String {
    let mut out = template.to_owned();
    out = out.replace("{event_type}", &event.event_type);
    out = out.replace("{host_id}", event.host_id.as_str());
    out = out.replace("{timestamp}", &event.timestamp.to_rfc3339());
    out = out.replace("{rule.id}", rule.id.as_str());
    out = out.replace("{rule.name}", &rule.name);
    out = out.replace("{rule.version}", &rule.version);
    for (key, value) in &event.args {
        out = out.replace(&format!("{{args.{key}}}"), value);
    }
    for (key, value) in &event.context {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{context.{key}}}"), &rendered);
    }
    out
}
