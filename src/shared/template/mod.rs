// Package template renders `{{name}}` placeholders in text.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved placeholders: {}", .0.join(", "))]
    Unresolved(Vec<String>),
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex"))
}

/// Returns placeholder names in order of first appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in placeholder_re().captures_iter(text) {
        let name = &cap[1];
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

/// Substitutes every placeholder through `lookup`. Any name the lookup does not
/// know fails the whole render; no partial output is returned.
pub fn render_with<F>(text: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for cap in placeholder_re().captures_iter(text) {
        let whole = cap.get(0).map(|m| m.range()).unwrap_or(0..0);
        out.push_str(&text[last..whole.start]);
        let name = &cap[1];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                if !missing.iter().any(|m: &String| m == name) {
                    missing.push(name.to_string());
                }
            }
        }
        last = whole.end;
    }
    out.push_str(&text[last..]);

    if !missing.is_empty() {
        return Err(TemplateError::Unresolved(missing));
    }
    Ok(out)
}

pub fn render(text: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    render_with(text, |name| vars.get(name).cloned())
}
