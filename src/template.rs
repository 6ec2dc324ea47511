//! Minimal prompt-template engine.
//!
//! Templates support exactly one construct: `{{variable}}` substitution
//! against a hard-coded whitelist per role. Anything that smells like a
//! directive (block helpers, partials, comments, function invocation) is
//! rejected at config-validation time rather than silently passed through
//! to the model.

use std::{collections::BTreeMap, fmt, sync::LazyLock};

use regex::Regex;

use crate::prelude::*;

/// A simple `{{name}}` placeholder, with optional interior whitespace.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex")
});

/// Any `{{...}}` span, used to find constructs the placeholder form misses.
static ANY_BRACE_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{.*?\}\}").expect("brace span regex"));

/// The role a template plays in the pipeline. Each role exposes a fixed set
/// of variables; nothing else may appear in the template text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateRole {
    /// Phase-1 subtopic generation.
    Subtopic,
    /// Phase-2 prompt generation.
    Prompt,
    /// Chosen-response generation.
    Chosen,
    /// Rejected-response generation.
    Rejected,
    /// The judge rubric.
    Judge,
}

impl TemplateRole {
    /// The variables a template of this role may reference.
    pub fn allowed_variables(self) -> &'static [&'static str] {
        match self {
            TemplateRole::Subtopic => &["topic", "count", "exclude_subtopics"],
            TemplateRole::Prompt => &["topic", "subtopic", "count"],
            TemplateRole::Chosen | TemplateRole::Rejected => {
                &["topic", "subtopic", "prompt"]
            }
            TemplateRole::Judge => &["prompt", "response"],
        }
    }
}

impl fmt::Display for TemplateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TemplateRole::Subtopic => "subtopic",
            TemplateRole::Prompt => "prompt",
            TemplateRole::Chosen => "chosen",
            TemplateRole::Rejected => "rejected",
            TemplateRole::Judge => "judge",
        };
        write!(f, "{}", name)
    }
}

/// Check a template against the rules for its role.
///
/// Rejects directive-like constructs (`{{#if}}`, `{{> partial}}`, `{{!--`,
/// `{{call f}}`), unknown variables, and unbalanced `{{`/`}}` pairs.
pub fn validate(role: TemplateRole, template: &str) -> Result<()> {
    for span in ANY_BRACE_SPAN.find_iter(template) {
        let text = span.as_str();
        let Some(captures) = PLACEHOLDER.captures(text) else {
            bail!(
                "{} template contains an unsupported construct: {:?} \
                 (only {{{{variable}}}} substitution is allowed)",
                role,
                text
            );
        };
        // `PLACEHOLDER` may match a strict subset of the span (e.g.
        // `{{{x}}}`), so require the whole span to be the placeholder.
        if captures.get(0).map(|m| m.as_str()) != Some(text) {
            bail!(
                "{} template contains an unsupported construct: {:?}",
                role,
                text
            );
        }
        let name = &captures[1];
        if !role.allowed_variables().contains(&name) {
            bail!(
                "{} template references unknown variable {:?} (allowed: {})",
                role,
                name,
                role.allowed_variables().join(", ")
            );
        }
    }

    // Catch stray or unclosed braces that no span matched.
    let stripped = ANY_BRACE_SPAN.replace_all(template, "");
    if stripped.contains("{{") || stripped.contains("}}") {
        bail!("{} template has unbalanced '{{{{' or '}}}}'", role);
    }
    Ok(())
}

/// Substitute bindings into a validated template.
///
/// Variables with no binding render as the empty string. Call [`validate`]
/// first; rendering performs no checks of its own.
pub fn render(template: &str, bindings: &BTreeMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |captures: &regex::Captures<'_>| {
            bindings
                .get(&captures[1])
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}
