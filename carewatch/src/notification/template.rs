//! Template rendering.
//!
//! `{{ key }}` placeholders are substituted from a variable map. Rendering
//! never fails: unknown keys render empty and are reported back so the caller
//! can log a render-quality warning.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::{DeliveryChannel, NotificationTemplate};

/// A rendered title/body pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub title: String,
    pub body: String,
    /// Placeholder keys that had no value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl RenderedMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            missing: Vec::new(),
        }
    }
}

/// Render `template` for `channel`.
///
/// Uses the channel-specific variant when one exists; a variant without its own
/// title keeps the generic title.
pub fn render(
    template: &NotificationTemplate,
    channel: DeliveryChannel,
    variables: &HashMap<String, String>,
) -> RenderedMessage {
    let (title_src, body_src) = match template.channel_templates.get(&channel) {
        Some(variant) => (
            variant
                .title
                .as_deref()
                .unwrap_or(template.title_template.as_str()),
            variant.body.as_str(),
        ),
        None => (
            template.title_template.as_str(),
            template.body_template.as_str(),
        ),
    };

    let mut missing = BTreeSet::new();
    let title = substitute(title_src, variables, &mut missing);
    let body = substitute(body_src, variables, &mut missing);

    RenderedMessage {
        title,
        body,
        missing: missing.into_iter().collect(),
    }
}

/// Replace every `{{ key }}` in `source`.
///
/// An unterminated `{{` is copied through literally.
pub fn substitute(
    source: &str,
    variables: &HashMap<String, String>,
    missing: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after_open[..end].trim();
        match variables.get(key) {
            Some(value) => out.push_str(value),
            None => {
                missing.insert(key.to_string());
            }
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}
