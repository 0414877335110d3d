//! Notification templates (read-mostly reference data).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::channel::DeliveryChannel;
use super::notification::NotificationPriority;
use super::risk::{RiskKind, Severity};
use crate::{Error, Result};

/// Code of the built-in template used when nothing matches.
pub const GENERIC_TEMPLATE_CODE: &str = "generic";

/// Default language for template lookup fallback.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Channel-specific variant of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
}

/// Message template plus the delivery policy attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub code: String,
    pub event_kind: RiskKind,
    /// `None` matches any severity.
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default = "default_language")]
    pub language_code: String,
    pub title_template: String,
    pub body_template: String,
    #[serde(default)]
    pub channel_templates: HashMap<DeliveryChannel, ChannelTemplate>,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub requires_immediate_action: bool,
    pub escalation_minutes: u32,
    pub max_retries: u32,
    pub retry_interval_seconds: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub usage_count: i64,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_active() -> bool {
    true
}

impl NotificationTemplate {
    /// Built-in fallback template for an event kind.
    pub fn generic(kind: RiskKind) -> Self {
        Self {
            code: GENERIC_TEMPLATE_CODE.to_string(),
            event_kind: kind,
            severity: None,
            language_code: DEFAULT_LANGUAGE.to_string(),
            title_template: "[{{severity}}] {{event_label}}".to_string(),
            body_template: "{{event_label}} for {{subject_id}} at {{detected_at}}. \
                            Location: {{location}} {{maps_url}}. Please acknowledge."
                .to_string(),
            channel_templates: HashMap::from([(
                DeliveryChannel::Sms,
                ChannelTemplate {
                    title: None,
                    body: "{{severity}}: {{event_label}} for {{subject_id}}. {{maps_url}} \
                           Reply to acknowledge."
                        .to_string(),
                },
            )]),
            priority: NotificationPriority::High,
            requires_immediate_action: true,
            escalation_minutes: 10,
            max_retries: 3,
            retry_interval_seconds: 60,
            active: true,
            usage_count: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(Error::validation("template code is empty"));
        }
        if self.body_template.trim().is_empty() {
            return Err(Error::validation(format!(
                "template {} has an empty body",
                self.code
            )));
        }
        if self.escalation_minutes == 0 {
            return Err(Error::validation(format!(
                "template {} has escalation_minutes = 0",
                self.code
            )));
        }
        if self.retry_interval_seconds == 0 {
            return Err(Error::validation(format!(
                "template {} has retry_interval_seconds = 0",
                self.code
            )));
        }
        Ok(())
    }

    /// Whether this template applies to the given event kind, severity and language.
    pub fn matches(&self, kind: RiskKind, severity: Option<Severity>, language: &str) -> bool {
        self.active
            && self.event_kind == kind
            && self.severity == severity
            && self.language_code.eq_ignore_ascii_case(language)
    }
}
