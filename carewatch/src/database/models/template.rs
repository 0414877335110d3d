//! Notification template database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{parse_column, to_u32};
use crate::Result;
use crate::domain::{NotificationPriority, NotificationTemplate, RiskKind, Severity};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationTemplateDbModel {
    pub code: String,
    pub event_kind: String,
    pub severity: Option<String>,
    pub language_code: String,
    pub title_template: String,
    pub body_template: String,
    /// JSON object keyed by channel.
    pub channel_templates: String,
    pub priority: String,
    pub requires_immediate_action: bool,
    pub escalation_minutes: i64,
    pub max_retries: i64,
    pub retry_interval_seconds: i64,
    pub active: bool,
    pub usage_count: i64,
}

impl NotificationTemplateDbModel {
    pub fn from_domain(t: &NotificationTemplate) -> Result<Self> {
        Ok(Self {
            code: t.code.clone(),
            event_kind: t.event_kind.as_str().to_string(),
            severity: t.severity.map(|s| s.as_str().to_string()),
            language_code: t.language_code.to_ascii_lowercase(),
            title_template: t.title_template.clone(),
            body_template: t.body_template.clone(),
            channel_templates: serde_json::to_string(&t.channel_templates)?,
            priority: t.priority.to_string(),
            requires_immediate_action: t.requires_immediate_action,
            escalation_minutes: i64::from(t.escalation_minutes),
            max_retries: i64::from(t.max_retries),
            retry_interval_seconds: i64::from(t.retry_interval_seconds),
            active: t.active,
            usage_count: t.usage_count,
        })
    }

    pub fn into_domain(self) -> Result<NotificationTemplate> {
        let severity = self
            .severity
            .as_deref()
            .map(|s| parse_column("severity", s, Severity::parse))
            .transpose()?;
        Ok(NotificationTemplate {
            event_kind: parse_column("event_kind", &self.event_kind, |s| {
                s.parse::<RiskKind>().ok()
            })?,
            severity,
            priority: parse_column("priority", &self.priority, |s| {
                s.parse::<NotificationPriority>().ok()
            })?,
            channel_templates: serde_json::from_str(&self.channel_templates)?,
            escalation_minutes: to_u32("escalation_minutes", self.escalation_minutes)?,
            max_retries: to_u32("max_retries", self.max_retries)?,
            retry_interval_seconds: to_u32("retry_interval_seconds", self.retry_interval_seconds)?,
            code: self.code,
            language_code: self.language_code,
            title_template: self.title_template,
            body_template: self.body_template,
            requires_immediate_action: self.requires_immediate_action,
            active: self.active,
            usage_count: self.usage_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeliveryChannel;

    #[test]
    fn test_template_row_preserves_channel_variants() {
        let template = NotificationTemplate::generic(RiskKind::Wandering);
        let row = NotificationTemplateDbModel::from_domain(&template).unwrap();
        assert_eq!(row.event_kind, "WANDERING");
        assert_eq!(row.severity, None);
        assert_eq!(row.priority, "HIGH");
        let back = row.into_domain().unwrap();
        assert!(back.channel_templates.contains_key(&DeliveryChannel::Sms));
        assert_eq!(back, template);
    }

    #[test]
    fn test_invalid_enum_column_is_reported() {
        let mut row =
            NotificationTemplateDbModel::from_domain(&NotificationTemplate::generic(RiskKind::Fall))
                .unwrap();
        row.event_kind = "EARTHQUAKE".to_string();
        let err = row.into_domain().unwrap_err();
        assert!(err.to_string().contains("event_kind"));
    }
}
