//! Notification database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{parse_column, to_u32};
use crate::Result;
use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::domain::{
    Acknowledgment, DeliveryChannel, Notification, NotificationPriority, NotificationStatus,
};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub batch_id: String,
    pub risk_event_id: String,
    pub subject_id: String,
    pub contact_id: String,
    pub template_code: String,
    pub channel: String,
    pub address: String,
    pub title: String,
    pub body: String,
    pub priority: String,
    pub status: String,
    pub level: i64,
    pub pinned_channel: bool,
    pub created_at: i64,
    pub expires_at: i64,
    pub first_attempt_at: Option<i64>,
    pub escalation_due_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// JSON acknowledgment.
    pub acknowledgment: Option<String>,
}

impl NotificationDbModel {
    pub fn from_domain(n: &Notification) -> Result<Self> {
        let acknowledgment = n
            .acknowledgment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(Self {
            id: n.id.clone(),
            batch_id: n.batch_id.clone(),
            risk_event_id: n.risk_event_id.clone(),
            subject_id: n.subject_id.clone(),
            contact_id: n.contact_id.clone(),
            template_code: n.template_code.clone(),
            channel: n.channel.as_str().to_string(),
            address: n.address.clone(),
            title: n.title.clone(),
            body: n.body.clone(),
            priority: n.priority.to_string(),
            status: n.status.as_str().to_string(),
            level: i64::from(n.level),
            pinned_channel: n.pinned_channel,
            created_at: datetime_to_ms(n.created_at),
            expires_at: datetime_to_ms(n.expires_at),
            first_attempt_at: opt_datetime_to_ms(n.first_attempt_at),
            escalation_due_at: opt_datetime_to_ms(n.escalation_due_at),
            completed_at: opt_datetime_to_ms(n.completed_at),
            acknowledgment,
        })
    }

    pub fn into_domain(self) -> Result<Notification> {
        let acknowledgment: Option<Acknowledgment> = self
            .acknowledgment
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Notification {
            channel: parse_column("channel", &self.channel, DeliveryChannel::parse)?,
            priority: parse_column("priority", &self.priority, |s| {
                s.parse::<NotificationPriority>().ok()
            })?,
            status: parse_column("notification status", &self.status, NotificationStatus::parse)?,
            level: to_u32("level", self.level)?,
            id: self.id,
            batch_id: self.batch_id,
            risk_event_id: self.risk_event_id,
            subject_id: self.subject_id,
            contact_id: self.contact_id,
            template_code: self.template_code,
            address: self.address,
            title: self.title,
            body: self.body,
            pinned_channel: self.pinned_channel,
            created_at: ms_to_datetime(self.created_at),
            expires_at: ms_to_datetime(self.expires_at),
            first_attempt_at: opt_ms_to_datetime(self.first_attempt_at),
            escalation_due_at: opt_ms_to_datetime(self.escalation_due_at),
            completed_at: opt_ms_to_datetime(self.completed_at),
            acknowledgment,
        })
    }
}
