//! Notification batch database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::parse_column;
use crate::Result;
use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::domain::{BatchStatus, NotificationBatch, RiskEvent};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationBatchDbModel {
    pub id: String,
    pub risk_event_id: String,
    pub subject_id: String,
    pub severity: String,
    /// JSON snapshot of the risk event.
    pub risk_event: String,
    pub status: String,
    /// JSON array of contact ids.
    pub contact_order: String,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub acknowledged_notification_id: Option<String>,
}

impl NotificationBatchDbModel {
    pub fn from_domain(batch: &NotificationBatch) -> Result<Self> {
        Ok(Self {
            id: batch.id.clone(),
            risk_event_id: batch.risk_event.id.clone(),
            subject_id: batch.risk_event.subject_id.clone(),
            severity: batch.risk_event.severity.as_str().to_string(),
            risk_event: serde_json::to_string(&batch.risk_event)?,
            status: batch.status.as_str().to_string(),
            contact_order: serde_json::to_string(&batch.contact_order)?,
            created_at: datetime_to_ms(batch.created_at),
            resolved_at: opt_datetime_to_ms(batch.resolved_at),
            acknowledged_notification_id: batch.acknowledged_notification_id.clone(),
        })
    }

    pub fn into_domain(self) -> Result<NotificationBatch> {
        let risk_event: RiskEvent = serde_json::from_str(&self.risk_event)?;
        Ok(NotificationBatch {
            id: self.id,
            risk_event,
            status: parse_column("batch status", &self.status, BatchStatus::parse)?,
            contact_order: serde_json::from_str(&self.contact_order)?,
            created_at: ms_to_datetime(self.created_at),
            resolved_at: opt_ms_to_datetime(self.resolved_at),
            acknowledged_notification_id: self.acknowledged_notification_id,
        })
    }
}
