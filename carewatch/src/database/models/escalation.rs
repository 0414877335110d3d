//! Escalation link database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{parse_column, to_u32};
use crate::Result;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{EscalationLink, EscalationReason};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EscalationLinkDbModel {
    pub id: String,
    pub batch_id: String,
    pub from_notification_id: String,
    pub to_notification_id: String,
    pub level: i64,
    pub reason: String,
    pub created_at: i64,
}

impl EscalationLinkDbModel {
    pub fn from_domain(link: &EscalationLink) -> Self {
        Self {
            id: link.id.clone(),
            batch_id: link.batch_id.clone(),
            from_notification_id: link.from_notification_id.clone(),
            to_notification_id: link.to_notification_id.clone(),
            level: i64::from(link.level),
            reason: link.reason.as_str().to_string(),
            created_at: datetime_to_ms(link.created_at),
        }
    }

    pub fn into_domain(self) -> Result<EscalationLink> {
        Ok(EscalationLink {
            level: to_u32("level", self.level)?,
            reason: parse_column("reason", &self.reason, EscalationReason::parse)?,
            id: self.id,
            batch_id: self.batch_id,
            from_notification_id: self.from_notification_id,
            to_notification_id: self.to_notification_id,
            created_at: ms_to_datetime(self.created_at),
        })
    }
}
