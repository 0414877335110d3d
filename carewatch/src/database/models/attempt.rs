//! Delivery attempt database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{parse_column, to_u32};
use crate::Result;
use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::domain::{AttemptStatus, DeliveryAttempt, DeliveryChannel, FaultKind};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAttemptDbModel {
    pub id: String,
    pub notification_id: String,
    pub channel: String,
    pub address: String,
    pub attempted_at: i64,
    pub completed_at: Option<i64>,
    pub status: String,
    pub attempt_count: i64,
    pub provider_response_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub fault: Option<String>,
    pub external_message_id: Option<String>,
    pub processing_time_ms: Option<i64>,
}

impl DeliveryAttemptDbModel {
    pub fn from_domain(a: &DeliveryAttempt) -> Self {
        Self {
            id: a.id.clone(),
            notification_id: a.notification_id.clone(),
            channel: a.channel.as_str().to_string(),
            address: a.address.clone(),
            attempted_at: datetime_to_ms(a.attempted_at),
            completed_at: opt_datetime_to_ms(a.completed_at),
            status: a.status.as_str().to_string(),
            attempt_count: i64::from(a.attempt_count),
            provider_response_code: a.provider_response_code.clone(),
            error_code: a.error_code.clone(),
            error_message: a.error_message.clone(),
            fault: a.fault.map(|f| f.as_str().to_string()),
            external_message_id: a.external_message_id.clone(),
            processing_time_ms: a.processing_time_ms,
        }
    }

    pub fn into_domain(self) -> Result<DeliveryAttempt> {
        let fault = self
            .fault
            .as_deref()
            .map(|f| parse_column("fault", f, FaultKind::parse))
            .transpose()?;
        Ok(DeliveryAttempt {
            channel: parse_column("channel", &self.channel, DeliveryChannel::parse)?,
            status: parse_column("attempt status", &self.status, AttemptStatus::parse)?,
            attempt_count: to_u32("attempt_count", self.attempt_count)?,
            fault,
            id: self.id,
            notification_id: self.notification_id,
            address: self.address,
            attempted_at: ms_to_datetime(self.attempted_at),
            completed_at: opt_ms_to_datetime(self.completed_at),
            provider_response_code: self.provider_response_code,
            error_code: self.error_code,
            error_message: self.error_message,
            external_message_id: self.external_message_id,
            processing_time_ms: self.processing_time_ms,
        })
    }
}
