//! Per-risk-event notification batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::risk::RiskEvent;

/// Resolution state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Open,
    /// Some notification in the fan-out was acknowledged.
    Acknowledged,
    /// Every chain ran out without an acknowledgment.
    Exhausted,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Exhausted => "EXHAUSTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "ACKNOWLEDGED" => Some(Self::Acknowledged),
            "EXHAUSTED" => Some(Self::Exhausted),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The fan-out of one risk event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub id: String,
    pub risk_event: RiskEvent,
    pub status: BatchStatus,
    /// Contact ids in escalation order, as resolved when the event was handled.
    pub contact_order: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_notification_id: Option<String>,
}

impl NotificationBatch {
    pub fn new(risk_event: RiskEvent, contact_order: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            risk_event,
            status: BatchStatus::Open,
            contact_order,
            created_at: now,
            resolved_at: None,
            acknowledged_notification_id: None,
        }
    }
}
