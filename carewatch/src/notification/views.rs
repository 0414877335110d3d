//! Read models returned to callers.
//!
//! These expose statuses and timestamps only. Provider error messages stay in
//! the attempt log.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    Acknowledgment, AttemptStatus, BatchStatus, DeliveryAttempt, DeliveryChannel, EscalationLink,
    FaultKind, Notification, NotificationBatch, NotificationStatus,
};

/// Human-readable status shown in histories.
pub fn status_label(status: NotificationStatus) -> &'static str {
    match status {
        NotificationStatus::Pending => "Queued",
        NotificationStatus::Sending => "Sending",
        NotificationStatus::Sent => "Sent",
        NotificationStatus::Delivered => "Delivered",
        NotificationStatus::Read => "Read",
        NotificationStatus::Acknowledged => "Acknowledged",
        NotificationStatus::Failed => "Could not be delivered",
        NotificationStatus::Expired => "No response",
        NotificationStatus::Cancelled => "Cancelled",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub channel: DeliveryChannel,
    pub status: AttemptStatus,
    pub attempt_count: u32,
    pub fault: Option<FaultKind>,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&DeliveryAttempt> for AttemptSummary {
    fn from(attempt: &DeliveryAttempt) -> Self {
        Self {
            channel: attempt.channel,
            status: attempt.status,
            attempt_count: attempt.attempt_count,
            fault: attempt.fault,
            attempted_at: attempt.attempted_at,
            completed_at: attempt.completed_at,
        }
    }
}

/// Current state of one notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationStatusSnapshot {
    pub notification_id: String,
    pub batch_id: String,
    pub contact_id: String,
    pub status: NotificationStatus,
    pub channel: DeliveryChannel,
    pub escalation_level: u32,
    pub escalation_due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub acknowledgment: Option<Acknowledgment>,
    pub attempts: Vec<AttemptSummary>,
}

impl NotificationStatusSnapshot {
    pub fn new(notification: &Notification, attempts: &[DeliveryAttempt]) -> Self {
        Self {
            notification_id: notification.id.clone(),
            batch_id: notification.batch_id.clone(),
            contact_id: notification.contact_id.clone(),
            status: notification.status,
            channel: notification.channel,
            escalation_level: notification.level,
            escalation_due_at: notification.escalation_due_at,
            completed_at: notification.completed_at,
            acknowledgment: notification.acknowledgment.clone(),
            attempts: attempts.iter().map(AttemptSummary::from).collect(),
        }
    }
}

/// History line for a subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationSummary {
    pub notification_id: String,
    pub batch_id: String,
    pub risk_event_id: String,
    pub contact_id: String,
    pub channel: DeliveryChannel,
    pub escalation_level: u32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Notification> for NotificationSummary {
    fn from(n: &Notification) -> Self {
        Self {
            notification_id: n.id.clone(),
            batch_id: n.batch_id.clone(),
            risk_event_id: n.risk_event_id.clone(),
            contact_id: n.contact_id.clone(),
            channel: n.channel,
            escalation_level: n.level,
            status: status_label(n.status).to_string(),
            created_at: n.created_at,
            completed_at: n.completed_at,
        }
    }
}

/// A batch with its notification arena and escalation edges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOverview {
    pub batch_id: String,
    pub risk_event_id: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_notification_id: Option<String>,
    pub notifications: Vec<NotificationSummary>,
    pub links: Vec<EscalationLink>,
}

impl BatchOverview {
    pub fn new(
        batch: &NotificationBatch,
        notifications: &[Notification],
        links: Vec<EscalationLink>,
    ) -> Self {
        Self {
            batch_id: batch.id.clone(),
            risk_event_id: batch.risk_event.id.clone(),
            status: batch.status,
            created_at: batch.created_at,
            resolved_at: batch.resolved_at,
            acknowledged_notification_id: batch.acknowledged_notification_id.clone(),
            notifications: notifications.iter().map(NotificationSummary::from).collect(),
            links,
        }
    }

    /// Deepest escalation level reached.
    pub fn max_level(&self) -> u32 {
        self.notifications
            .iter()
            .map(|n| n.escalation_level)
            .max()
            .unwrap_or(0)
    }
}
