//! Notification entity and its delivery state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::channel::DeliveryChannel;
use crate::{Error, Result};

/// Delivery state of a single notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Created, not yet handed to a channel.
    #[default]
    Pending,
    /// A delivery attempt is in flight.
    Sending,
    /// Accepted by the provider.
    Sent,
    /// Provider confirmed delivery to the device.
    Delivered,
    /// The recipient opened the notification.
    Read,
    /// The recipient confirmed they are handling the event.
    Acknowledged,
    /// Every channel failed and the policy gave up.
    Failed,
    /// The acknowledgment window passed.
    Expired,
    /// Cancelled explicitly or because the batch was resolved.
    Cancelled,
}

impl NotificationStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENDING" => Some(Self::Sending),
            "SENT" => Some(Self::Sent),
            "DELIVERED" => Some(Self::Delivered),
            "READ" => Some(Self::Read),
            "ACKNOWLEDGED" => Some(Self::Acknowledged),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub const ALL: [NotificationStatus; 9] = [
        Self::Pending,
        Self::Sending,
        Self::Sent,
        Self::Delivered,
        Self::Read,
        Self::Acknowledged,
        Self::Failed,
        Self::Expired,
        Self::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Acknowledged | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Non-terminal states, i.e. the ones an open notification can be in.
    pub fn open_states() -> &'static [NotificationStatus] {
        &[
            Self::Pending,
            Self::Sending,
            Self::Sent,
            Self::Delivered,
            Self::Read,
        ]
    }

    /// Position along the forward delivery path.
    fn progress(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
            Self::Acknowledged | Self::Failed | Self::Expired | Self::Cancelled => 5,
        }
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: NotificationStatus) -> bool {
        use NotificationStatus::*;

        if self.is_terminal() {
            return false;
        }

        match (self, target) {
            // Expiry and cancellation are reachable from any open state
            (_, Expired | Cancelled) => true,

            (Pending, Sending) => true,
            (Sending, Sent | Failed | Acknowledged) => true,
            (Sent, Delivered | Read | Failed | Acknowledged) => true,
            (Delivered, Read | Failed | Acknowledged) => true,
            (Read, Failed | Acknowledged) => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: NotificationStatus) -> Result<NotificationStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::invalid_transition(self, target))
        }
    }

    /// Whether moving to `target` would be forward progress along the delivery path.
    ///
    /// Used to turn late progress reports (a second channel reporting SENT after the
    /// first already reported DELIVERED) into no-ops.
    pub fn is_behind(&self, target: NotificationStatus) -> bool {
        self.progress() < target.progress()
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery priority, derived from the template.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// What the recipient said when acknowledging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckResponse {
    Seen,
    OnMyWay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_minutes: Option<u32>,
    },
    Handled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    NeedsAssistance {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    FalseAlarm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl AckResponse {
    pub fn response_type(&self) -> &'static str {
        match self {
            Self::Seen => "SEEN",
            Self::OnMyWay { .. } => "ON_MY_WAY",
            Self::Handled { .. } => "HANDLED",
            Self::NeedsAssistance { .. } => "NEEDS_ASSISTANCE",
            Self::FalseAlarm { .. } => "FALSE_ALARM",
        }
    }
}

/// Recorded acknowledgment of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub response: AckResponse,
    pub responded_at: DateTime<Utc>,
}

/// One notification to one contact (on one channel at a time) for one risk event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub batch_id: String,
    pub risk_event_id: String,
    pub subject_id: String,
    pub contact_id: String,
    pub template_code: String,
    /// Channel of the current (or last) attempt.
    pub channel: DeliveryChannel,
    pub address: String,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub status: NotificationStatus,
    /// Escalation depth; root notifications are level 0.
    pub level: u32,
    /// Whether this notification is pinned to its channel (parallel fan-out).
    pub pinned_channel: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub escalation_due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub acknowledgment: Option<Acknowledgment>,
}

/// Fields needed to create a notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub batch_id: String,
    pub risk_event_id: String,
    pub subject_id: String,
    pub contact_id: String,
    pub template_code: String,
    pub channel: DeliveryChannel,
    pub address: String,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub level: u32,
    pub pinned_channel: bool,
}

impl Notification {
    /// Create a PENDING notification expiring `ttl` after `now`.
    pub fn new(fields: NewNotification, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            batch_id: fields.batch_id,
            risk_event_id: fields.risk_event_id,
            subject_id: fields.subject_id,
            contact_id: fields.contact_id,
            template_code: fields.template_code,
            channel: fields.channel,
            address: fields.address,
            title: fields.title,
            body: fields.body,
            priority: fields.priority,
            status: NotificationStatus::Pending,
            level: fields.level,
            pinned_channel: fields.pinned_channel,
            created_at: now,
            expires_at: now + ttl,
            first_attempt_at: None,
            escalation_due_at: None,
            completed_at: None,
            acknowledgment: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now > self.expires_at
    }
}
