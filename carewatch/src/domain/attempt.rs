//! Delivery attempts and the faults they record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::channel::DeliveryChannel;

/// Status of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    /// Handed to the channel sender, no result yet.
    Attempting,
    Sent,
    Delivered,
    Failed,
    Expired,
    Cancelled,
    /// Failed, and a retry on the same channel has been scheduled.
    PendingRetry,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempting => "ATTEMPTING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
            Self::PendingRetry => "PENDING_RETRY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ATTEMPTING" => Some(Self::Attempting),
            "SENT" => Some(Self::Sent),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            "CANCELLED" => Some(Self::Cancelled),
            "PENDING_RETRY" => Some(Self::PendingRetry),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Attempting)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::PendingRetry)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a delivery fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    /// Network or provider hiccup; retried with backoff.
    Transient,
    /// Invalid address, unsubscribed recipient; never retried on the same channel.
    Permanent,
    /// No acknowledgment within the escalation window.
    Timeout,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSIENT" => Some(Self::Transient),
            "PERMANENT" => Some(Self::Permanent),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// A fault reported by a channel sender or raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFault {
    pub kind: FaultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl DeliveryFault {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Transient,
            code: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Permanent,
            code: None,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Timeout,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FaultKind::Permanent
    }
}

impl std::fmt::Display for DeliveryFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.kind.as_str(), code, self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

/// Provider acknowledgment of an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_response_code: Option<String>,
}

/// Outcome of a send, as reported back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryOutcome {
    Sent(SendReceipt),
    Failed(DeliveryFault),
}

impl DeliveryOutcome {
    pub fn fault(&self) -> Option<&DeliveryFault> {
        match self {
            Self::Sent(_) => None,
            Self::Failed(fault) => Some(fault),
        }
    }
}

/// Result of a send keyed by the attempt it completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub attempt_id: String,
    pub outcome: DeliveryOutcome,
}

/// Late provider receipt for an attempt that was already accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryReceipt {
    Delivered,
    Read,
}

/// One send of one notification on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub notification_id: String,
    pub channel: DeliveryChannel,
    pub address: String,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    /// Retries on this channel that preceded this attempt (0 for the first send).
    pub attempt_count: u32,
    pub provider_response_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub fault: Option<FaultKind>,
    pub external_message_id: Option<String>,
    pub processing_time_ms: Option<i64>,
}

impl DeliveryAttempt {
    /// Open a new ATTEMPTING row.
    pub fn open(
        notification_id: impl Into<String>,
        channel: DeliveryChannel,
        address: impl Into<String>,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            notification_id: notification_id.into(),
            channel,
            address: address.into(),
            attempted_at: now,
            completed_at: None,
            status: AttemptStatus::Attempting,
            attempt_count,
            provider_response_code: None,
            error_code: None,
            error_message: None,
            fault: None,
            external_message_id: None,
            processing_time_ms: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Build the completed version of this attempt.
    ///
    /// `retry_scheduled` marks a failure that already has a follow-up attempt planned.
    pub fn completed(
        &self,
        outcome: &DeliveryOutcome,
        retry_scheduled: bool,
        now: DateTime<Utc>,
    ) -> DeliveryAttempt {
        let mut done = self.clone();
        done.completed_at = Some(now);
        done.processing_time_ms = Some((now - self.attempted_at).num_milliseconds().max(0));
        match outcome {
            DeliveryOutcome::Sent(receipt) => {
                done.status = AttemptStatus::Sent;
                done.external_message_id = receipt.external_message_id.clone();
                done.provider_response_code = receipt.provider_response_code.clone();
            }
            DeliveryOutcome::Failed(fault) => {
                done.status = if retry_scheduled {
                    AttemptStatus::PendingRetry
                } else {
                    AttemptStatus::Failed
                };
                done.fault = Some(fault.kind);
                done.error_code = fault.code.clone();
                done.error_message = Some(fault.message.clone());
            }
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_attempt_status_strings() {
        for status in [
            AttemptStatus::Attempting,
            AttemptStatus::Sent,
            AttemptStatus::Delivered,
            AttemptStatus::Failed,
            AttemptStatus::Expired,
            AttemptStatus::Cancelled,
            AttemptStatus::PendingRetry,
        ] {
            assert_eq!(AttemptStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_completed_success_records_receipt() {
        let start = Utc::now();
        let attempt = DeliveryAttempt::open("n-1", DeliveryChannel::Sms, "+1555", 0, start);
        let done = attempt.completed(
            &DeliveryOutcome::Sent(SendReceipt {
                external_message_id: Some("SM123".into()),
                provider_response_code: Some("202".into()),
            }),
            false,
            start + Duration::milliseconds(350),
        );
        assert_eq!(done.status, AttemptStatus::Sent);
        assert_eq!(done.external_message_id.as_deref(), Some("SM123"));
        assert_eq!(done.processing_time_ms, Some(350));
    }

    #[test]
    fn test_completed_failure_with_retry() {
        let start = Utc::now();
        let attempt = DeliveryAttempt::open("n-1", DeliveryChannel::Push, "tok", 1, start);
        let fault = DeliveryFault::transient("gateway timeout").with_code("504");
        let done = attempt.completed(&DeliveryOutcome::Failed(fault), true, start);
        assert_eq!(done.status, AttemptStatus::PendingRetry);
        assert_eq!(done.fault, Some(FaultKind::Transient));
        assert_eq!(done.error_code.as_deref(), Some("504"));
        assert!(done.status.is_failure());
    }

    #[test]
    fn test_fault_display() {
        let fault = DeliveryFault::permanent("unsubscribed").with_code("21610");
        assert_eq!(fault.to_string(), "PERMANENT [21610]: unsubscribed");
    }
}
