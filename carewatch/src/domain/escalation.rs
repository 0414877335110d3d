//! Escalation links between notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a follow-up notification was spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    /// No acknowledgment within the escalation window.
    AckTimeout,
    /// Every channel of the contact failed.
    DeliveryExhausted,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::DeliveryExhausted => "DELIVERY_EXHAUSTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACK_TIMEOUT" => Some(Self::AckTimeout),
            "DELIVERY_EXHAUSTED" => Some(Self::DeliveryExhausted),
            _ => None,
        }
    }
}

/// Directed edge from an escalated notification to the one it spawned.
///
/// Links form an append-only edge list over the notification arena. `level` is the
/// escalation depth of the target and always equals the source level plus one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLink {
    pub id: String,
    pub batch_id: String,
    pub from_notification_id: String,
    pub to_notification_id: String,
    pub level: u32,
    pub reason: EscalationReason,
    pub created_at: DateTime<Utc>,
}

impl EscalationLink {
    pub fn new(
        batch_id: impl Into<String>,
        from_notification_id: impl Into<String>,
        to_notification_id: impl Into<String>,
        level: u32,
        reason: EscalationReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            batch_id: batch_id.into(),
            from_notification_id: from_notification_id.into(),
            to_notification_id: to_notification_id.into(),
            level,
            reason,
            created_at: now,
        }
    }

    /// Validate the edge against the source level and the configured depth cap.
    pub fn check(&self, source_level: u32, max_depth: u32) -> Result<(), String> {
        if self.from_notification_id == self.to_notification_id {
            return Err("self-referencing escalation link".to_string());
        }
        if self.level != source_level + 1 {
            return Err(format!(
                "link level {} does not follow source level {}",
                self.level, source_level
            ));
        }
        if self.level > max_depth {
            return Err(format!(
                "link level {} exceeds max depth {}",
                self.level, max_depth
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_accepts_next_level() {
        let link = EscalationLink::new("b", "n1", "n2", 1, EscalationReason::AckTimeout, Utc::now());
        assert!(link.check(0, 3).is_ok());
    }

    #[test]
    fn test_check_rejects_skipped_or_capped_levels() {
        let link = EscalationLink::new("b", "n1", "n2", 2, EscalationReason::AckTimeout, Utc::now());
        assert!(link.check(0, 3).is_err());

        let link = EscalationLink::new(
            "b",
            "n1",
            "n2",
            4,
            EscalationReason::DeliveryExhausted,
            Utc::now(),
        );
        assert!(link.check(3, 3).is_err());

        let link = EscalationLink::new("b", "n1", "n1", 1, EscalationReason::AckTimeout, Utc::now());
        assert!(link.check(0, 3).is_err());
    }
}
