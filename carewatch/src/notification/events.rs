//! Escalation signals broadcast to the emergency subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::domain::{AckResponse, RiskKind, Severity};

/// A risk event ran out of contacts without anybody acknowledging it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExhaustionFault {
    pub batch_id: String,
    pub risk_event_id: String,
    pub subject_id: String,
    pub kind: RiskKind,
    pub severity: Severity,
    /// Contacts that were notified before giving up.
    pub contacts_tried: Vec<String>,
    pub at: DateTime<Utc>,
}

impl From<ExhaustionFault> for Error {
    fn from(fault: ExhaustionFault) -> Self {
        Error::Exhausted {
            batch_id: fault.batch_id,
            risk_event_id: fault.risk_event_id,
        }
    }
}

/// Batch-level outcome of a risk event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum EscalationSignal {
    /// A contact acknowledged.
    Resolved {
        batch_id: String,
        risk_event_id: String,
        subject_id: String,
        notification_id: String,
        contact_id: String,
        response: AckResponse,
        at: DateTime<Utc>,
    },
    /// Every chain ended without an acknowledgment.
    Unresolved {
        batch_id: String,
        risk_event_id: String,
        subject_id: String,
        severity: Severity,
        at: DateTime<Utc>,
    },
    /// Fallback alert: nobody can be reached for an event that must not be dropped.
    ExhaustionAlert(ExhaustionFault),
    /// The batch was cancelled before resolution.
    Cancelled {
        batch_id: String,
        risk_event_id: String,
        subject_id: String,
        at: DateTime<Utc>,
    },
}

impl EscalationSignal {
    pub fn signal_type(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::Unresolved { .. } => "unresolved",
            Self::ExhaustionAlert(_) => "exhaustion_alert",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn batch_id(&self) -> &str {
        match self {
            Self::Resolved { batch_id, .. }
            | Self::Unresolved { batch_id, .. }
            | Self::Cancelled { batch_id, .. } => batch_id,
            Self::ExhaustionAlert(fault) => &fault.batch_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Resolved { at, .. } | Self::Unresolved { at, .. } | Self::Cancelled { at, .. } => {
                *at
            }
            Self::ExhaustionAlert(fault) => fault.at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault() -> ExhaustionFault {
        ExhaustionFault {
            batch_id: "b-1".into(),
            risk_event_id: "e-1".into(),
            subject_id: "s-1".into(),
            kind: RiskKind::Fall,
            severity: Severity::Critical,
            contacts_tried: vec!["c-1".into(), "c-2".into()],
            at: Utc::now(),
        }
    }

    #[test]
    fn test_exhaustion_fault_into_error() {
        let err: Error = fault().into();
        assert!(matches!(err, Error::Exhausted { ref batch_id, .. } if batch_id == "b-1"));
        assert!(err.is_caller_facing());
    }

    #[test]
    fn test_signal_serialization_is_tagged() {
        let signal = EscalationSignal::ExhaustionAlert(fault());
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["signal"], "exhaustion_alert");
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(signal.batch_id(), "b-1");
        assert_eq!(signal.signal_type(), "exhaustion_alert");
    }
}
