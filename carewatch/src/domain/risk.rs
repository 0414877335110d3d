//! Normalized risk events produced by the monitoring collaborators.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::contact::Capability;
use crate::{Error, Result};

/// Maximum clock skew tolerated for `detected_at` in the future.
const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Kind of safety signal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskKind {
    Fall,
    Wandering,
    GeofenceExit,
    MissedCheck,
    Manual,
}

impl RiskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fall => "FALL",
            Self::Wandering => "WANDERING",
            Self::GeofenceExit => "GEOFENCE_EXIT",
            Self::MissedCheck => "MISSED_CHECK",
            Self::Manual => "MANUAL",
        }
    }

    /// Human-friendly label used in rendered messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fall => "Fall detected",
            Self::Wandering => "Wandering detected",
            Self::GeofenceExit => "Left safe zone",
            Self::MissedCheck => "Missed check-in",
            Self::Manual => "Help requested",
        }
    }
}

/// Severity of a risk event. Ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// One level up, saturating at `Critical`.
    pub fn raised(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Capability a contact needs to be notified about events of this severity.
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::Low | Self::Medium => Capability::ReceiveAlerts,
            Self::High | Self::Critical => Capability::ReceiveEmergencyAlerts,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// A WGS84 position with optional horizontal accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::validation(format!(
                "latitude out of range: {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::validation(format!(
                "longitude out of range: {}",
                self.longitude
            )));
        }
        if let Some(accuracy) = self.accuracy_m
            && (!accuracy.is_finite() || accuracy < 0.0)
        {
            return Err(Error::validation(format!("invalid accuracy: {}", accuracy)));
        }
        Ok(())
    }

    /// Maps link for message bodies.
    pub fn maps_url(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.5}, {:.5}", self.latitude, self.longitude)
    }
}

/// A normalized safety signal. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: String,
    pub subject_id: String,
    pub kind: RiskKind,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub confidence: f64,
}

impl RiskEvent {
    pub fn new(
        subject_id: impl Into<String>,
        kind: RiskKind,
        severity: Severity,
        detected_at: DateTime<Utc>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            kind,
            severity,
            detected_at,
            location: None,
            confidence,
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    /// Reject malformed events before anything is persisted or sent.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("risk event id is empty"));
        }
        if self.subject_id.trim().is_empty() {
            return Err(Error::validation("risk event subject_id is empty"));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::validation(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }
        if self.detected_at > now + Duration::seconds(MAX_FUTURE_SKEW_SECS) {
            return Err(Error::validation(format!(
                "detected_at {} is in the future",
                self.detected_at.to_rfc3339()
            )));
        }
        if let Some(location) = &self.location {
            location.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> RiskEvent {
        RiskEvent::new("subject-1", RiskKind::Fall, Severity::High, Utc::now(), 0.9)
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
        assert_eq!(Severity::High.raised(), Severity::Critical);
        assert_eq!(Severity::Critical.raised(), Severity::Critical);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("critical"), None);
        assert_eq!(
            "GEOFENCE_EXIT".parse::<RiskKind>().ok(),
            Some(RiskKind::GeofenceExit)
        );
    }

    #[test]
    fn test_validate_accepts_well_formed_event() {
        let event = event().with_location(GeoPoint::new(51.5, -0.12).with_accuracy(8.0));
        assert!(event.validate(Utc::now()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let mut event = event();
        event.confidence = 1.5;
        assert!(matches!(
            event.validate(Utc::now()),
            Err(Error::Validation(_))
        ));
        event.confidence = f64::NAN;
        assert!(event.validate(Utc::now()).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_subject_and_future_timestamp() {
        let mut event = event();
        event.subject_id = "  ".to_string();
        assert!(event.validate(Utc::now()).is_err());

        let mut event = self::event();
        event.detected_at = Utc::now() + Duration::hours(1);
        assert!(event.validate(Utc::now()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_location() {
        let event = event().with_location(GeoPoint::new(95.0, 0.0));
        assert!(event.validate(Utc::now()).is_err());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&event()).unwrap();
        assert!(json.contains("\"FALL\""));
        assert!(json.contains("\"HIGH\""));
    }
}
