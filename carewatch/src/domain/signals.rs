//! Deterministic adapters turning raw sensor readings into [`RiskEvent`]s.
//!
//! The classifiers themselves live elsewhere; these rules only map their
//! outputs onto a severity and a confidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::risk::{GeoPoint, RiskEvent, RiskKind, Severity};
use crate::{Error, Result};

/// Confidence used when a position carries no accuracy estimate.
const UNKNOWN_ACCURACY_CONFIDENCE: f64 = 0.7;

/// Consecutive misses that make a missed check critical regardless of deviation.
const CRITICAL_CONSECUTIVE_MISSES: u32 = 3;

/// Wandering reading: distance from the safe zone and time spent outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanderingReading {
    pub subject_id: String,
    pub distance_m: f64,
    pub minutes_outside: u32,
    pub position: GeoPoint,
    pub detected_at: DateTime<Utc>,
}

/// Geofence boundary crossing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceExitReading {
    pub subject_id: String,
    pub distance_outside_m: f64,
    /// Caller decides whether the crossing happened at night in the subject's zone.
    #[serde(default)]
    pub night: bool,
    pub position: GeoPoint,
    pub detected_at: DateTime<Utc>,
}

/// Fall classifier output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallReading {
    pub subject_id: String,
    pub classifier_confidence: f64,
    pub motionless_secs: u32,
    #[serde(default)]
    pub position: Option<GeoPoint>,
    pub detected_at: DateTime<Utc>,
}

/// Missed health check, scored against the subject's baseline lateness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissedCheckReading {
    pub subject_id: String,
    pub minutes_overdue: f64,
    pub baseline_mean_minutes: f64,
    pub baseline_stddev_minutes: f64,
    pub consecutive_misses: u32,
    pub detected_at: DateTime<Utc>,
}

/// Manual panic button press.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualPanic {
    pub subject_id: String,
    #[serde(default)]
    pub position: Option<GeoPoint>,
    pub detected_at: DateTime<Utc>,
}

fn check_distance(value: f64, field: &str) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::validation(format!("{} must be >= 0, got {}", field, value)));
    }
    Ok(())
}

/// Map GPS accuracy onto a confidence value.
pub fn confidence_from_accuracy(accuracy_m: Option<f64>) -> f64 {
    match accuracy_m {
        Some(a) if a <= 10.0 => 0.95,
        Some(a) if a <= 30.0 => 0.85,
        Some(a) if a <= 100.0 => 0.65,
        Some(_) => 0.4,
        None => UNKNOWN_ACCURACY_CONFIDENCE,
    }
}

pub fn wandering(reading: &WanderingReading) -> Result<RiskEvent> {
    check_distance(reading.distance_m, "distance_m")?;
    let d = reading.distance_m;
    let m = reading.minutes_outside;
    let severity = if d > 1000.0 || m >= 60 {
        Severity::Critical
    } else if d > 500.0 || m >= 30 {
        Severity::High
    } else if d > 100.0 || m >= 10 {
        Severity::Medium
    } else {
        Severity::Low
    };

    Ok(RiskEvent::new(
        &reading.subject_id,
        RiskKind::Wandering,
        severity,
        reading.detected_at,
        confidence_from_accuracy(reading.position.accuracy_m),
    )
    .with_location(reading.position))
}

pub fn geofence_exit(reading: &GeofenceExitReading) -> Result<RiskEvent> {
    check_distance(reading.distance_outside_m, "distance_outside_m")?;
    let d = reading.distance_outside_m;
    let mut severity = if d >= 500.0 {
        Severity::High
    } else if d >= 100.0 {
        Severity::Medium
    } else {
        Severity::Low
    };
    if reading.night {
        severity = severity.raised();
    }

    Ok(RiskEvent::new(
        &reading.subject_id,
        RiskKind::GeofenceExit,
        severity,
        reading.detected_at,
        confidence_from_accuracy(reading.position.accuracy_m),
    )
    .with_location(reading.position))
}

pub fn fall(reading: &FallReading) -> Result<RiskEvent> {
    let c = reading.classifier_confidence;
    if !c.is_finite() || !(0.0..=1.0).contains(&c) {
        return Err(Error::validation(format!(
            "classifier_confidence must be within [0, 1], got {}",
            c
        )));
    }
    let severity = if reading.motionless_secs >= 120 && c >= 0.6 {
        Severity::Critical
    } else if c >= 0.8 {
        Severity::High
    } else if c >= 0.5 {
        Severity::Medium
    } else {
        Severity::Low
    };

    let mut event = RiskEvent::new(
        &reading.subject_id,
        RiskKind::Fall,
        severity,
        reading.detected_at,
        c,
    );
    if let Some(position) = reading.position {
        event = event.with_location(position);
    }
    Ok(event)
}

/// Standard score of the lateness against the baseline.
///
/// A degenerate baseline (zero spread) yields `+inf` for any lateness above the
/// mean and `0` otherwise.
pub fn missed_check_z_score(reading: &MissedCheckReading) -> f64 {
    let deviation = reading.minutes_overdue - reading.baseline_mean_minutes;
    if reading.baseline_stddev_minutes <= f64::EPSILON {
        return if deviation > 0.0 { f64::INFINITY } else { 0.0 };
    }
    deviation / reading.baseline_stddev_minutes
}

pub fn missed_check(reading: &MissedCheckReading) -> Result<RiskEvent> {
    check_distance(reading.minutes_overdue, "minutes_overdue")?;
    check_distance(reading.baseline_stddev_minutes, "baseline_stddev_minutes")?;
    if !reading.baseline_mean_minutes.is_finite() {
        return Err(Error::validation("baseline_mean_minutes must be finite"));
    }

    let z = missed_check_z_score(reading);
    let severity = if reading.consecutive_misses >= CRITICAL_CONSECUTIVE_MISSES {
        Severity::Critical
    } else if z >= 3.0 {
        Severity::High
    } else if z >= 2.0 {
        Severity::Medium
    } else {
        Severity::Low
    };
    // Confidence grows with the deviation and saturates at 3 sigma.
    let confidence = if z.is_finite() {
        (0.5 + z.max(0.0) / 6.0).min(1.0)
    } else {
        1.0
    };

    Ok(RiskEvent::new(
        &reading.subject_id,
        RiskKind::MissedCheck,
        severity,
        reading.detected_at,
        confidence,
    ))
}

pub fn manual_panic(panic: &ManualPanic) -> RiskEvent {
    let event = RiskEvent::new(
        &panic.subject_id,
        RiskKind::Manual,
        Severity::Critical,
        panic.detected_at,
        1.0,
    );
    match panic.position {
        Some(position) => event.with_location(position),
        None => event,
    }
}

/// Any raw reading the adapters understand, tagged by its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SensorReading {
    Wandering(WanderingReading),
    GeofenceExit(GeofenceExitReading),
    Fall(FallReading),
    MissedCheck(MissedCheckReading),
    ManualPanic(ManualPanic),
}

impl SensorReading {
    pub fn to_risk_event(&self) -> Result<RiskEvent> {
        match self {
            Self::Wandering(r) => wandering(r),
            Self::GeofenceExit(r) => geofence_exit(r),
            Self::Fall(r) => fall(r),
            Self::MissedCheck(r) => missed_check(r),
            Self::ManualPanic(p) => Ok(manual_panic(p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wandering_reading(distance_m: f64, minutes_outside: u32) -> WanderingReading {
        WanderingReading {
            subject_id: "s1".to_string(),
            distance_m,
            minutes_outside,
            position: GeoPoint::new(40.0, -3.0).with_accuracy(5.0),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_wandering_thresholds() {
        assert_eq!(wandering(&wandering_reading(50.0, 0)).unwrap().severity, Severity::Low);
        assert_eq!(wandering(&wandering_reading(150.0, 0)).unwrap().severity, Severity::Medium);
        assert_eq!(wandering(&wandering_reading(20.0, 10)).unwrap().severity, Severity::Medium);
        assert_eq!(wandering(&wandering_reading(600.0, 0)).unwrap().severity, Severity::High);
        assert_eq!(wandering(&wandering_reading(0.0, 60)).unwrap().severity, Severity::Critical);
        assert_eq!(wandering(&wandering_reading(1500.0, 0)).unwrap().severity, Severity::Critical);
        // Exactly 100 m is not "more than 100 m".
        assert_eq!(wandering(&wandering_reading(100.0, 0)).unwrap().severity, Severity::Low);
    }

    #[test]
    fn test_wandering_confidence_from_accuracy() {
        let event = wandering(&wandering_reading(50.0, 0)).unwrap();
        assert_eq!(event.confidence, 0.95);
        assert!(event.location.is_some());
        assert!(wandering(&wandering_reading(-1.0, 0)).is_err());
    }

    #[test]
    fn test_geofence_night_raises_severity() {
        let mut reading = GeofenceExitReading {
            subject_id: "s1".to_string(),
            distance_outside_m: 150.0,
            night: false,
            position: GeoPoint::new(40.0, -3.0),
            detected_at: Utc::now(),
        };
        assert_eq!(geofence_exit(&reading).unwrap().severity, Severity::Medium);
        reading.night = true;
        assert_eq!(geofence_exit(&reading).unwrap().severity, Severity::High);
        reading.distance_outside_m = 800.0;
        assert_eq!(geofence_exit(&reading).unwrap().severity, Severity::Critical);
    }

    #[test]
    fn test_fall_rules() {
        let reading = |confidence: f64, motionless_secs: u32| FallReading {
            subject_id: "s1".to_string(),
            classifier_confidence: confidence,
            motionless_secs,
            position: None,
            detected_at: Utc::now(),
        };
        assert_eq!(fall(&reading(0.6, 120)).unwrap().severity, Severity::Critical);
        assert_eq!(fall(&reading(0.59, 300)).unwrap().severity, Severity::Medium);
        assert_eq!(fall(&reading(0.85, 10)).unwrap().severity, Severity::High);
        assert_eq!(fall(&reading(0.3, 10)).unwrap().severity, Severity::Low);
        assert!(fall(&reading(1.2, 0)).is_err());
    }

    #[test]
    fn test_missed_check_scoring() {
        let mut reading = MissedCheckReading {
            subject_id: "s1".to_string(),
            minutes_overdue: 40.0,
            baseline_mean_minutes: 10.0,
            baseline_stddev_minutes: 10.0,
            consecutive_misses: 1,
            detected_at: Utc::now(),
        };
        assert_eq!(missed_check_z_score(&reading), 3.0);
        assert_eq!(missed_check(&reading).unwrap().severity, Severity::High);

        reading.minutes_overdue = 30.0;
        assert_eq!(missed_check(&reading).unwrap().severity, Severity::Medium);

        reading.minutes_overdue = 15.0;
        assert_eq!(missed_check(&reading).unwrap().severity, Severity::Low);

        reading.consecutive_misses = 3;
        assert_eq!(missed_check(&reading).unwrap().severity, Severity::Critical);
    }

    #[test]
    fn test_missed_check_zero_spread() {
        let reading = MissedCheckReading {
            subject_id: "s1".to_string(),
            minutes_overdue: 11.0,
            baseline_mean_minutes: 10.0,
            baseline_stddev_minutes: 0.0,
            consecutive_misses: 0,
            detected_at: Utc::now(),
        };
        let event = missed_check(&reading).unwrap();
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.confidence, 1.0);
    }

    #[test]
    fn test_manual_panic_is_critical() {
        let event = manual_panic(&ManualPanic {
            subject_id: "s1".to_string(),
            position: None,
            detected_at: Utc::now(),
        });
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.confidence, 1.0);
        assert_eq!(event.kind, RiskKind::Manual);
    }

    #[test]
    fn test_tagged_reading_dispatch() {
        let reading: SensorReading = serde_json::from_value(serde_json::json!({
            "source": "geofence_exit",
            "subject_id": "s1",
            "distance_outside_m": 600.0,
            "position": { "latitude": 40.0, "longitude": -3.0 },
            "detected_at": "2026-03-04T12:00:00Z"
        }))
        .unwrap();
        let event = reading.to_risk_event().unwrap();
        assert_eq!(event.kind, RiskKind::GeofenceExit);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.confidence, UNKNOWN_ACCURACY_CONFIDENCE);
    }
}
