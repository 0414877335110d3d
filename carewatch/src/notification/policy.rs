//! Escalation policy engine.
//!
//! Pure decision logic: given what just happened to a notification, pick the
//! next step. Rules are evaluated in order:
//!
//! 1. transient failure with retries left: retry the same channel with backoff
//! 2. failure with an untried channel (not for CRITICAL): switch channel
//! 3. window elapsed or no channel left, below the depth cap: escalate
//! 4. otherwise give up
//!
//! Rules 1 and 2 only apply to delivery failures. A timeout means the contact
//! already had the whole window.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{
    DeliveryAttempt, DeliveryChannel, DeliveryFault, Notification, NotificationStatus,
    NotificationTemplate, Severity,
};

/// Maximum backoff exponent, keeps the shift from overflowing.
const MAX_EXPONENT: u32 = 16;

/// Default ceiling for a single retry delay (15 minutes).
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(900);

/// What woke the policy up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A delivery attempt failed.
    Failure,
    /// The acknowledgment window elapsed.
    Timeout,
}

impl Trigger {
    /// Terminal status a notification takes when the policy gives up.
    pub fn give_up_status(&self) -> NotificationStatus {
        match self {
            Self::Failure => NotificationStatus::Failed,
            Self::Timeout => NotificationStatus::Expired,
        }
    }
}

/// Everything the policy looks at.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub notification: &'a Notification,
    pub severity: Severity,
    pub template: &'a NotificationTemplate,
    /// The attempt that just failed (or the last one, on timeout).
    pub last_attempt: Option<&'a DeliveryAttempt>,
    pub fault: Option<&'a DeliveryFault>,
    /// Reachable channels of the contact, preferred first.
    pub contact_channels: &'a [DeliveryChannel],
    /// Channels already attempted on this notification.
    pub tried_channels: &'a [DeliveryChannel],
    pub trigger: Trigger,
    pub now: DateTime<Utc>,
}

/// Next step for a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    RetrySameChannel {
        delay: Duration,
        /// `attempt_count` of the retry.
        attempt_count: u32,
    },
    SwitchChannel {
        channel: DeliveryChannel,
    },
    EscalateToNextContact,
    GiveUp {
        status: NotificationStatus,
    },
}

impl Decision {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RetrySameChannel { .. } => "retry_same_channel",
            Self::SwitchChannel { .. } => "switch_channel",
            Self::EscalateToNextContact => "escalate",
            Self::GiveUp { .. } => "give_up",
        }
    }
}

/// Escalation policy with the engine-wide limits.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    max_depth: u32,
    max_retry_delay: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(3, DEFAULT_MAX_RETRY_DELAY)
    }
}

impl EscalationPolicy {
    pub fn new(max_depth: u32, max_retry_delay: Duration) -> Self {
        Self {
            max_depth,
            max_retry_delay,
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn decide(&self, ctx: &PolicyContext<'_>) -> Decision {
        if ctx.trigger == Trigger::Failure {
            if let Some(decision) = self.retry(ctx) {
                return decision;
            }
            if !ctx.severity.is_critical()
                && let Some(channel) = untried_channel(ctx)
            {
                return Decision::SwitchChannel { channel };
            }
        }

        let window_elapsed = match ctx.trigger {
            Trigger::Timeout => {
                let started = ctx
                    .notification
                    .first_attempt_at
                    .unwrap_or(ctx.notification.created_at);
                ctx.now >= started + escalation_window(ctx.template, ctx.severity)
            }
            Trigger::Failure => false,
        };
        let channels_exhausted = untried_channel(ctx).is_none();

        if (window_elapsed || channels_exhausted) && ctx.notification.level < self.max_depth {
            return Decision::EscalateToNextContact;
        }

        Decision::GiveUp {
            status: ctx.trigger.give_up_status(),
        }
    }

    fn retry(&self, ctx: &PolicyContext<'_>) -> Option<Decision> {
        if ctx.fault.is_some_and(DeliveryFault::is_permanent) {
            return None;
        }
        let attempt = ctx.last_attempt?;
        if attempt.attempt_count >= ctx.template.max_retries {
            return None;
        }
        Some(Decision::RetrySameChannel {
            delay: self.retry_delay(ctx.template, attempt.attempt_count),
            attempt_count: attempt.attempt_count + 1,
        })
    }

    /// Backoff before the retry following an attempt with `attempt_count`.
    ///
    /// `retry_interval_seconds * 2^attempt_count`, capped at the configured ceiling.
    pub fn retry_delay(&self, template: &NotificationTemplate, attempt_count: u32) -> Duration {
        let base = Duration::from_secs(u64::from(template.retry_interval_seconds));
        let multiplier = 1u32 << attempt_count.min(MAX_EXPONENT);
        base.saturating_mul(multiplier).min(self.max_retry_delay)
    }
}

/// Acknowledgment window for a template. CRITICAL halves it, rounding up,
/// with a one minute floor.
pub fn escalation_window(template: &NotificationTemplate, severity: Severity) -> chrono::Duration {
    let minutes = if severity.is_critical() {
        template.escalation_minutes.div_ceil(2).max(1)
    } else {
        template.escalation_minutes.max(1)
    };
    chrono::Duration::minutes(i64::from(minutes))
}

fn untried_channel(ctx: &PolicyContext<'_>) -> Option<DeliveryChannel> {
    ctx.contact_channels
        .iter()
        .copied()
        .find(|c| !ctx.tried_channels.contains(c))
}
