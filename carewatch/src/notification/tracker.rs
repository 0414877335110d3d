//! Delivery attempt tracker.
//!
//! Records every send attempt with timestamps and outcome. The store enforces
//! at most one open attempt per notification; completion is first-writer-wins.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::Result;
use crate::clock::Clock;
use crate::database::repositories::NotificationRepository;
use crate::domain::{
    AttemptStatus, DeliveryAttempt, DeliveryChannel, DeliveryOutcome, DeliveryReceipt, FaultKind,
    Notification,
};
use crate::Error;

pub struct DeliveryTracker {
    repo: Arc<dyn NotificationRepository>,
    clock: Arc<dyn Clock>,
}

impl DeliveryTracker {
    pub fn new(repo: Arc<dyn NotificationRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Open an ATTEMPTING row for `notification`.
    ///
    /// Fails with [`Error::AttemptInProgress`] while another attempt is open.
    pub async fn record_attempt(
        &self,
        notification: &Notification,
        channel: DeliveryChannel,
        address: &str,
        attempt_count: u32,
    ) -> Result<DeliveryAttempt> {
        let attempt = DeliveryAttempt::open(
            &notification.id,
            channel,
            address,
            attempt_count,
            self.clock.now(),
        );
        self.repo.insert_attempt(&attempt).await?;
        debug!(
            notification_id = %notification.id,
            attempt_id = %attempt.id,
            channel = %channel,
            attempt_count,
            "Delivery attempt opened"
        );
        Ok(attempt)
    }

    /// Store the outcome of an open attempt.
    ///
    /// Returns `false` when the attempt was already closed; the first outcome is kept.
    pub async fn complete(
        &self,
        attempt: &DeliveryAttempt,
        outcome: &DeliveryOutcome,
        retry_scheduled: bool,
    ) -> Result<bool> {
        let done = attempt.completed(outcome, retry_scheduled, self.clock.now());
        let applied = self.repo.complete_attempt(&done).await?;
        if applied {
            debug!(
                attempt_id = %attempt.id,
                status = %done.status,
                processing_time_ms = ?done.processing_time_ms,
                "Delivery attempt completed"
            );
        } else {
            debug!(attempt_id = %attempt.id, "Ignoring duplicate completion");
        }
        Ok(applied)
    }

    /// Apply a provider receipt. Only SENT attempts are upgraded to DELIVERED.
    pub async fn record_receipt(
        &self,
        attempt: &DeliveryAttempt,
        receipt: DeliveryReceipt,
    ) -> Result<bool> {
        let upgraded = self.repo.mark_attempt_delivered(&attempt.id).await?;
        debug!(attempt_id = %attempt.id, receipt = ?receipt, upgraded, "Delivery receipt recorded");
        Ok(upgraded)
    }

    /// Close the open attempt of a notification that expired or was cancelled.
    pub async fn abandon_open(
        &self,
        notification_id: &str,
        status: AttemptStatus,
        reason: &str,
    ) -> Result<u64> {
        let fault = match status {
            AttemptStatus::Expired => Some(FaultKind::Timeout),
            AttemptStatus::Cancelled => None,
            other => {
                return Err(Error::validation(format!(
                    "cannot abandon an attempt as {}",
                    other
                )));
            }
        };
        let closed = self
            .repo
            .close_open_attempts(notification_id, status, fault, Some(reason), self.clock.now())
            .await?;
        if closed > 0 {
            warn!(notification_id, status = %status, reason, "Open delivery attempt abandoned");
        }
        Ok(closed)
    }

    /// Attempts of a notification, oldest first.
    pub async fn attempts(&self, notification_id: &str) -> Result<Vec<DeliveryAttempt>> {
        self.repo.list_attempts(notification_id).await
    }

    pub async fn get(&self, attempt_id: &str) -> Result<DeliveryAttempt> {
        self.repo.get_attempt(attempt_id).await
    }
}

/// Distinct channels used by `attempts`, in first-use order.
pub fn channels_tried(attempts: &[DeliveryAttempt]) -> Vec<DeliveryChannel> {
    let mut channels = Vec::new();
    for attempt in attempts {
        if !channels.contains(&attempt.channel) {
            channels.push(attempt.channel);
        }
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::database::repositories::MemoryNotificationRepository;
    use crate::domain::{
        DeliveryFault, NewNotification, NotificationBatch, NotificationPriority, RiskEvent,
        RiskKind, SendReceipt, Severity,
    };
    use chrono::Utc;

    async fn setup() -> (DeliveryTracker, Notification) {
        let repo = Arc::new(MemoryNotificationRepository::new());
        let event = RiskEvent::new("s1", RiskKind::Fall, Severity::High, Utc::now(), 0.9);
        let batch = NotificationBatch::new(event.clone(), vec!["c1".into()], Utc::now());
        repo.insert_batch(&batch).await.unwrap();
        let notification = Notification::new(
            NewNotification {
                batch_id: batch.id.clone(),
                risk_event_id: event.id.clone(),
                subject_id: "s1".into(),
                contact_id: "c1".into(),
                template_code: "generic".into(),
                channel: DeliveryChannel::Push,
                address: "tok".into(),
                title: "t".into(),
                body: "b".into(),
                priority: NotificationPriority::High,
                level: 0,
                pinned_channel: false,
            },
            Utc::now(),
            chrono::Duration::hours(1),
        );
        repo.insert_notification(&notification).await.unwrap();
        (DeliveryTracker::new(repo, Arc::new(SystemClock)), notification)
    }

    #[tokio::test]
    async fn test_only_one_open_attempt() {
        let (tracker, n) = setup().await;
        tracker
            .record_attempt(&n, DeliveryChannel::Push, "tok", 0)
            .await
            .unwrap();
        let second = tracker.record_attempt(&n, DeliveryChannel::Sms, "+1", 0).await;
        assert!(matches!(second, Err(Error::AttemptInProgress { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_completion_keeps_first_outcome() {
        let (tracker, n) = setup().await;
        let attempt = tracker
            .record_attempt(&n, DeliveryChannel::Push, "tok", 0)
            .await
            .unwrap();

        let sent = DeliveryOutcome::Sent(SendReceipt::default());
        let failed = DeliveryOutcome::Failed(DeliveryFault::transient("late failure"));
        assert!(tracker.complete(&attempt, &sent, false).await.unwrap());
        assert!(!tracker.complete(&attempt, &failed, false).await.unwrap());

        let stored = tracker.get(&attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Sent);
        assert!(stored.error_message.is_none());

        // A completed attempt no longer blocks the next one.
        assert!(
            tracker
                .record_attempt(&n, DeliveryChannel::Push, "tok", 1)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_receipt_only_upgrades_sent() {
        let (tracker, n) = setup().await;
        let attempt = tracker
            .record_attempt(&n, DeliveryChannel::Push, "tok", 0)
            .await
            .unwrap();
        // Still ATTEMPTING: nothing to upgrade.
        assert!(!tracker.record_receipt(&attempt, DeliveryReceipt::Delivered).await.unwrap());

        tracker
            .complete(&attempt, &DeliveryOutcome::Sent(SendReceipt::default()), false)
            .await
            .unwrap();
        assert!(tracker.record_receipt(&attempt, DeliveryReceipt::Delivered).await.unwrap());
        assert!(!tracker.record_receipt(&attempt, DeliveryReceipt::Read).await.unwrap());
        assert_eq!(
            tracker.get(&attempt.id).await.unwrap().status,
            AttemptStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_abandon_open_records_timeout() {
        let (tracker, n) = setup().await;
        let attempt = tracker
            .record_attempt(&n, DeliveryChannel::Push, "tok", 0)
            .await
            .unwrap();
        assert_eq!(
            tracker
                .abandon_open(&n.id, AttemptStatus::Expired, "window elapsed")
                .await
                .unwrap(),
            1
        );
        let stored = tracker.get(&attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Expired);
        assert_eq!(stored.fault, Some(FaultKind::Timeout));
        assert!(stored.completed_at.is_some());

        assert!(
            tracker
                .abandon_open(&n.id, AttemptStatus::Sent, "nope")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_attempts_listed_in_order() {
        let (tracker, n) = setup().await;
        for (count, channel) in [(0, DeliveryChannel::Push), (0, DeliveryChannel::Sms)] {
            let attempt = tracker.record_attempt(&n, channel, "addr", count).await.unwrap();
            tracker
                .complete(
                    &attempt,
                    &DeliveryOutcome::Failed(DeliveryFault::permanent("bad")),
                    false,
                )
                .await
                .unwrap();
        }
        let attempts = tracker.attempts(&n.id).await.unwrap();
        assert_eq!(
            channels_tried(&attempts),
            vec![DeliveryChannel::Push, DeliveryChannel::Sms]
        );
    }
}
