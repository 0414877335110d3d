//! Behaviour shared by the SQLite and in-memory notification repositories.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use carewatch::Error;
use carewatch::database::init_memory_pool;
use carewatch::database::repositories::{
    MemoryNotificationRepository, NotificationRepository, SqlxNotificationRepository,
    StatusChange,
};
use carewatch::domain::{
    AckResponse, Acknowledgment, AttemptStatus, BatchStatus, DeliveryAttempt, DeliveryChannel,
    DeliveryFault, DeliveryOutcome, EscalationLink, EscalationReason, FaultKind,
    NewNotification, Notification, NotificationBatch, NotificationPriority, NotificationStatus,
    RiskKind, SendReceipt, Severity,
};

use common::{anchor, event};

async fn repositories() -> Vec<(&'static str, Arc<dyn NotificationRepository>)> {
    let pool = init_memory_pool().await.unwrap();
    vec![
        ("memory", Arc::new(MemoryNotificationRepository::new())),
        ("sqlite", Arc::new(SqlxNotificationRepository::new(pool))),
    ]
}

async fn seed_batch(repo: &dyn NotificationRepository, now: DateTime<Utc>) -> NotificationBatch {
    let batch = NotificationBatch::new(
        event(RiskKind::Fall, Severity::High, now),
        vec!["c1".to_string(), "c2".to_string()],
        now,
    );
    repo.insert_batch(&batch).await.unwrap();
    batch
}

fn notification_for(
    batch: &NotificationBatch,
    contact_id: &str,
    level: u32,
    now: DateTime<Utc>,
) -> Notification {
    Notification::new(
        NewNotification {
            batch_id: batch.id.clone(),
            risk_event_id: batch.risk_event.id.clone(),
            subject_id: batch.risk_event.subject_id.clone(),
            contact_id: contact_id.to_string(),
            template_code: "generic".to_string(),
            channel: DeliveryChannel::Push,
            address: format!("push-{contact_id}"),
            title: "Fall detected".to_string(),
            body: "Please check in".to_string(),
            priority: NotificationPriority::High,
            level,
            pinned_channel: false,
        },
        now,
        Duration::hours(2),
    )
}

#[tokio::test]
async fn test_batch_resolves_once() {
    for (name, repo) in repositories().await {
        let now = anchor();
        let batch = seed_batch(repo.as_ref(), now).await;

        let found = repo
            .find_batch_for_event(&batch.risk_event.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, batch.id, "{name}");
        assert_eq!(found.contact_order, batch.contact_order, "{name}");
        assert_eq!(found.risk_event, batch.risk_event, "{name}");

        let duplicate = NotificationBatch::new(batch.risk_event.clone(), Vec::new(), now);
        assert!(repo.insert_batch(&duplicate).await.is_err(), "{name}");

        let n = notification_for(&batch, "c1", 0, now);
        repo.insert_notification(&n).await.unwrap();

        assert!(
            repo.resolve_batch(&batch.id, BatchStatus::Acknowledged, Some(&n.id), now)
                .await
                .unwrap(),
            "{name}"
        );
        assert!(
            !repo
                .resolve_batch(&batch.id, BatchStatus::Cancelled, None, now)
                .await
                .unwrap(),
            "{name}"
        );
        let stored = repo.get_batch(&batch.id).await.unwrap();
        assert_eq!(stored.status, BatchStatus::Acknowledged, "{name}");
        assert_eq!(stored.acknowledged_notification_id.as_deref(), Some(n.id.as_str()), "{name}");

        assert!(matches!(
            repo.get_batch("missing").await,
            Err(Error::NotFound { .. })
        ));
    }
}

#[tokio::test]
async fn test_status_changes_are_compare_and_set() {
    for (name, repo) in repositories().await {
        let now = anchor();
        let batch = seed_batch(repo.as_ref(), now).await;
        let n = notification_for(&batch, "c1", 0, now);
        repo.insert_notification(&n).await.unwrap();

        let due = now + Duration::minutes(10);
        let sending = StatusChange::to(NotificationStatus::Sending, now).with_first_attempt(now, due);
        assert!(
            repo.update_status_if(&n.id, &[NotificationStatus::Pending], &sending)
                .await
                .unwrap(),
            "{name}"
        );
        // The same change again no longer matches.
        assert!(
            !repo
                .update_status_if(&n.id, &[NotificationStatus::Pending], &sending)
                .await
                .unwrap(),
            "{name}"
        );
        // Illegal transitions never apply, even when the state matches.
        let back = StatusChange::to(NotificationStatus::Pending, now);
        assert!(
            !repo
                .update_status_if(&n.id, &[NotificationStatus::Sending], &back)
                .await
                .unwrap(),
            "{name}"
        );

        // First-attempt fields are only filled once.
        let later = now + Duration::minutes(1);
        let sent = StatusChange::to(NotificationStatus::Sent, later)
            .with_first_attempt(later, later + Duration::minutes(10));
        assert!(
            repo.update_status_if(&n.id, &[NotificationStatus::Sending], &sent)
                .await
                .unwrap()
        );
        let stored = repo.get_notification(&n.id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent, "{name}");
        assert_eq!(stored.first_attempt_at, Some(now), "{name}");
        assert_eq!(stored.escalation_due_at, Some(due), "{name}");
        assert_eq!(stored.completed_at, None, "{name}");

        let ack = StatusChange::to(NotificationStatus::Acknowledged, later).with_acknowledgment(
            Acknowledgment {
                response: AckResponse::Seen,
                responded_at: later,
            },
        );
        assert!(
            repo.update_status_if(&n.id, NotificationStatus::open_states(), &ack)
                .await
                .unwrap()
        );
        let stored = repo.get_notification(&n.id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Acknowledged, "{name}");
        assert_eq!(stored.completed_at, Some(later), "{name}");
        assert_eq!(
            stored.acknowledgment.map(|a| a.response),
            Some(AckResponse::Seen),
            "{name}"
        );

        // Terminal rows are frozen.
        let expire = StatusChange::to(NotificationStatus::Expired, later);
        assert!(
            !repo
                .update_status_if(&n.id, NotificationStatus::open_states(), &expire)
                .await
                .unwrap()
        );
        assert!(
            !repo
                .update_route(&n.id, DeliveryChannel::Sms, "+1555", "t", "b")
                .await
                .unwrap(),
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_one_open_attempt_per_notification() {
    for (name, repo) in repositories().await {
        let now = anchor();
        let batch = seed_batch(repo.as_ref(), now).await;
        let n = notification_for(&batch, "c1", 0, now);
        repo.insert_notification(&n).await.unwrap();

        let first = DeliveryAttempt::open(&n.id, DeliveryChannel::Push, &n.address, 0, now);
        repo.insert_attempt(&first).await.unwrap();
        let second = DeliveryAttempt::open(&n.id, DeliveryChannel::Push, &n.address, 1, now);
        assert!(
            matches!(
                repo.insert_attempt(&second).await,
                Err(Error::AttemptInProgress { .. })
            ),
            "{name}"
        );

        let failed = first.completed(
            &DeliveryOutcome::Failed(DeliveryFault::transient("busy").with_code("503")),
            true,
            now + Duration::seconds(2),
        );
        assert!(repo.complete_attempt(&failed).await.unwrap(), "{name}");
        // Completing twice is a no-op.
        assert!(!repo.complete_attempt(&failed).await.unwrap(), "{name}");

        let stored = repo.get_attempt(&first.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::PendingRetry, "{name}");
        assert_eq!(stored.fault, Some(FaultKind::Transient), "{name}");
        assert_eq!(stored.error_code.as_deref(), Some("503"), "{name}");
        assert_eq!(stored.processing_time_ms, Some(2000), "{name}");

        repo.insert_attempt(&second).await.unwrap();
        let sent = second.completed(
            &DeliveryOutcome::Sent(SendReceipt {
                external_message_id: Some("ext-1".to_string()),
                provider_response_code: None,
            }),
            false,
            now,
        );
        assert!(repo.complete_attempt(&sent).await.unwrap());
        assert!(repo.mark_attempt_delivered(&second.id).await.unwrap(), "{name}");
        assert!(!repo.mark_attempt_delivered(&second.id).await.unwrap(), "{name}");

        let third = DeliveryAttempt::open(&n.id, DeliveryChannel::Sms, "+1555", 0, now);
        repo.insert_attempt(&third).await.unwrap();
        let closed = repo
            .close_open_attempts(&n.id, AttemptStatus::Expired, Some(FaultKind::Timeout), Some("window elapsed"), now)
            .await
            .unwrap();
        assert_eq!(closed, 1, "{name}");

        let attempts = repo.list_attempts(&n.id).await.unwrap();
        let statuses: Vec<AttemptStatus> = attempts.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![
                AttemptStatus::PendingRetry,
                AttemptStatus::Delivered,
                AttemptStatus::Expired
            ],
            "{name}"
        );
        assert_eq!(attempts[2].fault, Some(FaultKind::Timeout), "{name}");
    }
}

#[tokio::test]
async fn test_escalation_links_respect_levels_and_depth() {
    for (name, repo) in repositories().await {
        let now = anchor();
        let batch = seed_batch(repo.as_ref(), now).await;
        let root = notification_for(&batch, "c1", 0, now);
        let child = notification_for(&batch, "c2", 1, now);
        let skipped = notification_for(&batch, "c3", 2, now);
        for n in [&root, &child, &skipped] {
            repo.insert_notification(n).await.unwrap();
        }

        let link = EscalationLink::new(&batch.id, &root.id, &child.id, 1, EscalationReason::AckTimeout, now);
        repo.insert_link(&link, 3).await.unwrap();

        // Level must follow the source.
        let jump = EscalationLink::new(&batch.id, &root.id, &skipped.id, 2, EscalationReason::AckTimeout, now);
        assert!(
            matches!(
                repo.insert_link(&jump, 3).await,
                Err(Error::EscalationLinkRejected(_))
            ),
            "{name}"
        );
        // And stay within the configured depth.
        let deep = EscalationLink::new(&batch.id, &child.id, &skipped.id, 2, EscalationReason::DeliveryExhausted, now);
        assert!(
            matches!(
                repo.insert_link(&deep, 1).await,
                Err(Error::EscalationLinkRejected(_))
            ),
            "{name}"
        );
        repo.insert_link(&deep, 3).await.unwrap();

        let links = repo.list_links(&batch.id).await.unwrap();
        assert_eq!(links.len(), 2, "{name}");
        assert_eq!(links[0], link, "{name}");
        assert_eq!(links[1].reason, EscalationReason::DeliveryExhausted, "{name}");
    }
}

#[tokio::test]
async fn test_sweep_queries_only_return_open_notifications() {
    for (name, repo) in repositories().await {
        let now = anchor();
        let batch = seed_batch(repo.as_ref(), now).await;
        let open = notification_for(&batch, "c1", 0, now);
        let done = notification_for(&batch, "c2", 0, now);
        repo.insert_notification(&open).await.unwrap();
        repo.insert_notification(&done).await.unwrap();

        let due = now + Duration::minutes(10);
        for n in [&open, &done] {
            let change = StatusChange::to(NotificationStatus::Sending, now).with_first_attempt(now, due);
            assert!(
                repo.update_status_if(&n.id, &[NotificationStatus::Pending], &change)
                    .await
                    .unwrap()
            );
        }
        let cancel = StatusChange::to(NotificationStatus::Cancelled, now);
        assert!(
            repo.update_status_if(&done.id, NotificationStatus::open_states(), &cancel)
                .await
                .unwrap()
        );

        assert!(repo.find_due_for_escalation(due - Duration::seconds(1)).await.unwrap().is_empty(), "{name}");
        let found = repo.find_due_for_escalation(due).await.unwrap();
        assert_eq!(found.len(), 1, "{name}");
        assert_eq!(found[0].id, open.id, "{name}");

        assert!(repo.find_expired(now + Duration::hours(1)).await.unwrap().is_empty(), "{name}");
        let expired = repo.find_expired(now + Duration::hours(3)).await.unwrap();
        assert_eq!(expired.len(), 1, "{name}");
        assert_eq!(expired[0].id, open.id, "{name}");
    }
}

#[tokio::test]
async fn test_stalled_query_finds_only_undispatched_notifications() {
    for (name, repo) in repositories().await {
        let now = anchor();
        let batch = seed_batch(repo.as_ref(), now).await;
        let stalled = notification_for(&batch, "c1", 0, now);
        let dispatched = notification_for(&batch, "c2", 0, now);
        let fresh = notification_for(&batch, "c3", 0, now + Duration::minutes(5));
        for n in [&stalled, &dispatched, &fresh] {
            repo.insert_notification(n).await.unwrap();
        }
        let change = StatusChange::to(NotificationStatus::Sending, now)
            .with_first_attempt(now, now + Duration::minutes(10));
        assert!(
            repo.update_status_if(&dispatched.id, &[NotificationStatus::Pending], &change)
                .await
                .unwrap()
        );

        assert!(
            repo.find_stalled_pending(now - Duration::seconds(1)).await.unwrap().is_empty(),
            "{name}"
        );
        let found = repo.find_stalled_pending(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(found.len(), 1, "{name}");
        assert_eq!(found[0].id, stalled.id, "{name}");
        let found = repo.find_stalled_pending(now + Duration::minutes(5)).await.unwrap();
        assert_eq!(found.len(), 2, "{name}");
    }
}

#[tokio::test]
async fn test_history_and_response_stats() {
    for (name, repo) in repositories().await {
        let now = anchor();
        let batch = seed_batch(repo.as_ref(), now).await;
        let older = notification_for(&batch, "c1", 0, now);
        let newer = notification_for(&batch, "c2", 1, now + Duration::minutes(10));
        repo.insert_notification(&older).await.unwrap();
        repo.insert_notification(&newer).await.unwrap();

        let history = repo
            .history(&batch.risk_event.subject_id, now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        let ids: Vec<&str> = history.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()], "{name}");

        let window = repo
            .history(&batch.risk_event.subject_id, now + Duration::minutes(5), now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(window.len(), 1, "{name}");

        // Only notifications with an attempt count towards the rate.
        let attempt = DeliveryAttempt::open(&older.id, DeliveryChannel::Push, &older.address, 0, now);
        repo.insert_attempt(&attempt).await.unwrap();
        for status in [NotificationStatus::Sending, NotificationStatus::Acknowledged] {
            let expected = [NotificationStatus::Pending, NotificationStatus::Sending];
            let change = StatusChange::to(status, now);
            assert!(repo.update_status_if(&older.id, &expected, &change).await.unwrap());
        }

        let stats = repo
            .response_stats(&["c1".to_string(), "c2".to_string()])
            .await
            .unwrap();
        let c1 = stats.get("c1").copied().unwrap_or_default();
        assert_eq!(c1.attempted, 1, "{name}");
        assert_eq!(c1.acknowledged, 1, "{name}");
        assert_eq!(c1.rate(), 1.0, "{name}");
        assert_eq!(stats.get("c2").copied().unwrap_or_default().attempted, 0, "{name}");
    }
}
