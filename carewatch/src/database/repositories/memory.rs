//! In-memory notification repository.
//!
//! Mirrors the SQLite repository's compare-and-set semantics behind a single
//! mutex. Used by tests and dry-run deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::notification::{NotificationRepository, ResponseStats, StatusChange};
use crate::domain::{
    AttemptStatus, BatchStatus, DeliveryAttempt, DeliveryChannel, EscalationLink, FaultKind,
    Notification, NotificationBatch, NotificationStatus,
};
use crate::{Error, Result};

#[derive(Default)]
struct Store {
    batches: HashMap<String, NotificationBatch>,
    notifications: HashMap<String, Notification>,
    /// Insertion order of notifications, for stable listings.
    notification_order: Vec<String>,
    /// Append-only, insertion ordered.
    attempts: Vec<DeliveryAttempt>,
    links: Vec<EscalationLink>,
}

impl Store {
    fn ordered_notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notification_order
            .iter()
            .filter_map(|id| self.notifications.get(id))
    }
}

#[derive(Default)]
pub struct MemoryNotificationRepository {
    store: Mutex<Store>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn insert_batch(&self, batch: &NotificationBatch) -> Result<()> {
        let mut store = self.store.lock();
        if store.batches.contains_key(&batch.id)
            || store
                .batches
                .values()
                .any(|b| b.risk_event.id == batch.risk_event.id)
        {
            return Err(Error::Database(format!(
                "batch for risk event {} already exists",
                batch.risk_event.id
            )));
        }
        store.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<NotificationBatch> {
        self.store
            .lock()
            .batches
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("NotificationBatch", id))
    }

    async fn find_batch_for_event(&self, risk_event_id: &str) -> Result<Option<NotificationBatch>> {
        Ok(self
            .store
            .lock()
            .batches
            .values()
            .find(|b| b.risk_event.id == risk_event_id)
            .cloned())
    }

    async fn resolve_batch(
        &self,
        id: &str,
        status: BatchStatus,
        acknowledged_notification_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_resolved() {
            return Err(Error::invalid_transition(BatchStatus::Open, status));
        }
        let mut store = self.store.lock();
        let Some(batch) = store.batches.get_mut(id) else {
            return Ok(false);
        };
        if batch.status != BatchStatus::Open {
            return Ok(false);
        }
        batch.status = status;
        batch.resolved_at = Some(now);
        batch.acknowledged_notification_id = acknowledged_notification_id.map(str::to_string);
        Ok(true)
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        let mut store = self.store.lock();
        if store.notifications.contains_key(&notification.id) {
            return Err(Error::Database(format!(
                "notification {} already exists",
                notification.id
            )));
        }
        if !store.batches.contains_key(&notification.batch_id) {
            return Err(Error::Database(format!(
                "batch {} does not exist",
                notification.batch_id
            )));
        }
        store.notification_order.push(notification.id.clone());
        store
            .notifications
            .insert(notification.id.clone(), notification.clone());
        Ok(())
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        self.store
            .lock()
            .notifications
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn list_batch_notifications(&self, batch_id: &str) -> Result<Vec<Notification>> {
        let store = self.store.lock();
        let mut list: Vec<Notification> = store
            .ordered_notifications()
            .filter(|n| n.batch_id == batch_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equals.
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.level.cmp(&b.level)));
        Ok(list)
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: &[NotificationStatus],
        change: &StatusChange,
    ) -> Result<bool> {
        let sources = change.legal_sources(expected);
        let mut store = self.store.lock();
        let Some(notification) = store.notifications.get_mut(id) else {
            return Ok(false);
        };
        if !sources.contains(&notification.status) {
            return Ok(false);
        }
        change.apply(notification);
        Ok(true)
    }

    async fn update_route(
        &self,
        id: &str,
        channel: DeliveryChannel,
        address: &str,
        title: &str,
        body: &str,
    ) -> Result<bool> {
        let mut store = self.store.lock();
        let Some(notification) = store.notifications.get_mut(id) else {
            return Ok(false);
        };
        if notification.is_terminal() {
            return Ok(false);
        }
        notification.channel = channel;
        notification.address = address.to_string();
        notification.title = title.to_string();
        notification.body = body.to_string();
        Ok(true)
    }

    async fn find_due_for_escalation(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let store = self.store.lock();
        let mut due: Vec<Notification> = store
            .ordered_notifications()
            .filter(|n| !n.is_terminal() && n.escalation_due_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|n| n.escalation_due_at);
        Ok(due)
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let store = self.store.lock();
        let mut expired: Vec<Notification> = store
            .ordered_notifications()
            .filter(|n| n.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|n| n.expires_at);
        Ok(expired)
    }

    async fn find_stalled_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Notification>> {
        let store = self.store.lock();
        Ok(store
            .ordered_notifications()
            .filter(|n| n.status == NotificationStatus::Pending && n.created_at <= created_before)
            .cloned()
            .collect())
    }

    async fn history(
        &self,
        subject_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let store = self.store.lock();
        let mut list: Vec<Notification> = store
            .ordered_notifications()
            .filter(|n| n.subject_id == subject_id && n.created_at >= from && n.created_at <= to)
            .cloned()
            .collect();
        list.reverse();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn response_stats(&self, contact_ids: &[String]) -> Result<HashMap<String, ResponseStats>> {
        let store = self.store.lock();
        let mut stats: HashMap<String, ResponseStats> = HashMap::new();
        for n in store.ordered_notifications() {
            if !contact_ids.contains(&n.contact_id) {
                continue;
            }
            if !store.attempts.iter().any(|a| a.notification_id == n.id) {
                continue;
            }
            let entry = stats.entry(n.contact_id.clone()).or_default();
            entry.attempted += 1;
            if n.status == NotificationStatus::Acknowledged {
                entry.acknowledged += 1;
            }
        }
        Ok(stats)
    }

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let mut store = self.store.lock();
        if !store.notifications.contains_key(&attempt.notification_id) {
            return Err(Error::Database(format!(
                "notification {} does not exist",
                attempt.notification_id
            )));
        }
        if attempt.is_open()
            && store
                .attempts
                .iter()
                .any(|a| a.notification_id == attempt.notification_id && a.is_open())
        {
            return Err(Error::AttemptInProgress {
                notification_id: attempt.notification_id.clone(),
            });
        }
        store.attempts.push(attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: &str) -> Result<DeliveryAttempt> {
        self.store
            .lock()
            .attempts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("DeliveryAttempt", id))
    }

    async fn complete_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool> {
        let mut store = self.store.lock();
        let Some(stored) = store.attempts.iter_mut().find(|a| a.id == attempt.id) else {
            return Ok(false);
        };
        if !stored.is_open() {
            return Ok(false);
        }
        stored.status = attempt.status;
        stored.completed_at = attempt.completed_at;
        stored.provider_response_code = attempt.provider_response_code.clone();
        stored.error_code = attempt.error_code.clone();
        stored.error_message = attempt.error_message.clone();
        stored.fault = attempt.fault;
        stored.external_message_id = attempt.external_message_id.clone();
        stored.processing_time_ms = attempt.processing_time_ms;
        Ok(true)
    }

    async fn mark_attempt_delivered(&self, id: &str) -> Result<bool> {
        let mut store = self.store.lock();
        match store.attempts.iter_mut().find(|a| a.id == id) {
            Some(attempt) if attempt.status == AttemptStatus::Sent => {
                attempt.status = AttemptStatus::Delivered;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_open_attempts(
        &self,
        notification_id: &str,
        status: AttemptStatus,
        fault: Option<FaultKind>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if status.is_open() {
            return Err(Error::invalid_transition(AttemptStatus::Attempting, status));
        }
        let mut store = self.store.lock();
        let mut closed = 0;
        for attempt in store
            .attempts
            .iter_mut()
            .filter(|a| a.notification_id == notification_id && a.is_open())
        {
            attempt.status = status;
            attempt.completed_at = Some(now);
            if fault.is_some() {
                attempt.fault = fault;
            }
            if let Some(message) = message {
                attempt.error_message = Some(message.to_string());
            }
            attempt.processing_time_ms =
                Some((now - attempt.attempted_at).num_milliseconds().max(0));
            closed += 1;
        }
        Ok(closed)
    }

    async fn list_attempts(&self, notification_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let store = self.store.lock();
        let mut list: Vec<DeliveryAttempt> = store
            .attempts
            .iter()
            .filter(|a| a.notification_id == notification_id)
            .cloned()
            .collect();
        list.sort_by_key(|a| a.attempted_at);
        Ok(list)
    }

    async fn insert_link(&self, link: &EscalationLink, max_depth: u32) -> Result<()> {
        let mut store = self.store.lock();
        let source_level = store
            .notifications
            .get(&link.from_notification_id)
            .map(|n| n.level)
            .ok_or_else(|| {
                Error::EscalationLinkRejected(format!(
                    "source notification {} does not exist",
                    link.from_notification_id
                ))
            })?;
        let target_level = store
            .notifications
            .get(&link.to_notification_id)
            .map(|n| n.level)
            .ok_or_else(|| {
                Error::EscalationLinkRejected(format!(
                    "target notification {} does not exist",
                    link.to_notification_id
                ))
            })?;

        link.check(source_level, max_depth)
            .map_err(Error::EscalationLinkRejected)?;
        if link.level != target_level {
            return Err(Error::EscalationLinkRejected(format!(
                "link level {} does not match target level {}",
                link.level, target_level
            )));
        }
        if store
            .links
            .iter()
            .any(|l| l.to_notification_id == link.to_notification_id)
        {
            return Err(Error::EscalationLinkRejected(format!(
                "notification {} is already an escalation target",
                link.to_notification_id
            )));
        }
        store.links.push(link.clone());
        Ok(())
    }

    async fn list_links(&self, batch_id: &str) -> Result<Vec<EscalationLink>> {
        Ok(self
            .store
            .lock()
            .links
            .iter()
            .filter(|l| l.batch_id == batch_id)
            .cloned()
            .collect())
    }
}
