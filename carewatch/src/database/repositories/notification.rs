//! Notification repository: batches, notifications, delivery attempts and
//! escalation links.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{
    DeliveryAttemptDbModel, EscalationLinkDbModel, NotificationBatchDbModel, NotificationDbModel,
};
use crate::database::retry::{is_unique_violation, retry_on_sqlite_busy};
use crate::database::time::{datetime_to_ms, opt_datetime_to_ms};
use crate::domain::{
    Acknowledgment, AttemptStatus, BatchStatus, DeliveryAttempt, DeliveryChannel, EscalationLink,
    FaultKind, Notification, NotificationBatch, NotificationStatus,
};
use crate::{Error, Result};

/// A guarded status change.
///
/// Applied only while the notification is still in one of the expected states;
/// `completed_at` is stamped when the target is terminal and the first-attempt
/// fields are only filled when still unset.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub to: NotificationStatus,
    pub at: DateTime<Utc>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub escalation_due_at: Option<DateTime<Utc>>,
    pub acknowledgment: Option<Acknowledgment>,
}

impl StatusChange {
    pub fn to(status: NotificationStatus, at: DateTime<Utc>) -> Self {
        Self {
            to: status,
            at,
            first_attempt_at: None,
            escalation_due_at: None,
            acknowledgment: None,
        }
    }

    pub fn with_first_attempt(mut self, first_attempt_at: DateTime<Utc>, due_at: DateTime<Utc>) -> Self {
        self.first_attempt_at = Some(first_attempt_at);
        self.escalation_due_at = Some(due_at);
        self
    }

    pub fn with_acknowledgment(mut self, ack: Acknowledgment) -> Self {
        self.acknowledgment = Some(ack);
        self
    }

    /// Expected states from which this change is a legal transition.
    pub(crate) fn legal_sources(&self, expected: &[NotificationStatus]) -> Vec<NotificationStatus> {
        expected
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(self.to))
            .collect()
    }

    /// Apply to an in-memory notification (the caller has checked the source state).
    pub(crate) fn apply(&self, n: &mut Notification) {
        n.status = self.to;
        if self.to.is_terminal() {
            n.completed_at = Some(self.at);
        }
        if n.first_attempt_at.is_none() {
            n.first_attempt_at = self.first_attempt_at;
        }
        if n.escalation_due_at.is_none() {
            n.escalation_due_at = self.escalation_due_at;
        }
        if let Some(ack) = &self.acknowledgment {
            n.acknowledgment = Some(ack.clone());
        }
    }
}

/// Acknowledgment statistics for one contact.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResponseStats {
    /// Notifications with at least one delivery attempt.
    pub attempted: u64,
    pub acknowledged: u64,
}

impl ResponseStats {
    pub fn rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.acknowledged as f64 / self.attempted as f64
        }
    }
}

/// Notification repository trait.
///
/// Every status write is a compare-and-set: it reports whether the row was
/// still in an expected state, so concurrent paths never overwrite each other.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    // Batches
    async fn insert_batch(&self, batch: &NotificationBatch) -> Result<()>;
    async fn get_batch(&self, id: &str) -> Result<NotificationBatch>;
    async fn find_batch_for_event(&self, risk_event_id: &str) -> Result<Option<NotificationBatch>>;
    /// Move an OPEN batch to a resolved status.
    async fn resolve_batch(
        &self,
        id: &str,
        status: BatchStatus,
        acknowledged_notification_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // Notifications
    async fn insert_notification(&self, notification: &Notification) -> Result<()>;
    async fn get_notification(&self, id: &str) -> Result<Notification>;
    async fn list_batch_notifications(&self, batch_id: &str) -> Result<Vec<Notification>>;
    async fn update_status_if(
        &self,
        id: &str,
        expected: &[NotificationStatus],
        change: &StatusChange,
    ) -> Result<bool>;
    /// Point an open notification at a different channel with re-rendered content.
    async fn update_route(
        &self,
        id: &str,
        channel: DeliveryChannel,
        address: &str,
        title: &str,
        body: &str,
    ) -> Result<bool>;
    async fn find_due_for_escalation(&self, now: DateTime<Utc>) -> Result<Vec<Notification>>;
    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Notification>>;
    /// PENDING notifications created at or before `created_before`: never
    /// dispatched, e.g. because the process stopped in between.
    async fn find_stalled_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Notification>>;
    /// Notifications for a subject created within `[from, to]`, newest first.
    async fn history(
        &self,
        subject_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Notification>>;
    async fn response_stats(&self, contact_ids: &[String]) -> Result<HashMap<String, ResponseStats>>;

    // Delivery attempts
    /// Insert an attempt; fails with `AttemptInProgress` if the notification already
    /// has an open one.
    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<()>;
    async fn get_attempt(&self, id: &str) -> Result<DeliveryAttempt>;
    /// Store the outcome of an attempt that is still ATTEMPTING.
    async fn complete_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool>;
    /// Upgrade a SENT attempt to DELIVERED.
    async fn mark_attempt_delivered(&self, id: &str) -> Result<bool>;
    /// Close every open attempt of a notification.
    async fn close_open_attempts(
        &self,
        notification_id: &str,
        status: AttemptStatus,
        fault: Option<FaultKind>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64>;
    /// Attempts of a notification ordered by `attempted_at`, then insertion.
    async fn list_attempts(&self, notification_id: &str) -> Result<Vec<DeliveryAttempt>>;

    // Escalation links
    /// Insert a link after checking it against the source level and the depth cap.
    async fn insert_link(&self, link: &EscalationLink, max_depth: u32) -> Result<()>;
    async fn list_links(&self, batch_id: &str) -> Result<Vec<EscalationLink>>;
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn open_status_list() -> String {
    NotificationStatus::open_states()
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_notifications(
        &self,
        sql: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(sql)
            .bind(datetime_to_ms(now))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(NotificationDbModel::into_domain).collect()
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn insert_batch(&self, batch: &NotificationBatch) -> Result<()> {
        let row = NotificationBatchDbModel::from_domain(batch)?;
        sqlx::query(
            r#"
            INSERT INTO notification_batches (
                id, risk_event_id, subject_id, severity, risk_event, status,
                contact_order, created_at, resolved_at, acknowledged_notification_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.risk_event_id)
        .bind(&row.subject_id)
        .bind(&row.severity)
        .bind(&row.risk_event)
        .bind(&row.status)
        .bind(&row.contact_order)
        .bind(row.created_at)
        .bind(row.resolved_at)
        .bind(&row.acknowledged_notification_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<NotificationBatch> {
        sqlx::query_as::<_, NotificationBatchDbModel>(
            "SELECT * FROM notification_batches WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationBatch", id))?
        .into_domain()
    }

    async fn find_batch_for_event(&self, risk_event_id: &str) -> Result<Option<NotificationBatch>> {
        sqlx::query_as::<_, NotificationBatchDbModel>(
            "SELECT * FROM notification_batches WHERE risk_event_id = ?",
        )
        .bind(risk_event_id)
        .fetch_optional(&self.pool)
        .await?
        .map(NotificationBatchDbModel::into_domain)
        .transpose()
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
        let now_ms = datetime_to_ms(now);
        let result = retry_on_sqlite_busy("resolve_batch", || async {
            sqlx::query(
                r#"
                UPDATE notification_batches
                SET status = ?, resolved_at = ?, acknowledged_notification_id = ?
                WHERE id = ? AND status = 'OPEN'
                "#,
            )
            .bind(status.as_str())
            .bind(now_ms)
            .bind(acknowledged_notification_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        let row = NotificationDbModel::from_domain(notification)?;
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, batch_id, risk_event_id, subject_id, contact_id, template_code,
                channel, address, title, body, priority, status, level, pinned_channel,
                created_at, expires_at, first_attempt_at, escalation_due_at, completed_at,
                acknowledgment
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.batch_id)
        .bind(&row.risk_event_id)
        .bind(&row.subject_id)
        .bind(&row.contact_id)
        .bind(&row.template_code)
        .bind(&row.channel)
        .bind(&row.address)
        .bind(&row.title)
        .bind(&row.body)
        .bind(&row.priority)
        .bind(&row.status)
        .bind(row.level)
        .bind(row.pinned_channel)
        .bind(row.created_at)
        .bind(row.expires_at)
        .bind(row.first_attempt_at)
        .bind(row.escalation_due_at)
        .bind(row.completed_at)
        .bind(&row.acknowledgment)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))?
            .into_domain()
    }

    async fn list_batch_notifications(&self, batch_id: &str) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            "SELECT * FROM notifications WHERE batch_id = ? ORDER BY created_at, level, rowid",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NotificationDbModel::into_domain).collect()
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: &[NotificationStatus],
        change: &StatusChange,
    ) -> Result<bool> {
        let sources = change.legal_sources(expected);
        if sources.is_empty() {
            return Ok(false);
        }
        let acknowledgment = change
            .acknowledgment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let completed_at = change.to.is_terminal().then(|| datetime_to_ms(change.at));
        let sql = format!(
            r#"
            UPDATE notifications SET
                status = ?,
                completed_at = COALESCE(?, completed_at),
                first_attempt_at = COALESCE(first_attempt_at, ?),
                escalation_due_at = COALESCE(escalation_due_at, ?),
                acknowledgment = COALESCE(?, acknowledgment)
            WHERE id = ? AND status IN ({})
            "#,
            placeholders(sources.len())
        );

        let result = retry_on_sqlite_busy("update_notification_status", || {
            let mut query = sqlx::query(&sql)
                .bind(change.to.as_str())
                .bind(completed_at)
                .bind(opt_datetime_to_ms(change.first_attempt_at))
                .bind(opt_datetime_to_ms(change.escalation_due_at))
                .bind(acknowledgment.as_deref())
                .bind(id);
            for status in &sources {
                query = query.bind(status.as_str());
            }
            async move { query.execute(&self.pool).await.map_err(Error::from) }
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_route(
        &self,
        id: &str,
        channel: DeliveryChannel,
        address: &str,
        title: &str,
        body: &str,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE notifications SET channel = ?, address = ?, title = ?, body = ?
            WHERE id = ? AND status IN ({})
            "#,
            open_status_list()
        );
        let result = sqlx::query(&sql)
            .bind(channel.as_str())
            .bind(address)
            .bind(title)
            .bind(body)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_due_for_escalation(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let sql = format!(
            r#"
            SELECT * FROM notifications
            WHERE status IN ({}) AND escalation_due_at IS NOT NULL AND escalation_due_at <= ?
            ORDER BY escalation_due_at, rowid
            "#,
            open_status_list()
        );
        self.fetch_notifications(&sql, now).await
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let sql = format!(
            r#"
            SELECT * FROM notifications
            WHERE status IN ({}) AND expires_at < ?
            ORDER BY expires_at, rowid
            "#,
            open_status_list()
        );
        self.fetch_notifications(&sql, now).await
    }

    async fn find_stalled_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Notification>> {
        let sql = format!(
            r#"
            SELECT * FROM notifications
            WHERE status = '{}' AND created_at <= ?
            ORDER BY created_at, rowid
            "#,
            NotificationStatus::Pending.as_str()
        );
        self.fetch_notifications(&sql, created_before).await
    }

    async fn history(
        &self,
        subject_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notifications
            WHERE subject_id = ? AND created_at >= ? AND created_at <= ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(subject_id)
        .bind(datetime_to_ms(from))
        .bind(datetime_to_ms(to))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NotificationDbModel::into_domain).collect()
    }

    async fn response_stats(&self, contact_ids: &[String]) -> Result<HashMap<String, ResponseStats>> {
        if contact_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            r#"
            SELECT
                n.contact_id,
                COUNT(*) AS attempted,
                SUM(CASE WHEN n.status = 'ACKNOWLEDGED' THEN 1 ELSE 0 END) AS acknowledged
            FROM notifications n
            WHERE n.contact_id IN ({})
              AND EXISTS (SELECT 1 FROM delivery_attempts a WHERE a.notification_id = n.id)
            GROUP BY n.contact_id
            "#,
            placeholders(contact_ids.len())
        );
        let mut query = sqlx::query_as::<_, (String, i64, i64)>(&sql);
        for id in contact_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(contact_id, attempted, acknowledged)| {
                (
                    contact_id,
                    ResponseStats {
                        attempted: attempted.max(0) as u64,
                        acknowledged: acknowledged.max(0) as u64,
                    },
                )
            })
            .collect())
    }

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let row = DeliveryAttemptDbModel::from_domain(attempt);
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                id, notification_id, channel, address, attempted_at, completed_at, status,
                attempt_count, provider_response_code, error_code, error_message, fault,
                external_message_id, processing_time_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.notification_id)
        .bind(&row.channel)
        .bind(&row.address)
        .bind(row.attempted_at)
        .bind(row.completed_at)
        .bind(&row.status)
        .bind(row.attempt_count)
        .bind(&row.provider_response_code)
        .bind(&row.error_code)
        .bind(&row.error_message)
        .bind(&row.fault)
        .bind(&row.external_message_id)
        .bind(row.processing_time_ms)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) && attempt.is_open() => {
                Err(Error::AttemptInProgress {
                    notification_id: attempt.notification_id.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_attempt(&self, id: &str) -> Result<DeliveryAttempt> {
        sqlx::query_as::<_, DeliveryAttemptDbModel>(
            r#"
            SELECT id, notification_id, channel, address, attempted_at, completed_at, status,
                   attempt_count, provider_response_code, error_code, error_message, fault,
                   external_message_id, processing_time_ms
            FROM delivery_attempts WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("DeliveryAttempt", id))?
        .into_domain()
    }

    async fn complete_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool> {
        let row = DeliveryAttemptDbModel::from_domain(attempt);
        let result = retry_on_sqlite_busy("complete_attempt", || async {
            sqlx::query(
                r#"
                UPDATE delivery_attempts SET
                    status = ?,
                    completed_at = ?,
                    provider_response_code = ?,
                    error_code = ?,
                    error_message = ?,
                    fault = ?,
                    external_message_id = ?,
                    processing_time_ms = ?
                WHERE id = ? AND status = 'ATTEMPTING'
                "#,
            )
            .bind(&row.status)
            .bind(row.completed_at)
            .bind(&row.provider_response_code)
            .bind(&row.error_code)
            .bind(&row.error_message)
            .bind(&row.fault)
            .bind(&row.external_message_id)
            .bind(row.processing_time_ms)
            .bind(&row.id)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_attempt_delivered(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delivery_attempts SET status = 'DELIVERED' WHERE id = ? AND status = 'SENT'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
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
        let now_ms = datetime_to_ms(now);
        let result = retry_on_sqlite_busy("close_open_attempts", || async {
            sqlx::query(
                r#"
                UPDATE delivery_attempts SET
                    status = ?,
                    completed_at = ?,
                    fault = COALESCE(?, fault),
                    error_message = COALESCE(?, error_message),
                    processing_time_ms = MAX(? - attempted_at, 0)
                WHERE notification_id = ? AND status = 'ATTEMPTING'
                "#,
            )
            .bind(status.as_str())
            .bind(now_ms)
            .bind(fault.map(|f| f.as_str()))
            .bind(message)
            .bind(now_ms)
            .bind(notification_id)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_attempts(&self, notification_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query_as::<_, DeliveryAttemptDbModel>(
            r#"
            SELECT id, notification_id, channel, address, attempted_at, completed_at, status,
                   attempt_count, provider_response_code, error_code, error_message, fault,
                   external_message_id, processing_time_ms
            FROM delivery_attempts
            WHERE notification_id = ?
            ORDER BY attempted_at, seq
            "#,
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeliveryAttemptDbModel::into_domain).collect()
    }

    async fn insert_link(&self, link: &EscalationLink, max_depth: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let source: Option<(i64,)> =
            sqlx::query_as("SELECT level FROM notifications WHERE id = ?")
                .bind(&link.from_notification_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((source_level,)) = source else {
            return Err(Error::EscalationLinkRejected(format!(
                "source notification {} does not exist",
                link.from_notification_id
            )));
        };
        let target: Option<(i64,)> =
            sqlx::query_as("SELECT level FROM notifications WHERE id = ?")
                .bind(&link.to_notification_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((target_level,)) = target else {
            return Err(Error::EscalationLinkRejected(format!(
                "target notification {} does not exist",
                link.to_notification_id
            )));
        };

        let source_level = u32::try_from(source_level).unwrap_or(u32::MAX);
        link.check(source_level, max_depth)
            .map_err(Error::EscalationLinkRejected)?;
        if i64::from(link.level) != target_level {
            return Err(Error::EscalationLinkRejected(format!(
                "link level {} does not match target level {}",
                link.level, target_level
            )));
        }

        let row = EscalationLinkDbModel::from_domain(link);
        let inserted = sqlx::query(
            r#"
            INSERT INTO escalation_links (
                id, batch_id, from_notification_id, to_notification_id, level, reason, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.batch_id)
        .bind(&row.from_notification_id)
        .bind(&row.to_notification_id)
        .bind(row.level)
        .bind(&row.reason)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(Error::EscalationLinkRejected(format!(
                    "notification {} is already an escalation target",
                    link.to_notification_id
                )));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_links(&self, batch_id: &str) -> Result<Vec<EscalationLink>> {
        let rows = sqlx::query_as::<_, EscalationLinkDbModel>(
            "SELECT * FROM escalation_links WHERE batch_id = ? ORDER BY created_at, level, rowid",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EscalationLinkDbModel::into_domain).collect()
    }
}
