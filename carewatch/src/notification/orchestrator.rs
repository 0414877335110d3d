//! Notification orchestrator.
//!
//! Turns risk events into notification batches and drives every notification
//! through delivery, retries, channel switches and escalation until someone
//! acknowledges or every chain runs out.
//!
//! Lock order is always notification, then batch. Paths that touch other
//! notifications of the batch (acknowledgment, cancellation, group expiry) do
//! so with compare-and-set writes only, without taking their locks.
//!
//! An acknowledgment registers with its batch before it waits for the
//! notification lock. Timer and failure paths that find one in flight stand
//! down and look again shortly after, so the acknowledgment always wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::channels::ChannelSender;
use super::directory::ContactDirectory;
use super::events::{EscalationSignal, ExhaustionFault};
use super::policy::{Decision, EscalationPolicy, PolicyContext, Trigger, escalation_window};
use super::scheduler::{KeyedGuard, KeyedLocks, PendingAcks, TimerKind, TimerScheduler, TimerTicket};
use super::template::{RenderedMessage, render};
use super::tracker::{DeliveryTracker, channels_tried};
use super::views::{BatchOverview, NotificationStatusSnapshot, NotificationSummary};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::database::repositories::{NotificationRepository, StatusChange, TemplateRepository};
use crate::domain::template::GENERIC_TEMPLATE_CODE;
use crate::domain::{
    AckResponse, Acknowledgment, AttemptStatus, BatchStatus, Contact, DeliveryAttempt,
    DeliveryChannel, DeliveryFault, DeliveryOutcome, DeliveryReceipt, DeliveryResult,
    EscalationLink, EscalationReason, NewNotification, Notification, NotificationBatch,
    NotificationStatus, NotificationTemplate, RiskEvent,
};
use crate::{Error, Result};

/// Capacity of the escalation signal channel.
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// How long a timer that stood down for an in-flight acknowledgment waits
/// before it looks again.
const ACK_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Runtime limits of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_sends: usize,
    pub send_timeout: Duration,
    pub max_retry_delay: Duration,
    pub notification_ttl: chrono::Duration,
    pub language: String,
    pub max_depth: u32,
    /// How many contacts receive a root notification.
    pub root_fanout: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_concurrent_sends: config.delivery.max_concurrent_sends,
            send_timeout: config.delivery.send_timeout(),
            max_retry_delay: config.delivery.max_retry_delay(),
            notification_ttl: config.delivery.notification_ttl(),
            language: config.delivery.language.clone(),
            max_depth: config.escalation.max_depth,
            root_fanout: config.escalation.root_fanout,
        }
    }
}

/// Collaborators the orchestrator is wired to.
pub struct OrchestratorDeps {
    pub notifications: Arc<dyn NotificationRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub directory: Arc<dyn ContactDirectory>,
    pub sender: Arc<dyn ChannelSender>,
    pub clock: Arc<dyn Clock>,
}

impl OrchestratorDeps {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        templates: Arc<dyn TemplateRepository>,
        directory: Arc<dyn ContactDirectory>,
        sender: Arc<dyn ChannelSender>,
    ) -> Self {
        Self {
            notifications,
            templates,
            directory,
            sender,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct Inner {
    repo: Arc<dyn NotificationRepository>,
    templates: Arc<dyn TemplateRepository>,
    directory: Arc<dyn ContactDirectory>,
    sender: Arc<dyn ChannelSender>,
    clock: Arc<dyn Clock>,
    tracker: DeliveryTracker,
    policy: EscalationPolicy,
    settings: OrchestratorSettings,
    notification_locks: KeyedLocks,
    batch_locks: KeyedLocks,
    intake_locks: KeyedLocks,
    pending_acks: PendingAcks,
    timers: TimerScheduler,
    send_permits: Arc<Semaphore>,
    signal_tx: broadcast::Sender<EscalationSignal>,
    shutdown: CancellationToken,
}

/// Coordinates delivery and escalation for every risk event.
#[derive(Clone)]
pub struct NotificationOrchestrator {
    inner: Arc<Inner>,
}

impl NotificationOrchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Self {
        let shutdown = CancellationToken::new();
        let (signal_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let tracker = DeliveryTracker::new(deps.notifications.clone(), deps.clock.clone());
        let policy = EscalationPolicy::new(settings.max_depth, settings.max_retry_delay);
        Self {
            inner: Arc::new(Inner {
                repo: deps.notifications,
                templates: deps.templates,
                directory: deps.directory,
                sender: deps.sender,
                clock: deps.clock,
                tracker,
                policy,
                send_permits: Arc::new(Semaphore::new(settings.max_concurrent_sends.max(1))),
                settings,
                notification_locks: KeyedLocks::new(),
                batch_locks: KeyedLocks::new(),
                intake_locks: KeyedLocks::new(),
                pending_acks: PendingAcks::new(),
                timers: TimerScheduler::new(shutdown.child_token()),
                signal_tx,
                shutdown,
            }),
        }
    }

    /// Subscribe to batch-level escalation signals.
    pub fn subscribe(&self) -> broadcast::Receiver<EscalationSignal> {
        self.inner.signal_tx.subscribe()
    }

    /// Token cancelled on shutdown, for background tasks tied to the engine.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancel every pending timer and background task.
    pub fn shutdown(&self) {
        info!(pending_timers = self.inner.timers.pending(), "Shutting down notification orchestrator");
        self.inner.shutdown.cancel();
        self.inner.timers.shutdown();
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ========== Intake ==========

    /// Fan a risk event out to its contacts. Returns the batch id.
    ///
    /// Handling the same event twice returns the existing batch.
    #[instrument(skip(self, event), fields(risk_event_id = %event.id, kind = %event.kind, severity = %event.severity))]
    pub async fn handle(&self, event: RiskEvent) -> Result<String> {
        let now = self.now();
        event.validate(now)?;

        let _intake = self.inner.intake_locks.lock(&event.id).await;
        if let Some(existing) = self.inner.repo.find_batch_for_event(&event.id).await? {
            debug!(batch_id = %existing.id, "Risk event already handled");
            return Ok(existing.id);
        }

        let template = self
            .inner
            .templates
            .resolve(event.kind, event.severity, &self.inner.settings.language)
            .await?;
        let contacts = self.ranked_contacts(&event, now).await?;
        let contact_order: Vec<String> = contacts.iter().map(|c| c.id.clone()).collect();

        let batch = NotificationBatch::new(event, contact_order, now);
        if let Err(e) = self.inner.repo.insert_batch(&batch).await {
            if let Some(existing) = self.inner.repo.find_batch_for_event(&batch.risk_event.id).await? {
                return Ok(existing.id);
            }
            return Err(e);
        }

        if contacts.is_empty() {
            warn!(batch_id = %batch.id, "No available contacts for risk event");
            self.exhaust_without_contacts(&batch).await?;
            return Ok(batch.id);
        }

        self.inner.templates.increment_usage(&template.code).await?;

        let roots: Vec<&Contact> = contacts
            .iter()
            .take(self.inner.settings.root_fanout.max(1))
            .collect();
        let mut created = Vec::new();
        for contact in roots {
            created.extend(
                self.create_for_contact(&batch, &template, contact, 0, None)
                    .await?,
            );
        }
        info!(
            batch_id = %batch.id,
            notifications = created.len(),
            contacts = batch.contact_order.len(),
            "Risk event fanned out"
        );
        for notification in created {
            self.spawn_dispatch(notification.id, 0);
        }
        Ok(batch.id)
    }

    /// Eligible contacts reachable right now, by priority then response rate.
    async fn ranked_contacts(&self, event: &RiskEvent, now: DateTime<Utc>) -> Result<Vec<Contact>> {
        let eligible = self
            .inner
            .directory
            .list_eligible_contacts(&event.subject_id, event.severity.required_capability())
            .await?;

        let mut available = Vec::with_capacity(eligible.len());
        for contact in eligible {
            if !contact.is_available_at(now) {
                debug!(contact_id = %contact.id, "Contact outside availability window");
                continue;
            }
            if contact.channel_order().is_empty() {
                debug!(contact_id = %contact.id, "Contact has no reachable channel");
                continue;
            }
            available.push(contact);
        }

        let ids: Vec<String> = available.iter().map(|c| c.id.clone()).collect();
        let stats = self.inner.repo.response_stats(&ids).await?;
        let rate = |c: &Contact| stats.get(&c.id).map(|s| s.rate()).unwrap_or(0.0);
        available.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| rate(b).total_cmp(&rate(a)))
        });
        Ok(available)
    }

    async fn exhaust_without_contacts(&self, batch: &NotificationBatch) -> Result<()> {
        let now = self.now();
        if !self
            .inner
            .repo
            .resolve_batch(&batch.id, BatchStatus::Exhausted, None, now)
            .await?
        {
            return Ok(());
        }
        self.emit_unresolved(batch, Vec::new(), true, now);
        Ok(())
    }

    /// Create the notifications for one contact.
    ///
    /// CRITICAL events get one notification pinned to each reachable channel.
    async fn create_for_contact(
        &self,
        batch: &NotificationBatch,
        template: &NotificationTemplate,
        contact: &Contact,
        level: u32,
        parent: Option<(&Notification, EscalationReason)>,
    ) -> Result<Vec<Notification>> {
        let event = &batch.risk_event;
        let now = self.now();
        let channels = contact.channel_order();
        let pinned = event.severity.is_critical();
        let targets: Vec<DeliveryChannel> = if pinned {
            channels
        } else {
            channels.into_iter().take(1).collect()
        };

        let variables = message_variables(event, contact, level);
        let mut created = Vec::with_capacity(targets.len());
        for channel in targets {
            let Some(address) = contact.address_for(channel) else {
                continue;
            };
            let message = self.render_logged(template, channel, &variables);
            let notification = Notification::new(
                NewNotification {
                    batch_id: batch.id.clone(),
                    risk_event_id: event.id.clone(),
                    subject_id: event.subject_id.clone(),
                    contact_id: contact.id.clone(),
                    template_code: template.code.clone(),
                    channel,
                    address: address.to_string(),
                    title: message.title,
                    body: message.body,
                    priority: template.priority,
                    level,
                    pinned_channel: pinned,
                },
                now,
                self.inner.settings.notification_ttl,
            );
            self.inner.repo.insert_notification(&notification).await?;

            if let Some((source, reason)) = parent {
                let link = EscalationLink::new(
                    &batch.id,
                    &source.id,
                    &notification.id,
                    level,
                    reason,
                    now,
                );
                self.inner
                    .repo
                    .insert_link(&link, self.inner.policy.max_depth())
                    .await?;
            }
            debug!(
                notification_id = %notification.id,
                contact_id = %contact.id,
                channel = %channel,
                level,
                "Notification created"
            );
            created.push(notification);
        }
        Ok(created)
    }

    fn render_logged(
        &self,
        template: &NotificationTemplate,
        channel: DeliveryChannel,
        variables: &HashMap<String, String>,
    ) -> RenderedMessage {
        let message = render(template, channel, variables);
        if !message.missing.is_empty() {
            warn!(
                template = %template.code,
                channel = %channel,
                missing = ?message.missing,
                "Template rendered with missing variables"
            );
        }
        message
    }

    // ========== Delivery ==========

    fn spawn_dispatch(&self, notification_id: String, attempt_count: u32) {
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = this.inner.notification_locks.lock(&notification_id).await;
            if let Err(e) = this.dispatch_locked(&notification_id, attempt_count).await {
                error!(notification_id, error = %e, "Failed to dispatch notification");
            }
        });
    }

    /// Open an attempt on the notification's current channel and hand it to the
    /// sender. The caller holds the notification lock.
    async fn dispatch_locked(&self, notification_id: &str, attempt_count: u32) -> Result<()> {
        let notification = self.inner.repo.get_notification(notification_id).await?;
        if notification.is_terminal() {
            return Ok(());
        }
        let batch = self.inner.repo.get_batch(&notification.batch_id).await?;
        if batch.status.is_resolved() {
            debug!(notification_id, batch_status = %batch.status, "Batch resolved, not sending");
            return Ok(());
        }

        let attempt = match self
            .inner
            .tracker
            .record_attempt(
                &notification,
                notification.channel,
                &notification.address,
                attempt_count,
            )
            .await
        {
            Ok(attempt) => attempt,
            Err(Error::AttemptInProgress { .. }) => {
                debug!(notification_id, "Attempt already in flight");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let now = self.now();
        let mut notification = notification;
        if notification.status == NotificationStatus::Pending {
            let window = escalation_window(
                &self.template_for(&notification, &batch.risk_event).await?,
                batch.risk_event.severity,
            );
            let change = StatusChange::to(NotificationStatus::Sending, now)
                .with_first_attempt(now, now + window);
            if self
                .inner
                .repo
                .update_status_if(notification_id, &[NotificationStatus::Pending], &change)
                .await?
            {
                change.apply(&mut notification);
            }
        }
        self.arm_deadline(&notification);

        debug!(
            notification_id,
            attempt_id = %attempt.id,
            channel = %attempt.channel,
            attempt_count,
            "Dispatching notification"
        );
        let message = RenderedMessage::new(&notification.title, &notification.body);
        self.spawn_send(attempt, message);
        Ok(())
    }

    fn spawn_send(&self, attempt: DeliveryAttempt, message: RenderedMessage) {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.send_with_limits(&attempt, &message).await;
            let result = DeliveryResult {
                attempt_id: attempt.id.clone(),
                outcome,
            };
            if let Err(e) = this.on_delivery_result(result).await {
                error!(attempt_id = %attempt.id, error = %e, "Failed to process delivery result");
            }
        });
    }

    async fn send_with_limits(
        &self,
        attempt: &DeliveryAttempt,
        message: &RenderedMessage,
    ) -> DeliveryOutcome {
        let permit = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                return DeliveryOutcome::Failed(DeliveryFault::transient("engine shutting down"));
            }
            permit = self.inner.send_permits.clone().acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return DeliveryOutcome::Failed(DeliveryFault::transient("send pool closed"));
        };

        let timeout = self.inner.settings.send_timeout;
        match tokio::time::timeout(
            timeout,
            self.inner
                .sender
                .send(attempt.channel, &attempt.address, message),
        )
        .await
        {
            Ok(Ok(receipt)) => DeliveryOutcome::Sent(receipt),
            Ok(Err(fault)) => DeliveryOutcome::Failed(fault),
            Err(_) => DeliveryOutcome::Failed(
                DeliveryFault::transient(format!("send timed out after {}s", timeout.as_secs()))
                    .with_code("SEND_TIMEOUT"),
            ),
        }
    }

    /// Apply the outcome of a send.
    ///
    /// Results for attempts that are already closed are ignored.
    #[instrument(skip(self, result), fields(attempt_id = %result.attempt_id))]
    pub async fn on_delivery_result(&self, result: DeliveryResult) -> Result<()> {
        let attempt = self.inner.tracker.get(&result.attempt_id).await?;
        let _guard = self
            .inner
            .notification_locks
            .lock(&attempt.notification_id)
            .await;

        let attempt = self.inner.tracker.get(&result.attempt_id).await?;
        if !attempt.is_open() {
            debug!(status = %attempt.status, "Ignoring result for closed attempt");
            return Ok(());
        }
        let notification = self
            .inner
            .repo
            .get_notification(&attempt.notification_id)
            .await?;

        match &result.outcome {
            DeliveryOutcome::Sent(_) => {
                self.inner
                    .tracker
                    .complete(&attempt, &result.outcome, false)
                    .await?;
                self.advance(&notification, NotificationStatus::Sent).await?;
                Ok(())
            }
            DeliveryOutcome::Failed(fault) => {
                warn!(
                    notification_id = %notification.id,
                    channel = %attempt.channel,
                    fault = %fault,
                    "Delivery attempt failed"
                );
                if notification.is_terminal() {
                    self.inner
                        .tracker
                        .complete(&attempt, &result.outcome, false)
                        .await?;
                    return Ok(());
                }
                self.handle_failure(notification, attempt, fault.clone())
                    .await
            }
        }
    }

    /// Move a notification forward along the delivery path. Late reports that
    /// would not advance it are no-ops.
    async fn advance(&self, notification: &Notification, target: NotificationStatus) -> Result<bool> {
        if notification.is_terminal() || !notification.status.is_behind(target) {
            return Ok(false);
        }
        let change = StatusChange::to(target, self.now());
        let applied = self
            .inner
            .repo
            .update_status_if(&notification.id, &[notification.status], &change)
            .await?;
        if applied {
            let mut updated = notification.clone();
            change.apply(&mut updated);
            self.arm_deadline(&updated);
            debug!(notification_id = %notification.id, from = %notification.status, to = %target, "Notification advanced");
        }
        Ok(applied)
    }

    async fn handle_failure(
        &self,
        notification: Notification,
        attempt: DeliveryAttempt,
        fault: DeliveryFault,
    ) -> Result<()> {
        let batch = self.inner.repo.get_batch(&notification.batch_id).await?;
        let event = &batch.risk_event;
        let template = self.template_for(&notification, event).await?;
        let contact = self.find_contact(event, &notification.contact_id).await?;
        let contact_channels = contact_channels(&notification, contact.as_ref());
        let attempts = self.inner.tracker.attempts(&notification.id).await?;
        let tried = channels_tried(&attempts);

        let decision = self.inner.policy.decide(&PolicyContext {
            notification: &notification,
            severity: event.severity,
            template: &template,
            last_attempt: Some(&attempt),
            fault: Some(&fault),
            contact_channels: &contact_channels,
            tried_channels: &tried,
            trigger: Trigger::Failure,
            now: self.now(),
        });
        debug!(notification_id = %notification.id, decision = decision.name(), "Policy decided");

        let retry_scheduled = matches!(decision, Decision::RetrySameChannel { .. });
        self.inner
            .tracker
            .complete(&attempt, &DeliveryOutcome::Failed(fault), retry_scheduled)
            .await?;

        match decision {
            Decision::RetrySameChannel {
                delay,
                attempt_count,
            } => {
                self.schedule_retry(&notification, delay, attempt_count);
                Ok(())
            }
            Decision::SwitchChannel { channel } => {
                self.switch_channel(&notification, &batch, &template, contact.as_ref(), channel)
                    .await
            }
            Decision::EscalateToNextContact => {
                self.conclude(&notification, &template, Trigger::Failure, true)
                    .await?;
                Ok(())
            }
            Decision::GiveUp { .. } => {
                self.conclude(&notification, &template, Trigger::Failure, false)
                    .await?;
                Ok(())
            }
        }
    }

    async fn switch_channel(
        &self,
        notification: &Notification,
        batch: &NotificationBatch,
        template: &NotificationTemplate,
        contact: Option<&Contact>,
        channel: DeliveryChannel,
    ) -> Result<()> {
        let Some((contact, address)) =
            contact.and_then(|c| c.address_for(channel).map(|address| (c, address)))
        else {
            self.conclude(notification, template, Trigger::Failure, true)
                .await?;
            return Ok(());
        };
        let variables = message_variables(&batch.risk_event, contact, notification.level);
        let message = self.render_logged(template, channel, &variables);
        if !self
            .inner
            .repo
            .update_route(&notification.id, channel, address, &message.title, &message.body)
            .await?
        {
            return Ok(());
        }
        info!(
            notification_id = %notification.id,
            from = %notification.channel,
            to = %channel,
            "Switching delivery channel"
        );
        self.dispatch_locked(&notification.id, 0).await
    }

    /// Apply a provider receipt (DELIVERED or READ) to an attempt.
    #[instrument(skip(self))]
    pub async fn on_delivery_receipt(&self, attempt_id: &str, receipt: DeliveryReceipt) -> Result<()> {
        let attempt = self.inner.tracker.get(attempt_id).await?;
        let _guard = self
            .inner
            .notification_locks
            .lock(&attempt.notification_id)
            .await;

        self.inner.tracker.record_receipt(&attempt, receipt).await?;
        let attempt = self.inner.tracker.get(attempt_id).await?;
        if !matches!(attempt.status, AttemptStatus::Sent | AttemptStatus::Delivered) {
            debug!(status = %attempt.status, "Receipt for an attempt that did not go out, ignoring");
            return Ok(());
        }
        let notification = self
            .inner
            .repo
            .get_notification(&attempt.notification_id)
            .await?;
        let target = match receipt {
            DeliveryReceipt::Delivered => NotificationStatus::Delivered,
            DeliveryReceipt::Read => NotificationStatus::Read,
        };
        self.advance(&notification, target).await?;
        Ok(())
    }

    // ========== Timers ==========

    /// (Re)arm the acknowledgment deadline of an open notification.
    fn arm_deadline(&self, notification: &Notification) {
        if notification.is_terminal() {
            return;
        }
        let Some(due) = notification.escalation_due_at else {
            return;
        };
        let delay = (due - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_deadline(&notification.id, delay);
    }

    fn schedule_deadline(&self, notification_id: &str, delay: Duration) {
        let this = self.clone();
        self.inner.timers.schedule(
            notification_id,
            TimerKind::Deadline,
            delay,
            move |ticket| async move {
                let id = ticket.key.clone();
                if let Err(e) = this.on_deadline(&id, Some(ticket)).await {
                    error!(notification_id = %id, error = %e, "Escalation deadline handling failed");
                }
            },
        );
    }

    /// Schedule a retry on the same channel, unless the deadline comes first.
    fn schedule_retry(&self, notification: &Notification, delay: Duration, attempt_count: u32) {
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.now().checked_add_signed(delay));
        if let Some(due) = notification.escalation_due_at
            && retry_at.is_none_or(|retry_at| due <= retry_at)
        {
            debug!(notification_id = %notification.id, "Deadline precedes retry, skipping retry timer");
            self.arm_deadline(notification);
            return;
        }

        debug!(
            notification_id = %notification.id,
            delay_secs = delay.as_secs(),
            attempt_count,
            "Retry scheduled"
        );
        let this = self.clone();
        self.inner.timers.schedule(
            &notification.id,
            TimerKind::Retry,
            delay,
            move |ticket| async move {
                let id = ticket.key.clone();
                if let Err(e) = this.on_retry(ticket, attempt_count).await {
                    error!(notification_id = %id, error = %e, "Retry failed");
                }
            },
        );
    }

    /// Take the notification lock for a fired timer. Returns `None` when the
    /// timer was superseded or cancelled in the meantime.
    async fn claim_timer(&self, ticket: &TimerTicket) -> Option<KeyedGuard> {
        let guard = self.inner.notification_locks.lock(&ticket.key).await;
        // Let an acknowledgment issued in the same tick cancel us first.
        tokio::task::yield_now().await;
        if !self.inner.timers.is_current(ticket) {
            debug!(notification_id = %ticket.key, kind = %ticket.kind, "Stale timer ignored");
            return None;
        }
        self.inner.timers.complete(ticket);
        Some(guard)
    }

    async fn on_retry(&self, ticket: TimerTicket, attempt_count: u32) -> Result<()> {
        let Some(_guard) = self.claim_timer(&ticket).await else {
            return Ok(());
        };
        let notification = self.inner.repo.get_notification(&ticket.key).await?;
        if self.inner.pending_acks.is_pending(&notification.batch_id) {
            debug!(notification_id = %ticket.key, "Acknowledgment in flight, holding retry");
            self.schedule_retry(&notification, ACK_SETTLE_DELAY, attempt_count);
            return Ok(());
        }
        self.dispatch_locked(&ticket.key, attempt_count).await
    }

    /// Acknowledgment window elapsed. Called by the deadline timer (with its
    /// ticket) and by the sweep (without one).
    pub(crate) async fn on_deadline(&self, notification_id: &str, ticket: Option<TimerTicket>) -> Result<()> {
        let _guard = match &ticket {
            Some(ticket) => match self.claim_timer(ticket).await {
                Some(guard) => guard,
                None => return Ok(()),
            },
            None => self.inner.notification_locks.lock(notification_id).await,
        };

        let notification = self.inner.repo.get_notification(notification_id).await?;
        if notification.is_terminal() {
            return Ok(());
        }
        let now = self.now();
        if notification.escalation_due_at.is_none_or(|due| now < due) {
            self.arm_deadline(&notification);
            return Ok(());
        }

        let batch = self.inner.repo.get_batch(&notification.batch_id).await?;
        let template = self.template_for(&notification, &batch.risk_event).await?;
        let contact = self
            .find_contact(&batch.risk_event, &notification.contact_id)
            .await?;
        let contact_channels = contact_channels(&notification, contact.as_ref());
        let attempts = self.inner.tracker.attempts(&notification.id).await?;
        let tried = channels_tried(&attempts);

        let decision = self.inner.policy.decide(&PolicyContext {
            notification: &notification,
            severity: batch.risk_event.severity,
            template: &template,
            last_attempt: attempts.last(),
            fault: None,
            contact_channels: &contact_channels,
            tried_channels: &tried,
            trigger: Trigger::Timeout,
            now,
        });
        info!(
            notification_id,
            level = notification.level,
            decision = decision.name(),
            "Acknowledgment window elapsed"
        );
        let escalate = matches!(decision, Decision::EscalateToNextContact);
        self.conclude(&notification, &template, Trigger::Timeout, escalate)
            .await?;
        Ok(())
    }

    // ========== Escalation ==========

    /// End a notification after the policy escalated or gave up on it.
    ///
    /// Runs under the batch lock: the terminal transition, the successor and the
    /// exhaustion check are one step as far as the batch is concerned. Returns
    /// whether the notification was closed.
    ///
    /// Stands down while an acknowledgment for the batch is in flight; the
    /// notification is looked at again once it settled.
    async fn conclude(
        &self,
        notification: &Notification,
        template: &NotificationTemplate,
        trigger: Trigger,
        escalate: bool,
    ) -> Result<bool> {
        let _batch_guard = self.inner.batch_locks.lock(&notification.batch_id).await;
        let batch = self.inner.repo.get_batch(&notification.batch_id).await?;
        let now = self.now();

        if batch.status.is_resolved() {
            return self
                .close_notification(notification, NotificationStatus::Cancelled, "batch resolved")
                .await;
        }
        if self.inner.pending_acks.is_pending(&batch.id) {
            info!(
                notification_id = %notification.id,
                batch_id = %batch.id,
                "Acknowledgment in flight, not escalating"
            );
            self.schedule_deadline(&notification.id, ACK_SETTLE_DELAY);
            return Ok(false);
        }

        let mut escalate = escalate;
        if notification.pinned_channel {
            let siblings = self.open_siblings(notification).await?;
            match trigger {
                // Other channels of the same contact are still in play.
                Trigger::Failure if !siblings.is_empty() => escalate = false,
                Trigger::Failure => {}
                Trigger::Timeout => {
                    for sibling in &siblings {
                        self.close_notification(sibling, NotificationStatus::Expired, "escalation window elapsed")
                            .await?;
                    }
                }
            }
        }

        let status = trigger.give_up_status();
        let reason = match trigger {
            Trigger::Failure => "delivery failed on every channel",
            Trigger::Timeout => "escalation window elapsed",
        };
        if !self.close_notification(notification, status, reason).await? {
            return Ok(false);
        }

        if escalate {
            let escalation_reason = match trigger {
                Trigger::Failure => EscalationReason::DeliveryExhausted,
                Trigger::Timeout => EscalationReason::AckTimeout,
            };
            if self
                .escalate(&batch, template, notification, escalation_reason)
                .await?
            {
                return Ok(true);
            }
            info!(
                batch_id = %batch.id,
                notification_id = %notification.id,
                "No further contact available, giving up"
            );
        }

        self.check_exhausted(&batch, now).await?;
        Ok(true)
    }

    /// Spawn the notification(s) for the next contact in the batch order.
    async fn escalate(
        &self,
        batch: &NotificationBatch,
        template: &NotificationTemplate,
        source: &Notification,
        reason: EscalationReason,
    ) -> Result<bool> {
        let Some(contact) = self.next_contact(batch).await? else {
            return Ok(false);
        };
        let level = source.level + 1;
        let created = self
            .create_for_contact(batch, template, &contact, level, Some((source, reason)))
            .await?;
        if created.is_empty() {
            return Ok(false);
        }
        info!(
            batch_id = %batch.id,
            from_notification = %source.id,
            contact_id = %contact.id,
            level,
            reason = reason.as_str(),
            "Escalated to next contact"
        );
        for notification in created {
            self.spawn_dispatch(notification.id, 0);
        }
        Ok(true)
    }

    /// First contact of the batch order not yet notified, still eligible and
    /// available now.
    async fn next_contact(&self, batch: &NotificationBatch) -> Result<Option<Contact>> {
        let event = &batch.risk_event;
        let notified: HashSet<String> = self
            .inner
            .repo
            .list_batch_notifications(&batch.id)
            .await?
            .into_iter()
            .map(|n| n.contact_id)
            .collect();
        let mut eligible: HashMap<String, Contact> = self
            .inner
            .directory
            .list_eligible_contacts(&event.subject_id, event.severity.required_capability())
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let now = self.now();
        for contact_id in &batch.contact_order {
            if notified.contains(contact_id) {
                continue;
            }
            let Some(contact) = eligible.remove(contact_id) else {
                continue;
            };
            if contact.is_available_at(now) && !contact.channel_order().is_empty() {
                return Ok(Some(contact));
            }
            debug!(contact_id, "Skipping unavailable contact");
        }
        Ok(None)
    }

    async fn open_siblings(&self, notification: &Notification) -> Result<Vec<Notification>> {
        Ok(self
            .inner
            .repo
            .list_batch_notifications(&notification.batch_id)
            .await?
            .into_iter()
            .filter(|n| {
                n.id != notification.id
                    && n.contact_id == notification.contact_id
                    && n.level == notification.level
                    && !n.is_terminal()
            })
            .collect())
    }

    /// Move an open notification to a terminal status, closing its open
    /// attempt and timer. Returns `false` if it was already terminal.
    async fn close_notification(
        &self,
        notification: &Notification,
        status: NotificationStatus,
        reason: &str,
    ) -> Result<bool> {
        let change = StatusChange::to(status, self.now());
        let applied = self
            .inner
            .repo
            .update_status_if(&notification.id, NotificationStatus::open_states(), &change)
            .await?;
        if !applied {
            return Ok(false);
        }
        self.inner.timers.cancel(&notification.id);
        let attempt_status = match status {
            NotificationStatus::Expired => AttemptStatus::Expired,
            _ => AttemptStatus::Cancelled,
        };
        self.inner
            .tracker
            .abandon_open(&notification.id, attempt_status, reason)
            .await?;
        debug!(notification_id = %notification.id, status = %status, reason, "Notification closed");
        Ok(true)
    }

    /// Resolve the batch as EXHAUSTED once every notification is terminal and
    /// none was acknowledged. Caller holds the batch lock.
    async fn check_exhausted(&self, batch: &NotificationBatch, now: DateTime<Utc>) -> Result<()> {
        let notifications = self.inner.repo.list_batch_notifications(&batch.id).await?;
        if !notifications.iter().all(Notification::is_terminal)
            || notifications
                .iter()
                .any(|n| n.status == NotificationStatus::Acknowledged)
        {
            return Ok(());
        }
        if !self
            .inner
            .repo
            .resolve_batch(&batch.id, BatchStatus::Exhausted, None, now)
            .await?
        {
            return Ok(());
        }

        let mut contacts_tried = Vec::new();
        for n in &notifications {
            if !contacts_tried.contains(&n.contact_id) {
                contacts_tried.push(n.contact_id.clone());
            }
        }
        let alert = batch.risk_event.severity.is_critical();
        self.emit_unresolved(batch, contacts_tried, alert, now);
        Ok(())
    }

    fn emit_unresolved(
        &self,
        batch: &NotificationBatch,
        contacts_tried: Vec<String>,
        alert: bool,
        now: DateTime<Utc>,
    ) {
        let event = &batch.risk_event;
        warn!(
            batch_id = %batch.id,
            risk_event_id = %event.id,
            severity = %event.severity,
            "Risk event unresolved, every chain exhausted"
        );
        self.emit(EscalationSignal::Unresolved {
            batch_id: batch.id.clone(),
            risk_event_id: event.id.clone(),
            subject_id: event.subject_id.clone(),
            severity: event.severity,
            at: now,
        });
        if alert {
            let fault = ExhaustionFault {
                batch_id: batch.id.clone(),
                risk_event_id: event.id.clone(),
                subject_id: event.subject_id.clone(),
                kind: event.kind,
                severity: event.severity,
                contacts_tried,
                at: now,
            };
            error!(
                error = %Error::from(fault.clone()),
                subject_id = %event.subject_id,
                contacts_tried = fault.contacts_tried.len(),
                "Raising exhaustion alert"
            );
            self.emit(EscalationSignal::ExhaustionAlert(fault));
        }
    }

    fn emit(&self, signal: EscalationSignal) {
        if self.inner.signal_tx.send(signal).is_err() {
            debug!("No escalation signal subscribers");
        }
    }

    // ========== Acknowledgment & cancellation ==========

    /// Record a recipient's acknowledgment and resolve the batch.
    ///
    /// Acknowledging an already acknowledged notification is a no-op.
    #[instrument(skip(self, response), fields(response = response.response_type()))]
    pub async fn on_acknowledge(&self, notification_id: &str, response: AckResponse) -> Result<()> {
        // Beat any timer that is about to fire, and make one that already fired
        // stand down before it escalates.
        self.inner.timers.cancel(notification_id);
        let batch_id = self.inner.repo.get_notification(notification_id).await?.batch_id;
        let _pending = self.inner.pending_acks.register(&batch_id);
        let _guard = self.inner.notification_locks.lock(notification_id).await;

        let notification = self.inner.repo.get_notification(notification_id).await?;
        if notification.status == NotificationStatus::Acknowledged {
            return Ok(());
        }
        notification
            .status
            .transition_to(NotificationStatus::Acknowledged)?;

        let _batch_guard = self.inner.batch_locks.lock(&notification.batch_id).await;
        let now = self.now();
        let change = StatusChange::to(NotificationStatus::Acknowledged, now).with_acknowledgment(
            Acknowledgment {
                response: response.clone(),
                responded_at: now,
            },
        );
        if !self
            .inner
            .repo
            .update_status_if(notification_id, &[notification.status], &change)
            .await?
        {
            let current = self.inner.repo.get_notification(notification_id).await?;
            if current.status == NotificationStatus::Acknowledged {
                return Ok(());
            }
            return Err(Error::invalid_transition(
                current.status,
                NotificationStatus::Acknowledged,
            ));
        }
        self.inner.timers.cancel(notification_id);
        info!(
            notification_id,
            batch_id = %notification.batch_id,
            contact_id = %notification.contact_id,
            "Notification acknowledged"
        );

        let batch = self.inner.repo.get_batch(&notification.batch_id).await?;
        if self
            .inner
            .repo
            .resolve_batch(
                &batch.id,
                BatchStatus::Acknowledged,
                Some(notification_id),
                now,
            )
            .await?
        {
            let cancelled = self
                .cancel_open_notifications(&batch.id, "batch acknowledged")
                .await?;
            debug!(batch_id = %batch.id, cancelled, "Cancelled remaining notifications");
            self.emit(EscalationSignal::Resolved {
                batch_id: batch.id.clone(),
                risk_event_id: batch.risk_event.id.clone(),
                subject_id: batch.risk_event.subject_id.clone(),
                notification_id: notification_id.to_string(),
                contact_id: notification.contact_id.clone(),
                response,
                at: now,
            });
        }
        Ok(())
    }

    /// Cancel every open notification of a batch. Returns `false` if the batch
    /// was already resolved.
    #[instrument(skip(self))]
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<bool> {
        let _batch_guard = self.inner.batch_locks.lock(batch_id).await;
        let batch = self.inner.repo.get_batch(batch_id).await?;
        let now = self.now();
        if !self
            .inner
            .repo
            .resolve_batch(batch_id, BatchStatus::Cancelled, None, now)
            .await?
        {
            return Ok(false);
        }
        let cancelled = self
            .cancel_open_notifications(batch_id, "batch cancelled")
            .await?;
        info!(batch_id, cancelled, "Batch cancelled");
        self.emit(EscalationSignal::Cancelled {
            batch_id: batch.id.clone(),
            risk_event_id: batch.risk_event.id.clone(),
            subject_id: batch.risk_event.subject_id.clone(),
            at: now,
        });
        Ok(true)
    }

    async fn cancel_open_notifications(&self, batch_id: &str, reason: &str) -> Result<usize> {
        let mut cancelled = 0;
        for notification in self.inner.repo.list_batch_notifications(batch_id).await? {
            if notification.is_terminal() {
                continue;
            }
            if self
                .close_notification(&notification, NotificationStatus::Cancelled, reason)
                .await?
            {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Expire a notification whose lifetime ran out and hand the batch to the
    /// next contact. Used by the sweep.
    pub(crate) async fn expire(&self, notification_id: &str) -> Result<bool> {
        let _guard = self.inner.notification_locks.lock(notification_id).await;
        let notification = self.inner.repo.get_notification(notification_id).await?;
        if !notification.is_expired_at(self.now()) {
            return Ok(false);
        }
        let batch = self.inner.repo.get_batch(&notification.batch_id).await?;
        let template = self.template_for(&notification, &batch.risk_event).await?;
        let escalate = notification.level < self.inner.policy.max_depth();
        info!(notification_id, level = notification.level, escalate, "Notification lifetime elapsed");
        self.conclude(&notification, &template, Trigger::Timeout, escalate)
            .await
    }

    /// Dispatch a notification that was created but never handed to a sender,
    /// e.g. because the process stopped in between. Used by the sweep.
    pub(crate) async fn resume_pending(&self, notification_id: &str) -> Result<bool> {
        let _guard = self.inner.notification_locks.lock(notification_id).await;
        let notification = self.inner.repo.get_notification(notification_id).await?;
        if notification.status != NotificationStatus::Pending || notification.is_expired_at(self.now()) {
            return Ok(false);
        }
        info!(notification_id, level = notification.level, "Resuming undispatched notification");
        self.dispatch_locked(notification_id, 0).await?;
        Ok(true)
    }

    // ========== Queries ==========

    pub async fn get_notification_status(&self, notification_id: &str) -> Result<NotificationStatusSnapshot> {
        let notification = self.inner.repo.get_notification(notification_id).await?;
        let attempts = self.inner.tracker.attempts(notification_id).await?;
        Ok(NotificationStatusSnapshot::new(&notification, &attempts))
    }

    /// Notifications for a subject created within `[from, to]`, newest first.
    pub async fn get_history(
        &self,
        subject_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<NotificationSummary>> {
        if from > to {
            return Err(Error::validation("history range start is after its end"));
        }
        let notifications = self.inner.repo.history(subject_id, from, to).await?;
        Ok(notifications.iter().map(NotificationSummary::from).collect())
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<BatchOverview> {
        let batch = self.inner.repo.get_batch(batch_id).await?;
        let notifications = self.inner.repo.list_batch_notifications(batch_id).await?;
        let links = self.inner.repo.list_links(batch_id).await?;
        Ok(BatchOverview::new(&batch, &notifications, links))
    }

    // ========== Helpers ==========

    /// Template a notification was rendered from. The built-in generic template
    /// is not stored, so it is rebuilt.
    async fn template_for(&self, notification: &Notification, event: &RiskEvent) -> Result<NotificationTemplate> {
        match self.inner.templates.get(&notification.template_code).await {
            Ok(template) => Ok(template),
            Err(Error::NotFound { .. }) if notification.template_code == GENERIC_TEMPLATE_CODE => {
                Ok(NotificationTemplate::generic(event.kind))
            }
            Err(e) => Err(e),
        }
    }

    async fn find_contact(&self, event: &RiskEvent, contact_id: &str) -> Result<Option<Contact>> {
        Ok(self
            .inner
            .directory
            .list_eligible_contacts(&event.subject_id, event.severity.required_capability())
            .await?
            .into_iter()
            .find(|c| c.id == contact_id))
    }
}

/// Channels the policy may use for a notification.
fn contact_channels(notification: &Notification, contact: Option<&Contact>) -> Vec<DeliveryChannel> {
    if notification.pinned_channel {
        return vec![notification.channel];
    }
    contact
        .map(Contact::channel_order)
        .unwrap_or_else(|| vec![notification.channel])
}

/// Standard template variables for one contact.
fn message_variables(event: &RiskEvent, contact: &Contact, level: u32) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("subject_id".to_string(), event.subject_id.clone());
    vars.insert("contact_name".to_string(), contact.name.clone());
    vars.insert("event_kind".to_string(), event.kind.as_str().to_string());
    vars.insert("event_label".to_string(), event.kind.label().to_string());
    vars.insert("severity".to_string(), event.severity.as_str().to_string());
    vars.insert(
        "detected_at".to_string(),
        event.detected_at.format("%Y-%m-%d %H:%M UTC").to_string(),
    );
    vars.insert(
        "confidence".to_string(),
        format!("{:.0}%", event.confidence * 100.0),
    );
    let (location, maps_url) = match &event.location {
        Some(point) => (point.to_string(), point.maps_url()),
        None => ("unknown".to_string(), String::new()),
    };
    vars.insert("location".to_string(), location);
    vars.insert("maps_url".to_string(), maps_url);
    vars.insert("escalation_level".to_string(), level.to_string());
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeoPoint, RiskKind, Severity};

    #[test]
    fn test_message_variables() {
        let event = RiskEvent::new("s-1", RiskKind::Fall, Severity::High, Utc::now(), 0.87)
            .with_location(GeoPoint::new(52.52, 13.405));
        let contact = Contact::new("c-1", "Alice", 1, DeliveryChannel::Sms);
        let vars = message_variables(&event, &contact, 2);
        assert_eq!(vars["contact_name"], "Alice");
        assert_eq!(vars["confidence"], "87%");
        assert_eq!(vars["escalation_level"], "2");
        assert_eq!(vars["event_kind"], "FALL");
        assert!(vars["maps_url"].contains("52.52"));
    }

    #[test]
    fn test_pinned_notification_only_uses_its_channel() {
        let contact = Contact::new("c-1", "Alice", 1, DeliveryChannel::Sms)
            .with_channel(DeliveryChannel::Sms, "+1")
            .with_channel(DeliveryChannel::Push, "tok");
        let mut notification = Notification::new(
            NewNotification {
                batch_id: "b".into(),
                risk_event_id: "e".into(),
                subject_id: "s".into(),
                contact_id: "c-1".into(),
                template_code: "generic".into(),
                channel: DeliveryChannel::Push,
                address: "tok".into(),
                title: String::new(),
                body: String::new(),
                priority: Default::default(),
                level: 0,
                pinned_channel: true,
            },
            Utc::now(),
            chrono::Duration::hours(1),
        );
        assert_eq!(
            contact_channels(&notification, Some(&contact)),
            vec![DeliveryChannel::Push]
        );
        notification.pinned_channel = false;
        assert_eq!(
            contact_channels(&notification, Some(&contact)),
            vec![DeliveryChannel::Sms, DeliveryChannel::Push]
        );
    }
}
