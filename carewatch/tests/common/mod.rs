//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use carewatch::Result;
use carewatch::clock::{Clock, TokioClock};
use carewatch::database::repositories::{
    MemoryNotificationRepository, MemoryTemplateRepository, NotificationRepository,
    ResponseStats, StatusChange,
};
use carewatch::domain::{
    AttemptStatus, BatchStatus, Contact, DeliveryAttempt, DeliveryChannel, DeliveryFault,
    EscalationLink, FaultKind, Notification, NotificationBatch, NotificationStatus, RiskEvent,
    RiskKind, SendReceipt, Severity,
};
use carewatch::notification::{
    ChannelSender, EscalationSignal, NotificationOrchestrator, OrchestratorDeps,
    OrchestratorSettings, RenderedMessage, StaticContactDirectory,
};

pub const SUBJECT: &str = "subject-1";

/// Wednesday noon, UTC.
pub fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0)
        .single()
        .expect("valid anchor")
}

/// What the scripted sender does with a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Transient,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub channel: DeliveryChannel,
    pub address: String,
    pub body: String,
    pub at: DateTime<Utc>,
}

/// Sender whose outcome is scripted per address, then per channel.
pub struct ScriptedSender {
    clock: Arc<dyn Clock>,
    default: Behavior,
    by_channel: Mutex<HashMap<DeliveryChannel, Behavior>>,
    by_address: Mutex<HashMap<String, Behavior>>,
    sent: Mutex<Vec<SentRecord>>,
}

impl ScriptedSender {
    pub fn new(clock: Arc<dyn Clock>, default: Behavior) -> Self {
        Self {
            clock,
            default,
            by_channel: Mutex::new(HashMap::new()),
            by_address: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn on_channel(&self, channel: DeliveryChannel, behavior: Behavior) {
        self.by_channel.lock().insert(channel, behavior);
    }

    pub fn on_address(&self, address: &str, behavior: Behavior) {
        self.by_address.lock().insert(address.to_string(), behavior);
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<SentRecord> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.address == address)
            .cloned()
            .collect()
    }

    fn behavior_for(&self, channel: DeliveryChannel, address: &str) -> Behavior {
        if let Some(behavior) = self.by_address.lock().get(address) {
            return *behavior;
        }
        self.by_channel
            .lock()
            .get(&channel)
            .copied()
            .unwrap_or(self.default)
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        message: &RenderedMessage,
    ) -> std::result::Result<SendReceipt, DeliveryFault> {
        self.sent.lock().push(SentRecord {
            channel,
            address: address.to_string(),
            body: message.body.clone(),
            at: self.clock.now(),
        });
        match self.behavior_for(channel, address) {
            Behavior::Succeed => Ok(SendReceipt {
                external_message_id: Some(format!("msg-{}", self.sent.lock().len())),
                provider_response_code: Some("202".to_string()),
            }),
            Behavior::Transient => Err(DeliveryFault::transient("gateway unavailable").with_code("503")),
            Behavior::Permanent => Err(DeliveryFault::permanent("address rejected").with_code("400")),
        }
    }
}

/// A guardian reachable on push only.
pub fn push_contact(id: &str, priority: u32) -> Contact {
    Contact::new(id, format!("Contact {id}"), priority, DeliveryChannel::Push)
        .with_channel(DeliveryChannel::Push, format!("push-{id}"))
}

/// A guardian reachable on push, then SMS.
pub fn push_sms_contact(id: &str, priority: u32) -> Contact {
    push_contact(id, priority).with_channel(DeliveryChannel::Sms, format!("sms-{id}"))
}

pub fn event(kind: RiskKind, severity: Severity, detected_at: DateTime<Utc>) -> RiskEvent {
    RiskEvent::new(SUBJECT, kind, severity, detected_at, 0.92)
}

/// Memory store whose batch reads can be made slow, to hold a path inside
/// its storage calls while another one arrives.
pub struct SlowBatchReads {
    inner: Arc<MemoryNotificationRepository>,
    delay: Mutex<Option<Duration>>,
}

impl SlowBatchReads {
    pub fn new(inner: Arc<MemoryNotificationRepository>) -> Self {
        Self {
            inner,
            delay: Mutex::new(None),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl NotificationRepository for SlowBatchReads {
    async fn insert_batch(&self, batch: &NotificationBatch) -> Result<()> {
        self.inner.insert_batch(batch).await
    }

    async fn get_batch(&self, id: &str) -> Result<NotificationBatch> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get_batch(id).await
    }

    async fn find_batch_for_event(&self, risk_event_id: &str) -> Result<Option<NotificationBatch>> {
        self.inner.find_batch_for_event(risk_event_id).await
    }

    async fn resolve_batch(
        &self,
        id: &str,
        status: BatchStatus,
        acknowledged_notification_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .resolve_batch(id, status, acknowledged_notification_id, now)
            .await
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.inner.insert_notification(notification).await
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        self.inner.get_notification(id).await
    }

    async fn list_batch_notifications(&self, batch_id: &str) -> Result<Vec<Notification>> {
        self.inner.list_batch_notifications(batch_id).await
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: &[NotificationStatus],
        change: &StatusChange,
    ) -> Result<bool> {
        self.inner.update_status_if(id, expected, change).await
    }

    async fn update_route(
        &self,
        id: &str,
        channel: DeliveryChannel,
        address: &str,
        title: &str,
        body: &str,
    ) -> Result<bool> {
        self.inner
            .update_route(id, channel, address, title, body)
            .await
    }

    async fn find_due_for_escalation(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        self.inner.find_due_for_escalation(now).await
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        self.inner.find_expired(now).await
    }

    async fn find_stalled_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<Notification>> {
        self.inner.find_stalled_pending(created_before).await
    }

    async fn history(
        &self,
        subject_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        self.inner.history(subject_id, from, to).await
    }

    async fn response_stats(&self, contact_ids: &[String]) -> Result<HashMap<String, ResponseStats>> {
        self.inner.response_stats(contact_ids).await
    }

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.inner.insert_attempt(attempt).await
    }

    async fn get_attempt(&self, id: &str) -> Result<DeliveryAttempt> {
        self.inner.get_attempt(id).await
    }

    async fn complete_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool> {
        self.inner.complete_attempt(attempt).await
    }

    async fn mark_attempt_delivered(&self, id: &str) -> Result<bool> {
        self.inner.mark_attempt_delivered(id).await
    }

    async fn close_open_attempts(
        &self,
        notification_id: &str,
        status: AttemptStatus,
        fault: Option<FaultKind>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.inner
            .close_open_attempts(notification_id, status, fault, message, now)
            .await
    }

    async fn list_attempts(&self, notification_id: &str) -> Result<Vec<DeliveryAttempt>> {
        self.inner.list_attempts(notification_id).await
    }

    async fn insert_link(&self, link: &EscalationLink, max_depth: u32) -> Result<()> {
        self.inner.insert_link(link, max_depth).await
    }

    async fn list_links(&self, batch_id: &str) -> Result<Vec<EscalationLink>> {
        self.inner.list_links(batch_id).await
    }
}

/// Orchestrator over in-memory stores with a paused-time clock.
pub struct Harness {
    pub orchestrator: NotificationOrchestrator,
    pub repo: Arc<MemoryNotificationRepository>,
    pub templates: Arc<MemoryTemplateRepository>,
    pub directory: Arc<StaticContactDirectory>,
    pub sender: Arc<ScriptedSender>,
    pub clock: Arc<TokioClock>,
    pub signals: broadcast::Receiver<EscalationSignal>,
}

impl Harness {
    pub fn new(contacts: Vec<Contact>, behavior: Behavior) -> Self {
        Self::with_settings(contacts, behavior, OrchestratorSettings::default())
    }

    pub fn with_settings(
        contacts: Vec<Contact>,
        behavior: Behavior,
        settings: OrchestratorSettings,
    ) -> Self {
        Self::build(contacts, behavior, settings, |repo| {
            repo as Arc<dyn NotificationRepository>
        })
    }

    /// Like `new`, with the orchestrator reading and writing through `wrap(repo)`.
    /// `Harness::repo` stays the unwrapped store.
    pub fn build(
        contacts: Vec<Contact>,
        behavior: Behavior,
        settings: OrchestratorSettings,
        wrap: impl FnOnce(Arc<MemoryNotificationRepository>) -> Arc<dyn NotificationRepository>,
    ) -> Self {
        let clock = Arc::new(TokioClock::starting_at(anchor()));
        let repo = Arc::new(MemoryNotificationRepository::new());
        let templates = Arc::new(MemoryTemplateRepository::new());
        let directory = Arc::new(StaticContactDirectory::new());
        directory.set_contacts(SUBJECT, contacts);
        let sender = Arc::new(ScriptedSender::new(clock.clone(), behavior));

        let orchestrator = NotificationOrchestrator::new(
            OrchestratorDeps::new(
                wrap(repo.clone()),
                templates.clone(),
                directory.clone(),
                sender.clone(),
            )
            .with_clock(clock.clone()),
            settings,
        );
        let signals = orchestrator.subscribe();
        Self {
            orchestrator,
            repo,
            templates,
            directory,
            sender,
            clock,
            signals,
        }
    }

    /// A second orchestrator over the same stores, as after a restart.
    pub fn restarted(&self, settings: OrchestratorSettings) -> NotificationOrchestrator {
        NotificationOrchestrator::new(
            OrchestratorDeps::new(
                self.repo.clone(),
                self.templates.clone(),
                self.directory.clone(),
                self.sender.clone(),
            )
            .with_clock(self.clock.clone()),
            settings,
        )
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn notifications(&self, batch_id: &str) -> Vec<Notification> {
        self.repo
            .list_batch_notifications(batch_id)
            .await
            .expect("list notifications")
    }

    /// Signals emitted so far.
    pub fn drain_signals(&mut self) -> Vec<EscalationSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = self.signals.try_recv() {
            out.push(signal);
        }
        out
    }
}

/// Let spawned tasks run to completion. Under paused time this advances the
/// clock by a millisecond at most.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn count_signals(signals: &[EscalationSignal], signal_type: &str) -> usize {
    signals
        .iter()
        .filter(|s| s.signal_type() == signal_type)
        .count()
}
