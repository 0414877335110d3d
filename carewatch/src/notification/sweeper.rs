//! Periodic escalation sweep.
//!
//! In-process timers are lost on restart. The sweep polls the store for
//! notifications past their escalation deadline or lifetime, and for ones that
//! were created but never dispatched, and feeds them through the same guarded
//! paths as the timers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::orchestrator::NotificationOrchestrator;
use crate::Result;
use crate::clock::Clock;
use crate::database::repositories::NotificationRepository;

/// How long a PENDING notification may wait for its first dispatch before the
/// sweep picks it up.
pub const DEFAULT_STALLED_GRACE: Duration = Duration::from_secs(30);

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub escalation_due: usize,
    pub expired: usize,
    pub resumed: usize,
}

pub struct EscalationSweeper {
    orchestrator: NotificationOrchestrator,
    repo: Arc<dyn NotificationRepository>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    stalled_grace: Duration,
}

impl EscalationSweeper {
    pub fn new(
        orchestrator: NotificationOrchestrator,
        repo: Arc<dyn NotificationRepository>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            repo,
            clock,
            interval,
            stalled_grace: DEFAULT_STALLED_GRACE,
        }
    }

    pub fn with_stalled_grace(mut self, grace: Duration) -> Self {
        self.stalled_grace = grace;
        self
    }

    /// Run one pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for notification in self.repo.find_due_for_escalation(now).await? {
            match self.orchestrator.on_deadline(&notification.id, None).await {
                Ok(()) => report.escalation_due += 1,
                Err(e) => warn!(notification_id = %notification.id, error = %e, "Sweep escalation failed"),
            }
        }

        for notification in self.repo.find_expired(now).await? {
            match self.orchestrator.expire(&notification.id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => warn!(notification_id = %notification.id, error = %e, "Sweep expiry failed"),
            }
        }

        let grace = chrono::Duration::from_std(self.stalled_grace).unwrap_or(chrono::Duration::zero());
        for notification in self.repo.find_stalled_pending(now - grace).await? {
            match self.orchestrator.resume_pending(&notification.id).await {
                Ok(true) => report.resumed += 1,
                Ok(false) => {}
                Err(e) => warn!(notification_id = %notification.id, error = %e, "Sweep dispatch failed"),
            }
        }

        if report != SweepReport::default() {
            debug!(
                escalation_due = report.escalation_due,
                expired = report.expired,
                resumed = report.resumed,
                "Escalation sweep pass"
            );
        }
        Ok(report)
    }

    /// Run the sweep until the orchestrator shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        let token = self.orchestrator.shutdown_token();
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Escalation sweep started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Escalation sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            warn!(error = %e, "Escalation sweep failed");
                        }
                    }
                }
            }
        })
    }
}
