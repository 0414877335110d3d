//! Notification engine.
//!
//! Turns risk events into caregiver notifications and drives them to an
//! acknowledgment:
//!
//! - [`orchestrator`]: intake, dispatch, escalation and batch resolution
//! - [`policy`]: retry / switch / escalate / give-up decisions
//! - [`tracker`]: the delivery attempt log
//! - [`scheduler`]: per-notification locks and timers
//! - [`sweeper`]: store-driven fallback for lost timers
//! - [`channels`], [`directory`], [`template`]: the seams to the outside world

pub mod channels;
pub mod directory;
pub mod events;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod sweeper;
pub mod template;
pub mod tracker;
pub mod views;

pub use channels::{ChannelRouter, ChannelSender, LogSender, WebhookConfig, WebhookSender};
pub use directory::{ContactDirectory, StaticContactDirectory, SubjectContacts};
pub use events::{EscalationSignal, ExhaustionFault};
pub use orchestrator::{NotificationOrchestrator, OrchestratorDeps, OrchestratorSettings};
pub use policy::{Decision, EscalationPolicy, Trigger};
pub use sweeper::{EscalationSweeper, SweepReport};
pub use template::{RenderedMessage, render};
pub use tracker::DeliveryTracker;
pub use views::{BatchOverview, NotificationStatusSnapshot, NotificationSummary};
