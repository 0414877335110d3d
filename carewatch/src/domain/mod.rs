//! Domain layer for carewatch.
//!
//! Entities, value objects and state machines shared by persistence and the
//! notification engine.

pub mod attempt;
pub mod batch;
pub mod channel;
pub mod contact;
pub mod escalation;
pub mod notification;
pub mod risk;
pub mod signals;
pub mod template;

pub use attempt::{
    AttemptStatus, DeliveryAttempt, DeliveryFault, DeliveryOutcome, DeliveryReceipt,
    DeliveryResult, FaultKind, SendReceipt,
};
pub use batch::{BatchStatus, NotificationBatch};
pub use channel::DeliveryChannel;
pub use contact::{AvailabilityWindow, Capability, Contact, ContactChannel, PermissionLevel};
pub use escalation::{EscalationLink, EscalationReason};
pub use notification::{
    AckResponse, Acknowledgment, NewNotification, Notification, NotificationPriority,
    NotificationStatus,
};
pub use risk::{GeoPoint, RiskEvent, RiskKind, Severity};
pub use template::{ChannelTemplate, NotificationTemplate};
