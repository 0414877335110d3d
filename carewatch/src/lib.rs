//! carewatch: safety-event escalation and multi-channel notification delivery.
//!
//! Risk signals from the monitoring side are normalized into [`domain::RiskEvent`]s
//! and handed to the [`notification::NotificationOrchestrator`], which notifies
//! caregivers, retries and escalates until someone acknowledges.

pub mod clock;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod http;
pub mod logging;
pub mod notification;

pub use error::{Error, Result};
