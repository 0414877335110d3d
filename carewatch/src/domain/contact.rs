//! Read-only view of caregiver contacts, as provided by the contact directory.

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::channel::DeliveryChannel;

/// What a contact must be allowed to do to be considered eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Routine safety alerts (LOW/MEDIUM).
    ReceiveAlerts,
    /// Emergency alerts (HIGH/CRITICAL).
    ReceiveEmergencyAlerts,
}

/// Permission level a guardian holds for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    /// Can view status but is never paged.
    Observer,
    /// Receives routine alerts.
    Caregiver,
    /// Receives every alert, including emergencies.
    Guardian,
}

impl PermissionLevel {
    pub fn grants(&self, capability: Capability) -> bool {
        match (self, capability) {
            (Self::Observer, _) => false,
            (Self::Caregiver, Capability::ReceiveAlerts) => true,
            (Self::Caregiver, Capability::ReceiveEmergencyAlerts) => false,
            (Self::Guardian, _) => true,
        }
    }
}

/// Recurring window during which a contact accepts notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Days the window applies to. Empty means every day.
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

fn default_timezone() -> Tz {
    Tz::UTC
}

impl AvailabilityWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            days: Vec::new(),
            timezone: Tz::UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        let time = local.time();

        if self.start <= self.end {
            // Same-day range (e.g. 08:00 - 20:00)
            self.day_matches(local.weekday()) && time >= self.start && time <= self.end
        } else if time >= self.start {
            // Overnight range (e.g. 22:00 - 06:00), evening part
            self.day_matches(local.weekday())
        } else if time <= self.end {
            // Morning part belongs to the window that opened the previous day
            self.day_matches(local.weekday().pred())
        } else {
            false
        }
    }

    fn day_matches(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }
}

/// Address of a contact on a specific channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactChannel {
    pub channel: DeliveryChannel,
    pub address: String,
}

/// A caregiver who can be notified about a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    /// Lower value means contacted first.
    pub priority: u32,
    #[serde(default)]
    pub availability: Option<AvailabilityWindow>,
    pub permission_level: PermissionLevel,
    pub preferred_channel: DeliveryChannel,
    #[serde(default)]
    pub channels: Vec<ContactChannel>,
}

impl Contact {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: u32,
        preferred_channel: DeliveryChannel,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            availability: None,
            permission_level: PermissionLevel::Guardian,
            preferred_channel,
            channels: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: DeliveryChannel, address: impl Into<String>) -> Self {
        self.channels.push(ContactChannel {
            channel,
            address: address.into(),
        });
        self
    }

    pub fn with_availability(mut self, window: AvailabilityWindow) -> Self {
        self.availability = Some(window);
        self
    }

    pub fn with_permission(mut self, level: PermissionLevel) -> Self {
        self.permission_level = level;
        self
    }

    /// A contact without a window is always available.
    pub fn is_available_at(&self, at: DateTime<Utc>) -> bool {
        self.availability
            .as_ref()
            .is_none_or(|window| window.contains(at))
    }

    pub fn address_for(&self, channel: DeliveryChannel) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.channel == channel && !c.address.trim().is_empty())
            .map(|c| c.address.as_str())
    }

    /// Reachable channels, preferred channel first, then in declaration order.
    pub fn channel_order(&self) -> Vec<DeliveryChannel> {
        let mut order = Vec::with_capacity(self.channels.len());
        if self.address_for(self.preferred_channel).is_some() {
            order.push(self.preferred_channel);
        }
        for entry in &self.channels {
            if entry.address.trim().is_empty() || order.contains(&entry.channel) {
                continue;
            }
            order.push(entry.channel);
        }
        order
    }
}
