//! Delivery channels.

use serde::{Deserialize, Serialize};

/// A transport a notification can be delivered over.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryChannel {
    Sms,
    Push,
    Email,
    Voice,
    InApp,
}

impl DeliveryChannel {
    pub const ALL: [DeliveryChannel; 5] = [
        Self::Push,
        Self::Sms,
        Self::Voice,
        Self::Email,
        Self::InApp,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "SMS",
            Self::Push => "PUSH",
            Self::Email => "EMAIL",
            Self::Voice => "VOICE",
            Self::InApp => "IN_APP",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SMS" => Some(Self::Sms),
            "PUSH" => Some(Self::Push),
            "EMAIL" => Some(Self::Email),
            "VOICE" => Some(Self::Voice),
            "IN_APP" => Some(Self::InApp),
            _ => None,
        }
    }

    /// Whether rendered content for this channel should be kept short.
    pub fn is_short_form(&self) -> bool {
        matches!(self, Self::Sms | Self::Push | Self::Voice)
    }
}
