//! Channel senders.
//!
//! A sender attempts delivery of one rendered message to one address and
//! reports either a provider receipt or a classified fault. Senders are
//! stateless and shared across tasks.

mod log;
mod router;
mod webhook;

pub use log::LogSender;
pub use router::ChannelRouter;
pub use webhook::{WebhookAuth, WebhookConfig, WebhookSender};

use async_trait::async_trait;

use super::template::RenderedMessage;
use crate::domain::{DeliveryChannel, DeliveryFault, SendReceipt};

/// Transport for one or more delivery channels.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Attempt delivery of `message` to `address` over `channel`.
    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        message: &RenderedMessage,
    ) -> std::result::Result<SendReceipt, DeliveryFault>;
}
