//! Per-channel routing of sends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::ChannelSender;
use crate::domain::{DeliveryChannel, DeliveryFault, SendReceipt};
use crate::notification::template::RenderedMessage;

/// Dispatches each channel to the sender registered for it.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    routes: HashMap<DeliveryChannel, Arc<dyn ChannelSender>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, channel: DeliveryChannel, sender: Arc<dyn ChannelSender>) -> Self {
        self.routes.insert(channel, sender);
        self
    }

    /// Register `sender` for every channel.
    pub fn route_all(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        for channel in DeliveryChannel::ALL {
            self.routes.insert(channel, sender.clone());
        }
        self
    }

    pub fn is_routed(&self, channel: DeliveryChannel) -> bool {
        self.routes.contains_key(&channel)
    }
}

#[async_trait]
impl ChannelSender for ChannelRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        message: &RenderedMessage,
    ) -> std::result::Result<SendReceipt, DeliveryFault> {
        let Some(sender) = self.routes.get(&channel) else {
            return Err(DeliveryFault::permanent(format!("no sender configured for {}", channel))
                .with_code("UNROUTED"));
        };
        debug!(channel = %channel, sender = sender.name(), "Routing delivery");
        sender.send(channel, address, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FaultKind;
    use crate::notification::channels::LogSender;

    #[tokio::test]
    async fn test_unrouted_channel_is_permanent_fault() {
        let router = ChannelRouter::new().route(DeliveryChannel::Push, Arc::new(LogSender));
        assert!(router.is_routed(DeliveryChannel::Push));

        let ok = router
            .send(DeliveryChannel::Push, "token", &RenderedMessage::new("t", "b"))
            .await;
        assert!(ok.is_ok());

        let fault = router
            .send(DeliveryChannel::Voice, "+1555", &RenderedMessage::new("t", "b"))
            .await
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::Permanent);
        assert_eq!(fault.code.as_deref(), Some("UNROUTED"));
    }
}
