//! Log-only sender for dry runs.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::ChannelSender;
use crate::domain::{DeliveryChannel, DeliveryFault, SendReceipt};
use crate::notification::template::RenderedMessage;

/// Logs every message and reports it as sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl ChannelSender for LogSender {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        message: &RenderedMessage,
    ) -> std::result::Result<SendReceipt, DeliveryFault> {
        let external_message_id = format!("log-{}", Uuid::new_v4());
        info!(
            channel = %channel,
            address,
            message_id = %external_message_id,
            title = %message.title,
            "Dry-run delivery: {}",
            message.body
        );
        Ok(SendReceipt {
            external_message_id: Some(external_message_id),
            provider_response_code: None,
        })
    }
}
