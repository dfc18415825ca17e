use crate::types::{InboundEvent, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Platform identifier: "discord", "feishu".
    fn platform(&self) -> &str;

    /// Start receiving events. Push to tx for each decoded event.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Deliver plain text to a conversation. Escaping and length limits are handled here.
    async fn send(&self, conversation_id: &str, message: OutboundMessage) -> Result<()>;

    /// Show a typing indicator where the platform has one.
    async fn send_typing(&self, _conversation_id: &str) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    fn supports_typing_events(&self) -> bool {
        false
    }
}
