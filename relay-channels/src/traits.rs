use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "discord".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a message to a specific conversation on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Show a typing indicator where supported.
    async fn send_typing(&self, _recipient_id: &str) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    fn supports_typing_events(&self) -> bool {
        false
    }
}
