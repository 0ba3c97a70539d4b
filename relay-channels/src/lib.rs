//! Chat platform adapters for the relay.
//!
//! Adapters are pure I/O: they turn platform events into `InboundMessage`
//! and deliver `OutboundMessage` back to the platform.

mod discord;
mod traits;
mod types;

pub use discord::DiscordAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    Attachment, ChannelId, InboundMessage, MessageId, OutboundMessage, SenderId, ThreadId,
};
