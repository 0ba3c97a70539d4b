use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(SenderId);
id_newtype!(ThreadId);

/// File attached to an inbound message. Only its presence matters to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub url: String,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    /// Adapter that produced the message, e.g. "discord".
    pub channel_id: ChannelId,
    pub sender_id: SenderId,
    /// Platform conversation the reply goes back to (a Discord text channel).
    pub thread_id: Option<ThreadId>,
    pub is_group: bool,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Where replies for this message are addressed.
    pub fn reply_target(&self) -> &str {
        self.thread_id
            .as_deref()
            .unwrap_or(self.sender_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}

impl OutboundMessage {
    pub fn reply(content: impl Into<String>, to: &MessageId) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: Some(to.clone()),
        }
    }

    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: None,
        }
    }
}
