//! Fakes shared by the dispatcher and gateway tests.

use async_trait::async_trait;
use chrono::Utc;
use relay_assistant::{AssistantSdk, SdkError, SdkEvent, SdkEventStream, SdkRequest};
use relay_channels::{ChannelAdapter, InboundMessage, MessageId, OutboundMessage, SenderId};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};

pub struct RecordingChannel {
    id: String,
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    pub sent_notify: Notify,
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self::named("test")
    }
}

impl RecordingChannel {
    pub fn named(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
        }
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, m)| m.content).collect()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient_id.to_string(), message));
        self.sent_notify.notify_one();
        Ok(())
    }
}

/// Answers every query with one `Result` event carrying `answer`.
pub struct ScriptedSdk {
    answer: String,
    calls: AtomicUsize,
}

impl ScriptedSdk {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssistantSdk for ScriptedSdk {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn query(&self, _request: SdkRequest) -> Result<SdkEventStream, SdkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let events = vec![Ok::<SdkEvent, SdkError>(SdkEvent::Result {
            result: self.answer.clone(),
            is_error: false,
        })];
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

pub fn message(id: &str, sender: &str, content: &str) -> InboundMessage {
    InboundMessage {
        message_id: MessageId::new(id),
        channel_id: "test".into(),
        sender_id: SenderId::new(sender),
        thread_id: Some("room-1".into()),
        is_group: false,
        content: content.to_string(),
        attachments: vec![],
        metadata: serde_json::Value::Null,
        received_at: Utc::now(),
    }
}
