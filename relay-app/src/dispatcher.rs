//! Per-message orchestration: validate, admit, rate-limit, sanitize, invoke,
//! chunk, reply.
//!
//! Check order is fixed: the concurrency gate runs before the cooldown, so a
//! request refused for capacity never reserves a cooldown slot.

use crate::admission::{Admission, ConcurrencyGate};
use crate::chunking;
use crate::cooldown::{CooldownDecision, CooldownTracker};
use relay_assistant::{AssistantError, AssistantInvoker, ErrorCategory, Provenance, sanitize};
use relay_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use std::sync::Arc;

pub const BUSY_NOTICE: &str =
    "🚦 I'm handling too many requests right now. Please try again in a moment.";
pub const INVALID_NOTICE: &str = "❌ Invalid message. Please send some plain text.";
const EMPTY_NOTICE: &str = "❌ Please include a message.";
const ATTACHMENTS_NOTICE: &str =
    "❌ File attachments aren't supported. Please paste the text instead.";
const NOT_FOUND_NOTICE: &str =
    "❌ Claude CLI not found. Make sure it is installed and on the PATH of the bot process.";

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub max_message_chars: usize,
    pub chunk_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    TooLong { chars: usize, max: usize },
    HasAttachments,
}

impl ValidationError {
    fn notice(&self) -> String {
        match self {
            Self::Empty => EMPTY_NOTICE.to_string(),
            Self::TooLong { chars, max } => format!(
                "❌ Message too long ({chars} characters). Please keep it under {max}."
            ),
            Self::HasAttachments => ATTACHMENTS_NOTICE.to_string(),
        }
    }
}

/// Which branch a dispatch took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Rejected(ValidationError),
    Busy,
    CoolingDown { retry_after_secs: u64 },
    InvalidInput,
    Replied { provenance: Provenance, chunks: usize },
    Failed(ErrorCategory),
}

pub struct Dispatcher {
    gate: Arc<ConcurrencyGate>,
    cooldowns: Arc<CooldownTracker>,
    invoker: Arc<AssistantInvoker>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        gate: Arc<ConcurrencyGate>,
        cooldowns: Arc<CooldownTracker>,
        invoker: Arc<AssistantInvoker>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            gate,
            cooldowns,
            invoker,
            settings,
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            channel_id = %inbound.channel_id,
            sender_id = %inbound.sender_id,
            message_id = %inbound.message_id
        )
    )]
    pub async fn handle(
        &self,
        channel: &dyn ChannelAdapter,
        inbound: &InboundMessage,
    ) -> DispatchOutcome {
        if let Err(rejection) = validate(inbound, self.settings.max_message_chars) {
            tracing::info!(?rejection, "inbound message rejected");
            self.notify(channel, inbound, rejection.notice()).await;
            return DispatchOutcome::Rejected(rejection);
        }

        let permit = match self.gate.try_admit() {
            Admission::Admitted(permit) => permit,
            Admission::Refused => {
                self.notify(channel, inbound, BUSY_NOTICE.to_string()).await;
                return DispatchOutcome::Busy;
            }
        };

        if let CooldownDecision::Denied { retry_after_secs } =
            self.cooldowns.check_and_reserve(&inbound.sender_id)
        {
            permit.release();
            tracing::info!(retry_after_secs, "sender is cooling down");
            self.notify(
                channel,
                inbound,
                format!("⏳ Please wait {retry_after_secs}s..."),
            )
            .await;
            return DispatchOutcome::CoolingDown { retry_after_secs };
        }

        let prompt = match sanitize(&inbound.content) {
            Ok(prompt) => prompt,
            Err(e) => {
                permit.release();
                tracing::info!(%e, "inbound message failed sanitization");
                self.notify(channel, inbound, INVALID_NOTICE.to_string()).await;
                return DispatchOutcome::InvalidInput;
            }
        };

        tracing::info!(
            invocation = %permit.token(),
            in_flight = self.gate.in_flight(),
            max_concurrent = self.gate.max_concurrent(),
            prompt_chars = prompt.char_count(),
            "invoking assistant"
        );
        self.show_typing(channel, inbound).await;

        // `permit` stays alive until the reply or diagnostic has been sent.
        let outcome = match self.invoker.invoke(&prompt).await {
            Ok(reply) => {
                let chunks = chunking::chunk(&reply.text, self.settings.chunk_limit);
                let sent = self.send_chunks(channel, inbound, chunks).await;
                DispatchOutcome::Replied {
                    provenance: reply.provenance,
                    chunks: sent,
                }
            }
            Err(e) => {
                let category = e.category();
                tracing::warn!(error = %e, ?category, "assistant invocation failed");
                self.notify(channel, inbound, failure_notice(&e)).await;
                DispatchOutcome::Failed(category)
            }
        };
        drop(permit);
        outcome
    }

    async fn send_chunks(
        &self,
        channel: &dyn ChannelAdapter,
        inbound: &InboundMessage,
        chunks: Vec<String>,
    ) -> usize {
        let total = chunks.len();
        let mut sent = 0;
        for (idx, body) in chunks.into_iter().enumerate() {
            let message = if idx == 0 {
                OutboundMessage::reply(body, &inbound.message_id)
            } else {
                OutboundMessage::plain(body)
            };
            if let Err(e) = channel.send(inbound.reply_target(), message).await {
                tracing::warn!(%e, chunk = idx + 1, total, "failed to send reply chunk");
                break;
            }
            sent += 1;
        }
        sent
    }

    async fn notify(&self, channel: &dyn ChannelAdapter, inbound: &InboundMessage, notice: String) {
        let message = OutboundMessage::reply(notice, &inbound.message_id);
        if let Err(e) = channel.send(inbound.reply_target(), message).await {
            tracing::warn!(%e, "failed to send notice");
        }
    }

    async fn show_typing(&self, channel: &dyn ChannelAdapter, inbound: &InboundMessage) {
        if !channel.supports_typing_events() {
            return;
        }
        if let Err(e) = channel.send_typing(inbound.reply_target()).await {
            tracing::debug!(%e, "typing indicator failed");
        }
    }
}

/// Attachments are checked first so a file-only message gets the more useful
/// notice.
fn validate(inbound: &InboundMessage, max_chars: usize) -> Result<(), ValidationError> {
    if inbound.has_attachments() {
        return Err(ValidationError::HasAttachments);
    }
    if inbound.content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let chars = inbound.content.chars().count();
    if chars > max_chars {
        return Err(ValidationError::TooLong {
            chars,
            max: max_chars,
        });
    }
    Ok(())
}

fn failure_notice(e: &AssistantError) -> String {
    match e.category() {
        ErrorCategory::Timeout => {
            let secs = match e {
                AssistantError::Timeout(after) => after.as_secs().max(1),
                _ => 1,
            };
            format!(
                "⏱️ Claude didn't answer within {secs}s. The assistant may just be slow right now, \
                 or the CLI may have hung (a known issue). Please try again."
            )
        }
        ErrorCategory::NotFound => NOT_FOUND_NOTICE.to_string(),
        ErrorCategory::ProcessError => format!("❌ Claude exited with an error: {e}"),
        ErrorCategory::Generic => format!("❌ Sorry, something went wrong: {e}"),
    }
}
