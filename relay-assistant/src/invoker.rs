//! Dual-path invocation: SDK first, CLI as the safety net.

use crate::cli::CliInvoker;
use crate::error::Result;
use crate::sanitize::SanitizedMessage;
use crate::sdk::{AssistantSdk, SdkEvent, SdkRequest};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Sdk,
    Cli,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sdk => "sdk",
            Self::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantReply {
    pub text: String,
    pub provenance: Provenance,
}

/// Result of the SDK attempt. Everything except `Success` sends the call
/// down the CLI path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkOutcome {
    Unavailable,
    Success(String),
    EmptyResult,
    Error(String),
    TimedOut,
}

pub struct AssistantInvoker {
    sdk: Option<Arc<dyn AssistantSdk>>,
    sdk_timeout: Duration,
    cli: CliInvoker,
}

impl AssistantInvoker {
    pub fn new(sdk: Option<Arc<dyn AssistantSdk>>, sdk_timeout: Duration, cli: CliInvoker) -> Self {
        Self {
            sdk,
            sdk_timeout,
            cli,
        }
    }

    pub fn sdk_available(&self) -> bool {
        self.sdk.is_some()
    }

    pub fn cli(&self) -> &CliInvoker {
        &self.cli
    }

    #[tracing::instrument(level = "info", skip_all, fields(prompt_chars = prompt.char_count()))]
    pub async fn invoke(&self, prompt: &SanitizedMessage) -> Result<AssistantReply> {
        let started = Instant::now();
        match self.attempt_sdk(prompt).await {
            SdkOutcome::Success(text) => {
                tracing::info!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    reply_chars = text.chars().count(),
                    "assistant replied via sdk"
                );
                return Ok(AssistantReply {
                    text,
                    provenance: Provenance::Sdk,
                });
            }
            SdkOutcome::Unavailable => {
                tracing::debug!("sdk unavailable; using cli");
            }
            SdkOutcome::EmptyResult => {
                tracing::warn!("sdk returned an empty result; falling back to cli");
            }
            SdkOutcome::Error(e) => {
                tracing::warn!(error = %e, "sdk call failed; falling back to cli");
            }
            SdkOutcome::TimedOut => {
                tracing::warn!(
                    timeout_ms = self.sdk_timeout.as_millis() as u64,
                    "sdk timed out; falling back to cli"
                );
            }
        }

        let text = self.cli.invoke(prompt).await?;
        tracing::info!(
            latency_ms = started.elapsed().as_millis() as u64,
            reply_chars = text.chars().count(),
            "assistant replied via cli"
        );
        Ok(AssistantReply {
            text,
            provenance: Provenance::Cli,
        })
    }

    pub async fn attempt_sdk(&self, prompt: &SanitizedMessage) -> SdkOutcome {
        let Some(sdk) = self.sdk.as_ref() else {
            return SdkOutcome::Unavailable;
        };
        let request = SdkRequest {
            prompt: prompt.to_string(),
            timeout_ms: self.sdk_timeout.as_millis() as u64,
        };

        let attempt = async {
            let mut events = match sdk.query(request).await {
                Ok(events) => events,
                Err(e) => return SdkOutcome::Error(e.to_string()),
            };
            while let Some(event) = events.next().await {
                match event {
                    Ok(SdkEvent::Result {
                        result,
                        is_error: false,
                    }) => {
                        if result.trim().is_empty() {
                            return SdkOutcome::EmptyResult;
                        }
                        return SdkOutcome::Success(result);
                    }
                    Ok(SdkEvent::Result {
                        result,
                        is_error: true,
                    }) => return SdkOutcome::Error(result),
                    Ok(other) => {
                        tracing::trace!(sdk = sdk.name(), event = ?other, "ignoring sdk event");
                    }
                    Err(e) => return SdkOutcome::Error(e.to_string()),
                }
            }
            SdkOutcome::EmptyResult
        };

        match tokio::time::timeout(self.sdk_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => SdkOutcome::TimedOut,
        }
    }
}
