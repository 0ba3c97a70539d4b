//! In-process assistant path.
//!
//! An [`AssistantSdk`] turns a prompt into a stream of typed events. The
//! invoker only consumes the `Result` event; everything else is progress
//! noise that is logged and dropped.

use crate::error::SdkError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

const MESSAGES_API_URL: &str = "https://api.anthropic.com/v1/messages";
const MESSAGES_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkRequest {
    pub prompt: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkEvent {
    System { subtype: String },
    Assistant { text: String },
    Result { result: String, is_error: bool },
}

pub type SdkEventStream =
    Pin<Box<dyn Stream<Item = std::result::Result<SdkEvent, SdkError>> + Send>>;

#[async_trait]
pub trait AssistantSdk: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    async fn query(&self, request: SdkRequest) -> std::result::Result<SdkEventStream, SdkError>;
}

/// Streaming client for the hosted Messages API.
#[derive(Clone)]
pub struct MessagesApiSdk {
    http: reqwest::Client,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
}

impl MessagesApiSdk {
    pub fn new(api_key: &str, model: &str) -> std::result::Result<Self, SdkError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            system_prompt: None,
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt.filter(|s| !s.trim().is_empty());
        self
    }
}

#[async_trait]
impl AssistantSdk for MessagesApiSdk {
    fn name(&self) -> &str {
        "messages_api"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn query(&self, request: SdkRequest) -> std::result::Result<SdkEventStream, SdkError> {
        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system: self.system_prompt.clone(),
            messages: vec![MessagesTurn {
                role: "user",
                content: request.prompt,
            }],
            stream: true,
        };

        let response = self
            .http
            .post(MESSAGES_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", MESSAGES_API_VERSION)
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::Http(format!(
                "messages stream status={status} body={body}"
            )));
        }

        Ok(Box::pin(sdk_events(decode_sse(response.bytes_stream()))))
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<MessagesTurn>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct MessagesTurn {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamErrorEvent {
    error: StreamErrorBody,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: String,
}

/// Folds raw SSE frames into [`SdkEvent`]s, accumulating text so that a
/// single `Result` carrying the whole answer is emitted at `message_stop`.
fn sdk_events<S>(sse: S) -> impl Stream<Item = std::result::Result<SdkEvent, SdkError>> + Send
where
    S: Stream<Item = std::result::Result<SseItem, SdkError>> + Send + 'static,
{
    let sse = Box::pin(sse);
    futures_util::stream::unfold(
        (sse, String::new(), false),
        |(mut sse, mut text, done)| async move {
            if done {
                return None;
            }
            loop {
                let (event_name, data) = match sse.as_mut().next().await? {
                    Ok(v) => v,
                    Err(e) => return Some((Err(e), (sse, text, true))),
                };
                match event_name.as_str() {
                    "message_start" => {
                        let event = SdkEvent::System {
                            subtype: "message_start".to_string(),
                        };
                        return Some((Ok(event), (sse, text, false)));
                    }
                    "content_block_delta" => {
                        let v: ContentBlockDelta = match serde_json::from_str(&data) {
                            Ok(v) => v,
                            Err(e) => {
                                let err = SdkError::StreamParse(format!(
                                    "delta json error={e} data={data}"
                                ));
                                return Some((Err(err), (sse, text, true)));
                            }
                        };
                        if let Delta::TextDelta { text: delta } = v.delta {
                            if !delta.is_empty() {
                                text.push_str(&delta);
                                let event = SdkEvent::Assistant { text: delta };
                                return Some((Ok(event), (sse, text, false)));
                            }
                        }
                    }
                    "message_stop" => {
                        let event = SdkEvent::Result {
                            result: text.clone(),
                            is_error: false,
                        };
                        return Some((Ok(event), (sse, text, true)));
                    }
                    "error" => {
                        let message = serde_json::from_str::<StreamErrorEvent>(&data)
                            .map(|e| e.error.message)
                            .unwrap_or(data);
                        let event = SdkEvent::Result {
                            result: message,
                            is_error: true,
                        };
                        return Some((Ok(event), (sse, text, true)));
                    }
                    _ => {}
                }
            }
        },
    )
}

type SseItem = (String, String);

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = std::result::Result<SseItem, SdkError>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(item) = take_sse_frame(&mut buffer) {
                    return Some((Ok(item), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(SdkError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

/// Pops the next complete `event:`/`data:` frame off the buffer, skipping
/// frames that carry neither. Bytes are only decoded once a whole frame has
/// arrived, so a character split across network chunks stays intact.
fn take_sse_frame(buffer: &mut Vec<u8>) -> Option<SseItem> {
    while let Some(idx) = buffer.windows(2).position(|w| w == b"\n\n") {
        let frame: Vec<u8> = buffer.drain(..idx + 2).collect();
        let raw = String::from_utf8_lossy(&frame[..idx]);

        let mut event = String::new();
        let mut data_lines = Vec::new();
        for line in raw.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim_start().to_string();
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }

        let data = data_lines.join("\n");
        if event.is_empty() && data.is_empty() {
            continue;
        }
        if event.is_empty() {
            event = "message".to_string();
        }
        return Some((event, data));
    }
    None
}
