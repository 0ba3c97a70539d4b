use crate::traits::ChannelAdapter;
use crate::types::{Attachment, InboundMessage, OutboundMessage};
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;

const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
/// GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT.
const DISCORD_DEFAULT_INTENTS: u64 = (1 << 9) | (1 << 12) | (1 << 15);
const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const RECONNECT_MAX_DELAY_MS: u64 = 60_000;

#[derive(Clone)]
pub struct DiscordAdapter {
    http: reqwest::Client,
    bot_token: String,
    require_mention_in_group_chats: bool,
    allowed_channel_ids: Vec<String>,
}

impl DiscordAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            require_mention_in_group_chats: true,
            allowed_channel_ids: Vec::new(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("https://discord.com/api/v10{path}")
    }

    pub fn with_require_mention_in_group_chats(
        mut self,
        require_mention_in_group_chats: bool,
    ) -> Self {
        self.require_mention_in_group_chats = require_mention_in_group_chats;
        self
    }

    /// Restrict inbound traffic to these channel ids. Empty means all channels.
    pub fn with_allowed_channel_ids(mut self, allowed_channel_ids: Vec<String>) -> Self {
        self.allowed_channel_ids = allowed_channel_ids;
        self
    }

    fn filter(&self) -> InboundFilter<'_> {
        InboundFilter {
            require_mention_in_group_chats: self.require_mention_in_group_chats,
            allowed_channel_ids: &self.allowed_channel_ids,
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel_id(&self) -> &str {
        "discord"
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.run_gateway_loop(tx).await;
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let url = self.api_url(&format!("/channels/{recipient_id}/messages"));
        let mut body = serde_json::json!({ "content": message.content });
        if let Some(reply_to) = message.reply_to_message_id.as_ref() {
            body["message_reference"] = serde_json::json!({
                "message_id": reply_to.as_str(),
                "fail_if_not_exists": false,
            });
        }
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "discord send failed: status={status} body={text}"
            ));
        }
        Ok(())
    }

    async fn send_typing(&self, recipient_id: &str) -> Result<()> {
        let url = self.api_url(&format!("/channels/{recipient_id}/typing"));
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .header("Content-Length", "0")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "discord typing failed: status={}",
                resp.status()
            ));
        }
        Ok(())
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}

impl DiscordAdapter {
    async fn run_gateway_loop(&self, tx: mpsc::Sender<InboundMessage>) {
        let mut attempt: u32 = 0;
        loop {
            match self.run_gateway_once(&tx).await {
                Ok(()) => {
                    tracing::info!("discord inbound queue closed; gateway loop stopping");
                    return;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = reconnect_delay(attempt);
                    tracing::warn!(
                        %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "discord gateway disconnected; reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            if tx.is_closed() {
                return;
            }
        }
    }

    /// Runs one gateway session. `Ok` means the inbound queue closed and the
    /// adapter should stop; any `Err` is a reason to reconnect.
    async fn run_gateway_once(&self, tx: &mpsc::Sender<InboundMessage>) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(DISCORD_GATEWAY_URL).await?;
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        // HELLO.
        let heartbeat_interval_ms: u64 = if let Some(msg) = read.next().await {
            let msg = msg?;
            let v: serde_json::Value = serde_json::from_str(msg.to_text()?)?;
            v.get("d")
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|x| x.as_u64())
                .ok_or_else(|| anyhow::anyhow!("discord HELLO missing heartbeat_interval"))?
        } else {
            return Err(anyhow::anyhow!("discord gateway closed before HELLO"));
        };

        // IDENTIFY.
        let identify = serde_json::json!({
            "op": 2,
            "d": {
                "token": format!("Bot {}", self.bot_token),
                "intents": DISCORD_DEFAULT_INTENTS,
                "properties": { "os": "linux", "browser": "claude-relay", "device": "claude-relay" }
            }
        });
        write
            .lock()
            .await
            .send(Message::Text(identify.to_string().into()))
            .await?;

        let seq: Arc<RwLock<Option<i64>>> = Arc::new(RwLock::new(None));
        let mut bot_user_id: Option<String> = None;

        let _heartbeat = {
            let write = write.clone();
            let seq = seq.clone();
            AbortOnDrop(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
                loop {
                    interval.tick().await;
                    let s = *seq.read().await;
                    let payload = serde_json::json!({ "op": 1, "d": s });
                    if write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }))
        };

        while let Some(msg) = read.next().await {
            let msg = msg?;
            if msg.is_close() {
                return Err(anyhow::anyhow!("discord gateway sent close frame"));
            }
            let txt = msg.to_text()?;
            let v: serde_json::Value = serde_json::from_str(txt)?;

            if let Some(s) = v.get("s").and_then(|s| s.as_i64()) {
                *seq.write().await = Some(s);
            }

            let op = v
                .get("op")
                .and_then(|o| o.as_i64())
                .ok_or_else(|| anyhow::anyhow!("discord payload missing op"))?;
            match op {
                // Heartbeat ACK.
                11 => continue,
                // Heartbeat request.
                1 => {
                    let s = *seq.read().await;
                    let payload = serde_json::json!({ "op": 1, "d": s });
                    write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await?;
                    continue;
                }
                7 => return Err(anyhow::anyhow!("discord requested reconnect")),
                9 => return Err(anyhow::anyhow!("discord invalidated the session")),
                _ => {}
            }

            match v.get("t").and_then(|t| t.as_str()) {
                Some("READY") => {
                    bot_user_id = v
                        .get("d")
                        .and_then(|d| d.get("user"))
                        .and_then(|u| u.get("id"))
                        .and_then(|id| id.as_str())
                        .map(|s| s.to_string());
                    tracing::info!(bot_user_id = ?bot_user_id, "discord gateway ready");
                }
                Some("MESSAGE_CREATE") => {
                    let event_payload = v
                        .get("d")
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("discord MESSAGE_CREATE missing payload"))?;
                    let event: DiscordMessageCreate = match serde_json::from_value(event_payload) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(%e, "skipping undecodable discord MESSAGE_CREATE");
                            continue;
                        }
                    };
                    let Some(inbound) =
                        build_inbound_message(event, bot_user_id.as_deref(), &self.filter())?
                    else {
                        continue;
                    };
                    if tx.send(inbound).await.is_err() {
                        return Ok(());
                    }
                }
                Some(_) | None => {}
            }
        }

        Err(anyhow::anyhow!("discord gateway stream ended unexpectedly"))
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct InboundFilter<'a> {
    require_mention_in_group_chats: bool,
    allowed_channel_ids: &'a [String],
}

fn build_inbound_message(
    event: DiscordMessageCreate,
    bot_user_id: Option<&str>,
    filter: &InboundFilter<'_>,
) -> Result<Option<InboundMessage>> {
    if event.author.bot {
        return Ok(None);
    }
    if !filter.allowed_channel_ids.is_empty()
        && !filter
            .allowed_channel_ids
            .iter()
            .any(|id| id == &event.channel_id)
    {
        return Ok(None);
    }

    let is_group = event.guild_id.is_some();
    let mut content = event.content.clone();
    if let Some(bot_id) = bot_user_id {
        let mention1 = format!("<@{bot_id}>");
        let mention2 = format!("<@!{bot_id}>");
        let mentioned = content.contains(&mention1) || content.contains(&mention2);
        if is_group && filter.require_mention_in_group_chats && !mentioned {
            return Ok(None);
        }
        content = content.replace(&mention1, "").replace(&mention2, "");
    }

    let attachments = event
        .attachments
        .iter()
        .map(|a| Attachment {
            name: a.filename.clone(),
            content_type: a.content_type.clone(),
            url: a.url.clone(),
            size_bytes: a.size,
        })
        .collect();
    let metadata = serde_json::to_value(&event)?;
    Ok(Some(InboundMessage {
        message_id: event.id.into(),
        channel_id: "discord".into(),
        sender_id: event.author.id.into(),
        thread_id: Some(event.channel_id.into()),
        is_group,
        content: content.trim().to_string(),
        attachments,
        metadata,
        received_at: Utc::now(),
    }))
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = RECONNECT_BASE_DELAY_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(RECONNECT_MAX_DELAY_MS))
}

#[derive(Debug, Deserialize, Serialize)]
struct DiscordMessageCreate {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    content: String,
    author: DiscordAuthor,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize, Serialize)]
struct DiscordAuthor {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct DiscordAttachment {
    filename: String,
    url: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: u64,
}

#[cfg(test)]
mod tests {
    use super::{DiscordMessageCreate, InboundFilter, build_inbound_message, reconnect_delay};

    fn event(json: serde_json::Value) -> DiscordMessageCreate {
        serde_json::from_value(json).expect("valid MESSAGE_CREATE payload")
    }

    fn open_filter() -> InboundFilter<'static> {
        InboundFilter {
            require_mention_in_group_chats: true,
            allowed_channel_ids: &[],
        }
    }

    #[test]
    fn reconnect_delay_grows_exponentially_and_caps() {
        assert_eq!(reconnect_delay(1).as_millis(), 1_000);
        assert_eq!(reconnect_delay(2).as_millis(), 2_000);
        assert_eq!(reconnect_delay(4).as_millis(), 8_000);
        assert_eq!(reconnect_delay(30).as_millis(), 60_000);
    }

    #[test]
    fn bot_authors_are_ignored() {
        let e = event(serde_json::json!({
            "id": "1", "channel_id": "c", "content": "hi",
            "author": { "id": "u", "bot": true }
        }));
        assert!(build_inbound_message(e, None, &open_filter()).unwrap().is_none());
    }

    #[test]
    fn guild_messages_require_mention_and_mention_is_stripped() {
        let without = event(serde_json::json!({
            "id": "1", "channel_id": "c", "guild_id": "g", "content": "hi",
            "author": { "id": "u" }
        }));
        assert!(
            build_inbound_message(without, Some("42"), &open_filter())
                .unwrap()
                .is_none()
        );

        let with = event(serde_json::json!({
            "id": "2", "channel_id": "c", "guild_id": "g", "content": "<@42> explain traits",
            "author": { "id": "u" }
        }));
        let inbound = build_inbound_message(with, Some("42"), &open_filter())
            .unwrap()
            .expect("mentioned message is relayed");
        assert_eq!(inbound.content, "explain traits");
        assert!(inbound.is_group);
        assert_eq!(inbound.reply_target(), "c");
        assert_eq!(inbound.sender_id.as_str(), "u");
    }

    #[test]
    fn attachments_and_channel_allowlist_are_applied() {
        let payload = serde_json::json!({
            "id": "3", "channel_id": "allowed", "content": "see file",
            "author": { "id": "u" },
            "attachments": [{ "filename": "a.txt", "url": "https://cdn/a.txt", "size": 12 }]
        });
        let allowed = vec!["allowed".to_string()];
        let filter = InboundFilter {
            require_mention_in_group_chats: true,
            allowed_channel_ids: &allowed,
        };
        let inbound = build_inbound_message(event(payload), None, &filter)
            .unwrap()
            .expect("dm in allowed channel is relayed");
        assert!(inbound.has_attachments());
        assert_eq!(inbound.attachments[0].name, "a.txt");

        let elsewhere = event(serde_json::json!({
            "id": "4", "channel_id": "other", "content": "hi",
            "author": { "id": "u" }
        }));
        assert!(build_inbound_message(elsewhere, None, &filter).unwrap().is_none());
    }
}
