use crate::text::split_message;
use crate::traits::ChannelAdapter;
use crate::types::{InboundEvent, InboundMessage, OutboundMessage};
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;

const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
/// GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT.
const DISCORD_GATEWAY_INTENTS: u64 = (1 << 9) | (1 << 12) | (1 << 15);
const DISCORD_MAX_MESSAGE_CHARS: usize = 2000;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DiscordAdapter {
    http: reqwest::Client,
    bot_token: String,
    require_mention_in_group_chats: bool,
    command_prefix: String,
}

impl DiscordAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let token = bot_token.trim();
        if token.is_empty() {
            return Err(anyhow::anyhow!("discord bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: token.to_string(),
            require_mention_in_group_chats: true,
            command_prefix: "!".to_string(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{DISCORD_API_BASE}{path}")
    }

    pub fn with_require_mention_in_group_chats(
        mut self,
        require_mention_in_group_chats: bool,
    ) -> Self {
        self.require_mention_in_group_chats = require_mention_in_group_chats;
        self
    }

    /// Guild messages starting with this prefix pass the mention filter.
    pub fn with_command_prefix(mut self, command_prefix: &str) -> Self {
        self.command_prefix = command_prefix.to_string();
        self
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.run_gateway_loop(tx).await;
        });
        Ok(())
    }

    async fn send(&self, conversation_id: &str, message: OutboundMessage) -> Result<()> {
        let url = self.api_url(&format!("/channels/{conversation_id}/messages"));
        for (idx, chunk) in split_message(&message.content, DISCORD_MAX_MESSAGE_CHARS)
            .into_iter()
            .enumerate()
        {
            let mut body = serde_json::json!({ "content": chunk });
            if idx == 0 {
                if let Some(reply_to) = message.reply_to_message_id.as_ref() {
                    body["message_reference"] = serde_json::json!({
                        "message_id": reply_to.as_str(),
                        "fail_if_not_exists": false,
                    });
                }
            }
            let resp = self
                .http
                .post(&url)
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
        }
        Ok(())
    }

    async fn send_typing(&self, conversation_id: &str) -> Result<()> {
        let url = self.api_url(&format!("/channels/{conversation_id}/typing"));
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
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
    async fn run_gateway_loop(&self, tx: mpsc::Sender<InboundEvent>) {
        loop {
            match self.run_gateway_once(&tx).await {
                Ok(()) => {
                    tracing::info!("discord inbound queue closed; stopping gateway loop");
                    return;
                }
                Err(e) => {
                    tracing::error!(%e, "discord gateway loop exited; reconnecting");
                }
            }
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_gateway_once(&self, tx: &mpsc::Sender<InboundEvent>) -> Result<()> {
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

        let identify = identify_payload(&self.bot_token);
        write
            .lock()
            .await
            .send(Message::Text(identify.to_string().into()))
            .await?;

        let seq: Arc<RwLock<Option<i64>>> = Arc::new(RwLock::new(None));
        let mut bot_user_id: Option<String> = None;

        // Heartbeat loop.
        let heartbeat = {
            let write = write.clone();
            let seq = seq.clone();
            tokio::spawn(async move {
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
            })
        };

        let result = async {
            while let Some(msg) = read.next().await {
                let msg = msg?;
                if msg.is_close() {
                    return Err(anyhow::anyhow!("discord gateway sent close frame: {msg}"));
                }
                let txt = msg.to_text()?;
                if txt.is_empty() {
                    continue;
                }
                let v: serde_json::Value = serde_json::from_str(txt)?;

                if let Some(s) = v.get("s").and_then(|s| s.as_i64()) {
                    *seq.write().await = Some(s);
                }

                let op = v
                    .get("op")
                    .and_then(|o| o.as_i64())
                    .ok_or_else(|| anyhow::anyhow!("discord payload missing op"))?;
                match op {
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
                    11 => continue,
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
                        let ready = InboundEvent::Ready {
                            platform: "discord".to_string(),
                            bot_user_id: bot_user_id.clone(),
                        };
                        if tx.send(ready).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some("MESSAGE_CREATE") => {
                        let event_payload = v.get("d").cloned().ok_or_else(|| {
                            anyhow::anyhow!("discord MESSAGE_CREATE missing payload")
                        })?;
                        let event: DiscordMessageCreate = serde_json::from_value(event_payload)?;
                        if !should_relay(
                            &event,
                            bot_user_id.as_deref(),
                            self.require_mention_in_group_chats,
                            &self.command_prefix,
                        ) {
                            continue;
                        }
                        let inbound = build_inbound(event, bot_user_id.as_deref())?;
                        if tx.send(InboundEvent::Message(inbound)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(_) | None => {}
                }
            }
            Err::<(), anyhow::Error>(anyhow::anyhow!(
                "discord gateway stream ended unexpectedly"
            ))
        }
        .await;

        heartbeat.abort();
        result
    }
}

fn identify_payload(bot_token: &str) -> serde_json::Value {
    serde_json::json!({
        "op": 2,
        "d": {
            "token": format!("Bot {bot_token}"),
            "intents": DISCORD_GATEWAY_INTENTS,
            "properties": { "os": "linux", "browser": "disclaude", "device": "disclaude" }
        }
    })
}

/// Guild messages are only relayed when they mention the bot or carry the command
/// prefix; direct messages always are.
fn should_relay(
    event: &DiscordMessageCreate,
    bot_user_id: Option<&str>,
    require_mention_in_group_chats: bool,
    command_prefix: &str,
) -> bool {
    if event.guild_id.is_none() || !require_mention_in_group_chats {
        return true;
    }
    if !command_prefix.is_empty() && event.content.trim_start().starts_with(command_prefix) {
        return true;
    }
    match bot_user_id {
        Some(bot_id) => {
            event.content.contains(&format!("<@{bot_id}>"))
                || event.content.contains(&format!("<@!{bot_id}>"))
        }
        None => false,
    }
}

fn strip_mentions(content: &str, bot_user_id: Option<&str>) -> String {
    let Some(bot_id) = bot_user_id else {
        return content.trim().to_string();
    };
    content
        .replace(&format!("<@{bot_id}>"), "")
        .replace(&format!("<@!{bot_id}>"), "")
        .trim()
        .to_string()
}

fn build_inbound(event: DiscordMessageCreate, bot_user_id: Option<&str>) -> Result<InboundMessage> {
    let metadata = serde_json::to_value(&event)?;
    Ok(InboundMessage {
        platform: "discord".to_string(),
        message_id: event.id.into(),
        conversation_id: event.channel_id.into(),
        sender_id: event.author.id.into(),
        is_bot: event.author.bot,
        is_group: event.guild_id.is_some(),
        content: strip_mentions(&event.content, bot_user_id),
        metadata,
        received_at: Utc::now(),
    })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct DiscordMessageCreate {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    content: String,
    author: DiscordAuthor,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct DiscordAuthor {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(guild: Option<&str>, content: &str, bot: bool) -> DiscordMessageCreate {
        serde_json::from_value(json!({
            "id": "m1",
            "channel_id": "c1",
            "guild_id": guild,
            "content": content,
            "author": { "id": "u1", "bot": bot },
        }))
        .expect("fixture decodes")
    }

    #[test]
    fn identify_requests_message_intents() {
        let identify = identify_payload("abc");
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "Bot abc");
        // GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT.
        assert_eq!(identify["d"]["intents"], 512 + 4096 + 32768);
    }

    #[test]
    fn direct_messages_are_always_relayed() {
        let event = message(None, "hello", false);
        assert!(should_relay(&event, Some("42"), true, "!"));
    }

    #[test]
    fn guild_messages_need_mention_or_prefix() {
        let plain = message(Some("g1"), "hello everyone", false);
        assert!(!should_relay(&plain, Some("42"), true, "!"));
        assert!(should_relay(&plain, Some("42"), false, "!"));

        let mentioned = message(Some("g1"), "<@42> hello", false);
        assert!(should_relay(&mentioned, Some("42"), true, "!"));

        let nick_mention = message(Some("g1"), "<@!42> hello", false);
        assert!(should_relay(&nick_mention, Some("42"), true, "!"));

        let command = message(Some("g1"), "!reset", false);
        assert!(should_relay(&command, Some("42"), true, "!"));

        // Before READY the bot id is unknown, so nothing counts as a mention.
        assert!(!should_relay(&mentioned, None, true, "!"));
    }

    #[test]
    fn inbound_strips_mention_markup_and_keeps_bot_flag() {
        let event = message(Some("g1"), "<@42> what is rust? <@!42>", true);
        let inbound = build_inbound(event, Some("42")).expect("builds");
        assert_eq!(inbound.content, "what is rust?");
        assert_eq!(inbound.conversation_id.as_str(), "c1");
        assert_eq!(inbound.sender_id.as_str(), "u1");
        assert!(inbound.is_bot);
        assert!(inbound.is_group);
        assert_eq!(inbound.platform, "discord");
    }

    #[test]
    fn author_bot_flag_defaults_to_false() {
        let event: DiscordMessageCreate = serde_json::from_value(json!({
            "id": "m2",
            "channel_id": "c2",
            "author": { "id": "u2" },
        }))
        .expect("decodes without bot flag");
        assert!(!event.author.bot);
        assert!(event.content.is_empty());
    }
}
