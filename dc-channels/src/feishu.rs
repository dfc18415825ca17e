use crate::text::split_message;
use crate::traits::ChannelAdapter;
use crate::types::{InboundEvent, InboundMessage, OutboundMessage};
use anyhow::{Result, anyhow};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};
use tower_http::trace::TraceLayer;

const FEISHU_DEFAULT_API_BASE: &str = "https://open.feishu.cn";
const FEISHU_EVENTS_PATH: &str = "/feishu/events";
const FEISHU_MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";
const FEISHU_MAX_MESSAGE_CHARS: usize = 4000;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const EVENT_DEDUP_TTL: Duration = Duration::from_secs(600);
const EVENT_DEDUP_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Feishu/Lark bot: event-subscription webhook in, IM REST API out.
#[derive(Clone)]
pub struct FeishuAdapter {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    api_base_url: String,
    listen_addr: SocketAddr,
    verification_token: Option<String>,
    token: Arc<RwLock<Option<CachedToken>>>,
    seen_events: Arc<DashMap<String, Instant>>,
}

impl FeishuAdapter {
    pub fn new(app_id: &str, app_secret: &str) -> Result<Self> {
        let app_id = app_id.trim();
        if app_id.is_empty() {
            return Err(anyhow!("feishu app id is required"));
        }
        let app_secret = app_secret.trim();
        if app_secret.is_empty() {
            return Err(anyhow!("feishu app secret is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            api_base_url: FEISHU_DEFAULT_API_BASE.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            verification_token: None,
            token: Arc::new(RwLock::new(None)),
            seen_events: Arc::new(DashMap::new()),
        })
    }

    /// `https://open.larksuite.com` for Lark tenants.
    pub fn with_api_base_url(mut self, api_base_url: &str) -> Self {
        let trimmed = api_base_url.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.api_base_url = trimmed.to_string();
        }
        self
    }

    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    pub fn with_verification_token(mut self, verification_token: Option<String>) -> Self {
        self.verification_token = verification_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    /// Router serving the event subscription callback at `/feishu/events`.
    pub fn router(&self, tx: mpsc::Sender<InboundEvent>) -> Router {
        Router::new()
            .route(FEISHU_EVENTS_PATH, post(handle_callback))
            .layer(TraceLayer::new_for_http())
            .with_state(WebhookState {
                adapter: self.clone(),
                tx,
            })
    }

    async fn tenant_access_token(&self) -> Result<String> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(cached.value.clone());
            }
        }

        let mut guard = self.token.write().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(cached.value.clone());
            }
        }

        let response = self
            .http
            .post(self.api_url("/open-apis/auth/v3/tenant_access_token/internal"))
            .json(&serde_json::json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret,
            }))
            .send()
            .await?;
        let status = response.status();
        let body: FeishuTokenResponse = response.json().await?;
        let Some(value) = body.tenant_access_token.filter(|_| body.code == 0) else {
            return Err(anyhow!(
                "feishu tenant_access_token failed: status={} code={} msg={}",
                status,
                body.code,
                body.msg
            ));
        };

        tracing::debug!(expire_secs = body.expire, "feishu tenant access token refreshed");
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(body.expire),
        });
        Ok(value)
    }

    /// Records `event_id`; false when it was already seen within the dedup window.
    fn remember_event(&self, event_id: &str) -> bool {
        if self.seen_events.len() > EVENT_DEDUP_PRUNE_THRESHOLD {
            self.seen_events
                .retain(|_, seen_at| seen_at.elapsed() < EVENT_DEDUP_TTL);
        }
        match self.seen_events.entry(event_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for FeishuAdapter {
    fn platform(&self) -> &str {
        "feishu"
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow!("bind feishu webhook {}: {e}", self.listen_addr))?;
        let router = self.router(tx.clone());
        let listen_addr = self.listen_addr;
        tokio::spawn(async move {
            tracing::info!(%listen_addr, path = FEISHU_EVENTS_PATH, "feishu webhook listening");
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(%e, "feishu webhook server exited");
            }
        });
        // Webhook delivery has no handshake; the adapter is ready once bound.
        tx.send(InboundEvent::Ready {
            platform: "feishu".to_string(),
            bot_user_id: None,
        })
        .await
        .map_err(|e| anyhow!("feishu inbound queue closed: {e}"))?;
        Ok(())
    }

    async fn send(&self, conversation_id: &str, message: OutboundMessage) -> Result<()> {
        let chat_id = conversation_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("conversation_id (feishu chat id) is required"));
        }

        let token = self.tenant_access_token().await?;
        let url = self.api_url("/open-apis/im/v1/messages");
        for chunk in split_message(&message.content, FEISHU_MAX_MESSAGE_CHARS) {
            let payload = serde_json::json!({
                "receive_id": chat_id,
                "msg_type": "text",
                "content": text_content(&chunk),
            });
            let response = self
                .http
                .post(&url)
                .query(&[("receive_id_type", "chat_id")])
                .bearer_auth(&token)
                .json(&payload)
                .send()
                .await?;
            let status = response.status();
            let body: FeishuApiResponse = response.json().await?;
            if !status.is_success() || body.code != 0 {
                return Err(anyhow!(
                    "feishu im.message.create failed: status={} code={} msg={}",
                    status,
                    body.code,
                    body.msg
                ));
            }
        }
        tracing::debug!(chat_id, "feishu message sent");
        Ok(())
    }
}

#[derive(Clone)]
struct WebhookState {
    adapter: FeishuAdapter,
    tx: mpsc::Sender<InboundEvent>,
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_callback(
    State(state): State<WebhookState>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Response {
    let callback = match decode_callback(&body, state.adapter.verification_token.as_deref()) {
        Ok(callback) => callback,
        Err(e) => {
            tracing::warn!(%e, "feishu callback rejected");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match callback {
        Callback::Challenge(challenge) => {
            axum::Json(serde_json::json!({ "challenge": challenge })).into_response()
        }
        Callback::Unauthorized => {
            tracing::warn!("feishu callback carried an unexpected verification token");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Callback::Ignored { event_type } => {
            tracing::debug!(%event_type, "feishu event ignored");
            StatusCode::OK.into_response()
        }
        Callback::Message { event_id, inbound } => {
            if !state.adapter.remember_event(&event_id) {
                tracing::debug!(%event_id, "feishu duplicate delivery dropped");
                return StatusCode::OK.into_response();
            }
            tracing::info!(
                conversation_id = %inbound.conversation_id,
                %event_id,
                "feishu message received"
            );
            if let Err(e) = state.tx.send(InboundEvent::Message(inbound)).await {
                tracing::error!(%e, "feishu inbound queue closed");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            StatusCode::OK.into_response()
        }
    }
}

#[derive(Debug)]
enum Callback {
    Challenge(String),
    Unauthorized,
    Ignored { event_type: String },
    Message { event_id: String, inbound: InboundMessage },
}

fn decode_callback(body: &serde_json::Value, verification_token: Option<&str>) -> Result<Callback> {
    if body.get("encrypt").is_some() {
        return Err(anyhow!(
            "encrypted event payloads are not supported; clear the app's Encrypt Key"
        ));
    }

    if body.get("type").and_then(|t| t.as_str()) == Some("url_verification") {
        let token = body.get("token").and_then(|t| t.as_str());
        if !token_matches(verification_token, token) {
            return Ok(Callback::Unauthorized);
        }
        let challenge = body
            .get("challenge")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow!("url_verification missing challenge"))?;
        return Ok(Callback::Challenge(challenge.to_string()));
    }

    let envelope: FeishuEventEnvelope = serde_json::from_value(body.clone())?;
    if !token_matches(verification_token, envelope.header.token.as_deref()) {
        return Ok(Callback::Unauthorized);
    }
    if envelope.header.event_type != FEISHU_MESSAGE_RECEIVE_EVENT {
        return Ok(Callback::Ignored {
            event_type: envelope.header.event_type,
        });
    }

    let event: FeishuMessageEvent = serde_json::from_value(envelope.event)?;
    if event.message.message_type != "text" {
        return Ok(Callback::Ignored {
            event_type: format!(
                "{}:{}",
                envelope.header.event_type, event.message.message_type
            ),
        });
    }

    let content = decode_text_content(&event.message.content, &event.message.mentions)?;
    let sender_id = event
        .sender
        .sender_id
        .open_id
        .clone()
        .or_else(|| event.sender.sender_id.user_id.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let metadata = serde_json::json!({
        "event_id": envelope.header.event_id,
        "chat_type": event.message.chat_type,
        "tenant_key": envelope.header.tenant_key,
    });

    Ok(Callback::Message {
        event_id: envelope.header.event_id,
        inbound: InboundMessage {
            platform: "feishu".to_string(),
            message_id: event.message.message_id.into(),
            conversation_id: event.message.chat_id.into(),
            sender_id: sender_id.into(),
            is_bot: event.sender.sender_type != "user",
            is_group: event.message.chat_type != "p2p",
            content,
            metadata,
            received_at: Utc::now(),
        },
    })
}

fn token_matches(expected: Option<&str>, received: Option<&str>) -> bool {
    match expected {
        Some(expected) => received == Some(expected),
        None => true,
    }
}

/// Text message content is a JSON string `{"text": "..."}` with `@_user_N` mention keys.
fn decode_text_content(content: &str, mentions: &[FeishuMention]) -> Result<String> {
    let parsed: FeishuTextContent = serde_json::from_str(content)
        .map_err(|e| anyhow!("feishu text content is not valid json: {e}"))?;
    let mut text = parsed.text;
    for mention in mentions {
        if !mention.key.is_empty() {
            text = text.replace(&mention.key, "");
        }
    }
    Ok(text.trim().to_string())
}

fn text_content(text: &str) -> String {
    serde_json::json!({ "text": text }).to_string()
}

#[derive(Debug, Deserialize)]
struct FeishuTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct FeishuApiResponse {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct FeishuEventEnvelope {
    header: FeishuEventHeader,
    #[serde(default)]
    event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct FeishuEventHeader {
    event_id: String,
    event_type: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    tenant_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeishuMessageEvent {
    sender: FeishuSender,
    message: FeishuMessage,
}

#[derive(Debug, Deserialize)]
struct FeishuSender {
    #[serde(default)]
    sender_id: FeishuSenderId,
    #[serde(default)]
    sender_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct FeishuSenderId {
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeishuMessage {
    message_id: String,
    chat_id: String,
    #[serde(default)]
    chat_type: String,
    message_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    mentions: Vec<FeishuMention>,
}

#[derive(Debug, Deserialize)]
struct FeishuMention {
    #[serde(default)]
    key: String,
}

#[derive(Debug, Deserialize)]
struct FeishuTextContent {
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_event(message_type: &str, content: &str, sender_type: &str) -> serde_json::Value {
        json!({
            "schema": "2.0",
            "header": {
                "event_id": "ev-1",
                "event_type": "im.message.receive_v1",
                "token": "vt",
                "tenant_key": "tk",
                "app_id": "cli_1"
            },
            "event": {
                "sender": {
                    "sender_id": { "open_id": "ou_1", "user_id": "u_1" },
                    "sender_type": sender_type
                },
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_1",
                    "chat_type": "group",
                    "message_type": message_type,
                    "content": content,
                    "mentions": [{ "key": "@_user_1", "name": "Disclaude" }]
                }
            }
        })
    }

    #[test]
    fn url_verification_echoes_challenge() {
        let body = json!({ "type": "url_verification", "challenge": "abc", "token": "vt" });
        match decode_callback(&body, Some("vt")).expect("decodes") {
            Callback::Challenge(c) => assert_eq!(c, "abc"),
            other => panic!("expected challenge, got {other:?}"),
        }
        assert!(matches!(
            decode_callback(&body, Some("other")).expect("decodes"),
            Callback::Unauthorized
        ));
    }

    #[test]
    fn text_message_is_decoded_with_mentions_stripped() {
        let body = message_event("text", r#"{"text":"@_user_1 hello there"}"#, "user");
        let Callback::Message { event_id, inbound } =
            decode_callback(&body, Some("vt")).expect("decodes")
        else {
            panic!("expected message");
        };
        assert_eq!(event_id, "ev-1");
        assert_eq!(inbound.content, "hello there");
        assert_eq!(inbound.conversation_id.as_str(), "oc_1");
        assert_eq!(inbound.sender_id.as_str(), "ou_1");
        assert_eq!(inbound.message_id.as_str(), "om_1");
        assert!(inbound.is_group);
        assert!(!inbound.is_bot);
    }

    #[test]
    fn non_user_senders_are_flagged_as_bots() {
        let body = message_event("text", r#"{"text":"ping"}"#, "app");
        let Callback::Message { inbound, .. } = decode_callback(&body, None).expect("decodes")
        else {
            panic!("expected message");
        };
        assert!(inbound.is_bot);
    }

    #[test]
    fn non_text_and_other_events_are_ignored() {
        let body = message_event("image", r#"{"image_key":"img"}"#, "user");
        assert!(matches!(
            decode_callback(&body, None).expect("decodes"),
            Callback::Ignored { .. }
        ));

        let read = json!({
            "schema": "2.0",
            "header": { "event_id": "ev-2", "event_type": "im.message.message_read_v1" },
            "event": {}
        });
        match decode_callback(&read, None).expect("decodes") {
            Callback::Ignored { event_type } => {
                assert_eq!(event_type, "im.message.message_read_v1")
            }
            other => panic!("expected ignored, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_token_and_encrypted_payloads_are_rejected() {
        let body = message_event("text", r#"{"text":"hi"}"#, "user");
        assert!(matches!(
            decode_callback(&body, Some("expected")).expect("decodes"),
            Callback::Unauthorized
        ));
        assert!(decode_callback(&json!({ "encrypt": "xyz" }), None).is_err());
    }

    #[test]
    fn malformed_text_content_is_an_error() {
        let body = message_event("text", "not json", "user");
        assert!(decode_callback(&body, None).is_err());
    }

    #[test]
    fn outbound_content_escapes_quotes_and_newlines() {
        let raw = "say \"hi\"\nthen \\ leave";
        let encoded = text_content(raw);
        let decoded: FeishuTextContent = serde_json::from_str(&encoded).expect("round trips");
        assert_eq!(decoded.text, raw);
        assert!(encoded.contains("\\n"));
        assert!(encoded.contains("\\\"hi\\\""));
    }

    #[test]
    fn duplicate_event_ids_are_remembered() {
        let adapter = FeishuAdapter::new("cli_1", "secret").expect("adapter");
        assert!(adapter.remember_event("ev-1"));
        assert!(!adapter.remember_event("ev-1"));
        assert!(adapter.remember_event("ev-2"));
    }

    #[test]
    fn constructor_requires_credentials() {
        assert!(FeishuAdapter::new("", "secret").is_err());
        assert!(FeishuAdapter::new("cli_1", " ").is_err());
        let adapter = FeishuAdapter::new("cli_1", "secret")
            .expect("adapter")
            .with_api_base_url("https://open.larksuite.com/")
            .with_verification_token(Some("  ".to_string()));
        assert_eq!(
            adapter.api_url("/open-apis/im/v1/messages"),
            "https://open.larksuite.com/open-apis/im/v1/messages"
        );
        assert!(adapter.verification_token.is_none());
    }
}
