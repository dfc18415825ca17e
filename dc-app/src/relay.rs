//! Relay orchestrator: one inbound chat message in, at most one reply out.
//!
//! Per message: ignore bot authors and empty text, route prefixed text to the
//! command handler, otherwise replay the session's recent turns plus the new
//! prompt through the completion client and deliver its text verbatim.

use crate::commands::{self, Command};
use crate::gateway::EventHandler;
use crate::session::SessionStore;
use crate::transcript::TranscriptBook;
use async_trait::async_trait;
use dc_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use dc_llm::{ChatMessage, ChatResponse, LlmClient, LlmError};
use std::sync::Arc;
use uuid::Uuid;

/// The completion round trip, as seen by the relay.
#[async_trait]
pub trait Completion: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, turns: &[ChatMessage]) -> Result<ChatResponse, LlmError>;
}

#[async_trait]
impl Completion for LlmClient {
    fn model(&self) -> &str {
        LlmClient::model(self)
    }

    async fn complete(&self, turns: &[ChatMessage]) -> Result<ChatResponse, LlmError> {
        self.chat(turns).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Bot-authored or empty; nothing sent.
    Ignored,
    Command,
    /// The model answered. Empty answers are not delivered.
    Replied,
    /// The completion failed and an error line was delivered.
    Failed,
}

pub struct Relay {
    completion: Arc<dyn Completion>,
    sink: Arc<dyn ChannelAdapter>,
    sessions: Arc<SessionStore>,
    transcripts: Arc<TranscriptBook>,
    command_prefix: String,
    history_limit: usize,
    system_prompt: Option<String>,
    platform_info: String,
}

impl Relay {
    pub fn new(
        completion: Arc<dyn Completion>,
        sink: Arc<dyn ChannelAdapter>,
        sessions: Arc<SessionStore>,
        transcripts: Arc<TranscriptBook>,
    ) -> Self {
        let platform_info = format!("{} bot with {}", sink.platform(), completion.model());
        Self {
            completion,
            sink,
            sessions,
            transcripts,
            command_prefix: "/".to_string(),
            history_limit: 20,
            system_prompt: None,
            platform_info,
        }
    }

    pub fn with_command_prefix(mut self, prefix: &str) -> Self {
        self.command_prefix = prefix.to_string();
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_platform_info(mut self, platform_info: impl Into<String>) -> Self {
        self.platform_info = platform_info.into();
        self
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            platform = %inbound.platform,
            conversation_id = %inbound.conversation_id,
            message_id = %inbound.message_id,
        )
    )]
    pub async fn handle_message(&self, inbound: &InboundMessage) -> RelayOutcome {
        if inbound.is_bot {
            tracing::debug!("ignoring bot-authored message");
            return RelayOutcome::Ignored;
        }
        let text = inbound.content.trim();
        if text.is_empty() {
            return RelayOutcome::Ignored;
        }

        match commands::parse_command(&self.command_prefix, text) {
            Some(Command::Ask(question)) => self.prompt(inbound, &question).await,
            Some(command) => {
                let reply = self.run_command(inbound, command).await;
                self.deliver(inbound, reply).await;
                RelayOutcome::Command
            }
            None => self.prompt(inbound, text).await,
        }
    }

    /// Replies to every command except `ask`, which goes through [`Relay::prompt`].
    async fn run_command(&self, inbound: &InboundMessage, command: Command) -> String {
        let conversation_id = inbound.conversation_id.as_str();
        tracing::info!(?command, "command");
        match command {
            Command::Ask(_) => unreachable!("ask is relayed as a prompt"),
            Command::Reset => {
                if let Some(session_id) = self.sessions.get(conversation_id).await {
                    if let Err(e) = self.transcripts.remove(&session_id).await {
                        tracing::warn!(%e, %session_id, "transcript removal failed");
                    }
                }
                if let Err(e) = self.sessions.clear(conversation_id).await {
                    tracing::warn!(%e, "session clear was not persisted");
                }
                "Session cleared.".to_string()
            }
            Command::Status => {
                let active = self.sessions.get(conversation_id).await.is_some();
                commands::status_text(self.completion.model(), active)
            }
            Command::Help => commands::help_text(&self.command_prefix, &self.platform_info),
            Command::Ping => "Pong!".to_string(),
            Command::Unknown(text) => format!("Unknown command: {text}"),
        }
    }

    async fn prompt(&self, inbound: &InboundMessage, prompt: &str) -> RelayOutcome {
        let conversation_id = inbound.conversation_id.as_str();
        if self.sink.supports_typing_events() {
            if let Err(e) = self.sink.send_typing(conversation_id).await {
                tracing::debug!(%e, "typing indicator failed");
            }
        }

        let existing = self.sessions.get(conversation_id).await;
        let history = match existing.as_deref() {
            Some(session_id) => self
                .transcripts
                .recent(session_id, self.history_limit)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(%e, %session_id, "transcript unreadable; sending prompt alone");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let mut turns = Vec::with_capacity(history.len() + 2);
        if let Some(system_prompt) = &self.system_prompt {
            turns.push(ChatMessage::system(system_prompt.clone()));
        }
        turns.extend(history);
        turns.push(ChatMessage::user(prompt));

        let response = match self.completion.complete(&turns).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%e, kind = e.kind().as_str(), "completion failed");
                self.deliver(inbound, format!("Error: {e}")).await;
                return RelayOutcome::Failed;
            }
        };
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            history = turns.len() - 1,
            "completion ok"
        );

        let reply = response.text();
        if reply.trim().is_empty() {
            tracing::debug!("empty completion; nothing to deliver");
            return RelayOutcome::Replied;
        }

        let session_id = match existing {
            Some(session_id) => session_id,
            None => {
                let session_id = Uuid::new_v4().to_string();
                if let Err(e) = self.sessions.set(conversation_id, &session_id).await {
                    tracing::warn!(%e, "new session was not persisted");
                }
                session_id
            }
        };
        if let Err(e) = self
            .transcripts
            .append(
                &session_id,
                &[ChatMessage::user(prompt), ChatMessage::assistant(reply)],
            )
            .await
        {
            tracing::warn!(%e, %session_id, "transcript append failed");
        }

        self.deliver(inbound, reply.to_string()).await;
        RelayOutcome::Replied
    }

    async fn deliver(&self, inbound: &InboundMessage, content: String) {
        let message = OutboundMessage {
            content,
            reply_to_message_id: Some(inbound.message_id.clone()),
        };
        if let Err(e) = self
            .sink
            .send(inbound.conversation_id.as_str(), message)
            .await
        {
            tracing::warn!(%e, "reply delivery failed");
        }
    }
}

#[async_trait]
impl EventHandler for Relay {
    async fn on_ready(&self, platform: &str, bot_user_id: Option<&str>) {
        tracing::info!(
            platform,
            bot_user_id,
            info = %self.platform_info,
            "relay ready"
        );
    }

    async fn on_message(&self, message: InboundMessage) {
        let outcome = self.handle_message(&message).await;
        tracing::debug!(?outcome, "message handled");
    }
}
